//! Prompts for the analysis pipeline.
//!
//! Every domain question is sent as two messages: [`SYSTEM_PROMPT`], then the
//! domain prompt followed by a blank line and the data context. The overall
//! prompt gets every domain's analysis: a template may place one with an
//! `{answer_<domain>}` token, and the rest are listed under their titles at
//! `{answers}` (or at the end when the template has no such slot).

use loadscribe_core::schema::analysis_schema_text;
use loadscribe_core::DomainConfig;

use crate::providers::ChatMessage;

/// System prompt shared by every analysis request.
pub const SYSTEM_PROMPT: &str = "You are a load-test engineer analysing the results of a stepped \
max-performance test. The user provides the data and a question. Use the context of this data \
to answer the question.";

/// Response contract appended to every analysis prompt.
pub const ANSWER_FORMAT: &str = r#"
## Answer format
Reply with a single JSON object and nothing else:
{
  "verdict": "ok | degraded | saturated | failed",
  "confidence": 0.0-1.0,
  "findings": [
    {"summary": "what happened", "severity": "critical | high | medium | low",
     "component": "which part of the system", "evidence": "series, time and value"}
  ],
  "recommended_actions": ["concrete next step"],
  "affected_components": ["component"],
  "peak_performance": {"step": "load step at which throughput peaked", "value": "observed peak"}
}
Findings may also be plain strings. Cite timestamps and values from the data.
"#;

pub const JVM_PROMPT: &str = r#"
## Domain: JVM
The tables show heap and non-heap memory, GC pause time and frequency, thread
counts and CPU of the JVM processes during the test. For each load step:
- Does heap usage return to baseline after GC, or does it creep upward?
- Do GC pauses grow with load, and at which step do they start to dominate?
- Do thread counts or CPU saturate before throughput stops growing?
Name the step at which the JVM became the limiting factor, if any.
"#;

pub const DATABASE_PROMPT: &str = r#"
## Domain: Database
The tables show query rate, query latency, connection usage and resource
consumption of the database during the test. For each load step:
- Does latency stay flat while the query rate grows?
- Are connection pools or server resources close to their limits?
- Are there bursts of slow queries or errors aligned with load steps?
Name the step at which the database became the limiting factor, if any.
"#;

pub const KAFKA_PROMPT: &str = r#"
## Domain: Kafka
The tables show produce and consume rates, consumer lag and broker request
latency during the test. For each load step:
- Do consumers keep up with producers, or does lag accumulate?
- Does broker latency grow with throughput?
- Are some partitions or consumer groups falling behind others?
Name the step at which messaging became the limiting factor, if any.
"#;

pub const MICROSERVICES_PROMPT: &str = r#"
## Domain: Microservices
The tables show request rate, response time percentiles and error rate per
service and endpoint during the test. For each load step:
- Does throughput grow in proportion to the applied load?
- At which step do response times or error rates break away from baseline?
- Which services or endpoints degrade first?
Name the maximum sustainable throughput and the step that exceeded it.
"#;

pub const OVERALL_PROMPT: &str = r#"
## Overall assessment
Below are the analyses of the individual subsystems from the same test run.

{answers}

Combine them into one conclusion about the run: the maximum performance
reached, the first bottleneck, and what should be fixed before the next test.
"#;

/// Prompt for a domain without a built-in one.
const GENERIC_DOMAIN_PROMPT: &str = r#"
## Domain: {title}
The tables show the metrics of this subsystem during the test. For each load
step, describe how the metrics respond to growing load, which series degrade
first, and at which step this subsystem became the limiting factor, if any.
"#;

/// Instruction for the critic pass.
pub const CRITIC_PROMPT: &str = r#"
The text below was meant to be a JSON analysis but does not match the required
format. Rewrite it as a single JSON object that validates against this JSON
Schema. Keep the meaning, do not invent findings, and output only the JSON.

## Schema
{schema}

## Text
{candidate}
"#;

/// Prompt for a domain: its configured override, else the built-in one.
pub fn domain_prompt(domain: &DomainConfig) -> String {
    let base = match domain.prompt.as_deref() {
        Some(custom) if !custom.trim().is_empty() => custom.to_string(),
        _ => match domain.name.as_str() {
            "jvm" => JVM_PROMPT.to_string(),
            "database" => DATABASE_PROMPT.to_string(),
            "kafka" => KAFKA_PROMPT.to_string(),
            "ms" | "microservices" => MICROSERVICES_PROMPT.to_string(),
            _ => GENERIC_DOMAIN_PROMPT.replace("{title}", domain.display_title()),
        },
    };
    format!("{}\n{}", base.trim_end(), ANSWER_FORMAT)
}

/// The two messages of an analysis request.
pub fn analysis_messages(prompt: &str, data_context: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!("{}\n\n{}", prompt, data_context)),
    ]
}

/// Token replaced with a domain's analysis in the overall prompt.
pub fn answer_token(domain: &str) -> String {
    format!("{{answer_{}}}", domain)
}

const ANSWER_PREFIX: &str = "answer_";
const ANSWERS_SLOT: &str = "answers";

/// Stands in for a token whose domain was not analysed in this run.
pub const NOT_ANALYSED: &str = "(not analysed in this run)";

/// One domain's contribution to the overall prompt.
#[derive(Debug, Clone, Copy)]
pub struct DomainAnswer<'a> {
    pub name: &'a str,
    pub title: &'a str,
    pub text: &'a str,
}

fn same_domain(token: &str, name: &str) -> bool {
    fn canonical(n: &str) -> &str {
        if n == "microservices" { "ms" } else { n }
    }
    canonical(token) == canonical(name)
}

fn is_token(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Replace `{key}` tokens for which `fill` returns a value; everything else
/// is copied as is. Replacement text is never scanned again.
fn substitute<F>(template: &str, mut fill: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let key = after
            .find('}')
            .map(|close| &after[..close])
            .filter(|key| is_token(key));
        match key.and_then(|key| fill(key).map(|text| (key.len(), text))) {
            Some((len, text)) => {
                out.push_str(&text);
                rest = &after[len + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Fill an overall template with the analysed domains.
///
/// `{answer_<name>}` takes that domain's text (`ms` and `microservices` are
/// the same domain). Domains without a token of their own are rendered as
/// `### <title>` sections at `{answers}`, or appended after the template.
/// Tokens naming a domain that was not analysed become [`NOT_ANALYSED`].
pub fn overall_prompt(template: &str, answers: &[DomainAnswer<'_>]) -> String {
    let find = |name: &str| answers.iter().position(|a| same_domain(name, a.name));

    let mut claimed = Vec::new();
    substitute(template, |key| {
        if let Some(index) = key.strip_prefix(ANSWER_PREFIX).and_then(find) {
            claimed.push(index);
        }
        None
    });

    let sections = answers
        .iter()
        .enumerate()
        .filter(|(index, _)| !claimed.contains(index))
        .map(|(_, a)| format!("### {}\n{}", a.title, a.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut has_slot = false;
    let body = substitute(template, |key| {
        if key == ANSWERS_SLOT {
            has_slot = true;
            return Some(sections.clone());
        }
        let name = key.strip_prefix(ANSWER_PREFIX)?;
        Some(match find(name) {
            Some(index) => answers[index].text.trim().to_string(),
            None => NOT_ANALYSED.to_string(),
        })
    });

    let body = body.trim_end();
    if has_slot || sections.is_empty() {
        format!("{}\n{}", body, ANSWER_FORMAT)
    } else {
        format!("{}\n\n{}\n{}", body, sections, ANSWER_FORMAT)
    }
}

/// Messages for one critic pass over a malformed candidate.
pub fn critic_messages(candidate: &str) -> Vec<ChatMessage> {
    let prompt = CRITIC_PROMPT
        .replace("{schema}", analysis_schema_text())
        .replace("{candidate}", candidate);
    vec![
        ChatMessage::system("You convert text into strict JSON. Output JSON only."),
        ChatMessage::user(prompt),
    ]
}
