//! `loadscribe` command line.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use loadscribe_core::config::parse_time_ms;
use loadscribe_core::render::analysis_text;
use loadscribe_core::{decode_analysis, ReportConfig};
use loadscribe_runtime::{analysis_pipeline, ProviderRegistry, ReportBuilder};

mod server;

#[derive(Parser, Debug)]
#[command(name = "loadscribe", version)]
#[command(about = "Load-test reports with model-written analysis, published to Confluence")]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "LOADSCRIBE_CONFIG",
        default_value = "loadscribe.yaml"
    )]
    config: PathBuf,

    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the report page for one service
    Report {
        #[arg(long)]
        service: String,

        /// `YYYY-MM-DDTHH:MM` in the configured offset, or epoch ms
        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        /// Fill panels and logs only
        #[arg(long)]
        skip_analysis: bool,
    },

    /// Run the analysis without touching the wiki
    Analyze {
        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        /// Analyse a single domain
        #[arg(long)]
        domain: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List configured services
    Services,

    /// Validate the configuration and print a summary
    CheckConfig,

    /// Decode a saved model response (stdin when FILE is omitted)
    Decode { file: Option<PathBuf> },

    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "0.0.0.0:5001")]
        addr: String,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Result<ReportConfig> {
    ReportConfig::from_yaml_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Both bounds in epoch ms, `start` strictly before `end`.
fn time_range(config: &ReportConfig, start: &str, end: &str) -> Result<(i64, i64)> {
    let offset = config.analysis.offset();
    let start_ms = parse_time_ms(start, &offset)?;
    let end_ms = parse_time_ms(end, &offset)?;
    if end_ms <= start_ms {
        bail!("end ({}) must be after start ({})", end, start);
    }
    Ok((start_ms, end_ms))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn report(
    config: &ReportConfig,
    service: &str,
    start: &str,
    end: &str,
    skip_analysis: bool,
) -> Result<()> {
    config.service(service)?;
    let (start_ms, end_ms) = time_range(config, start, end)?;

    let mut builder = ReportBuilder::from_config(config)?;
    if skip_analysis || !config.analysis.enabled {
        info!("Analysis skipped");
    } else {
        builder = builder.with_analysis(Arc::new(analysis_pipeline(config)?));
    }

    let outcome = builder.build(service, start_ms, end_ms).await?;
    print_json(&outcome)?;

    if !outcome.is_complete() {
        bail!(
            "{} placeholder(s) on page {} were not filled",
            outcome.failures.len(),
            outcome.page_id
        );
    }
    Ok(())
}

async fn analyze(
    config: &ReportConfig,
    start: &str,
    end: &str,
    domain: Option<&str>,
    json: bool,
) -> Result<()> {
    let (start_ms, end_ms) = time_range(config, start, end)?;
    let pipeline = analysis_pipeline(config)?;

    if let Some(name) = domain {
        let domain = config.domain(name)?;
        let analysis = pipeline.analyze_domain(&domain, start_ms, end_ms).await?;
        if json {
            return print_json(&serde_json::json!({
                "domain": analysis.name,
                "text": analysis.answer_text(),
                "parsed": analysis.structured(),
            }));
        }
        println!("{}\n{}", analysis.markdown, analysis.answer_text());
        return Ok(());
    }

    let report = pipeline.run(start_ms, end_ms).await?;
    if json {
        return print_json(&report.to_json());
    }

    for analysis in &report.domains {
        println!("## {}\n\n{}\n{}\n", analysis.title, analysis.markdown, analysis.answer_text());
    }
    let overall = match &report.overall.parsed {
        Some(result) => analysis_text(result),
        None => report.overall.text.clone(),
    };
    println!("## Overall\n\n{}", overall);
    Ok(())
}

fn decode(file: Option<&Path>) -> Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let result = decode_analysis(&text)?;
    print_json(&result)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Decode { file } => decode(file.as_deref()),
        Command::CheckConfig => {
            let config = load_config(&cli.config)?;
            let llm = ProviderRegistry::with_defaults().check(&config.llm);
            if !llm.ok {
                warn!(provider = %llm.provider, "LLM provider is not usable; analysis will be skipped");
            }
            print_json(&serde_json::json!({ "config": config.summary(), "llm": llm }))
        }
        Command::Services => {
            let config = load_config(&cli.config)?;
            for name in config.service_names() {
                println!("{}", name);
            }
            Ok(())
        }
        Command::Report {
            service,
            start,
            end,
            skip_analysis,
        } => {
            let config = load_config(&cli.config)?;
            report(&config, &service, &start, &end, skip_analysis).await
        }
        Command::Analyze {
            start,
            end,
            domain,
            json,
        } => {
            let config = load_config(&cli.config)?;
            analyze(&config, &start, &end, domain.as_deref(), json).await
        }
        Command::Serve { addr } => {
            let config = load_config(&cli.config)?;
            if !config.analysis.enabled {
                warn!("Analysis disabled in configuration, /analyze will answer 503");
            }
            server::serve(config, &addr).await
        }
    }
}
