//! Placeholder tokens and storage-format snippets for Confluence pages.
//!
//! A template page carries literal `$$name$$` tokens. Report generation
//! replaces each token with rendered storage XHTML.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

use crate::render::escape_xml;

/// Height of the log viewer macro, in pixels.
pub const LOG_VIEWER_HEIGHT: u32 = 250;

lazy_static! {
    static ref PLACEHOLDER_PATTERN: Regex =
        Regex::new(r"\$\$([A-Za-z0-9_.\-]+)\$\$").unwrap();
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarkupError {
    #[error("Placeholder '{0}' not found on page")]
    PlaceholderNotFound(String),
}

/// The literal token for a placeholder name.
pub fn placeholder(name: &str) -> String {
    format!("$${}$$", name)
}

/// Placeholder names in order of first appearance.
pub fn find_placeholders(body: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    PLACEHOLDER_PATTERN
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Replace every occurrence of `$$name$$` with `content`.
pub fn replace_placeholder(body: &str, name: &str, content: &str) -> Result<String, MarkupError> {
    let token = placeholder(name);
    if !body.contains(&token) {
        return Err(MarkupError::PlaceholderNotFound(name.to_string()));
    }
    Ok(body.replace(&token, content))
}

pub fn image_attachment(filename: &str) -> String {
    format!(
        "<ac:image><ri:attachment ri:filename=\"{}\" /></ac:image>",
        escape_xml(filename)
    )
}

/// File viewer macro showing an attached log.
pub fn view_file_macro(filename: &str, height: u32) -> String {
    format!(
        "<ac:structured-macro ac:name=\"view-file\" ac:schema-version=\"1\">\
         <ac:parameter ac:name=\"name\"><ri:attachment ri:filename=\"{}\" /></ac:parameter>\
         <ac:parameter ac:name=\"height\">{}</ac:parameter>\
         </ac:structured-macro>",
        escape_xml(filename),
        height
    )
}

/// Group several bodies into tabs. Bodies are inserted as-is.
pub fn tabs_macro<S: AsRef<str>>(tabs: &[(S, S)]) -> String {
    let mut storage = String::from("<ac:structured-macro ac:name=\"ui-tabs\"><ac:rich-text-body>");
    for (title, body) in tabs {
        storage.push_str("<ac:structured-macro ac:name=\"ui-tab\">");
        storage.push_str(&format!(
            "<ac:parameter ac:name=\"title\">{}</ac:parameter>",
            escape_xml(title.as_ref())
        ));
        storage.push_str(&format!(
            "<ac:rich-text-body><p>{}</p></ac:rich-text-body>",
            body.as_ref()
        ));
        storage.push_str("</ac:structured-macro>");
    }
    storage.push_str("</ac:rich-text-body></ac:structured-macro>");
    storage
}

/// Attachment name for a rendered panel image.
pub fn image_filename(panel: &str, service: &str, page_id: &str) -> String {
    format!("{}_{}_{}.jpg", panel, service, page_id)
}

/// Attachment name for a log excerpt.
pub fn log_filename(service: &str, placeholder: &str, page_id: &str) -> String {
    format!("{}_{}_{}.log", service, placeholder, page_id)
}
