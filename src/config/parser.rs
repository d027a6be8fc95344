//! INI-style configuration parser
//!
//! Parses the node configuration file into sections of key/value pairs.
//! Section names are case-insensitive and stored lowercased; keys are stored
//! uppercased, so `[ARM] DefaultServices` and `[arm] DEFAULTSERVICES` agree.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// A section maps each (uppercased) key to its last assigned value
pub type ParsedSection = HashMap<String, String>;

/// A parsed configuration file is a map of section names to their contents
pub type ParsedFile = HashMap<String, ParsedSection>;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Section '{0}' appears more than once")]
    DuplicateSection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[{section}] {key}: invalid value '{value}'")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

impl ParseError {
    pub(crate) fn invalid(section: &str, key: &str, value: &str) -> Self {
        Self::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Parse a configuration file from a string
pub fn parse_file(content: &str) -> Result<ParsedFile, ParseError> {
    let mut sections = HashMap::new();
    let mut current: Option<(String, ParsedSection)> = None;

    for line in content.lines().map(str::trim) {
        // Skip comments and empty lines
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if let Some((name, entries)) = current.take() {
                insert_section(&mut sections, name, entries)?;
            }
            current = Some((name.trim().to_lowercase(), HashMap::new()));
            continue;
        }

        // Lines before the first section are ignored
        let Some((_, entries)) = current.as_mut() else {
            continue;
        };

        let Some((name, value)) = line.split_once('=') else {
            continue;
        };

        entries.insert(name.trim().to_uppercase(), unquote(value.trim()).to_string());
    }

    if let Some((name, entries)) = current {
        insert_section(&mut sections, name, entries)?;
    }

    Ok(sections)
}

fn insert_section(
    sections: &mut ParsedFile,
    name: String,
    entries: ParsedSection,
) -> Result<(), ParseError> {
    if sections.contains_key(&name) {
        return Err(ParseError::DuplicateSection(name));
    }
    sections.insert(name, entries);
    Ok(())
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Parse a configuration file from disk
pub async fn parse_config_file(path: &Path) -> Result<ParsedFile, ParseError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_file(&content)
}

/// Parse a yes/no value
pub fn parse_yesno(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Some(true),
        "no" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Parse duration (e.g., "5s", "100ms", "1min")
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();

    if let Some(n) = s.strip_suffix("ms") {
        n.trim().parse().ok().map(Duration::from_millis)
    } else if let Some(n) = s.strip_suffix("min") {
        n.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(n) = s.strip_suffix('s') {
        n.trim().parse().ok().map(Duration::from_secs)
    } else {
        // Bare number = seconds
        s.parse().ok().map(Duration::from_secs)
    }
}
