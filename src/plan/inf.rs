//! Minimal INF reading: enough to filter by hardware id and to label
//! install events with provider, class and version.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Metadata from an INF `[Version]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfInfo {
    pub provider: Option<String>,
    pub class: Option<String>,
    pub version: Option<String>,
}

/// Read an INF as text. INFs shipped by vendors are often UTF-16LE with a BOM.
pub fn read_inf(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
    Ok(decode(&bytes))
}

fn decode(bytes: &[u8]) -> String {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// True when any of `ids` appears in the INF text (case-insensitive).
pub fn matches_hardware_id(content: &str, ids: &[String]) -> bool {
    let haystack = content.to_ascii_lowercase();
    ids.iter()
        .filter(|id| !id.trim().is_empty())
        .any(|id| haystack.contains(&id.trim().to_ascii_lowercase()))
}

pub fn parse_info(content: &str) -> InfInfo {
    let sections = sections(content);
    let strings = sections.get("strings");
    let lookup = |key: &str| -> Option<String> {
        let raw = sections.get("version")?.get(key)?;
        Some(expand_tokens(raw, strings))
    };

    InfInfo {
        provider: lookup("provider"),
        class: lookup("class"),
        version: lookup("driverver"),
    }
}

type Section = HashMap<String, String>;

fn sections(content: &str) -> HashMap<String, Section> {
    let mut out: HashMap<String, Section> = HashMap::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let line = strip_comment(line).trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim().to_ascii_lowercase();
            out.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        let (Some(section), Some((key, value))) = (current.as_ref(), line.split_once('=')) else {
            continue;
        };
        out.entry(section.clone()).or_default().insert(
            key.trim().to_ascii_lowercase(),
            value.trim().trim_matches('"').to_string(),
        );
    }
    out
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Replace `%token%` references with their `[Strings]` values.
fn expand_tokens(raw: &str, strings: Option<&Section>) -> String {
    let Some(strings) = strings else {
        return raw.to_string();
    };
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) => {
                let token = &after[..end];
                match strings.get(&token.to_ascii_lowercase()) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('%');
                        out.push_str(token);
                        out.push('%');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
