use regex::Regex;

use crate::error::{Error, Result};

/// Generic "NN%" matcher used when a caller supplies no patterns.
pub const DEFAULT_PATTERN: &str = r"(\d{1,3}(?:\.\d+)?)\s*%";

/// `Verification 42% complete.`
pub const SFC_PATTERNS: &[&str] = &[r"(?i)verification\s+(\d{1,3})\s*%\s+complete"];

/// `[=====     42.3%        ]` progress bar, then bare percentages.
pub const DISM_PATTERNS: &[&str] = &[
    r"\[[=\s]*(\d{1,3}(?:\.\d+)?)%[=\s]*\]",
    r"(\d{1,3}(?:\.\d+)?)\s*%",
];

/// Ordered list of regexes, each capturing one percentage group.
#[derive(Debug, Clone)]
pub struct ProgressMatcher {
    patterns: Vec<Regex>,
}

impl ProgressMatcher {
    /// Compile `patterns` in order. An empty list falls back to [`DEFAULT_PATTERN`].
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let sources: Vec<&str> = if patterns.is_empty() {
            vec![DEFAULT_PATTERN]
        } else {
            patterns.iter().map(AsRef::as_ref).collect()
        };

        let patterns = sources
            .into_iter()
            .map(|p| {
                Regex::new(p).map_err(|source| Error::Pattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Whole percent found in `line`, if any.
    ///
    /// Tools that redraw a bar with carriage returns emit several updates per
    /// line; the last one wins. Values outside 0..=100 do not count as matches.
    pub fn parse(&self, line: &str) -> Option<u8> {
        line.split('\r')
            .filter_map(|segment| self.parse_segment(segment))
            .last()
    }

    fn parse_segment(&self, segment: &str) -> Option<u8> {
        self.patterns.iter().find_map(|re| {
            let caps = re.captures(segment)?;
            let value: f64 = caps.get(1)?.as_str().parse().ok()?;
            (0.0..=100.0).contains(&value).then(|| value.floor() as u8)
        })
    }
}
