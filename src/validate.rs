//! Output validation: classify an actual output against an expected value
//! under a named match policy.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum MatchType {
    Exact,
    #[default]
    Contains,
    Regex,
    Datetime,
    Set,
    In,
}

impl FromStr for MatchType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(MatchType::Exact),
            "contains" => Ok(MatchType::Contains),
            "regex" => Ok(MatchType::Regex),
            "datetime" => Ok(MatchType::Datetime),
            "set" => Ok(MatchType::Set),
            "in" => Ok(MatchType::In),
            _ => Err(()),
        }
    }
}

/// Unknown policies behave like `contains`.
impl From<String> for MatchType {
    fn from(s: String) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchType::Exact => "exact",
            MatchType::Contains => "contains",
            MatchType::Regex => "regex",
            MatchType::Datetime => "datetime",
            MatchType::Set => "set",
            MatchType::In => "in",
        })
    }
}

/// Expected value: a single string or a collection of strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Expected {
    Text(String),
    Set(Vec<String>),
}

impl Default for Expected {
    fn default() -> Self {
        Expected::Text(String::new())
    }
}

impl From<&str> for Expected {
    fn from(s: &str) -> Self {
        Expected::Text(s.to_string())
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::Text(s) => f.write_str(s),
            Expected::Set(v) => write!(f, "{v:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub passed: bool,
    /// The actual output on success, an expected-vs-actual note otherwise.
    pub diagnostic: String,
}

impl Validation {
    fn judge(passed: bool, actual: &str, expected: &Expected, match_type: MatchType) -> Self {
        let diagnostic = if passed {
            actual.to_string()
        } else {
            format!("expected ({match_type}) '{expected}', got '{actual}'")
        };
        Self { passed, diagnostic }
    }
}

static DATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\d{1,2}:\d{2}:\d{2}",
        r"\d{1,2}/\d{1,2}/\d{4}",
        r"\d{4}-\d{1,2}-\d{1,2}",
        r"[A-Za-z]{3}\s+[A-Za-z]{3}\s+\d{1,2}\s+\d{1,2}:\d{2}:\d{2}",
        r"\d+[-/: ]\d+[-/: ]\d+",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

const DATE_FORMATS: &[&str] = &[
    "%a %b %d %H:%M:%S %Y",
    "%Y-%m-%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%H:%M:%S %d-%m-%Y",
];

/// Minimum digits for a bare numeral to pass as a Unix timestamp.
const TIMESTAMP_DIGITS: usize = 9;

pub fn validate(actual: &str, expected: &Expected, match_type: MatchType) -> Validation {
    let passed = match (match_type, expected) {
        (MatchType::Set, Expected::Set(want)) => set_matches(&[actual], want),
        (MatchType::Set, Expected::Text(want)) => set_matches(&[actual], std::slice::from_ref(want)),
        (MatchType::Datetime, _) => looks_like_datetime(actual),
        (_, Expected::Text(want)) => matches_text(actual, want, match_type),
        (_, Expected::Set(wants)) => wants.iter().any(|w| matches_text(actual, w, match_type)),
    };
    let mut v = Validation::judge(passed, actual, expected, match_type);
    if !passed
        && match_type == MatchType::Regex
        && let Expected::Text(pattern) = expected
        && let Err(e) = Regex::new(pattern)
    {
        v.diagnostic = format!("invalid regex '{pattern}': {e}");
    }
    v
}

fn matches_text(actual: &str, expected: &str, match_type: MatchType) -> bool {
    match match_type {
        MatchType::Exact => actual == expected,
        MatchType::Regex => Regex::new(expected)
            .map(|re| re.is_match(actual))
            .unwrap_or(false),
        MatchType::Datetime => looks_like_datetime(actual),
        MatchType::Set => actual == expected,
        MatchType::Contains | MatchType::In => actual.contains(expected),
    }
}

/// Order- and duplicate-independent membership equality.
pub fn set_matches<S: AsRef<str>>(actual: &[S], expected: &[String]) -> bool {
    let a: BTreeSet<&str> = actual.iter().map(AsRef::as_ref).collect();
    let e: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
    a == e
}

fn looks_like_datetime(actual: &str) -> bool {
    if DATE_PATTERNS.iter().any(|re| re.is_match(actual)) {
        return true;
    }
    let trimmed = actual.trim();
    let parses = |s: &str| {
        DATE_FORMATS
            .iter()
            .any(|fmt| NaiveDateTime::parse_from_str(s, fmt).is_ok())
    };
    if parses(trimmed) || trimmed.lines().any(|l| parses(l.trim())) {
        return true;
    }
    trimmed.len() >= TIMESTAMP_DIGITS && trimmed.bytes().all(|b| b.is_ascii_digit())
}
