//! PII scrubbing for log message bodies

use crate::{Error, Result};
use regex::{Captures, Regex};

/// Replacement for any token holding both `@` and `.`
pub const FILTERED_EMAIL: &str = "FILTERED_EMAIL";

/// Replacement for dotted-quad runs
pub const FILTERED_IP: &str = "FILTERED_IP";

/// Prefix replacing the directories of paths outside the application tree
pub const FILTERED_PATH: &str = "FILTERED_PATH";

/// Messages starting with one of these carry internal diagnostics and are
/// written verbatim.
pub const DEFAULT_EXEMPT_MARKERS: &[&str] = &["CMD:", "QUEUE:"];

const IPV4_PATTERN: &str = r"[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+";
const CREDENTIAL_PATTERN: &str =
    r#"(?i)\b(password|passwd|secret|token|api_?key)(\s*[:=]\s*)("[^"]*"|'[^']*'|[^\s,;]+)"#;
const TOKEN_PATTERN: &str = r"\S+";
const DRIVE_PATTERN: &str = r"^[A-Za-z]:[\\/]";

const LEADING_PUNCTUATION: &[char] = &['"', '\'', '(', '[', '{', '<'];
const TRAILING_PUNCTUATION: &[char] = &['"', '\'', '.', ',', ';', ':', ')', ']', '}', '>', '!', '?'];

/// Rewrites a free-form message so it can leave the user's machine.
///
/// Rules run per whitespace-separated token:
/// 1. a token containing both `@` and `.` becomes [`FILTERED_EMAIL`];
/// 2. an absolute path containing the root marker is cut to start at the marker;
/// 3. any other absolute path keeps only its final component;
/// 4. dotted-quad runs become [`FILTERED_IP`].
///
/// Credential assignments (`password=...`, `api_key: ...`) are masked first.
#[derive(Debug, Clone)]
pub struct Redactor {
    root_marker: String,
    exempt_markers: Vec<String>,
    ipv4: Regex,
    credential: Regex,
    token: Regex,
    drive: Regex,
}

impl Redactor {
    /// Create a redactor that keeps paths below `root_marker` readable
    pub fn new(root_marker: impl Into<String>) -> Result<Self> {
        Ok(Self {
            root_marker: root_marker.into(),
            exempt_markers: DEFAULT_EXEMPT_MARKERS.iter().map(|m| m.to_string()).collect(),
            ipv4: compile(IPV4_PATTERN)?,
            credential: compile(CREDENTIAL_PATTERN)?,
            token: compile(TOKEN_PATTERN)?,
            drive: compile(DRIVE_PATTERN)?,
        })
    }

    pub fn with_exempt_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    pub fn root_marker(&self) -> &str {
        &self.root_marker
    }

    /// Whether `message` is an internal diagnostic payload
    pub fn is_exempt(&self, message: &str) -> bool {
        let trimmed = message.trim_start();
        self.exempt_markers
            .iter()
            .any(|marker| trimmed.starts_with(marker.as_str()))
    }

    /// Redact a message body unless it is exempt
    pub fn redact_message(&self, message: &str) -> String {
        if self.is_exempt(message) {
            return message.to_string();
        }
        self.redact(message)
    }

    /// Redact unconditionally
    pub fn redact(&self, text: &str) -> String {
        let masked = self
            .credential
            .replace_all(text, |caps: &Captures| format!("{}{}[REDACTED]", &caps[1], &caps[2]));

        self.token
            .replace_all(&masked, |caps: &Captures| self.redact_token(&caps[0]))
            .into_owned()
    }

    fn redact_token(&self, token: &str) -> String {
        if token.contains('@') && token.contains('.') {
            return FILTERED_EMAIL.to_string();
        }

        let core = token.trim_start_matches(LEADING_PUNCTUATION);
        let prefix = &token[..token.len() - core.len()];
        let trimmed = core.trim_end_matches(TRAILING_PUNCTUATION);
        let suffix = &core[trimmed.len()..];

        let rewritten = if self.looks_like_path(trimmed) {
            format!("{}{}{}", prefix, self.redact_path(trimmed), suffix)
        } else {
            token.to_string()
        };

        self.ipv4.replace_all(&rewritten, FILTERED_IP).into_owned()
    }

    fn looks_like_path(&self, candidate: &str) -> bool {
        if candidate.len() < 2 {
            return false;
        }
        candidate.starts_with('/')
            || candidate.starts_with("~/")
            || candidate.starts_with("~\\")
            || candidate.starts_with("\\\\")
            || self.drive.is_match(candidate)
    }

    /// Rewrite one absolute path
    pub fn redact_path(&self, path: &str) -> String {
        let normalized = path.replace('\\', "/");
        let components: Vec<&str> = normalized.split('/').filter(|c| !c.is_empty()).collect();

        if let Some(index) = components.iter().position(|c| *c == self.root_marker) {
            return components[index..].join("/");
        }

        match components.last() {
            Some(last) => format!("{}/{}", FILTERED_PATH, last),
            None => FILTERED_PATH.to_string(),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Config {
        message: format!("Invalid redaction pattern '{}': {}", pattern, e),
    })
}
