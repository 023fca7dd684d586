//! Single-line, redacted rendering of log records

use crate::redaction::Redactor;
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use skiff_core::AppSettings;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Severity code used whenever a record carries an exception
pub const EXCEPTION_CODE: char = 'X';

/// Severity code for records without a usable severity name
pub const UNKNOWN_CODE: char = 'U';

const FIELD_SEPARATOR: &str = "|";
const MISSING: &str = "-";

/// One structured diagnostic record
#[derive(Debug, Clone)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    /// Emitting module or subsystem
    pub component: String,
    pub function: String,
    pub line: Option<u32>,
    pub message: String,
    /// Severity name, e.g. `INFO`
    pub severity: String,
    pub exception: Option<ExceptionInfo>,
    pub session_id: String,
    pub user_id: Option<String>,
}

impl Record {
    pub fn new(severity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component: MISSING.to_string(),
            function: MISSING.to_string(),
            line: None,
            message: message.into(),
            severity: severity.into(),
            exception: None,
            session_id: MISSING.to_string(),
            user_id: None,
        }
    }

    pub fn with_location(
        mut self,
        component: impl Into<String>,
        function: impl Into<String>,
        line: u32,
    ) -> Self {
        self.component = component.into();
        self.function = function.into();
        self.line = Some(line);
        self
    }

    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

/// An error flattened for inline rendering; never a multi-line trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub kind: Option<String>,
    pub message: String,
    /// Source chain, outermost first
    pub causes: Vec<String>,
}

impl ExceptionInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Capture an error and its `source()` chain
    pub fn from_error(error: &(dyn StdError + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            kind: None,
            message: error.to_string(),
            causes,
        }
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kind) = &self.kind {
            write!(f, "{}: ", kind)?;
        }
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, " <- {}", cause)?;
        }
        Ok(())
    }
}

/// Map a severity name to its one-letter code
pub fn severity_code(severity: &str, has_exception: bool) -> char {
    if has_exception {
        return EXCEPTION_CODE;
    }
    severity
        .trim()
        .chars()
        .next()
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or(UNKNOWN_CODE)
}

/// Collapse line breaks and tabs so one record is one line
pub fn single_line(text: &str) -> String {
    text.replace("\r\n", " - ")
        .replace(['\n', '\r'], " - ")
        .replace('\t', " ")
}

/// Renders records as
/// `SEVERITY|app|commit|installation|session|user|timestamp|component|function|line|message`
#[derive(Debug, Clone)]
pub struct RedactingFormatter {
    app: Arc<AppSettings>,
    redactor: Redactor,
}

impl RedactingFormatter {
    /// Paths below `root_marker` stay readable; defaults to the app name
    pub fn new(app: Arc<AppSettings>, root_marker: Option<&str>) -> Result<Self> {
        let marker = root_marker.unwrap_or(app.name.as_str()).to_string();
        let redactor = Redactor::new(marker)?;
        Ok(Self { app, redactor })
    }

    pub fn with_redactor(app: Arc<AppSettings>, redactor: Redactor) -> Self {
        Self { app, redactor }
    }

    pub fn app(&self) -> &AppSettings {
        &self.app
    }

    /// Format one record; the result never contains a line break
    pub fn format(&self, record: &Record) -> String {
        let code = severity_code(&record.severity, record.exception.is_some());

        let mut body = self.redactor.redact_message(&record.message);
        if let Some(exception) = &record.exception {
            body.push_str(" | exception=");
            body.push_str(&self.redactor.redact(&exception.to_string()));
        }

        let user = record
            .user_id
            .as_deref()
            .or(self.app.user_id.as_deref())
            .map(|user| self.redactor.redact(user))
            .unwrap_or_else(|| MISSING.to_string());
        let line = record
            .line
            .map(|l| l.to_string())
            .unwrap_or_else(|| MISSING.to_string());
        let timestamp = record
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        let fields = [
            code.to_string(),
            self.app.name.clone(),
            self.app.commit.clone(),
            self.app.installation_id.clone(),
            record.session_id.clone(),
            user,
            timestamp,
            record.component.clone(),
            record.function.clone(),
            line,
            body,
        ];

        fields
            .iter()
            .map(|field| single_line(field))
            .collect::<Vec<_>>()
            .join(FIELD_SEPARATOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use regex::Regex;

    fn formatter() -> RedactingFormatter {
        let app = AppSettings::new("skiff", "abc1234", "sess01", "inst01");
        RedactingFormatter::new(Arc::new(app), None).unwrap()
    }

    fn record(message: &str) -> Record {
        Record::new("INFO", message)
            .with_location("skiff::menu", "run", 42)
            .with_session("sess01")
    }

    #[test]
    fn test_header_layout() {
        let mut rec = record("hello");
        rec.timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();

        let line = formatter().format(&rec);
        assert_eq!(
            line,
            "I|skiff|abc1234|inst01|sess01|-|2024-03-01T12:30:05.000Z|skiff::menu|run|42|hello"
        );
    }

    #[test]
    fn test_severity_codes() {
        assert_eq!(severity_code("WARN", false), 'W');
        assert_eq!(severity_code("debug", false), 'D');
        assert_eq!(severity_code("INFO", true), EXCEPTION_CODE);
        assert_eq!(severity_code("", false), UNKNOWN_CODE);
        assert_eq!(severity_code("   ", false), UNKNOWN_CODE);
    }

    #[test]
    fn test_exception_is_flattened_inline() {
        let exception = ExceptionInfo {
            kind: Some("IoError".to_string()),
            message: "read failed\n  at frame 1".to_string(),
            causes: vec!["permission denied".to_string()],
        };
        let rec = record("loading portfolio").with_exception(exception);

        let line = formatter().format(&rec);
        assert!(line.starts_with("X|"));
        assert!(line.ends_with(
            "loading portfolio | exception=IoError: read failed -   at frame 1 <- permission denied"
        ));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_exception_from_error_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let outer = crate::Error::Io(inner);
        let info = ExceptionInfo::from_error(&outer);

        assert_eq!(info.message, "IO error: missing");
        assert!(info.causes.is_empty() || info.causes[0] == "missing");
    }

    #[test]
    fn test_output_is_single_line() {
        let line = formatter().format(&record("first\nsecond\r\nthird\tfourth"));
        assert!(!line.contains('\n'));
        assert!(!line.contains('\r'));
        assert!(!line.contains('\t'));
        assert!(line.ends_with("first - second - third fourth"));
    }

    #[test]
    fn test_user_id_falls_back_to_app_settings() {
        let app = AppSettings::new("skiff", "c", "s", "i").with_user_id("user-9");
        let formatter = RedactingFormatter::new(Arc::new(app), None).unwrap();

        let line = formatter.format(&record("x"));
        assert_eq!(line.split('|').nth(5), Some("user-9"));

        let mut own = record("x");
        own.user_id = Some("user-1".to_string());
        assert_eq!(formatter.format(&own).split('|').nth(5), Some("user-1"));
    }

    #[test]
    fn test_no_ip_or_email_survives() {
        let dotted_quad = Regex::new(r"[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+").unwrap();
        let messages = [
            "user bob@example.org logged in from 10.1.2.3",
            "proxy=172.16.0.1:8080 mail:<ops@corp.io>",
            "1.2.3.4.5 and 255.255.255.255/24",
            "path /Users/bob@home.net/files/8.8.8.8.txt",
        ];

        let formatter = formatter();
        for message in messages {
            let line = formatter.format(&record(message));
            assert!(!dotted_quad.is_match(&line), "IPv4 survived in {}", line);
            for token in line.split_whitespace() {
                assert!(
                    !(token.contains('@') && token.contains('.')),
                    "email survived in {}",
                    line
                );
            }
        }
    }

    #[test]
    fn test_email_shaped_user_id_is_filtered() {
        let mut rec = record("signed in");
        rec.user_id = Some("jane.doe@example.com".to_string());
        assert_eq!(formatter().format(&rec).split('|').nth(5), Some("FILTERED_EMAIL"));

        let app = AppSettings::new("skiff", "c", "s", "i").with_user_id("ops@corp.io");
        let formatter = RedactingFormatter::new(Arc::new(app), None).unwrap();
        assert_eq!(formatter.format(&record("x")).split('|').nth(5), Some("FILTERED_EMAIL"));
    }

    #[test]
    fn test_exempt_message_kept_verbatim() {
        let line = formatter().format(&record("QUEUE: /home/bob/x 10.0.0.1"));
        assert!(line.ends_with("|QUEUE: /home/bob/x 10.0.0.1"));
    }
}
