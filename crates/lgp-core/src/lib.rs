//! Core domain model for LeadGen Pro: audit findings, composed outreach, and scheduled sends.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "lgp-core";

/// Storage and display format for every persisted timestamp (naive local time).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Prefix a failed page fetch carries in place of homepage text.
pub const FETCH_ERROR_MARKER: &str = "Error scraping: ";

/// Upper bound on issue sentences kept from one audit.
pub const MAX_AUDIT_ISSUES: usize = 4;

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT)
}

/// True when `text` is the error-carrying stand-in produced by a failed fetch.
pub fn is_fetch_error_text(text: &str) -> bool {
    text.trim_start().starts_with(FETCH_ERROR_MARKER)
}

/// Canonical conversion defects. Composition looks these up; synonyms never reach storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKey {
    ValueProp,
    Cta,
    Trust,
    Differentiation,
    Sparse,
    Dense,
    Contact,
    Services,
}

impl IssueKey {
    pub const ALL: [IssueKey; 8] = [
        IssueKey::ValueProp,
        IssueKey::Cta,
        IssueKey::Trust,
        IssueKey::Differentiation,
        IssueKey::Sparse,
        IssueKey::Dense,
        IssueKey::Contact,
        IssueKey::Services,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IssueKey::ValueProp => "value_prop",
            IssueKey::Cta => "cta",
            IssueKey::Trust => "trust",
            IssueKey::Differentiation => "differentiation",
            IssueKey::Sparse => "sparse",
            IssueKey::Dense => "dense",
            IssueKey::Contact => "contact",
            IssueKey::Services => "services",
        }
    }
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, capped list of human-readable issue sentences in detection order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditResult {
    issues: Vec<String>,
}

impl AuditResult {
    /// Keeps the first [`MAX_AUDIT_ISSUES`] sentences; order is never changed.
    pub fn from_issues(mut issues: Vec<String>) -> Self {
        issues.truncate(MAX_AUDIT_ISSUES);
        Self { issues }
    }

    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    /// Issues joined for tabular export, or the literal `None detected`.
    pub fn joined(&self, delimiter: &str) -> String {
        if self.issues.is_empty() {
            "None detected".to_string()
        } else {
            self.issues.join(delimiter)
        }
    }
}

/// Who the outreach is about.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusinessIdentity {
    pub company_name: String,
    pub website: String,
    pub niche: String,
}

impl BusinessIdentity {
    pub fn new(
        company_name: impl Into<String>,
        website: impl Into<String>,
        niche: impl Into<String>,
    ) -> Self {
        Self {
            company_name: company_name.into(),
            website: website.into(),
            niche: niche.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.company_name.trim().is_empty() {
            return Err(ValidationError::MissingCompanyName);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedEmail {
    pub subject: String,
    pub body: String,
}

/// Lifecycle of a scheduled send. `Sending` is the in-flight claim marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    Pending,
    Sending,
    Sent,
    Failed(String),
}

impl SendStatus {
    pub const PENDING: &'static str = "Pending";
    pub const SENDING: &'static str = "Sending";
    pub const SENT: &'static str = "Sent";
    const FAILED_PREFIX: &'static str = "Failed: ";

    pub fn is_terminal(&self) -> bool {
        matches!(self, SendStatus::Sent | SendStatus::Failed(_))
    }

    pub fn to_db(&self) -> String {
        match self {
            SendStatus::Pending => Self::PENDING.to_string(),
            SendStatus::Sending => Self::SENDING.to_string(),
            SendStatus::Sent => Self::SENT.to_string(),
            SendStatus::Failed(reason) => format!("{}{reason}", Self::FAILED_PREFIX),
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            Self::PENDING => SendStatus::Pending,
            Self::SENDING => SendStatus::Sending,
            Self::SENT => SendStatus::Sent,
            other => SendStatus::Failed(
                other
                    .strip_prefix(Self::FAILED_PREFIX)
                    .or_else(|| other.strip_prefix("Failed"))
                    .unwrap_or(other)
                    .trim()
                    .to_string(),
            ),
        }
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_db())
    }
}

/// Producer-side request for a deferred send; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewScheduledSend {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub business: BusinessIdentity,
    pub scheduled_time: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSend {
    pub id: i64,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub business: BusinessIdentity,
    pub scheduled_time: NaiveDateTime,
    pub status: SendStatus,
    pub created_at: NaiveDateTime,
}

/// Outcome label recorded on an email_log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOutcome {
    Sent,
    Failed,
    ScheduledSent,
    ScheduledFailed,
    Interrupted,
}

impl LogOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            LogOutcome::Sent => "sent",
            LogOutcome::Failed => "failed",
            LogOutcome::ScheduledSent => "sent (scheduled)",
            LogOutcome::ScheduledFailed => "failed (scheduled)",
            LogOutcome::Interrupted => "failed (interrupted)",
        }
    }
}

impl fmt::Display for LogOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record to be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub timestamp: NaiveDateTime,
    pub business: BusinessIdentity,
    pub contact_email: String,
    pub subject: String,
    pub body: String,
    pub outcome: LogOutcome,
    pub notes: Option<String>,
}

impl NewLogEntry {
    /// Log entry describing a delivery attempt for a scheduled row.
    pub fn for_scheduled(
        task: &ScheduledSend,
        timestamp: NaiveDateTime,
        outcome: LogOutcome,
        notes: Option<String>,
    ) -> Self {
        Self {
            timestamp,
            business: task.business.clone(),
            contact_email: task.recipient.clone(),
            subject: task.subject.clone(),
            body: task.body.clone(),
            outcome,
            notes,
        }
    }
}

/// Persisted audit record as read back from the log table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailLogEntry {
    pub id: i64,
    pub timestamp: NaiveDateTime,
    pub business: BusinessIdentity,
    pub contact_email: String,
    pub subject: String,
    pub body: String,
    pub status: String,
    pub notes: Option<String>,
}

/// Input rejected before any analysis or persistence happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("company name is required")]
    MissingCompanyName,
    #[error("homepage text is required (paste it or fetch it from the website)")]
    EmptyHomepageText,
    #[error("homepage text is a fetch error, not page content: {0}")]
    UnusableHomepageText(String),
    #[error("recipient address {0:?} is not a valid email address")]
    InvalidRecipient(String),
    #[error("scheduled time {requested} is not in the future (now {now})")]
    ScheduleNotInFuture {
        requested: NaiveDateTime,
        now: NaiveDateTime,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_status_round_trips_failure_reason() {
        let status = SendStatus::Failed("auth failure: 535".into());
        assert_eq!(status.to_db(), "Failed: auth failure: 535");
        assert_eq!(SendStatus::from_db(&status.to_db()), status);
        assert!(status.is_terminal());
        assert!(!SendStatus::Sending.is_terminal());
        assert_eq!(SendStatus::from_db("Pending"), SendStatus::Pending);
    }

    #[test]
    fn audit_result_caps_and_joins() {
        let result = AuditResult::from_issues((0..6).map(|i| format!("issue {i}")).collect());
        assert_eq!(result.len(), MAX_AUDIT_ISSUES);
        assert_eq!(result.issues()[0], "issue 0");
        assert_eq!(result.issues()[3], "issue 3");
        assert_eq!(AuditResult::default().joined(" | "), "None detected");
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = parse_timestamp("2026-03-01 09:05:00").unwrap();
        let b = parse_timestamp("2026-03-01 10:00:00").unwrap();
        assert!(format_timestamp(a) < format_timestamp(b));
    }

    #[test]
    fn fetch_error_marker_is_recognised() {
        assert!(is_fetch_error_text("Error scraping: dns failure"));
        assert!(!is_fetch_error_text("We fix errors in your plumbing"));
    }
}
