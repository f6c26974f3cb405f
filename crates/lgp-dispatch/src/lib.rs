//! Producer session, scheduling, immediate send, and the scheduled-send coordinator.

use std::future::Future;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, Timelike};
use lgp_adapters::{DeliveryError, LivePageSource, Mailer, PageTextSource, SmtpSettings};
use lgp_core::{
    is_fetch_error_text, AuditResult, BusinessIdentity, ComposedEmail, LogOutcome, NewLogEntry,
    NewScheduledSend, SendStatus, ValidationError,
};
use lgp_storage::{HttpClientConfig, HttpFetcher, ScheduleStore, DEFAULT_USER_AGENT};
use serde::Serialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, warn, Instrument};

mod batch;

pub use batch::{run_batch, BatchError, BatchSummary, LeadRow, ResultRow, REQUIRED_COLUMNS};

pub const CRATE_NAME: &str = "lgp-dispatch";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("LGP_STALE_CLAIM_SECS ({stale_secs}) must exceed LGP_DELIVERY_TIMEOUT_SECS ({timeout_secs})")]
    StaleClaimTooShort { stale_secs: u64, timeout_secs: u64 },
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub database_url: String,
    pub poll_interval: Duration,
    pub delivery_timeout: Duration,
    pub due_batch_limit: i64,
    pub stale_claim_after: Duration,
    pub http_timeout: Duration,
    pub services_timeout: Duration,
    pub user_agent: String,
    pub batch_delay: Duration,
    pub smtp: SmtpSettings,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://leadgen.db".to_string(),
            poll_interval: Duration::from_secs(60),
            delivery_timeout: Duration::from_secs(30),
            due_batch_limit: 50,
            stale_claim_after: Duration::from_secs(600),
            http_timeout: Duration::from_secs(10),
            services_timeout: Duration::from_secs(8),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            batch_delay: Duration::from_millis(1000),
            smtp: SmtpSettings::default(),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        #[cfg(not(test))]
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or blank keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            database_url: get("LGP_DATABASE_URL").unwrap_or(defaults.database_url),
            poll_interval: Duration::from_secs(parse_or(
                "LGP_POLL_INTERVAL_SECS",
                get("LGP_POLL_INTERVAL_SECS"),
                60u64,
            )?),
            delivery_timeout: Duration::from_secs(parse_or(
                "LGP_DELIVERY_TIMEOUT_SECS",
                get("LGP_DELIVERY_TIMEOUT_SECS"),
                30u64,
            )?),
            due_batch_limit: parse_or("LGP_DUE_BATCH_LIMIT", get("LGP_DUE_BATCH_LIMIT"), 50i64)?,
            stale_claim_after: Duration::from_secs(parse_or(
                "LGP_STALE_CLAIM_SECS",
                get("LGP_STALE_CLAIM_SECS"),
                600u64,
            )?),
            http_timeout: Duration::from_secs(parse_or(
                "LGP_HTTP_TIMEOUT_SECS",
                get("LGP_HTTP_TIMEOUT_SECS"),
                10u64,
            )?),
            services_timeout: Duration::from_secs(parse_or(
                "LGP_SERVICES_TIMEOUT_SECS",
                get("LGP_SERVICES_TIMEOUT_SECS"),
                8u64,
            )?),
            user_agent: get("LGP_USER_AGENT").unwrap_or(defaults.user_agent),
            batch_delay: Duration::from_millis(parse_or(
                "LGP_BATCH_DELAY_MS",
                get("LGP_BATCH_DELAY_MS"),
                1000u64,
            )?),
            smtp: SmtpSettings {
                host: get("LGP_SMTP_HOST").unwrap_or(defaults.smtp.host),
                port: parse_or("LGP_SMTP_PORT", get("LGP_SMTP_PORT"), 465u16)?,
                username: get("LGP_SMTP_USER"),
                password: get("LGP_SMTP_PASSWORD"),
            },
        };

        // Claims younger than one delivery attempt may still be in flight elsewhere.
        if config.stale_claim_after <= config.delivery_timeout {
            return Err(ConfigError::StaleClaimTooShort {
                stale_secs: config.stale_claim_after.as_secs(),
                timeout_secs: config.delivery_timeout.as_secs(),
            });
        }
        Ok(config)
    }

    pub fn page_source(&self) -> Result<LivePageSource> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        })?;
        Ok(LivePageSource::new(http, self.services_timeout))
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            poll_interval: self.poll_interval,
            delivery_timeout: self.delivery_timeout,
            due_batch_limit: self.due_batch_limit,
            stale_claim_after: self.stale_claim_after,
        }
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = raw else {
        return Ok(default);
    };
    let parsed = value.trim().parse::<T>();
    parsed.map_err(|err| ConfigError::Invalid {
        key,
        reason: err.to_string(),
        value,
    })
}

/// Wall-clock "now" as naive local time, truncated to whole seconds.
pub fn local_now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// One delivery attempt bounded by `timeout`; an elapsed timer is a delivery failure.
pub async fn deliver_with_timeout(
    mailer: &dyn Mailer,
    recipient: &str,
    subject: &str,
    body: &str,
    timeout: Duration,
) -> Result<(), DeliveryError> {
    match tokio::time::timeout(timeout, mailer.deliver(recipient, subject, body)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Timeout(timeout)),
    }
}

/// Generated outreach kept by the interactive session until cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutreachDraft {
    pub business: BusinessIdentity,
    pub homepage_text: String,
    pub services_text: String,
    pub audit: AuditResult,
    pub email: ComposedEmail,
}

/// A draft the operator accepted, possibly with an edited subject or body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedSend {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub business: BusinessIdentity,
}

/// Process-local working state of one interactive operator.
#[derive(Debug, Default)]
pub struct OutreachSession {
    current: Option<OutreachDraft>,
    batch: Option<BatchSummary>,
}

impl OutreachSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates input, audits the text, and replaces the current draft.
    pub fn generate(
        &mut self,
        business: BusinessIdentity,
        homepage_text: &str,
        services_text: &str,
    ) -> Result<&OutreachDraft, ValidationError> {
        business.validate()?;
        if homepage_text.trim().is_empty() {
            return Err(ValidationError::EmptyHomepageText);
        }
        if is_fetch_error_text(homepage_text) {
            return Err(ValidationError::UnusableHomepageText(
                homepage_text.trim().to_string(),
            ));
        }

        let audit = lgp_audit::audit_text(homepage_text, services_text);
        let email = lgp_audit::compose_email(&business.company_name, &business.niche, &audit);
        info!(
            company = %business.company_name,
            issues = audit.len(),
            "generated outreach draft"
        );
        Ok(self.current.insert(OutreachDraft {
            business,
            homepage_text: homepage_text.to_string(),
            services_text: services_text.to_string(),
            audit,
            email,
        }))
    }

    pub fn current(&self) -> Option<&OutreachDraft> {
        self.current.as_ref()
    }

    /// Runs a bulk pass and keeps its summary as the session's current batch report.
    pub async fn process_batch<R: Read, W: Write>(
        &mut self,
        source: &dyn PageTextSource,
        input: R,
        output: W,
        pacing: Duration,
    ) -> Result<&BatchSummary, BatchError> {
        let summary = run_batch(source, input, output, pacing).await?;
        Ok(self.batch.insert(summary))
    }

    pub fn last_batch(&self) -> Option<&BatchSummary> {
        self.batch.as_ref()
    }

    /// Drops both the current draft and the last batch report.
    pub fn clear(&mut self) {
        self.current = None;
        self.batch = None;
    }

    /// `None` when nothing has been generated yet.
    pub fn approve(
        &self,
        recipient: &str,
        subject: Option<String>,
        body: Option<String>,
    ) -> Option<ApprovedSend> {
        let draft = self.current.as_ref()?;
        Some(ApprovedSend {
            recipient: recipient.trim().to_string(),
            subject: subject.unwrap_or_else(|| draft.email.subject.clone()),
            body: body.unwrap_or_else(|| draft.email.body.clone()),
            business: draft.business.clone(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("schedule store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

fn validate_recipient(recipient: &str) -> Result<(), ValidationError> {
    if recipient.contains('@') {
        Ok(())
    } else {
        Err(ValidationError::InvalidRecipient(recipient.to_string()))
    }
}

/// Queues `approved` for delivery at `when`. Nothing is written when validation fails.
pub async fn schedule_send(
    store: &ScheduleStore,
    approved: &ApprovedSend,
    when: NaiveDateTime,
    now: NaiveDateTime,
) -> Result<i64, ScheduleError> {
    validate_recipient(&approved.recipient)?;
    if when <= now {
        return Err(ValidationError::ScheduleNotInFuture {
            requested: when,
            now,
        }
        .into());
    }

    let id = store
        .create(
            &NewScheduledSend {
                recipient: approved.recipient.clone(),
                subject: approved.subject.clone(),
                body: approved.body.clone(),
                business: approved.business.clone(),
                scheduled_time: when,
            },
            now,
        )
        .await?;
    info!(id, recipient = %approved.recipient, scheduled_time = %when, "scheduled email");
    Ok(id)
}

#[derive(Debug)]
pub struct DeliveryReport {
    pub outcome: LogOutcome,
    pub error: Option<DeliveryError>,
    pub log_id: i64,
}

impl DeliveryReport {
    pub fn delivered(&self) -> bool {
        self.error.is_none()
    }
}

/// Immediate send. Delivery failure is reported and logged, never raised.
pub async fn send_now(
    store: &ScheduleStore,
    mailer: &dyn Mailer,
    approved: &ApprovedSend,
    timeout: Duration,
) -> Result<DeliveryReport> {
    let span = info_span!("send_now", recipient = %approved.recipient);
    let result = deliver_with_timeout(
        mailer,
        &approved.recipient,
        &approved.subject,
        &approved.body,
        timeout,
    )
    .instrument(span)
    .await;

    let (outcome, error) = match result {
        Ok(()) => (LogOutcome::Sent, None),
        Err(err) => {
            warn!(recipient = %approved.recipient, error = %err, "immediate send failed");
            (LogOutcome::Failed, Some(err))
        }
    };

    let log_id = store
        .append_log(&NewLogEntry {
            timestamp: local_now(),
            business: approved.business.clone(),
            contact_email: approved.recipient.clone(),
            subject: approved.subject.clone(),
            body: approved.body.clone(),
            outcome,
            notes: error.as_ref().map(DeliveryError::reason),
        })
        .await
        .context("logging immediate send")?;

    Ok(DeliveryReport {
        outcome,
        error,
        log_id,
    })
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub poll_interval: Duration,
    pub delivery_timeout: Duration,
    pub due_batch_limit: i64,
    pub stale_claim_after: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        DispatchConfig::default().coordinator_settings()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub due: usize,
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub lost_claims: usize,
    pub store_errors: usize,
}

/// Polls the store for due rows and delivers each one at most once.
pub struct DispatchCoordinator {
    store: ScheduleStore,
    mailer: Arc<dyn Mailer>,
    settings: CoordinatorSettings,
}

impl DispatchCoordinator {
    pub fn new(store: ScheduleStore, mailer: Arc<dyn Mailer>, settings: CoordinatorSettings) -> Self {
        Self {
            store,
            mailer,
            settings,
        }
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    /// Fails rows left in `Sending` by a dispatcher that stopped mid-delivery.
    pub async fn reconcile_interrupted(&self, now: NaiveDateTime) -> Result<usize> {
        let stale_secs = i64::try_from(self.settings.stale_claim_after.as_secs()).unwrap_or(i64::MAX);
        let claimed_before = now
            .checked_sub_signed(chrono::Duration::seconds(stale_secs))
            .unwrap_or(NaiveDateTime::MIN);
        let reconciled = self
            .store
            .reconcile_stale_claims(claimed_before, now)
            .await?;
        if !reconciled.is_empty() {
            warn!(count = reconciled.len(), "marked interrupted deliveries as failed");
        }
        Ok(reconciled.len())
    }

    /// One bounded pass over due rows, processed sequentially.
    ///
    /// A store error on one row is logged and counted; the rest of the batch still runs.
    pub async fn poll_once(&self, now: NaiveDateTime) -> Result<PollSummary> {
        let due = self
            .store
            .list_due(now, self.settings.due_batch_limit)
            .await?;
        let mut summary = PollSummary {
            due: due.len(),
            ..PollSummary::default()
        };

        for task in due {
            match self.store.claim(task.id, now).await {
                Ok(true) => summary.claimed += 1,
                Ok(false) => {
                    info!(id = task.id, "claim lost to another dispatcher");
                    summary.lost_claims += 1;
                    continue;
                }
                Err(err) => {
                    error!(id = task.id, error = ?err, "claiming scheduled email failed");
                    summary.store_errors += 1;
                    continue;
                }
            }

            let span = info_span!("scheduled_delivery", id = task.id, recipient = %task.recipient);
            let result = deliver_with_timeout(
                self.mailer.as_ref(),
                &task.recipient,
                &task.subject,
                &task.body,
                self.settings.delivery_timeout,
            )
            .instrument(span)
            .await;

            let (status, outcome, notes) = match &result {
                Ok(()) => (SendStatus::Sent, LogOutcome::ScheduledSent, None),
                Err(err) => (
                    SendStatus::Failed(err.reason()),
                    LogOutcome::ScheduledFailed,
                    Some(err.reason()),
                ),
            };
            let log = NewLogEntry::for_scheduled(&task, local_now().max(now), outcome, notes);
            match self.store.complete(task.id, &status, &log).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    // Row stays in `Sending` until stale-claim reconciliation fails it.
                    error!(id = task.id, %status, error = ?err, "recording delivery outcome failed");
                    summary.store_errors += 1;
                    continue;
                }
            }

            match result {
                Ok(()) => {
                    info!(id = task.id, recipient = %task.recipient, "scheduled email sent");
                    summary.sent += 1;
                }
                Err(err) => {
                    warn!(id = task.id, recipient = %task.recipient, error = %err, "scheduled email failed");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Reconciles stale claims and polls on a fixed interval until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            "dispatcher started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("dispatcher stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let now = local_now();
                    if let Err(err) = self.reconcile_interrupted(now).await {
                        error!(error = ?err, "reconciling interrupted deliveries failed");
                    }
                    match self.poll_once(now).await {
                        Ok(summary) if summary.due > 0 => info!(?summary, "poll complete"),
                        Ok(_) => {}
                        Err(err) => error!(error = ?err, "poll failed"),
                    }
                }
            }
        }
        Ok(())
    }
}
