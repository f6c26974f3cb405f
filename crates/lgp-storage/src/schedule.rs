//! SQLite-backed scheduled-send queue and append-only email log.
//!
//! Producers only ever insert `Pending` rows. A coordinator moves a row to
//! `Sending` with a conditional update (the claim) and then to exactly one
//! terminal status; the terminal write and its log entry share a transaction.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use lgp_core::{
    format_timestamp, parse_timestamp, BusinessIdentity, EmailLogEntry, NewLogEntry,
    NewScheduledSend, ScheduledSend, SendStatus,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_emails (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        recipient TEXT NOT NULL,
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        company_name TEXT NOT NULL,
        website TEXT NOT NULL DEFAULT '',
        niche TEXT NOT NULL DEFAULT '',
        scheduled_time TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'Pending',
        created_at TEXT NOT NULL,
        claimed_at TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_scheduled_emails_status_time
        ON scheduled_emails (status, scheduled_time)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS email_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        company_name TEXT NOT NULL,
        website TEXT NOT NULL DEFAULT '',
        contact_email TEXT NOT NULL,
        niche TEXT NOT NULL DEFAULT '',
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        status TEXT NOT NULL,
        notes TEXT
    )
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS email_log_no_update
    BEFORE UPDATE ON email_log
    BEGIN
        SELECT RAISE(ABORT, 'email_log is append-only');
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS email_log_no_delete
    BEFORE DELETE ON email_log
    BEGIN
        SELECT RAISE(ABORT, 'email_log is append-only');
    END
    "#,
];

const SCHEDULED_COLUMNS: &str = "id, recipient, subject, body, company_name, website, niche, \
     scheduled_time, status, created_at";

#[derive(Debug, Clone)]
pub struct ScheduleStore {
    pool: SqlitePool,
}

impl ScheduleStore {
    /// Opens (creating if needed) the database at `database_url` and applies the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?;
        Self::connect_with(options).await
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with(SqliteConnectOptions::new().filename(path.as_ref())).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("opening sqlite database")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema creation.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("applying schema")?;
        }
        Ok(())
    }

    /// Inserts a `Pending` row. The future-time precondition is the caller's job.
    pub async fn create(&self, task: &NewScheduledSend, created_at: NaiveDateTime) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_emails
                (recipient, subject, body, company_name, website, niche, scheduled_time, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.recipient)
        .bind(&task.subject)
        .bind(&task.body)
        .bind(&task.business.company_name)
        .bind(&task.business.website)
        .bind(&task.business.niche)
        .bind(format_timestamp(task.scheduled_time))
        .bind(SendStatus::PENDING)
        .bind(format_timestamp(created_at))
        .execute(&self.pool)
        .await
        .context("inserting scheduled email")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<ScheduledSend>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULED_COLUMNS} FROM scheduled_emails WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading scheduled email {id}"))?;
        row.as_ref().map(scheduled_from_row).transpose()
    }

    /// Pending rows whose scheduled time has arrived, oldest first.
    pub async fn list_due(&self, now: NaiveDateTime, limit: i64) -> Result<Vec<ScheduledSend>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCHEDULED_COLUMNS}
              FROM scheduled_emails
             WHERE status = ?
               AND scheduled_time <= ?
             ORDER BY scheduled_time ASC, id ASC
             LIMIT ?
            "#
        ))
        .bind(SendStatus::PENDING)
        .bind(format_timestamp(now))
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await
        .context("listing due scheduled emails")?;
        rows.iter().map(scheduled_from_row).collect()
    }

    /// Atomically moves a due row from `Pending` to `Sending`.
    ///
    /// Returns `false` when another worker got there first or the row is no longer due.
    pub async fn claim(&self, id: i64, now: NaiveDateTime) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_emails
               SET status = ?,
                   claimed_at = ?
             WHERE id = ?
               AND status = ?
               AND scheduled_time <= ?
            "#,
        )
        .bind(SendStatus::SENDING)
        .bind(format_timestamp(now))
        .bind(id)
        .bind(SendStatus::PENDING)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await
        .with_context(|| format!("claiming scheduled email {id}"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Sets a terminal status once. A row that is already terminal is left untouched.
    pub async fn transition(&self, id: i64, status: &SendStatus) -> Result<bool> {
        if !status.is_terminal() {
            bail!("refusing to transition scheduled email {id} to non-terminal status {status}");
        }
        let result = sqlx::query(
            "UPDATE scheduled_emails SET status = ? WHERE id = ? AND status IN (?, ?)",
        )
        .bind(status.to_db())
        .bind(id)
        .bind(SendStatus::PENDING)
        .bind(SendStatus::SENDING)
        .execute(&self.pool)
        .await
        .with_context(|| format!("transitioning scheduled email {id}"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal transition plus its log entry, committed together or not at all.
    pub async fn complete(&self, id: i64, status: &SendStatus, log: &NewLogEntry) -> Result<bool> {
        if !status.is_terminal() {
            bail!("refusing to complete scheduled email {id} with non-terminal status {status}");
        }
        let mut tx = self.pool.begin().await.context("starting completion transaction")?;

        let updated = sqlx::query(
            "UPDATE scheduled_emails SET status = ? WHERE id = ? AND status IN (?, ?)",
        )
        .bind(status.to_db())
        .bind(id)
        .bind(SendStatus::PENDING)
        .bind(SendStatus::SENDING)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("completing scheduled email {id}"))?;

        if updated.rows_affected() != 1 {
            warn!(id, %status, "scheduled email already terminal; completion skipped");
            tx.rollback().await.context("rolling back skipped completion")?;
            return Ok(false);
        }

        insert_log(&mut *tx, log).await?;
        tx.commit().await.context("committing completion")?;
        Ok(true)
    }

    /// Fails rows stuck in `Sending` since before `claimed_before` with reason `interrupted`.
    pub async fn reconcile_stale_claims(
        &self,
        claimed_before: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<Vec<ScheduledSend>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCHEDULED_COLUMNS}
              FROM scheduled_emails
             WHERE status = ?
               AND (claimed_at IS NULL OR claimed_at <= ?)
             ORDER BY id ASC
            "#
        ))
        .bind(SendStatus::SENDING)
        .bind(format_timestamp(claimed_before))
        .fetch_all(&self.pool)
        .await
        .context("listing stale claims")?;

        let failed = SendStatus::Failed("interrupted".to_string());
        let mut reconciled = Vec::new();
        for row in &rows {
            let task = scheduled_from_row(row)?;
            let log = NewLogEntry::for_scheduled(
                &task,
                now,
                lgp_core::LogOutcome::Interrupted,
                Some("delivery was in flight when the previous dispatcher stopped".to_string()),
            );
            if self.complete(task.id, &failed, &log).await? {
                info!(id = task.id, recipient = %task.recipient, "reconciled interrupted delivery");
                reconciled.push(ScheduledSend {
                    status: failed.clone(),
                    ..task
                });
            }
        }
        Ok(reconciled)
    }

    /// Most recently created rows first; display only.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<ScheduledSend>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULED_COLUMNS} FROM scheduled_emails ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await
        .context("listing recent scheduled emails")?;
        rows.iter().map(scheduled_from_row).collect()
    }

    pub async fn append_log(&self, entry: &NewLogEntry) -> Result<i64> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        insert_log(&mut *conn, entry).await
    }

    pub async fn recent_log(&self, limit: i64) -> Result<Vec<EmailLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, company_name, website, contact_email, niche, subject, body, status, notes
              FROM email_log
             ORDER BY timestamp DESC, id DESC
             LIMIT ?
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await
        .context("listing email log")?;
        rows.iter().map(log_from_row).collect()
    }
}

async fn insert_log(conn: &mut sqlx::SqliteConnection, entry: &NewLogEntry) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO email_log
            (timestamp, company_name, website, contact_email, niche, subject, body, status, notes)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(format_timestamp(entry.timestamp))
    .bind(&entry.business.company_name)
    .bind(&entry.business.website)
    .bind(&entry.contact_email)
    .bind(&entry.business.niche)
    .bind(&entry.subject)
    .bind(&entry.body)
    .bind(entry.outcome.as_str())
    .bind(entry.notes.as_deref())
    .execute(conn)
    .await
    .context("appending email log entry")?;
    Ok(result.last_insert_rowid())
}

fn timestamp_column(row: &SqliteRow, column: &str) -> Result<NaiveDateTime> {
    let raw: String = row
        .try_get(column)
        .with_context(|| format!("decoding {column}"))?;
    parse_timestamp(&raw).with_context(|| format!("parsing {column} value {raw:?}"))
}

fn scheduled_from_row(row: &SqliteRow) -> Result<ScheduledSend> {
    let id: i64 = row.try_get("id").context("decoding scheduled email id")?;
    let status: String = row
        .try_get("status")
        .with_context(|| format!("decoding status for scheduled email {id}"))?;
    Ok(ScheduledSend {
        id,
        recipient: row.try_get("recipient")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        business: BusinessIdentity {
            company_name: row.try_get("company_name")?,
            website: row.try_get("website")?,
            niche: row.try_get("niche")?,
        },
        scheduled_time: timestamp_column(row, "scheduled_time")?,
        status: SendStatus::from_db(&status),
        created_at: timestamp_column(row, "created_at")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<EmailLogEntry> {
    Ok(EmailLogEntry {
        id: row.try_get("id").context("decoding email log id")?,
        timestamp: timestamp_column(row, "timestamp")?,
        business: BusinessIdentity {
            company_name: row.try_get("company_name")?,
            website: row.try_get("website")?,
            niche: row.try_get("niche")?,
        },
        contact_email: row.try_get("contact_email")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        status: row.try_get("status")?,
        notes: row.try_get("notes")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lgp_core::LogOutcome;
    use tempfile::tempdir;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn new_task(recipient: &str, scheduled_time: NaiveDateTime) -> NewScheduledSend {
        NewScheduledSend {
            recipient: recipient.to_string(),
            subject: "Quick thought on Acme".to_string(),
            body: "Hi,\n\nBody\n\nBest".to_string(),
            business: BusinessIdentity::new("Acme", "acme.test", "Plumbing"),
            scheduled_time,
        }
    }

    fn log_for(task: &ScheduledSend, outcome: LogOutcome) -> NewLogEntry {
        NewLogEntry::for_scheduled(task, at(12, 0), outcome, None)
    }

    #[tokio::test]
    async fn list_due_excludes_future_and_terminal_rows() {
        let dir = tempdir().expect("tempdir");
        let store = ScheduleStore::open_path(dir.path().join("lgp.db")).await.expect("store");

        let due = store.create(&new_task("a@x.test", at(9, 0)), at(8, 0)).await.unwrap();
        let future = store.create(&new_task("b@x.test", at(11, 0)), at(8, 0)).await.unwrap();
        let done = store.create(&new_task("c@x.test", at(9, 30)), at(8, 0)).await.unwrap();
        assert!(store.transition(done, &SendStatus::Sent).await.unwrap());

        let listed = store.list_due(at(10, 0), 50).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![due]);
        assert!(listed.iter().all(|t| t.scheduled_time <= at(10, 0)));
        assert!(!ids.contains(&future));

        // Boundary: scheduled exactly at `now` is due.
        let boundary = store.list_due(at(11, 0), 50).await.unwrap();
        assert!(boundary.iter().any(|t| t.id == future));
    }

    #[tokio::test]
    async fn claim_succeeds_once() {
        let dir = tempdir().expect("tempdir");
        let store = ScheduleStore::open_path(dir.path().join("lgp.db")).await.expect("store");
        let id = store.create(&new_task("a@x.test", at(9, 0)), at(8, 0)).await.unwrap();

        assert!(!store.claim(id, at(8, 30)).await.unwrap(), "not due yet");
        assert!(store.claim(id, at(9, 0)).await.unwrap());
        assert!(!store.claim(id, at(9, 0)).await.unwrap());
        assert_eq!(store.get(id).await.unwrap().unwrap().status, SendStatus::Sending);
        assert!(store.list_due(at(10, 0), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transition_never_overwrites_terminal_status() {
        let dir = tempdir().expect("tempdir");
        let store = ScheduleStore::open_path(dir.path().join("lgp.db")).await.expect("store");
        let id = store.create(&new_task("a@x.test", at(9, 0)), at(8, 0)).await.unwrap();

        assert!(store
            .transition(id, &SendStatus::Failed("smtp timeout".into()))
            .await
            .unwrap());
        assert!(!store.transition(id, &SendStatus::Sent).await.unwrap());
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            SendStatus::Failed("smtp timeout".into())
        );
        assert!(store.transition(id, &SendStatus::Pending).await.is_err());
    }

    #[tokio::test]
    async fn completion_writes_exactly_one_log_entry() {
        let dir = tempdir().expect("tempdir");
        let store = ScheduleStore::open_path(dir.path().join("lgp.db")).await.expect("store");
        let id = store.create(&new_task("a@x.test", at(9, 0)), at(8, 0)).await.unwrap();
        assert!(store.claim(id, at(9, 5)).await.unwrap());
        let task = store.get(id).await.unwrap().unwrap();

        assert!(store
            .complete(id, &SendStatus::Sent, &log_for(&task, LogOutcome::ScheduledSent))
            .await
            .unwrap());
        assert!(!store
            .complete(
                id,
                &SendStatus::Failed("late".into()),
                &log_for(&task, LogOutcome::ScheduledFailed)
            )
            .await
            .unwrap());

        let log = store.recent_log(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, "sent (scheduled)");
        assert_eq!(log[0].contact_email, "a@x.test");
        assert_eq!(store.get(id).await.unwrap().unwrap().status, SendStatus::Sent);
    }

    #[tokio::test]
    async fn competing_stores_on_one_file_claim_once() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("lgp.db");
        let first = ScheduleStore::open_path(&path).await.expect("first");
        let second = ScheduleStore::open_path(&path).await.expect("second");
        let id = first.create(&new_task("a@x.test", at(9, 0)), at(8, 0)).await.unwrap();

        let seen_a = first.list_due(at(9, 0), 10).await.unwrap();
        let seen_b = second.list_due(at(9, 0), 10).await.unwrap();
        assert_eq!(seen_a.len(), 1);
        assert_eq!(seen_b.len(), 1);

        let (a, b) = tokio::join!(first.claim(id, at(9, 0)), second.claim(id, at(9, 0)));
        let wins = [a.unwrap(), b.unwrap()].iter().filter(|won| **won).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn stale_claims_are_failed_as_interrupted() {
        let dir = tempdir().expect("tempdir");
        let store = ScheduleStore::open_path(dir.path().join("lgp.db")).await.expect("store");
        let stale = store.create(&new_task("a@x.test", at(9, 0)), at(8, 0)).await.unwrap();
        let fresh = store.create(&new_task("b@x.test", at(9, 0)), at(8, 0)).await.unwrap();
        assert!(store.claim(stale, at(9, 0)).await.unwrap());
        assert!(store.claim(fresh, at(11, 55)).await.unwrap());

        let reconciled = store.reconcile_stale_claims(at(11, 50), at(12, 0)).await.unwrap();
        assert_eq!(reconciled.len(), 1);
        assert_eq!(reconciled[0].id, stale);
        assert_eq!(
            store.get(stale).await.unwrap().unwrap().status,
            SendStatus::Failed("interrupted".into())
        );
        assert_eq!(store.get(fresh).await.unwrap().unwrap().status, SendStatus::Sending);

        let log = store.recent_log(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, "failed (interrupted)");
    }

    #[tokio::test]
    async fn email_log_rejects_mutation() {
        let dir = tempdir().expect("tempdir");
        let store = ScheduleStore::open_path(dir.path().join("lgp.db")).await.expect("store");
        let entry = NewLogEntry {
            timestamp: at(9, 0),
            business: BusinessIdentity::new("Acme", "acme.test", "Plumbing"),
            contact_email: "a@x.test".into(),
            subject: "s".into(),
            body: "b".into(),
            outcome: LogOutcome::Sent,
            notes: None,
        };
        let id = store.append_log(&entry).await.unwrap();

        let update = sqlx::query("UPDATE email_log SET status = 'edited' WHERE id = ?")
            .bind(id)
            .execute(store.pool())
            .await;
        assert!(update.is_err());
        let delete = sqlx::query("DELETE FROM email_log WHERE id = ?")
            .bind(id)
            .execute(store.pool())
            .await;
        assert!(delete.is_err());
        assert_eq!(store.recent_log(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_recent_is_newest_first() {
        let dir = tempdir().expect("tempdir");
        let store = ScheduleStore::open_path(dir.path().join("lgp.db")).await.expect("store");
        let older = store.create(&new_task("a@x.test", at(13, 0)), at(8, 0)).await.unwrap();
        let newer = store.create(&new_task("b@x.test", at(13, 0)), at(8, 30)).await.unwrap();

        let recent = store.list_recent(10).await.unwrap();
        assert_eq!(recent.iter().map(|t| t.id).collect::<Vec<_>>(), vec![newer, older]);
        assert_eq!(recent[0].business.niche, "Plumbing");
    }

    #[tokio::test]
    async fn reopening_keeps_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("lgp.db");
        let id = {
            let store = ScheduleStore::open_path(&path).await.expect("store");
            store.create(&new_task("a@x.test", at(9, 0)), at(8, 0)).await.unwrap()
        };
        let store = ScheduleStore::connect(&format!("sqlite://{}", path.display()))
            .await
            .expect("reopen");
        assert_eq!(store.get(id).await.unwrap().unwrap().recipient, "a@x.test");
    }
}
