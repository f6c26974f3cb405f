//! Bulk lead processing: CSV in, audited outreach CSV out.

use std::io::{Read, Write};
use std::time::Duration;

use chrono::NaiveDateTime;
use lgp_adapters::PageTextSource;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::local_now;

pub const REQUIRED_COLUMNS: [&str; 3] = ["Company Name", "Website URL", "Niche"];

const ISSUE_DELIMITER: &str = " | ";
const STATUS_OK: &str = "OK";
const STATUS_NO_URL: &str = "No URL provided";
const STATUS_SKIPPED: &str = "Skipped: missing company name";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("input is missing required column {0:?}")]
    MissingColumn(String),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LeadRow {
    #[serde(rename = "Company Name", default)]
    pub company_name: String,
    #[serde(rename = "Website URL", default)]
    pub website: String,
    #[serde(rename = "Niche", default)]
    pub niche: String,
    #[serde(rename = "Contact Email", default)]
    pub contact_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRow {
    #[serde(rename = "Company Name")]
    pub company_name: String,
    #[serde(rename = "Website")]
    pub website: String,
    #[serde(rename = "Niche")]
    pub niche: String,
    #[serde(rename = "Contact Email")]
    pub contact_email: String,
    #[serde(rename = "Scrape Status")]
    pub scrape_status: String,
    #[serde(rename = "Issues Found")]
    pub issues_found: String,
    #[serde(rename = "Subject Line")]
    pub subject_line: String,
    #[serde(rename = "Email Body")]
    pub email_body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub rows: usize,
    pub fetched_ok: usize,
    pub fetch_failed: usize,
    pub skipped: usize,
}

/// Audits every lead in `input` and writes one result row per lead to `output`.
///
/// Header problems fail before anything is written; per-row fetch failures
/// degrade to empty text and are reported in the Scrape Status column.
pub async fn run_batch<R: Read, W: Write>(
    source: &dyn PageTextSource,
    input: R,
    output: W,
    pacing: Duration,
) -> Result<BatchSummary, BatchError> {
    let leads = read_leads(input)?;
    let run_id = Uuid::new_v4();
    let started_at = local_now();
    let mut summary = BatchSummary {
        run_id,
        started_at,
        finished_at: started_at,
        rows: leads.len(),
        fetched_ok: 0,
        fetch_failed: 0,
        skipped: 0,
    };
    info!(%run_id, rows = leads.len(), "batch started");

    let mut results = Vec::with_capacity(leads.len());
    for (index, lead) in leads.iter().enumerate() {
        if lead.company_name.trim().is_empty() {
            summary.skipped += 1;
            results.push(skipped_row(lead));
            continue;
        }

        let span = info_span!("batch_row", row = index + 1, company = %lead.company_name);
        let (homepage, services, scrape_status) = if lead.website.trim().is_empty() {
            (String::new(), String::new(), STATUS_NO_URL.to_string())
        } else {
            let fetched = source
                .fetch_page_text(lead.website.trim())
                .instrument(span)
                .await;
            match fetched {
                Ok(page) => {
                    summary.fetched_ok += 1;
                    (page.homepage, page.services, STATUS_OK.to_string())
                }
                Err(err) => {
                    warn!(company = %lead.company_name, error = %err, "page fetch failed");
                    summary.fetch_failed += 1;
                    (String::new(), String::new(), err.to_string())
                }
            }
        };

        let audit = lgp_audit::audit_text(&homepage, &services);
        let email = lgp_audit::compose_email(lead.company_name.trim(), lead.niche.trim(), &audit);
        results.push(ResultRow {
            company_name: lead.company_name.clone(),
            website: lead.website.clone(),
            niche: lead.niche.clone(),
            contact_email: lead.contact_email.clone(),
            scrape_status,
            issues_found: audit.joined(ISSUE_DELIMITER),
            subject_line: email.subject,
            email_body: flatten_newlines(&email.body),
        });

        let fetched_page = !lead.website.trim().is_empty();
        if fetched_page && index + 1 < leads.len() && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
    }

    write_results(output, &results)?;
    summary.finished_at = local_now();
    info!(
        %run_id,
        fetched_ok = summary.fetched_ok,
        fetch_failed = summary.fetch_failed,
        skipped = summary.skipped,
        "batch finished"
    );
    Ok(summary)
}

fn read_leads<R: Read>(input: R) -> Result<Vec<LeadRow>, BatchError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_reader(input);

    let headers = reader.headers()?.clone();
    for required in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == required) {
            return Err(BatchError::MissingColumn(required.to_string()));
        }
    }

    reader
        .deserialize::<LeadRow>()
        .map(|row| row.map_err(BatchError::from))
        .collect()
}

fn write_results<W: Write>(output: W, results: &[ResultRow]) -> Result<(), BatchError> {
    let mut writer = csv::Writer::from_writer(output);
    if results.is_empty() {
        writer.write_record(result_headers())?;
    }
    for row in results {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn result_headers() -> [&'static str; 8] {
    [
        "Company Name",
        "Website",
        "Niche",
        "Contact Email",
        "Scrape Status",
        "Issues Found",
        "Subject Line",
        "Email Body",
    ]
}

fn skipped_row(lead: &LeadRow) -> ResultRow {
    ResultRow {
        company_name: lead.company_name.clone(),
        website: lead.website.clone(),
        niche: lead.niche.clone(),
        contact_email: lead.contact_email.clone(),
        scrape_status: STATUS_SKIPPED.to_string(),
        issues_found: String::new(),
        subject_line: String::new(),
        email_body: String::new(),
    }
}

fn flatten_newlines(body: &str) -> String {
    body.replace("\r\n", " ").replace('\n', " ")
}
