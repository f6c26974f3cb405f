use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand};
use lgp_adapters::{PageTextSource, SmtpMailer};
use lgp_core::{format_timestamp, BusinessIdentity};
use lgp_dispatch::{
    local_now, schedule_send, send_now, DispatchConfig, DispatchCoordinator, OutreachSession,
};
use lgp_storage::ScheduleStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SCHEDULE_INPUT_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Parser)]
#[command(name = "lgp")]
#[command(about = "LeadGen Pro: website audits, outreach drafts, and scheduled sends")]
struct Cli {
    /// Overrides LGP_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the scheduled_emails and email_log tables.
    Migrate,
    /// Audit one business and draft an outreach email.
    Audit(AuditArgs),
    /// Audit every lead in a CSV file.
    Batch {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// List recently scheduled sends.
    Scheduled {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List recent email log entries.
    Log {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Deliver scheduled emails as they come due.
    Dispatch {
        /// Run a single poll and exit.
        #[arg(long)]
        once: bool,
    },
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[arg(long)]
    company: String,
    #[arg(long, default_value = "")]
    niche: String,
    #[arg(long, conflicts_with = "homepage_file")]
    url: Option<String>,
    #[arg(long)]
    homepage_file: Option<PathBuf>,
    #[arg(long)]
    services_file: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    #[arg(long, conflicts_with = "schedule_to")]
    send_to: Option<String>,
    #[arg(long, requires = "at")]
    schedule_to: Option<String>,
    /// Local send time, "YYYY-MM-DD HH:MM".
    #[arg(long, requires = "schedule_to")]
    at: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = DispatchConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command {
        Commands::Migrate => {
            ScheduleStore::connect(&config.database_url).await?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Audit(args) => audit(&config, args).await?,
        Commands::Batch { input, output } => {
            let source = config.page_source()?;
            let reader = BufReader::new(
                File::open(&input).with_context(|| format!("opening {}", input.display()))?,
            );
            let writer = BufWriter::new(
                File::create(&output).with_context(|| format!("creating {}", output.display()))?,
            );
            let mut session = OutreachSession::new();
            let summary = session
                .process_batch(&source, reader, writer, config.batch_delay)
                .await?;
            println!(
                "batch complete: run_id={} rows={} fetched={} fetch_failed={} skipped={} output={}",
                summary.run_id,
                summary.rows,
                summary.fetched_ok,
                summary.fetch_failed,
                summary.skipped,
                output.display()
            );
        }
        Commands::Scheduled { limit } => {
            let store = ScheduleStore::connect(&config.database_url).await?;
            for task in store.list_recent(limit).await? {
                println!(
                    "#{} {} -> {} [{}] {} ({})",
                    task.id,
                    format_timestamp(task.scheduled_time),
                    task.recipient,
                    task.status,
                    task.subject,
                    task.business.company_name
                );
            }
        }
        Commands::Log { limit } => {
            let store = ScheduleStore::connect(&config.database_url).await?;
            for entry in store.recent_log(limit).await? {
                println!(
                    "{} {} <{}> {}{}",
                    format_timestamp(entry.timestamp),
                    entry.business.company_name,
                    entry.contact_email,
                    entry.status,
                    entry
                        .notes
                        .as_deref()
                        .filter(|n| !n.is_empty())
                        .map(|n| format!(" ({n})"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Dispatch { once } => {
            let store = ScheduleStore::connect(&config.database_url).await?;
            let mailer = Arc::new(SmtpMailer::new(&config.smtp)?);
            let coordinator =
                DispatchCoordinator::new(store, mailer, config.coordinator_settings());
            if once {
                let now = local_now();
                let reconciled = coordinator.reconcile_interrupted(now).await?;
                let summary = coordinator.poll_once(now).await?;
                println!(
                    "poll complete: due={} claimed={} sent={} failed={} lost_claims={} store_errors={} reconciled={}",
                    summary.due,
                    summary.claimed,
                    summary.sent,
                    summary.failed,
                    summary.lost_claims,
                    summary.store_errors,
                    reconciled
                );
            } else {
                info!(database_url = %config.database_url, "starting dispatcher; Ctrl+C to stop");
                coordinator
                    .run(async {
                        let _ = tokio::signal::ctrl_c().await;
                    })
                    .await?;
            }
        }
    }

    Ok(())
}

async fn audit(config: &DispatchConfig, args: AuditArgs) -> Result<()> {
    let website = args.url.clone().unwrap_or_default();
    let (homepage, fetched_services) = match (&args.homepage_file, &args.url) {
        (Some(path), _) => (
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
            String::new(),
        ),
        (None, Some(url)) => match config.page_source()?.fetch_page_text(url).await {
            Ok(page) => (page.homepage, page.services),
            // Rejected below as unusable homepage text.
            Err(err) => (err.to_string(), String::new()),
        },
        (None, None) => bail!("provide --url or --homepage-file"),
    };
    let services = match &args.services_file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
        }
        None => fetched_services,
    };

    let mut session = OutreachSession::new();
    let draft = session.generate(
        BusinessIdentity::new(args.company.trim(), website, args.niche.trim()),
        &homepage,
        &services,
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(draft)?);
    } else {
        println!("Issues found:");
        if draft.audit.is_empty() {
            println!("  none detected");
        }
        for issue in draft.audit.issues() {
            println!("  - {issue}");
        }
        println!("\nSubject: {}\n\n{}", draft.email.subject, draft.email.body);
    }

    if let Some(recipient) = &args.send_to {
        let approved = session
            .approve(recipient, None, None)
            .context("no draft to send")?;
        let store = ScheduleStore::connect(&config.database_url).await?;
        let mailer = SmtpMailer::new(&config.smtp)?;
        let report = send_now(&store, &mailer, &approved, config.delivery_timeout).await?;
        match report.error {
            None => eprintln!("sent to {recipient}"),
            Some(err) => eprintln!("send to {recipient} failed: {err}"),
        }
    }

    if let (Some(recipient), Some(at)) = (&args.schedule_to, &args.at) {
        let when = NaiveDateTime::parse_from_str(at.trim(), SCHEDULE_INPUT_FORMAT)
            .with_context(|| format!("--at must look like \"YYYY-MM-DD HH:MM\", got {at:?}"))?;
        let approved = session
            .approve(recipient, None, None)
            .context("no draft to schedule")?;
        let store = ScheduleStore::connect(&config.database_url).await?;
        let id = schedule_send(&store, &approved, when, local_now()).await?;
        eprintln!(
            "scheduled #{id} to {recipient} at {}",
            format_timestamp(when)
        );
    }

    Ok(())
}
