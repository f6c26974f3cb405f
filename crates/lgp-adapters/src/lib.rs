//! External collaborators at their interface: page-text fetching and mail transport.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use lgp_core::FETCH_ERROR_MARKER;
use lgp_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{Html, Node, Selector};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "lgp-adapters";

pub const HOMEPAGE_TEXT_LIMIT: usize = 3000;
pub const SERVICES_TEXT_LIMIT: usize = 2000;

const HOMEPAGE_EXCLUDED: &[&str] = &["script", "style", "nav", "footer", "header"];
const SERVICES_EXCLUDED: &[&str] = &["script", "style", "nav", "footer"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageText {
    pub homepage: String,
    pub services: String,
}

#[derive(Debug, Error)]
pub enum PageFetchError {
    #[error("{marker}invalid url {url:?}: {reason}", marker = FETCH_ERROR_MARKER)]
    InvalidUrl { url: String, reason: String },
    #[error("{marker}{0}", marker = FETCH_ERROR_MARKER)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait PageTextSource: Send + Sync {
    /// Homepage text plus best-effort services text. An empty url yields empty text.
    async fn fetch_page_text(&self, url: &str) -> Result<PageText, PageFetchError>;
}

/// Fetches over HTTP and reduces HTML to visible text.
#[derive(Debug, Clone)]
pub struct LivePageSource {
    http: HttpFetcher,
    services_timeout: Duration,
}

impl LivePageSource {
    pub fn new(http: HttpFetcher, services_timeout: Duration) -> Self {
        Self {
            http,
            services_timeout,
        }
    }

    async fn fetch_services(&self, candidates: &[Url]) -> String {
        for candidate in candidates {
            match self
                .http
                .fetch_text(candidate.as_str(), Some(self.services_timeout))
                .await
            {
                Ok(page) => {
                    let doc = Html::parse_document(&page.body);
                    return truncate_chars(
                        &visible_text(&doc, SERVICES_EXCLUDED),
                        SERVICES_TEXT_LIMIT,
                    );
                }
                Err(err) => {
                    debug!(url = %candidate, error = %err, "services candidate failed");
                }
            }
        }
        String::new()
    }
}

#[async_trait]
impl PageTextSource for LivePageSource {
    async fn fetch_page_text(&self, url: &str) -> Result<PageText, PageFetchError> {
        if url.trim().is_empty() {
            return Ok(PageText::default());
        }
        let base = normalize_url(url)?;
        let span = info_span!("page_text", url = %base);

        async move {
            let page = self.http.fetch_text(base.as_str(), None).await?;
            let final_url = Url::parse(&page.final_url).unwrap_or_else(|_| base.clone());

            let (homepage, candidates) = {
                let doc = Html::parse_document(&page.body);
                let homepage =
                    truncate_chars(&visible_text(&doc, HOMEPAGE_EXCLUDED), HOMEPAGE_TEXT_LIMIT);
                (homepage, services_links(&doc, &final_url))
            };

            let services = self.fetch_services(&candidates).await;
            info!(
                homepage_chars = homepage.chars().count(),
                services_chars = services.chars().count(),
                "fetched page text"
            );
            Ok::<_, PageFetchError>(PageText { homepage, services })
        }
        .instrument(span)
        .await
    }
}

/// Prepends `https://` when the input has no http(s) scheme.
pub fn normalize_url(raw: &str) -> Result<Url, PageFetchError> {
    let trimmed = raw.trim();
    let candidate = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    Url::parse(&candidate).map_err(|err| PageFetchError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })
}

/// Text nodes outside `excluded` elements, single-space joined and collapsed.
pub fn visible_text(document: &Html, excluded: &[&str]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in document.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| excluded.iter().any(|name| *name == el.name()))
        });
        if !hidden {
            parts.push(text);
        }
    }
    parts
        .iter()
        .flat_map(|part| part.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Candidate services pages in document order, ignoring links inside nav/header/footer.
pub fn services_links(document: &Html, base: &Url) -> Vec<Url> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut out: Vec<Url> = Vec::new();
    for link in document.select(&selector) {
        let in_chrome = link.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| HOMEPAGE_EXCLUDED.iter().any(|name| *name == el.name()))
        });
        if in_chrome {
            continue;
        }
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let href_lower = href.to_lowercase();
        let text_lower = link.text().collect::<String>().to_lowercase();
        let qualifies = href_lower.contains("service")
            || href_lower.contains("what-we-do")
            || text_lower.contains("service");
        if !qualifies {
            continue;
        }
        if let Ok(url) = base.join(href.trim()) {
            if matches!(url.scheme(), "http" | "https") && !out.contains(&url) {
                out.push(url);
            }
        }
    }
    out
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("SMTP credentials are not configured")]
    NotConfigured,
    #[error("invalid email address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("temporary delivery failure: {0}")]
    Transient(String),
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

impl DeliveryError {
    /// Reason text persisted as `Failed: <reason>`.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, recipient: &str, subject: &str, body: &str)
        -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".to_string(),
            port: 465,
            username: None,
            password: None,
        }
    }
}

struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

/// Plain-text mail over SMTP. Port 465 uses implicit TLS, anything else STARTTLS.
///
/// Without credentials the mailer still constructs, and every delivery
/// fails with [`DeliveryError::NotConfigured`].
pub struct SmtpMailer {
    inner: Option<SmtpTransport>,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self, DeliveryError> {
        let (Some(user), Some(password)) = (
            settings.username.as_deref().filter(|v| !v.trim().is_empty()),
            settings.password.as_deref().filter(|v| !v.is_empty()),
        ) else {
            warn!("SMTP credentials missing; deliveries will fail");
            return Ok(Self { inner: None });
        };

        let from: Mailbox = user.parse().map_err(|err: lettre::address::AddressError| {
            DeliveryError::InvalidAddress {
                address: user.to_string(),
                reason: err.to_string(),
            }
        })?;

        let builder = if settings.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
        }
        .map_err(|err| DeliveryError::Transient(err.to_string()))?;

        let transport = builder
            .port(settings.port)
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .build();

        Ok(Self {
            inner: Some(SmtpTransport { transport, from }),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn deliver(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), DeliveryError> {
        let smtp = self.inner.as_ref().ok_or(DeliveryError::NotConfigured)?;
        let to: Mailbox = recipient
            .trim()
            .parse()
            .map_err(|err: lettre::address::AddressError| DeliveryError::InvalidAddress {
                address: recipient.to_string(),
                reason: err.to_string(),
            })?;

        let message = Message::builder()
            .from(smtp.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|err| DeliveryError::Rejected(err.to_string()))?;

        let span = info_span!("smtp_deliver", recipient, subject);
        smtp.transport
            .send(message)
            .instrument(span)
            .await
            .map(|_| ())
            .map_err(|err| classify_smtp_error(&err))
    }
}

fn classify_smtp_error(err: &lettre::transport::smtp::Error) -> DeliveryError {
    let reason = err.to_string();
    let code = err.status().map(|code| code.to_string());
    match code.as_deref() {
        Some("530" | "534" | "535") => DeliveryError::Auth(reason),
        _ if err.is_transient() => DeliveryError::Transient(reason),
        _ if err.is_permanent() => DeliveryError::Rejected(reason),
        _ => DeliveryError::Transient(reason),
    }
}
