//! Automation driver for the reservation portal: login, listing navigation,
//! date filtering and CSV export download.
//!
//! The portal's markup is not a stable contract, so every step matches an
//! ordered list of candidate selectors, first hit wins. The driver holds one
//! exclusive cookie session per store and runs each network step under its
//! own deadline.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rbetl_core::{DateWindow, RawExtract, StoreConfig};
use rbetl_storage::{RetryClass, RetryDisposition};
use reqwest::redirect;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

pub const CRATE_NAME: &str = "rbetl-portal";

#[derive(Debug, Error)]
pub enum PortalError {
    /// The portal demanded a second authentication factor. Unwinnable for an
    /// unattended run; the store is skipped without burning retry budget.
    #[error("portal requires a second authentication factor for this account")]
    AuthenticationRequired,
    #[error("step '{step}' did not complete within {timeout_ms}ms")]
    NavigationTimeout { step: &'static str, timeout_ms: u64 },
    #[error("step '{step}' matched none of its candidate selectors")]
    ElementNotFound { step: &'static str },
    #[error("no reservation export materialized within the download window")]
    DownloadNotFound,
    #[error("portal returned http status {status} at {url}")]
    HttpStatus { status: u16, url: String },
    #[error("login rejected for this account")]
    LoginRejected,
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("download io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid portal url: {0}")]
    Url(#[from] url::ParseError),
    #[error("session is not open")]
    SessionNotOpen,
}

impl RetryClass for PortalError {
    fn retry_disposition(&self) -> RetryDisposition {
        match self {
            // Auth conditions do not heal between attempts.
            PortalError::AuthenticationRequired
            | PortalError::LoginRejected
            | PortalError::SessionNotOpen
            | PortalError::Url(_) => RetryDisposition::Terminal,
            PortalError::NavigationTimeout { .. }
            | PortalError::ElementNotFound { .. }
            | PortalError::DownloadNotFound
            | PortalError::HttpStatus { .. }
            | PortalError::Request(_)
            | PortalError::Io(_) => RetryDisposition::Retryable,
        }
    }
}

/// Ordered candidate matchers for one step. Evaluated in order, first
/// success wins; a miss fails the step.
#[derive(Debug, Clone)]
pub struct SelectorCandidates {
    step: &'static str,
    selectors: Vec<Selector>,
}

impl SelectorCandidates {
    pub fn new(step: &'static str, candidates: &[&str]) -> Self {
        let selectors = candidates
            .iter()
            .filter_map(|raw| match Selector::parse(raw) {
                Ok(selector) => Some(selector),
                Err(err) => {
                    tracing::warn!(step, selector = raw, error = %err, "unparseable candidate selector");
                    None
                }
            })
            .collect();
        Self { step, selectors }
    }

    pub fn step(&self) -> &'static str {
        self.step
    }

    /// First matching element's value of `attr`, if any candidate hits.
    pub fn first_attr(&self, html: &str, attr: &str) -> Option<String> {
        let document = Html::parse_document(html);
        for selector in &self.selectors {
            if let Some(element) = document.select(selector).next() {
                return element.value().attr(attr).map(str::to_string);
            }
        }
        None
    }

    pub fn matches(&self, html: &str) -> bool {
        let document = Html::parse_document(html);
        self.selectors
            .iter()
            .any(|selector| document.select(selector).next().is_some())
    }

    pub fn require(&self, html: &str) -> Result<(), PortalError> {
        if self.matches(html) {
            Ok(())
        } else {
            Err(PortalError::ElementNotFound { step: self.step })
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub login_path: String,
    pub listing_path: String,
    pub user_agent: String,
    /// Deadline applied to each individual navigation/wait step.
    pub step_timeout: Duration,
    pub download_timeout: Duration,
    /// Where downloaded exports materialize before the codec consumes them.
    pub work_dir: PathBuf,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://manage.restaurant-board.example".to_string(),
            login_path: "/login".to_string(),
            listing_path: "/reservations".to_string(),
            user_agent: "rbetl/0.1".to_string(),
            step_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(60),
            work_dir: std::env::temp_dir(),
        }
    }
}

/// Seam between the orchestrator and whatever drives the portal. `close`
/// is idempotent and must succeed on a session that was never opened.
#[async_trait]
pub trait ReservationPortal: Send {
    async fn open(&mut self) -> Result<(), PortalError>;
    async fn extract(
        &mut self,
        store: &StoreConfig,
        window: DateWindow,
    ) -> Result<RawExtract, PortalError>;
    async fn close(&mut self);
}

/// Candidate lists for the steps the driver walks through. Collected in one
/// place so markup drift is a one-line fix.
struct PortalSteps {
    login_form: SelectorCandidates,
    logged_in: SelectorCandidates,
    listing: SelectorCandidates,
    export_link: SelectorCandidates,
}

impl PortalSteps {
    fn new() -> Self {
        Self {
            login_form: SelectorCandidates::new(
                "login_page",
                &[
                    "form#login-form",
                    "form[action*='login']",
                    "form input[type='password']",
                ],
            ),
            logged_in: SelectorCandidates::new(
                "confirm_login",
                &[
                    "a[href*='logout']",
                    "#account-menu",
                    ".store-header .store-name",
                ],
            ),
            listing: SelectorCandidates::new(
                "reservation_list",
                &[
                    "#reservation-list",
                    "table.reservations",
                    "[data-page='reservations']",
                ],
            ),
            export_link: SelectorCandidates::new(
                "csv_export",
                &[
                    "a#csv-download",
                    "a[href*='csv']",
                    "form[action*='download']",
                ],
            ),
        }
    }
}

/// Markers whose presence on the post-login destination means the account is
/// gated behind a second factor.
const MFA_MARKERS: [&str; 5] = [
    "二段階認証",
    "ワンタイムパスワード",
    "認証コード",
    "two-step verification",
    "verification code",
];

/// True when the post-login destination is a second-factor challenge rather
/// than the authenticated portal.
pub fn mfa_challenge_present(final_url: &str, body: &str) -> bool {
    let url_lower = final_url.to_lowercase();
    if ["two_step", "two-step", "otp", "mfa"]
        .iter()
        .any(|marker| url_lower.contains(marker))
    {
        return true;
    }
    MFA_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Drives the portal through its HTTP surface with an exclusive cookie
/// session. The `ReservationPortal` seam leaves room for a WebDriver-backed
/// implementation without touching the orchestrator.
pub struct HttpPortalSession {
    config: PortalConfig,
    steps: PortalSteps,
    client: Option<reqwest::Client>,
}

impl HttpPortalSession {
    pub fn new(config: PortalConfig) -> Self {
        Self {
            config,
            steps: PortalSteps::new(),
            client: None,
        }
    }

    fn client(&self) -> Result<&reqwest::Client, PortalError> {
        self.client.as_ref().ok_or(PortalError::SessionNotOpen)
    }

    fn absolute_url(&self, path_or_url: &str) -> Result<Url, PortalError> {
        let base = Url::parse(&self.config.base_url)?;
        Ok(base.join(path_or_url)?)
    }

    async fn step_get(
        &self,
        step: &'static str,
        url: Url,
    ) -> Result<(String, String), PortalError> {
        let client = self.client()?;
        let timeout = self.config.step_timeout;
        let span = tracing::info_span!("portal_step", step, url = %url);
        let _guard = span.enter();

        let response = tokio::time::timeout(timeout, client.get(url).send())
            .await
            .map_err(|_| PortalError::NavigationTimeout {
                step,
                timeout_ms: timeout.as_millis() as u64,
            })??;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(PortalError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = tokio::time::timeout(timeout, response.text())
            .await
            .map_err(|_| PortalError::NavigationTimeout {
                step,
                timeout_ms: timeout.as_millis() as u64,
            })??;
        Ok((final_url, body))
    }

    async fn login(&self, store: &StoreConfig) -> Result<(), PortalError> {
        let login_url = self.absolute_url(&self.config.login_path)?;
        let (_, login_page) = self.step_get("login_page", login_url.clone()).await?;
        self.steps.login_form.require(&login_page)?;

        let action = self
            .steps
            .login_form
            .first_attr(&login_page, "action")
            .unwrap_or_else(|| self.config.login_path.clone());
        let post_url = self.absolute_url(&action)?;

        let client = self.client()?;
        let timeout = self.config.step_timeout;
        let response = tokio::time::timeout(
            timeout,
            client
                .post(post_url)
                .form(&[
                    ("username", store.username.as_str()),
                    ("password", store.password.as_str()),
                ])
                .send(),
        )
        .await
        .map_err(|_| PortalError::NavigationTimeout {
            step: "submit_login",
            timeout_ms: timeout.as_millis() as u64,
        })??;

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(PortalError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = response.text().await?;

        if mfa_challenge_present(&final_url, &body) {
            return Err(PortalError::AuthenticationRequired);
        }
        if self.steps.login_form.matches(&body) {
            // Bounced back to the credential form: rejected.
            return Err(PortalError::LoginRejected);
        }
        self.steps.logged_in.require(&body)?;
        tracing::info!(store_id = %store.store_id, "portal login confirmed");
        Ok(())
    }

    async fn discover_export_url(&self, window: DateWindow) -> Result<Url, PortalError> {
        let listing_url = self.absolute_url(&self.config.listing_path)?;
        let (_, listing_page) = self.step_get("reservation_list", listing_url).await?;
        self.steps.listing.require(&listing_page)?;

        let href = self
            .steps
            .export_link
            .first_attr(&listing_page, "href")
            .or_else(|| self.steps.export_link.first_attr(&listing_page, "action"))
            .ok_or(PortalError::ElementNotFound {
                step: self.steps.export_link.step(),
            })?;

        let mut export_url = self.absolute_url(&href)?;
        export_url
            .query_pairs_mut()
            .append_pair("from", &window.from.format("%Y-%m-%d").to_string())
            .append_pair("to", &window.to.format("%Y-%m-%d").to_string());
        Ok(export_url)
    }

    /// Trigger the export download and wait for the file to materialize in
    /// the work directory. An empty or missing file inside the window is
    /// `DownloadNotFound`.
    async fn download_export(
        &self,
        store: &StoreConfig,
        window: DateWindow,
        export_url: Url,
    ) -> Result<PathBuf, PortalError> {
        let client = self.client()?;
        let timeout = self.config.download_timeout;
        let target = self.config.work_dir.join(format!(
            "rb_{}_{}.csv",
            store.store_id,
            window.label()
        ));

        let response = tokio::time::timeout(timeout, client.get(export_url).send())
            .await
            .map_err(|_| PortalError::DownloadNotFound)??;
        if !response.status().is_success() {
            return Err(PortalError::DownloadNotFound);
        }
        let bytes = tokio::time::timeout(timeout, response.bytes())
            .await
            .map_err(|_| PortalError::DownloadNotFound)??;

        let mut file = tokio::fs::File::create(&target).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        let materialized = tokio::fs::metadata(&target).await?;
        if materialized.len() == 0 {
            return Err(PortalError::DownloadNotFound);
        }
        Ok(target)
    }
}

#[async_trait]
impl ReservationPortal for HttpPortalSession {
    /// Acquire the exclusive session resource. Must be paired with `close`
    /// on every exit path.
    async fn open(&mut self) -> Result<(), PortalError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .redirect(redirect::Policy::limited(5))
            .user_agent(self.config.user_agent.clone())
            .timeout(self.config.step_timeout)
            .build()?;
        self.client = Some(client);
        Ok(())
    }

    async fn extract(
        &mut self,
        store: &StoreConfig,
        window: DateWindow,
    ) -> Result<RawExtract, PortalError> {
        self.login(store).await?;
        let export_url = self.discover_export_url(window).await?;
        let downloaded = self.download_export(store, window, export_url).await?;
        let bytes = tokio::fs::read(&downloaded).await?;
        tracing::info!(
            store_id = %store.store_id,
            bytes = bytes.len(),
            path = %downloaded.display(),
            "reservation export downloaded"
        );
        Ok(RawExtract {
            bytes,
            downloaded_path: Some(downloaded),
        })
    }

    async fn close(&mut self) {
        // Dropping the client tears down the cookie session and its pool.
        // Safe to call on a session that was never opened.
        self.client = None;
    }
}
