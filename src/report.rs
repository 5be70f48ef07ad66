//! Findings-report creation, readiness polling and download.
//!
//! Two protocols coexist. The cloud service renders its default report on
//! demand, so that path is a single download call. Selected-issue reports
//! (and everything on the on-premises service) are two-phase: a creation
//! request yields a report id, the report's status is polled until it is
//! ready, then the body is downloaded.
//!
//! Both polling loops are bounded and cancellable, and a 500 from the
//! download endpoint is retried a limited number of times with exponential
//! backoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use crate::AppScanError;
use crate::ase::AseScanService;
use crate::client::ApiResponse;
use crate::cloud::CloudScanService;

const DOWNLOAD_ATTEMPTS: u32 = 4;
const DOWNLOAD_BACKOFF_START: Duration = Duration::from_millis(500);
const DOWNLOAD_BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Errors raised while generating or downloading a report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Report creation rejected: {0}")]
    Creation(String),
    #[error("Report generation failed: {0}")]
    Generation(String),
    #[error("Report was not ready after {0} status checks")]
    Timeout(u32),
    #[error("Report generation was cancelled")]
    Cancelled,
    #[error("Report download failed: {0}")]
    Download(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] AppScanError),
}

/// Shared cancellation flag for polling loops.
///
/// Clone it, hand one copy to the poll and keep the other; `cancel()` makes
/// the loop return at its next check.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounds for a status polling loop.
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// Milliseconds between consecutive status checks.
    pub interval_ms: u64,
    /// Status checks before the poll gives up.
    pub max_attempts: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            max_attempts: 100,
        }
    }
}

impl PollOptions {
    #[must_use]
    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// What to generate and where to put it.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    format: String,
    destination: PathBuf,
    title: String,
    notes: String,
    locale: String,
    include_history: bool,
    trial_report: bool,
}

impl ReportRequest {
    /// A report in `format` (a file extension such as `html` or `pdf`)
    /// written to `destination`. A directory destination gets an
    /// auto-generated timestamped file name.
    #[must_use]
    pub fn new(format: &str, destination: &Path) -> Self {
        Self {
            format: format.to_ascii_lowercase(),
            destination: destination.to_path_buf(),
            title: String::new(),
            notes: String::new(),
            locale: "en-US".to_string(),
            include_history: true,
            trial_report: false,
        }
    }

    /// Report title; conventionally the scan name.
    #[must_use]
    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    #[must_use]
    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = notes.to_string();
        self
    }

    #[must_use]
    pub fn with_locale(mut self, locale: &str) -> Self {
        self.locale = locale.to_string();
        self
    }

    #[must_use]
    pub fn with_history(mut self, include_history: bool) -> Self {
        self.include_history = include_history;
        self
    }

    #[must_use]
    pub fn as_trial_report(mut self, trial_report: bool) -> Self {
        self.trial_report = trial_report;
        self
    }

    #[must_use]
    pub fn format(&self) -> &str {
        &self.format
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

#[derive(Serialize)]
struct ReportConfiguration<'a> {
    #[serde(rename = "Summary")]
    summary: bool,
    #[serde(rename = "Details")]
    details: bool,
    #[serde(rename = "Discussion")]
    discussion: bool,
    #[serde(rename = "Overview")]
    overview: bool,
    #[serde(rename = "TableOfContent")]
    table_of_content: bool,
    #[serde(rename = "Advisories")]
    advisories: bool,
    #[serde(rename = "FixRecommendation")]
    fix_recommendation: bool,
    #[serde(rename = "History")]
    history: bool,
    #[serde(rename = "IsTrialReport")]
    is_trial_report: bool,
    #[serde(rename = "ReportFileType")]
    report_file_type: String,
    #[serde(rename = "Title")]
    title: &'a str,
    #[serde(rename = "Notes")]
    notes: &'a str,
    #[serde(rename = "Locale")]
    locale: &'a str,
}

#[derive(Serialize)]
struct ReportCreationBody<'a> {
    #[serde(rename = "Configuration")]
    configuration: ReportConfiguration<'a>,
    #[serde(rename = "ApplyPolicies")]
    apply_policies: &'a str,
}

fn creation_body(request: &ReportRequest) -> ReportCreationBody<'_> {
    ReportCreationBody {
        configuration: ReportConfiguration {
            summary: true,
            details: true,
            discussion: false,
            overview: true,
            table_of_content: true,
            advisories: true,
            fix_recommendation: true,
            history: request.include_history,
            is_trial_report: request.trial_report,
            report_file_type: request.format.to_ascii_uppercase(),
            title: &request.title,
            notes: &request.notes,
            locale: &request.locale,
        },
        apply_policies: "All",
    }
}

/// Backend-specific report operations.
pub trait ReportBackend {
    /// Request generation of a findings report for the job. Returns the
    /// report id to poll and download.
    fn create_report(
        &self,
        job_id: &str,
        request: &ReportRequest,
    ) -> impl Future<Output = Result<String, ReportError>> + Send;

    /// The report's raw status string (`Ready`, `Failed`, or an in-progress
    /// value).
    fn report_status(
        &self,
        report_id: &str,
    ) -> impl Future<Output = Result<String, ReportError>> + Send;

    /// Fetch the generated report body.
    fn download_report(
        &self,
        report_id: &str,
    ) -> impl Future<Output = Result<ApiResponse, ReportError>> + Send;

    /// Fetch the service's pre-rendered default report for a job, skipping
    /// the create/poll phase.
    fn download_rendered(
        &self,
        job_id: &str,
        format: &str,
    ) -> impl Future<Output = Result<ApiResponse, ReportError>> + Send;
}

impl ReportBackend for CloudScanService {
    async fn create_report(
        &self,
        job_id: &str,
        request: &ReportRequest,
    ) -> Result<String, ReportError> {
        let url = format!(
            "{}/api/v4/Reports/Security/Scan/{job_id}",
            self.auth().server_url()
        );
        let body = creation_body(request);
        let response = self
            .client()
            .post_json(&url, &self.auth().auth_headers(true), &body)
            .await?;

        if !response.is_success() {
            let reason = response
                .error_message()
                .unwrap_or_else(|| format!("HTTP {}", response.status()));
            return Err(ReportError::Creation(reason));
        }
        response
            .body_json()
            .and_then(|json| json.get("Id").and_then(|v| v.as_str()).map(String::from))
            .ok_or_else(|| {
                ReportError::Creation("missing Id in report creation response".to_string())
            })
    }

    async fn report_status(&self, report_id: &str) -> Result<String, ReportError> {
        let base = format!("{}/api/v4/Reports", self.auth().server_url());
        let filter = format!("Id eq {report_id}");
        let url =
            crate::client::AppScanClient::url_with_params(&base, &[("$filter", &filter)]);
        let response = self
            .client()
            .get(&url, &self.auth().auth_headers(true))
            .await?;

        if !response.is_success() {
            return Err(ReportError::Generation(format!(
                "report status returned HTTP {}",
                response.status()
            )));
        }
        response
            .body_json()
            .and_then(|json| {
                json.get("Items")
                    .and_then(|items| items.get(0))
                    .and_then(|item| item.get("Status"))
                    .and_then(|s| s.as_str())
                    .map(String::from)
            })
            .ok_or_else(|| {
                ReportError::Generation("report status document had no Status".to_string())
            })
    }

    async fn download_report(&self, report_id: &str) -> Result<ApiResponse, ReportError> {
        let url = format!(
            "{}/api/v4/Reports/{report_id}/Download",
            self.auth().server_url()
        );
        Ok(self
            .client()
            .get(&url, &self.auth().auth_headers(true))
            .await?)
    }

    async fn download_rendered(
        &self,
        job_id: &str,
        format: &str,
    ) -> Result<ApiResponse, ReportError> {
        let url = format!(
            "{}/api/v4/Scans/{job_id}/Report/{format}",
            self.auth().server_url()
        );
        Ok(self
            .client()
            .get(&url, &self.auth().auth_headers(true))
            .await?)
    }
}

impl ReportBackend for AseScanService {
    /// The on-premises service generates its reports as part of the job
    /// itself; "creation" here resolves the report pack holding them.
    async fn create_report(
        &self,
        job_id: &str,
        _request: &ReportRequest,
    ) -> Result<String, ReportError> {
        self.report_pack_id(job_id)
            .await
            .map_err(|e| ReportError::Creation(e.to_string()))
    }

    async fn report_status(&self, report_id: &str) -> Result<String, ReportError> {
        let state = self
            .folder_item_state(report_id, "report-pack")
            .await
            .map_err(|e| ReportError::Generation(e.to_string()))?;
        Ok(state.unwrap_or_else(|| "Unknown".to_string()))
    }

    async fn download_report(&self, report_id: &str) -> Result<ApiResponse, ReportError> {
        let url = format!(
            "{}/api/folderitems/{report_id}/reports/download",
            self.auth().server_url()
        );
        Ok(self
            .client()
            .get(&url, &self.auth().auth_headers(true))
            .await?)
    }

    async fn download_rendered(
        &self,
        job_id: &str,
        _format: &str,
    ) -> Result<ApiResponse, ReportError> {
        // No pre-rendered path on this service; go through the report pack.
        let pack_id = self
            .report_pack_id(job_id)
            .await
            .map_err(|e| ReportError::Download(e.to_string()))?;
        self.download_report(&pack_id).await
    }
}

/// Drives report generation against one backend.
pub struct ReportGenerator<'a, B> {
    backend: &'a B,
    options: PollOptions,
}

impl<'a, B: ReportBackend + Sync> ReportGenerator<'a, B> {
    #[must_use]
    pub fn new(backend: &'a B) -> Self {
        Self {
            backend,
            options: PollOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: PollOptions) -> Self {
        self.options = options;
        self
    }

    /// Download the backend's pre-rendered default report for a job.
    ///
    /// # Errors
    ///
    /// Surfaces the response's `Message` body (or the HTTP status) when the
    /// report is not available, and I/O errors from the file write.
    pub async fn download_rendered(
        &self,
        job_id: &str,
        format: &str,
        destination: &Path,
    ) -> Result<PathBuf, ReportError> {
        let response = self.backend.download_rendered(job_id, format).await?;
        if !response.is_success() {
            let reason = response
                .error_message()
                .unwrap_or_else(|| format!("HTTP {}", response.status()));
            return Err(ReportError::Download(reason));
        }
        let destination = crate::cloud::resolve_destination(destination, "report", format);
        write_report(&destination, response.body()).await?;
        info!("report written to {}", destination.display());
        Ok(destination)
    }

    /// Create a report, poll its status until it is ready and download it.
    ///
    /// The status poll is bounded by the generator's [`PollOptions`] and
    /// stops early when `cancel` fires. A 500 from the download endpoint is
    /// retried with exponential backoff, at most four attempts in total.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Timeout`] when the attempt budget runs out,
    /// [`ReportError::Cancelled`] on cancellation, and
    /// [`ReportError::Generation`] when the service reports the report
    /// failed.
    pub async fn generate(
        &self,
        job_id: &str,
        request: &ReportRequest,
        cancel: Option<&CancelHandle>,
    ) -> Result<PathBuf, ReportError> {
        let report_id = self.backend.create_report(job_id, request).await?;
        debug!("report {report_id} created for job {job_id}");

        self.wait_until_ready(&report_id, cancel).await?;

        let response = self.download_with_retry(&report_id).await?;
        let destination =
            crate::cloud::resolve_destination(request.destination(), "report", request.format());
        write_report(&destination, response.body()).await?;
        info!("report written to {}", destination.display());
        Ok(destination)
    }

    async fn wait_until_ready(
        &self,
        report_id: &str,
        cancel: Option<&CancelHandle>,
    ) -> Result<(), ReportError> {
        let interval = Duration::from_millis(self.options.interval_ms);
        for attempt in 0..self.options.max_attempts {
            if let Some(handle) = cancel
                && handle.is_cancelled()
            {
                return Err(ReportError::Cancelled);
            }
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }

            let status = self.backend.report_status(report_id).await?;
            debug!("report {report_id} status: {status}");
            if status.eq_ignore_ascii_case("ready") {
                return Ok(());
            }
            if status.eq_ignore_ascii_case("failed") {
                return Err(ReportError::Generation(format!(
                    "report {report_id} failed on the service"
                )));
            }
        }
        Err(ReportError::Timeout(self.options.max_attempts))
    }

    /// Download, retrying 500s with exponential backoff. Other non-success
    /// statuses fail immediately.
    async fn download_with_retry(&self, report_id: &str) -> Result<ApiResponse, ReportError> {
        let mut delay = DOWNLOAD_BACKOFF_START;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            let response = self.backend.download_report(report_id).await?;
            if response.is_success() {
                return Ok(response);
            }
            if response.status() == 500 && attempt < DOWNLOAD_ATTEMPTS {
                warn!(
                    "report download returned HTTP 500, retrying in {}ms (attempt {attempt})",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(DOWNLOAD_BACKOFF_CAP);
                continue;
            }
            let reason = response
                .error_message()
                .unwrap_or_else(|| format!("HTTP {}", response.status()));
            return Err(ReportError::Download(reason));
        }
        unreachable!("loop returns on the final attempt")
    }
}

async fn write_report(destination: &Path, body: &[u8]) -> Result<(), ReportError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(destination, body).await?;
    Ok(())
}
