//! # AppScan Platform Client Library
//!
//! A Rust client library for driving security scans on the AppScan platform,
//! covering both the multi-tenant cloud service (ASoC) and single-tenant
//! on-premises deployments (ASE).
//!
//! This library implements the scan lifecycle orchestration consumed by
//! build/CI integrations: submitting a scan job, driving the on-premises
//! multi-step job configuration, polling for completion across the two
//! backends' status vocabularies, and retrieving a findings report once the
//! job reaches a terminal state.
//!
//! ## Features
//!
//! - 🔍 **Scan submission** - Static, dynamic, mobile and software composition
//!   analysis scans with per-type target validation and file uploads
//! - 🏢 **Two backends, one contract** - `CloudScanService` (single-call job
//!   creation) and `AseScanService` (template job + sequential configuration)
//!   behind the `ScanServiceProvider` trait
//! - 📊 **Results polling** - Normalized job status plus severity-bucketed
//!   finding counts, cached at most once per job
//! - 📄 **Report retrieval** - Direct download and two-phase
//!   create/poll/download protocols with bounded polling and cancellation
//! - 🚀 **Async/Await** - Built on tokio
//! - ⚡ **Type-safe** - serde models for all wire documents
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use appscan_platform::{
//!     AppScanConfig, AppScanClient, BearerAuth, CloudScanService,
//!     ScanKind, ScanSpec, ResultsPoller,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let auth = Arc::new(BearerAuth::new(
//!         "https://cloud.appscan.com".to_string(),
//!         "your_token".to_string(),
//!     ));
//!     let client = AppScanClient::new(AppScanConfig::new())?;
//!     let service = CloudScanService::new(client, auth);
//!
//!     let spec = ScanSpec::new(ScanKind::Dynamic)
//!         .with_target("https://demo.testfire.net");
//!     let job = spec.submit(&service).await?;
//!
//!     let mut poller = ResultsPoller::new(job.id().to_string(), service);
//!     let status = poller.refresh().await?;
//!     println!("scan {} is {status}", poller.job_id());
//!     Ok(())
//! }
//! ```
//!
//! ## Backend differences
//!
//! The cloud service creates and executes a scan in one POST. The on-premises
//! service creates a job from a template and then applies each configured
//! property (starting URL, agent server, login, traffic files, scan type,
//! test optimization) as an independent call, aborting on the first failure.
//! Both are exposed through [`ScanServiceProvider`], so pollers and report
//! generation are backend-agnostic.

pub mod auth;
pub mod client;
pub mod provider;
pub mod cloud;
pub mod ase;
pub mod scan;
pub mod results;
pub mod report;
pub mod validation;

use std::fmt;

use reqwest::Error as ReqwestError;

// Re-export common types for convenience
pub use auth::{AuthProvider, BearerAuth};
pub use client::{ApiResponse, AppScanClient, FilePart, RegionServer, ServerRegistry};
pub use provider::{
    ExecutionDetail, JobDetail, ProviderError, ScanDetail, ScanServiceProvider, SeverityCount,
};
pub use cloud::CloudScanService;
pub use ase::{AseComponent, AseScanService, LoginType};
pub use scan::{ScanError, ScanJob, ScanKind, ScanSpec};
pub use results::{FindingsSummary, JobStatus, ResultsPoller};
pub use report::{
    CancelHandle, PollOptions, ReportBackend, ReportError, ReportGenerator, ReportRequest,
};
pub use validation::TargetValidator;

/// Custom error type for AppScan API operations.
///
/// This enum represents the failures that can occur at the transport and
/// configuration layer, below the per-module errors.
#[derive(Debug)]
pub enum AppScanError {
    /// HTTP request failed
    Http(ReqwestError),
    /// JSON serialization/deserialization failed
    Serialization(serde_json::Error),
    /// The authentication session is expired or unusable
    Authentication(String),
    /// API returned an error response
    InvalidResponse(String),
    /// Configuration is invalid
    InvalidConfig(String),
}

impl AppScanError {
    /// True when the underlying failure never produced a usable HTTP status
    /// code (connection refused, DNS failure, timeout). Pollers map this to a
    /// synthetic `Unknown` status instead of failing the job.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        match self {
            AppScanError::Http(e) => e.is_connect() || e.is_timeout() || e.status().is_none(),
            _ => false,
        }
    }
}

impl fmt::Display for AppScanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppScanError::Http(e) => write!(f, "HTTP error: {e}"),
            AppScanError::Serialization(e) => write!(f, "Serialization error: {e}"),
            AppScanError::Authentication(e) => write!(f, "Authentication error: {e}"),
            AppScanError::InvalidResponse(e) => write!(f, "Invalid response: {e}"),
            AppScanError::InvalidConfig(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for AppScanError {}

impl From<ReqwestError> for AppScanError {
    fn from(error: ReqwestError) -> Self {
        AppScanError::Http(error)
    }
}

impl From<serde_json::Error> for AppScanError {
    fn from(error: serde_json::Error) -> Self {
        AppScanError::Serialization(error)
    }
}

/// Configuration for the AppScan API client.
///
/// The server URL itself comes from the [`AuthProvider`] session; this struct
/// carries transport concerns: proxy, TLS validation and timeouts.
#[derive(Debug, Clone)]
pub struct AppScanConfig {
    /// Optional proxy URL (e.g. `http://proxy.example.com:3128`)
    pub proxy_url: Option<String>,
    /// Optional proxy username
    pub proxy_username: Option<String>,
    /// Optional proxy password
    pub proxy_password: Option<String>,
    /// Whether to validate TLS certificates (default: true)
    pub validate_certificates: bool,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Whole-request timeout in seconds
    pub request_timeout: u64,
}

impl Default for AppScanConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AppScanConfig {
    /// Create a configuration with certificate validation enabled and no proxy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            proxy_url: None,
            proxy_username: None,
            proxy_password: None,
            validate_certificates: true, // Default to secure
            connect_timeout: 30,
            request_timeout: 300,
        }
    }

    /// Route all requests through the given proxy.
    ///
    /// # Returns
    ///
    /// The updated configuration instance (for method chaining).
    #[must_use]
    pub fn with_proxy(mut self, proxy_url: String) -> Self {
        self.proxy_url = Some(proxy_url);
        self
    }

    /// Set basic-auth credentials for the proxy.
    #[must_use]
    pub fn with_proxy_credentials(mut self, username: String, password: String) -> Self {
        self.proxy_username = Some(username);
        self.proxy_password = Some(password);
        self
    }

    /// Disable certificate validation for on-premises deployments with
    /// self-signed certificates.
    ///
    /// WARNING: never use this against a production cloud service.
    #[must_use]
    pub fn with_certificate_validation_disabled(mut self) -> Self {
        self.validate_certificates = false;
        self
    }

    /// Override the connect/request timeouts (seconds).
    #[must_use]
    pub fn with_timeouts(mut self, connect: u64, request: u64) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = AppScanConfig::new();

        assert!(config.validate_certificates);
        assert!(config.proxy_url.is_none());
        assert_eq!(config.connect_timeout, 30);
        assert_eq!(config.request_timeout, 300);
    }

    #[test]
    fn test_config_builders() {
        let config = AppScanConfig::new()
            .with_proxy("http://proxy.local:3128".to_string())
            .with_proxy_credentials("user".to_string(), "pass".to_string())
            .with_certificate_validation_disabled()
            .with_timeouts(5, 60);

        assert_eq!(config.proxy_url.as_deref(), Some("http://proxy.local:3128"));
        assert_eq!(config.proxy_username.as_deref(), Some("user"));
        assert!(!config.validate_certificates);
        assert_eq!(config.connect_timeout, 5);
        assert_eq!(config.request_timeout, 60);
    }

    #[test]
    fn test_error_display() {
        let error = AppScanError::Authentication("session expired".to_string());
        assert_eq!(format!("{error}"), "Authentication error: session expired");
    }
}
