//! The backend-agnostic scan service contract.
//!
//! Both the cloud and the on-premises services are driven through
//! [`ScanServiceProvider`]; pollers and scan strategies never see the
//! endpoint differences.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::AppScanError;

/// Errors raised by the backend adapters.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Authentication session has expired")]
    SessionExpired,
    #[error("Invalid application id: {0}")]
    InvalidApplication(String),
    #[error("Scan submission rejected: {0}")]
    Submission(String),
    #[error("File upload failed: {0}")]
    Upload(String),
    /// The service answered but the body was not the expected document.
    /// Deliberately distinct from a failed job: a response we could not
    /// understand must not flip a scan to `Failed`.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Transport error: {0}")]
    Transport(#[from] AppScanError),
}

/// Detail document for a job's most recent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    /// Execution id, used for scan-log retrieval on the cloud service.
    #[serde(rename = "Id", default)]
    pub id: Option<String>,
    /// Backend status string, not yet normalized.
    #[serde(rename = "Status")]
    pub status: String,
    /// User-facing message the backend attaches to failed or paused jobs.
    #[serde(rename = "UserMessage", default)]
    pub user_message: Option<String>,
    #[serde(rename = "NIssuesFound", default)]
    pub total_issues: Option<u64>,
    #[serde(rename = "NCriticalIssues", default)]
    pub critical_issues: Option<u64>,
    #[serde(rename = "NHighIssues", default)]
    pub high_issues: Option<u64>,
    #[serde(rename = "NMediumIssues", default)]
    pub medium_issues: Option<u64>,
    #[serde(rename = "NLowIssues", default)]
    pub low_issues: Option<u64>,
    #[serde(rename = "NInfoIssues", default)]
    pub info_issues: Option<u64>,
}

/// Job detail document as returned by a scan service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    /// Scan name, used as the report title.
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "LatestExecution")]
    pub latest_execution: ExecutionDetail,
}

/// Outcome of a job detail fetch.
///
/// The three non-`Detail` variants are normalized from special responses so a
/// long-running poll never has to catch transport exceptions:
/// HTTP 400 means the job id itself is bad, a missing status code means the
/// service was unreachable, and a 403 with `Key == "UNAUTHORIZED_ACTION"` is
/// kept distinct from "not found".
#[derive(Debug, Clone)]
pub enum ScanDetail {
    /// The job's detail document.
    Detail(JobDetail),
    /// The service could not be reached; nothing is known about the job.
    Unknown,
    /// The caller is not permitted to see this job.
    Unauthorized,
    /// The service rejected the job id (HTTP 400).
    InvalidJobId,
}

impl ScanDetail {
    /// The detail document, when one was returned.
    #[must_use]
    pub fn detail(&self) -> Option<&JobDetail> {
        match self {
            ScanDetail::Detail(d) => Some(d),
            _ => None,
        }
    }
}

/// One row of the severity aggregation query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityCount {
    #[serde(rename = "Severity")]
    pub severity: String,
    #[serde(rename = "Count", alias = "N")]
    pub count: u64,
}

/// Backend adapter for scan lifecycle operations.
///
/// Implementations check session expiry before every call and return
/// [`ProviderError::SessionExpired`] without a network attempt when the
/// session is gone.
pub trait ScanServiceProvider {
    /// Create a scan job with the given type-specific parameters and start
    /// its execution. Returns the job id assigned by the service.
    fn create_and_execute_scan(
        &self,
        scan_type: &str,
        params: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;

    /// Upload a file and obtain its handle id for use in scan parameters.
    fn submit_file(
        &self,
        file: &Path,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;

    /// Fetch the job's current detail document, normalizing the special
    /// outcomes described on [`ScanDetail`].
    fn get_scan_details(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<ScanDetail, ProviderError>> + Send;

    /// Fetch aggregated non-compliant issue counts, bucketed by severity.
    fn get_non_compliant_issues(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<SeverityCount>, ProviderError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_detail_deserializes_cloud_document() {
        let doc = serde_json::json!({
            "Id": "exec-1",
            "Status": "Ready",
            "NIssuesFound": 12,
            "NCriticalIssues": 1,
            "NHighIssues": 2,
            "NMediumIssues": 3,
            "NLowIssues": 4,
            "NInfoIssues": 2
        });
        let detail: ExecutionDetail = serde_json::from_value(doc).unwrap();
        assert_eq!(detail.status, "Ready");
        assert_eq!(detail.total_issues, Some(12));
        assert!(detail.user_message.is_none());
    }

    #[test]
    fn test_execution_detail_tolerates_missing_counts() {
        let doc = serde_json::json!({ "Status": "InQueue" });
        let detail: ExecutionDetail = serde_json::from_value(doc).unwrap();
        assert_eq!(detail.status, "InQueue");
        assert!(detail.total_issues.is_none());
    }

    #[test]
    fn test_severity_count_accepts_both_count_fields() {
        let a: SeverityCount =
            serde_json::from_value(serde_json::json!({"Severity": "High", "Count": 4})).unwrap();
        let b: SeverityCount =
            serde_json::from_value(serde_json::json!({"Severity": "Low", "N": 7})).unwrap();
        assert_eq!(a.count, 4);
        assert_eq!(b.count, 7);
    }
}
