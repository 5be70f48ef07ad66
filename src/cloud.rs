//! Cloud (multi-tenant) scan service adapter.
//!
//! Job creation on the cloud service is a single POST; the interesting parts
//! are the error surfacing rules (`Message` bodies with `{0}`-style format
//! placeholders), the application-id precondition, and the normalization of
//! detail-fetch outcomes that keeps a long poll alive through HTTP 400,
//! forbidden responses and transient connectivity loss.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use serde::Deserialize;

use crate::auth::AuthProvider;
use crate::client::{ApiResponse, AppScanClient, FilePart};
use crate::provider::{
    JobDetail, ProviderError, ScanDetail, ScanServiceProvider, SeverityCount,
};

const API_SCANNER: &str = "/api/v4/Scans";
const API_FILE_UPLOAD: &str = "/api/v4/FileUpload";
const API_APPS: &str = "/api/v4/Apps";
const API_ISSUES_COUNT: &str = "/api/v4/Issues";

const UPLOADED_FILE_FIELD: &str = "uploadedFile";
const UNAUTHORIZED_ACTION: &str = "UNAUTHORIZED_ACTION";

/// File extensions that already are scan definitions and must not be tagged
/// as source archives on upload.
const DAST_FILE_EXTENSIONS: [&str; 3] = ["scan", "scant", "config"];
const IRX_EXTENSION: &str = "irx";

/// Adapter for the multi-tenant cloud scan service.
pub struct CloudScanService {
    client: AppScanClient,
    auth: Arc<dyn AuthProvider>,
}

#[derive(Debug, Deserialize)]
struct ItemsDocument<T> {
    #[serde(rename = "Items")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct AppSummary {
    #[serde(rename = "Id")]
    id: String,
}

impl CloudScanService {
    /// Create an adapter bound to the given transport and session.
    #[must_use]
    pub fn new(client: AppScanClient, auth: Arc<dyn AuthProvider>) -> Self {
        Self { client, auth }
    }

    /// The authentication session this adapter uses.
    #[must_use]
    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    /// The underlying HTTP client.
    #[must_use]
    pub fn client(&self) -> &AppScanClient {
        &self.client
    }

    fn ensure_session(&self) -> Result<(), ProviderError> {
        if self.auth.is_expired() {
            error!("authentication session has expired, aborting before the network call");
            return Err(ProviderError::SessionExpired);
        }
        Ok(())
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.auth.auth_headers(true)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.auth.server_url())
    }

    /// Look up the caller's applications and confirm `app_id` is among them.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidApplication`] when the id is blank or
    /// not visible to the session.
    pub async fn verify_application(&self, app_id: &str) -> Result<(), ProviderError> {
        if app_id.trim().is_empty() {
            return Err(ProviderError::InvalidApplication(app_id.to_string()));
        }

        let response = self
            .client
            .get(&self.url(API_APPS), &self.headers())
            .await?;
        if !response.is_success() {
            return Err(ProviderError::InvalidApplication(app_id.to_string()));
        }

        let doc: ItemsDocument<AppSummary> = response
            .body_as()
            .map_err(|e| ProviderError::UnexpectedResponse(e.to_string()))?;
        if doc.items.iter().any(|a| a.id == app_id) {
            Ok(())
        } else {
            Err(ProviderError::InvalidApplication(app_id.to_string()))
        }
    }

    /// Download a scan's execution log to `destination`.
    ///
    /// Directory destinations get a timestamped `ScanLog_*.zip` name.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is expired, the request fails, or
    /// the file cannot be written.
    pub async fn download_scan_log(
        &self,
        execution_id: &str,
        destination: &Path,
    ) -> Result<std::path::PathBuf, ProviderError> {
        self.ensure_session()?;

        let url = self.url(&format!("/api/v4/Scans/ScanLogs/{execution_id}"));
        let response = self.client.get(&url, &self.headers()).await?;
        if !response.is_success() {
            let reason = response
                .error_message()
                .unwrap_or_else(|| format!("HTTP {}", response.status()));
            return Err(ProviderError::UnexpectedResponse(reason));
        }

        let destination = resolve_destination(destination, "ScanLog", "zip");
        write_body(&destination, response.body()).await?;
        Ok(destination)
    }
}

/// Substitute `{0}`-style placeholders in a service error message.
fn format_message(template: &str, params: &[String]) -> String {
    let mut message = template.to_string();
    for (i, param) in params.iter().enumerate() {
        message = message.replace(&format!("{{{i}}}"), param);
    }
    message
}

/// Extract the error reason from a rejection body: the formatted `Message`
/// when present, the HTTP status otherwise.
fn rejection_reason(response: &ApiResponse) -> String {
    if let Some(json) = response.body_json()
        && let Some(template) = json.get("Message").and_then(|m| m.as_str())
    {
        let params: Vec<String> = json
            .get("FormatParams")
            .and_then(|p| p.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        return format_message(template, &params);
    }
    format!("HTTP {}", response.status())
}

/// Whether an upload needs the `fileType=SourceCodeArchive` query parameter.
///
/// IRX archives and pre-built DAST scan definitions are recognized by the
/// service from their extension; everything else is treated as source.
fn needs_source_archive_tag(file: &Path) -> bool {
    let ext = file
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    ext != IRX_EXTENSION && !DAST_FILE_EXTENSIONS.contains(&ext.as_str())
}

/// Interpret a detail-fetch response into a [`ScanDetail`].
///
/// Kept separate from the transport so the status table is testable: 400 is
/// an invalid job id, 403 with the `UNAUTHORIZED_ACTION` key is surfaced
/// as-is, and anything else non-2xx is an unexpected response.
fn interpret_detail_response(response: &ApiResponse) -> Result<ScanDetail, ProviderError> {
    if response.is_success() {
        let doc: ItemsDocument<JobDetail> = response
            .body_as()
            .map_err(|e| ProviderError::UnexpectedResponse(e.to_string()))?;
        return doc
            .items
            .into_iter()
            .next()
            .map(ScanDetail::Detail)
            .ok_or_else(|| ProviderError::UnexpectedResponse("empty Items array".to_string()));
    }

    if response.status() == 400 {
        return Ok(ScanDetail::InvalidJobId);
    }

    if response.status() == 403
        && let Some(json) = response.body_json()
        && json.get("Key").and_then(|k| k.as_str()) == Some(UNAUTHORIZED_ACTION)
    {
        return Ok(ScanDetail::Unauthorized);
    }

    if let Some(message) = response.error_message() {
        warn!("scan detail fetch rejected: {message}");
    }
    Err(ProviderError::UnexpectedResponse(format!(
        "HTTP {}",
        response.status()
    )))
}

async fn write_body(destination: &Path, body: &[u8]) -> Result<(), ProviderError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ProviderError::Upload(e.to_string()))?;
    }
    tokio::fs::write(destination, body)
        .await
        .map_err(|e| ProviderError::Upload(e.to_string()))
}

pub(crate) fn resolve_destination(
    destination: &Path,
    prefix: &str,
    extension: &str,
) -> std::path::PathBuf {
    if destination.is_dir() {
        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        destination.join(format!("{prefix}_{timestamp}.{extension}"))
    } else {
        destination.to_path_buf()
    }
}

impl ScanServiceProvider for CloudScanService {
    async fn create_and_execute_scan(
        &self,
        scan_type: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String, ProviderError> {
        self.ensure_session()?;
        if let Some(app_id) = params.get("AppId") {
            self.verify_application(app_id).await?;
        }

        info!("submitting {scan_type} scan");
        let url = self.url(&format!("{API_SCANNER}/{scan_type}"));
        let response = self.client.post_json(&url, &self.headers(), params).await?;

        if response.is_success() {
            let json = response.body_json().ok_or_else(|| {
                ProviderError::UnexpectedResponse("empty scan creation response".to_string())
            })?;
            let id = json
                .get("Id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ProviderError::UnexpectedResponse("missing Id in creation response".to_string())
                })?;
            info!("scan created: {id}");
            return Ok(id.to_string());
        }

        let reason = rejection_reason(&response);
        error!("scan submission rejected: {reason}");
        Err(ProviderError::Submission(reason))
    }

    async fn submit_file(&self, file: &Path) -> Result<String, ProviderError> {
        self.ensure_session()?;

        info!("uploading {}", file.display());
        let mut url = self.url(API_FILE_UPLOAD);
        if needs_source_archive_tag(file) {
            url.push_str("?fileType=SourceCodeArchive");
        }

        let part = FilePart::from_path(UPLOADED_FILE_FIELD, file, "multipart/form-data")
            .await
            .map_err(|e| ProviderError::Upload(e.to_string()))?;
        let response = self
            .client
            .post_multipart(&url, &self.headers(), vec![part])
            .await?;

        let json = response.body_json().ok_or_else(|| {
            ProviderError::UnexpectedResponse("empty upload response".to_string())
        })?;
        if let Some(message) = json.get("Message").and_then(|m| m.as_str()) {
            return Err(ProviderError::Upload(message.to_string()));
        }
        json.get("FileId")
            .or_else(|| json.get("Id"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| {
                ProviderError::UnexpectedResponse("missing FileId in upload response".to_string())
            })
    }

    async fn get_scan_details(&self, job_id: &str) -> Result<ScanDetail, ProviderError> {
        self.ensure_session()?;

        let base = self.url(API_SCANNER);
        let filter = format!("Id eq {job_id}");
        let url = AppScanClient::url_with_params(&base, &[("$filter", &filter)]);

        match self.client.get(&url, &self.headers()).await {
            Ok(response) => interpret_detail_response(&response),
            // A poll must survive transient connectivity loss: no usable
            // status code maps to a synthetic Unknown, not an error.
            Err(e) if e.is_unreachable() => {
                warn!("scan service unreachable while fetching details: {e}");
                Ok(ScanDetail::Unknown)
            }
            Err(e) => Err(ProviderError::Transport(e)),
        }
    }

    async fn get_non_compliant_issues(
        &self,
        job_id: &str,
    ) -> Result<Vec<SeverityCount>, ProviderError> {
        self.ensure_session()?;

        let base = self.url(&format!("{API_ISSUES_COUNT}/Scan/{job_id}"));
        let url = AppScanClient::url_with_params(
            &base,
            &[("$apply", "groupby((Severity),aggregate($count as N))")],
        );
        let response = self.client.get(&url, &self.headers()).await?;

        if response.is_success() {
            let doc: ItemsDocument<SeverityCount> = response
                .body_as()
                .map_err(|e| ProviderError::UnexpectedResponse(e.to_string()))?;
            return Ok(doc.items);
        }

        if response.status() == 400 {
            return Err(ProviderError::Submission(format!(
                "invalid job id: {job_id}"
            )));
        }
        Err(ProviderError::UnexpectedResponse(rejection_reason(
            &response,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn response(status: u16, body: serde_json::Value) -> ApiResponse {
        ApiResponse::new(status, HashMap::new(), body.to_string().into_bytes())
    }

    #[test]
    fn test_format_message_substitutes_placeholders() {
        let message = format_message(
            "Scan {0} was rejected by policy {1}",
            &["abc".to_string(), "default".to_string()],
        );
        assert_eq!(message, "Scan abc was rejected by policy default");
    }

    #[test]
    fn test_rejection_reason_prefers_message_body() {
        let r = response(
            409,
            serde_json::json!({"Message": "App {0} is locked", "FormatParams": ["web-app"]}),
        );
        assert_eq!(rejection_reason(&r), "App web-app is locked");
    }

    #[test]
    fn test_rejection_reason_falls_back_to_status() {
        let r = ApiResponse::new(502, HashMap::new(), Vec::new());
        assert_eq!(rejection_reason(&r), "HTTP 502");
    }

    #[test]
    fn test_source_archive_tag_rules() {
        assert!(needs_source_archive_tag(Path::new("src.zip")));
        assert!(needs_source_archive_tag(Path::new("project.tar.gz")));
        assert!(!needs_source_archive_tag(Path::new("app.irx")));
        assert!(!needs_source_archive_tag(Path::new("site.scan")));
        assert!(!needs_source_archive_tag(Path::new("site.SCANT")));
        assert!(!needs_source_archive_tag(Path::new("login.config")));
    }

    #[test]
    fn test_interpret_detail_success() {
        let r = response(
            200,
            serde_json::json!({"Items": [{
                "Name": "nightly",
                "LatestExecution": {"Status": "Running"}
            }]}),
        );
        let detail = interpret_detail_response(&r).unwrap();
        let doc = detail.detail().expect("expected a detail document");
        assert_eq!(doc.latest_execution.status, "Running");
        assert_eq!(doc.name.as_deref(), Some("nightly"));
    }

    #[test]
    fn test_interpret_detail_bad_request_is_invalid_job_id() {
        let r = ApiResponse::new(400, HashMap::new(), Vec::new());
        assert!(matches!(
            interpret_detail_response(&r).unwrap(),
            ScanDetail::InvalidJobId
        ));
    }

    #[test]
    fn test_interpret_detail_forbidden_with_key() {
        let r = response(403, serde_json::json!({"Key": "UNAUTHORIZED_ACTION"}));
        assert!(matches!(
            interpret_detail_response(&r).unwrap(),
            ScanDetail::Unauthorized
        ));
    }

    #[test]
    fn test_interpret_detail_forbidden_without_key_is_error() {
        let r = response(403, serde_json::json!({"Message": "nope"}));
        assert!(interpret_detail_response(&r).is_err());
    }

    #[test]
    fn test_interpret_detail_empty_items_is_unexpected() {
        let r = response(200, serde_json::json!({"Items": []}));
        assert!(matches!(
            interpret_detail_response(&r),
            Err(ProviderError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_resolve_destination_passthrough_for_files() {
        let path = Path::new("/tmp/results/report.html");
        assert_eq!(resolve_destination(path, "asoc_results", "html"), path);
    }

    #[test]
    fn test_resolve_destination_names_file_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_destination(dir.path(), "asoc_results", "html");
        let name = resolved.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("asoc_results_"));
        assert!(name.ends_with(".html"));
        assert_eq!(resolved.parent().unwrap(), dir.path());
    }
}
