//! Pre-submission target validation.
//!
//! Scan strategies validate their target before any job-creation call is
//! made, so a bad target never leaves a half-configured job on the remote
//! side. File targets are checked locally; URL targets are checked against
//! the cloud service's validation endpoint.

use std::path::Path;

use log::debug;
use serde::Serialize;

use crate::ase::AseScanService;
use crate::cloud::CloudScanService;

/// Backend-specific URL reachability check.
///
/// The cloud service exposes a validation endpoint; the on-premises service
/// has none, so every URL is accepted there and left to the scanner itself.
pub trait TargetValidator {
    /// Whether the given URL is acceptable as a scan target.
    fn is_valid_url(&self, url: &str) -> impl Future<Output = bool> + Send;
}

#[derive(Serialize)]
struct UrlCheckRequest<'a> {
    #[serde(rename = "Url")]
    url: &'a str,
}

impl TargetValidator for CloudScanService {
    /// POSTs the URL to the validation endpoint. Any failure (request error,
    /// non-2xx, missing field) counts as invalid.
    async fn is_valid_url(&self, url: &str) -> bool {
        let endpoint = format!("{}/api/v4/Scans/IsValidUrl", self.auth().server_url());
        let headers = self.auth().auth_headers(false);
        let body = UrlCheckRequest { url };

        match self.client().post_json(&endpoint, &headers, &body).await {
            Ok(response) if response.is_success() => response
                .body_json()
                .and_then(|json| json.get("IsValid").and_then(|v| v.as_bool()))
                .unwrap_or(false),
            Ok(response) => {
                debug!("url validation returned HTTP {}", response.status());
                false
            }
            Err(e) => {
                debug!("url validation request failed: {e}");
                false
            }
        }
    }
}

impl TargetValidator for AseScanService {
    async fn is_valid_url(&self, _url: &str) -> bool {
        true
    }
}

/// Whether `path` names an existing regular file.
#[must_use]
pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_exists() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(file_exists(file.path()));
        assert!(!file_exists(Path::new("/nonexistent/archive.zip")));
    }

    #[test]
    fn test_file_exists_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!file_exists(dir.path()));
    }
}
