//! Scan kinds, parameter assembly and submission.
//!
//! Each scan kind owns its target validation, its optional pre-submission
//! file uploads, and the shape of the parameter set handed to the backend.
//! Kinds are a plain enum dispatching to per-kind assembly logic; there is
//! no scan class hierarchy.

use std::collections::BTreeMap;
use std::path::Path;

use log::info;

use crate::ase::LoginType;
use crate::provider::{ProviderError, ScanServiceProvider};
use crate::report::ReportRequest;
use crate::validation::{TargetValidator, file_exists};

/// Well-known parameter keys.
const SCAN_NAME: &str = "ScanName";
const LOCALE: &str = "Locale";
const EMAIL_NOTIFICATION: &str = "EnableMailNotification";
const STARTING_URL: &str = "StartingUrl";
const LOGIN_TYPE: &str = "LoginType";
const TRAFFIC_FILE: &str = "trafficFile";
const TRAFFIC_FILE_ID: &str = "LoginSequenceFileId";
const SCAN_FILE: &str = "ScanFile";
const SCAN_FILE_ID: &str = "ScanFileId";
const ARSA_FILE_ID: &str = "ARSAFileId";
const APPLICATION_FILE_ID: &str = "ApplicationFileId";

/// Errors raised while preparing or submitting a scan.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Invalid scan target: {0}")]
    InvalidTarget(String),
    #[error("Scan could not be prepared: {0}")]
    Preparation(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// The kind of analysis a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// Static analysis of an uploaded archive (cloud).
    Static,
    /// Dynamic analysis of a running application by URL (cloud).
    Dynamic,
    /// Dynamic analysis driven by a pre-built scan-definition file (cloud).
    DynamicWithFile,
    /// Mobile application analysis of an uploaded binary (cloud).
    Mobile,
    /// Software composition analysis of an uploaded archive (cloud).
    CompositionAnalysis,
    /// Dynamic analysis on the on-premises service.
    AseDynamic,
}

impl ScanKind {
    /// The type name used on the wire when creating a job.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            ScanKind::Static => "StaticAnalyzer",
            ScanKind::Dynamic => "DynamicAnalyzer",
            ScanKind::DynamicWithFile => "DynamicAnalyzerWithFile",
            ScanKind::Mobile => "MobileAnalyzer",
            ScanKind::CompositionAnalysis => "Sca",
            ScanKind::AseDynamic => "AseDynamicAnalyzer",
        }
    }

    /// Human-readable kind name.
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            ScanKind::Static => "Static Analyzer",
            ScanKind::Dynamic | ScanKind::DynamicWithFile => "Dynamic Analyzer",
            ScanKind::Mobile => "Mobile Analyzer",
            ScanKind::CompositionAnalysis => "Software Composition Analyzer",
            ScanKind::AseDynamic => "Dynamic Analyzer (ASE)",
        }
    }

    /// Default report format for this kind of scan.
    #[must_use]
    pub fn report_format(&self) -> &'static str {
        match self {
            ScanKind::Mobile => "pdf",
            ScanKind::AseDynamic => "json",
            _ => "html",
        }
    }
}

impl std::fmt::Display for ScanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A submitted scan job.
///
/// The id is assigned by the service exactly once, at submission. Retrying a
/// failed submission goes back through [`ScanSpec::submit`] and produces a
/// new job; an existing job's id is never reassigned.
#[derive(Debug, Clone)]
pub struct ScanJob {
    id: String,
    kind: ScanKind,
    name: String,
    parameters: BTreeMap<String, String>,
}

impl ScanJob {
    /// The service-assigned job id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The kind of analysis this job performs.
    #[must_use]
    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    /// The scan name (auto-generated when the spec carried none).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parameter set that was submitted.
    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// A report request pre-filled with this job's default report format
    /// and the scan name as the report title.
    #[must_use]
    pub fn report_request(&self, destination: &Path) -> ReportRequest {
        ReportRequest::new(self.kind.report_format(), destination).with_title(&self.name)
    }
}

/// Everything needed to submit one scan.
///
/// A spec is reusable: each call to [`submit`](Self::submit) produces an
/// independent [`ScanJob`].
#[derive(Debug, Clone)]
pub struct ScanSpec {
    kind: ScanKind,
    target: Option<String>,
    properties: BTreeMap<String, String>,
}

impl ScanSpec {
    /// Start a spec for the given kind.
    #[must_use]
    pub fn new(kind: ScanKind) -> Self {
        Self {
            kind,
            target: None,
            properties: BTreeMap::new(),
        }
    }

    /// Set the scan target: a URL for dynamic kinds, a file path for
    /// upload-based kinds.
    #[must_use]
    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    /// Set an explicit scan name (otherwise one is generated from the kind
    /// and a timestamp).
    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.properties
            .insert(SCAN_NAME.to_string(), name.to_string());
        self
    }

    /// Associate the scan with an application id. The cloud service verifies
    /// the id before creating the job.
    #[must_use]
    pub fn with_app_id(mut self, app_id: &str) -> Self {
        self.properties
            .insert("AppId".to_string(), app_id.to_string());
        self
    }

    /// Use a pre-built scan-definition file for a dynamic scan.
    #[must_use]
    pub fn with_scan_file(mut self, path: &str) -> Self {
        self.properties
            .insert(SCAN_FILE.to_string(), path.to_string());
        self
    }

    /// Configure target login for a dynamic scan. `Manual` requires a
    /// recorded traffic file.
    #[must_use]
    pub fn with_login(mut self, login: LoginType, traffic_file: Option<&str>) -> Self {
        self.properties
            .insert(LOGIN_TYPE.to_string(), login.as_str().to_string());
        if let Some(file) = traffic_file {
            self.properties
                .insert(TRAFFIC_FILE.to_string(), file.to_string());
        }
        self
    }

    /// Set an arbitrary backend parameter.
    #[must_use]
    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// The kind this spec submits.
    #[must_use]
    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    /// Validate the target, perform any pre-submission uploads, assemble the
    /// final parameter set and create-and-execute the job.
    ///
    /// Validation and upload failures are raised before any job-creation
    /// call, so no partial job is left behind for those cases.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::InvalidTarget`] for a missing or unusable
    /// target, [`ScanError::Preparation`] for upload/validation failures,
    /// and the provider's error when the service rejects the submission.
    pub async fn submit<P>(&self, provider: &P) -> Result<ScanJob, ScanError>
    where
        P: ScanServiceProvider + TargetValidator + Sync,
    {
        let mut params = self.properties.clone();
        let kind = match self.kind {
            ScanKind::Dynamic | ScanKind::DynamicWithFile => {
                self.prepare_dynamic(provider, &mut params).await?
            }
            ScanKind::Static | ScanKind::CompositionAnalysis => {
                self.prepare_upload(provider, &mut params, ARSA_FILE_ID).await?;
                self.kind
            }
            ScanKind::Mobile => {
                self.prepare_upload(provider, &mut params, APPLICATION_FILE_ID)
                    .await?;
                self.kind
            }
            ScanKind::AseDynamic => {
                if let Some(target) = &self.target {
                    params.insert("startingURL".to_string(), target.clone());
                }
                // The on-premises adapter reads its login type under the
                // lowercase key.
                if let Some(login) = params.remove(LOGIN_TYPE) {
                    params.insert("loginType".to_string(), login);
                }
                self.kind
            }
        };

        let name = apply_defaults(&mut params, kind);
        info!("submitting scan '{name}' ({kind})");

        let id = provider
            .create_and_execute_scan(kind.type_name(), &params)
            .await?;
        Ok(ScanJob {
            id,
            kind,
            name,
            parameters: params,
        })
    }

    /// Dynamic-scan preparation: URL validation, optional login traffic
    /// upload, optional scan-definition upload (which switches the kind).
    async fn prepare_dynamic<P>(
        &self,
        provider: &P,
        params: &mut BTreeMap<String, String>,
    ) -> Result<ScanKind, ScanError>
    where
        P: ScanServiceProvider + TargetValidator + Sync,
    {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| ScanError::InvalidTarget("no target URL".to_string()))?;
        let parsed = url::Url::parse(target)
            .map_err(|e| ScanError::InvalidTarget(format!("malformed target URL: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ScanError::InvalidTarget(format!(
                "target URL must be http(s): {target}"
            )));
        }
        params.insert(STARTING_URL.to_string(), target.clone());

        if !provider.is_valid_url(target).await {
            return Err(ScanError::InvalidTarget(format!(
                "target URL failed validation: {target}"
            )));
        }

        // The login type steers preparation but is not itself a job
        // parameter on the cloud service.
        let login = params.remove(LOGIN_TYPE);
        if login.as_deref() == Some(LoginType::Manual.as_str()) {
            if let Some(traffic) = params.remove(TRAFFIC_FILE) {
                let traffic_path = Path::new(&traffic);
                if !file_exists(traffic_path) {
                    return Err(ScanError::Preparation(format!(
                        "login traffic file not found: {traffic}"
                    )));
                }
                let file_id = provider.submit_file(traffic_path).await?;
                params.insert(TRAFFIC_FILE_ID.to_string(), file_id);
            }
        }

        let mut kind = ScanKind::Dynamic;
        if let Some(scan_file) = params.remove(SCAN_FILE) {
            let scan_path = Path::new(&scan_file);
            if !file_exists(scan_path) {
                return Err(ScanError::Preparation(format!(
                    "scan definition file not found: {scan_file}"
                )));
            }
            let file_id = provider.submit_file(scan_path).await?;
            params.insert(SCAN_FILE_ID.to_string(), file_id);
            kind = ScanKind::DynamicWithFile;
        }
        Ok(kind)
    }

    /// Upload-based preparation shared by static, SCA and mobile scans.
    async fn prepare_upload<P>(
        &self,
        provider: &P,
        params: &mut BTreeMap<String, String>,
        file_id_key: &str,
    ) -> Result<(), ScanError>
    where
        P: ScanServiceProvider + Sync,
    {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| ScanError::InvalidTarget("no target file".to_string()))?;
        let path = Path::new(target);
        if !file_exists(path) {
            return Err(ScanError::InvalidTarget(format!(
                "target file not found: {target}"
            )));
        }

        let file_id = provider.submit_file(path).await?;
        params.insert(file_id_key.to_string(), file_id);
        Ok(())
    }
}

/// Fill in the parameters every submission carries: a scan name, a locale
/// and the mail-notification flag. Returns the effective scan name.
fn apply_defaults(params: &mut BTreeMap<String, String>, kind: ScanKind) -> String {
    if !params.contains_key(SCAN_NAME) {
        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        params.insert(
            SCAN_NAME.to_string(),
            format!("{}{timestamp}", kind.type_name()),
        );
    }
    if kind != ScanKind::AseDynamic {
        params
            .entry(LOCALE.to_string())
            .or_insert_with(|| "en-US".to_string());
        params
            .entry(EMAIL_NOTIFICATION.to_string())
            .or_insert_with(|| "false".to_string());
    }
    params[SCAN_NAME].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    use crate::provider::{ScanDetail, SeverityCount};

    #[derive(Default)]
    struct MockService {
        calls: Mutex<Vec<(String, BTreeMap<String, String>)>>,
        uploads: Mutex<Vec<String>>,
        url_valid: bool,
        next_job_id: String,
    }

    impl MockService {
        fn new(job_id: &str, url_valid: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                uploads: Mutex::new(Vec::new()),
                url_valid,
                next_job_id: job_id.to_string(),
            }
        }
    }

    impl ScanServiceProvider for MockService {
        async fn create_and_execute_scan(
            &self,
            scan_type: &str,
            params: &BTreeMap<String, String>,
        ) -> Result<String, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push((scan_type.to_string(), params.clone()));
            Ok(self.next_job_id.clone())
        }

        async fn submit_file(&self, file: &Path) -> Result<String, ProviderError> {
            let mut uploads = self.uploads.lock().unwrap();
            uploads.push(file.display().to_string());
            Ok(format!("file-{}", uploads.len()))
        }

        async fn get_scan_details(&self, _job_id: &str) -> Result<ScanDetail, ProviderError> {
            Ok(ScanDetail::Unknown)
        }

        async fn get_non_compliant_issues(
            &self,
            _job_id: &str,
        ) -> Result<Vec<SeverityCount>, ProviderError> {
            Ok(Vec::new())
        }
    }

    impl TargetValidator for MockService {
        async fn is_valid_url(&self, _url: &str) -> bool {
            self.url_valid
        }
    }

    #[tokio::test]
    async fn test_dynamic_scan_submission() {
        let service = MockService::new("scan-42", true);
        let spec = ScanSpec::new(ScanKind::Dynamic).with_target("https://example.com");

        let job = spec.submit(&service).await.unwrap();

        assert_eq!(job.id(), "scan-42");
        assert_eq!(job.kind(), ScanKind::Dynamic);
        let calls = service.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "DynamicAnalyzer");
        assert_eq!(
            calls[0].1.get("StartingUrl").map(String::as_str),
            Some("https://example.com")
        );
        // no login, no files: nothing uploaded
        assert!(service.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dynamic_scan_rejects_invalid_url_before_submission() {
        let service = MockService::new("scan-42", false);
        let spec = ScanSpec::new(ScanKind::Dynamic).with_target("https://unreachable.example");

        let err = spec.submit(&service).await.unwrap_err();

        assert!(matches!(err, ScanError::InvalidTarget(_)));
        assert!(service.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dynamic_scan_rejects_malformed_url_locally() {
        let service = MockService::new("scan-42", true);
        for target in ["not a url", "ftp://example.com"] {
            let err = ScanSpec::new(ScanKind::Dynamic)
                .with_target(target)
                .submit(&service)
                .await
                .unwrap_err();
            assert!(matches!(err, ScanError::InvalidTarget(_)));
        }
        assert!(service.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dynamic_scan_without_target_fails_fast() {
        let service = MockService::new("scan-42", true);
        let err = ScanSpec::new(ScanKind::Dynamic)
            .submit(&service)
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::InvalidTarget(_)));
        assert!(service.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_file_switches_kind_to_dynamic_with_file() {
        let mut scan_file = tempfile::NamedTempFile::new().unwrap();
        scan_file.write_all(b"recorded").unwrap();

        let service = MockService::new("scan-9", true);
        let spec = ScanSpec::new(ScanKind::Dynamic)
            .with_target("https://example.com")
            .with_scan_file(&scan_file.path().display().to_string());

        let job = spec.submit(&service).await.unwrap();

        assert_eq!(job.kind(), ScanKind::DynamicWithFile);
        let calls = service.calls.lock().unwrap();
        assert_eq!(calls[0].0, "DynamicAnalyzerWithFile");
        assert_eq!(
            calls[0].1.get("ScanFileId").map(String::as_str),
            Some("file-1")
        );
        assert!(!calls[0].1.contains_key("ScanFile"));
    }

    #[tokio::test]
    async fn test_manual_login_missing_traffic_file_fails_before_submission() {
        let service = MockService::new("scan-9", true);
        let spec = ScanSpec::new(ScanKind::Dynamic)
            .with_target("https://example.com")
            .with_login(LoginType::Manual, Some("/nonexistent/login.traffic"));

        let err = spec.submit(&service).await.unwrap_err();

        assert!(matches!(err, ScanError::Preparation(_)));
        assert!(service.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_login_uploads_traffic_file() {
        let mut traffic = tempfile::NamedTempFile::new().unwrap();
        traffic.write_all(b"GET /login").unwrap();

        let service = MockService::new("scan-9", true);
        let spec = ScanSpec::new(ScanKind::Dynamic)
            .with_target("https://example.com")
            .with_login(LoginType::Manual, Some(&traffic.path().display().to_string()));

        let job = spec.submit(&service).await.unwrap();

        let calls = service.calls.lock().unwrap();
        assert_eq!(
            calls[0].1.get("LoginSequenceFileId").map(String::as_str),
            Some("file-1")
        );
        // LoginType steers preparation only
        assert!(!calls[0].1.contains_key("LoginType"));
        assert_eq!(job.kind(), ScanKind::Dynamic);
    }

    #[tokio::test]
    async fn test_mobile_scan_uploads_target() {
        let mut app = tempfile::NamedTempFile::new().unwrap();
        app.write_all(b"binary").unwrap();

        let service = MockService::new("scan-7", true);
        let spec =
            ScanSpec::new(ScanKind::Mobile).with_target(&app.path().display().to_string());

        let job = spec.submit(&service).await.unwrap();

        assert_eq!(job.id(), "scan-7");
        let calls = service.calls.lock().unwrap();
        assert_eq!(calls[0].0, "MobileAnalyzer");
        assert_eq!(
            calls[0].1.get("ApplicationFileId").map(String::as_str),
            Some("file-1")
        );
    }

    #[tokio::test]
    async fn test_static_scan_missing_target_file() {
        let service = MockService::new("scan-7", true);
        let spec = ScanSpec::new(ScanKind::Static).with_target("/nonexistent/app.irx");

        let err = spec.submit(&service).await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn test_defaults_applied() {
        let service = MockService::new("scan-1", true);
        let spec = ScanSpec::new(ScanKind::Dynamic).with_target("https://example.com");

        let job = spec.submit(&service).await.unwrap();

        assert!(job.name().starts_with("DynamicAnalyzer"));
        let calls = service.calls.lock().unwrap();
        assert_eq!(
            calls[0].1.get("EnableMailNotification").map(String::as_str),
            Some("false")
        );
        assert_eq!(calls[0].1.get("Locale").map(String::as_str), Some("en-US"));
    }

    #[tokio::test]
    async fn test_explicit_name_is_kept() {
        let service = MockService::new("scan-1", true);
        let spec = ScanSpec::new(ScanKind::Dynamic)
            .with_target("https://example.com")
            .with_name("nightly-dast");

        let job = spec.submit(&service).await.unwrap();
        assert_eq!(job.name(), "nightly-dast");
    }

    #[tokio::test]
    async fn test_report_request_carries_scan_name_and_format() {
        let service = MockService::new("scan-1", true);
        let job = ScanSpec::new(ScanKind::Dynamic)
            .with_target("https://example.com")
            .with_name("nightly-dast")
            .submit(&service)
            .await
            .unwrap();

        let request = job.report_request(Path::new("./reports"));
        assert_eq!(request.format(), "html");
        assert_eq!(request.title(), "nightly-dast");
    }

    #[test]
    fn test_report_formats() {
        assert_eq!(ScanKind::Dynamic.report_format(), "html");
        assert_eq!(ScanKind::Mobile.report_format(), "pdf");
        assert_eq!(ScanKind::AseDynamic.report_format(), "json");
    }
}
