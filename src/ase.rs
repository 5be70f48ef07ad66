//! On-premises (single-tenant) scan service adapter.
//!
//! Job creation here is multi-step: a job is created from a template, then
//! each configured property is applied as an independent REST call. A failure
//! at any step aborts the remaining steps and the overall submission reports
//! no job id. Already-applied steps are not rolled back; the service keeps
//! the partially configured job and the next submission starts fresh.
//!
//! The run action (and scan-type selection) require an optimistic-concurrency
//! `ETag` fetched from the job resource immediately beforehand. The tag is
//! never cached across runs.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::auth::AuthProvider;
use crate::client::{AppScanClient, FilePart};
use crate::provider::{
    ExecutionDetail, JobDetail, ProviderError, ScanDetail, ScanServiceProvider, SeverityCount,
};

const ASE_API: &str = "/api";
const UPLOADED_FILE_FIELD: &str = "uploadedfile";
const TEMPLATES_FOLDER_ID: &str = "2";

/// An id/name pair from one of the service's discovery listings
/// (templates, folders, agent servers, applications).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AseComponent {
    pub id: String,
    pub name: String,
}

/// How a dynamic scan authenticates against its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginType {
    /// Username/password applied to the scan template; the password travels
    /// with the encrypt flag set.
    Automatic,
    /// A recorded login-traffic file is uploaded and attached.
    Manual,
}

impl LoginType {
    /// The wire value used in job parameters.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginType::Automatic => "Automatic",
            LoginType::Manual => "Manual",
        }
    }
}

impl FromStr for LoginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Automatic" => Ok(LoginType::Automatic),
            "Manual" => Ok(LoginType::Manual),
            other => Err(format!("unknown login type: {other}")),
        }
    }
}

/// Adapter for the on-premises scan service.
///
/// Job parameters are carried in the same string map the cloud adapter uses;
/// the keys this adapter reads are: `templateId`, `testPolicyId`, `folder`,
/// `application`, `ScanName`, `description`, `contact`, `startingURL`,
/// `agentServer`, `loginType`, `userName`, `password`, `trafficFile`,
/// `exploreData`, `scanType`, `testOptimization`.
pub struct AseScanService {
    client: AppScanClient,
    auth: Arc<dyn AuthProvider>,
}

impl AseScanService {
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
        let mut headers = self.auth.auth_headers(true);
        headers.push(("Accept".to_string(), "application/json".to_string()));
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}{ASE_API}{path}", self.auth.server_url())
    }

    async fn create_job(&self, params: &BTreeMap<String, String>) -> Result<String, ProviderError> {
        self.ensure_session()?;

        let template_id = params
            .get("templateId")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::Submission("missing templateId".to_string()))?;

        info!("creating job from template {template_id}");
        let form = create_job_form(params);
        let url = self.url(&format!("/jobs/{template_id}/dastconfig/createjob"));
        let response = self.client.post_form(&url, &self.headers(), &form).await?;

        // The service does not return a structured error document for bad
        // input during job creation, so 400/404 are mapped here.
        if response.status() == 400 || response.status() == 404 {
            return Err(ProviderError::Submission(
                "job creation rejected: invalid configuration details".to_string(),
            ));
        }

        if response.status() == 201 {
            let json = response.body_json().ok_or_else(|| {
                ProviderError::UnexpectedResponse("empty job creation response".to_string())
            })?;
            let id = json_id(&json, "id").ok_or_else(|| {
                ProviderError::UnexpectedResponse("missing id in creation response".to_string())
            })?;
            info!("job created: {id}");
            return Ok(id);
        }

        let reason = response
            .error_message()
            .unwrap_or_else(|| format!("HTTP {}", response.status()));
        Err(ProviderError::Submission(reason))
    }

    /// Apply each configured property in order, aborting on the first
    /// failure. The step name is carried in the error so callers can tell
    /// which call sank the submission.
    async fn configure_job(
        &self,
        params: &BTreeMap<String, String>,
        job_id: &str,
    ) -> Result<(), ProviderError> {
        for step in config_plan(params)? {
            let result = match &step {
                ConfigStep::UpdateNode {
                    node,
                    value,
                    encrypt,
                    ..
                } => self.update_scant_node(job_id, node, value, *encrypt).await,
                ConfigStep::DesignateAgent { server_id } => {
                    self.designate_agent_server(job_id, server_id).await
                }
                ConfigStep::UploadTraffic { file, action, .. } => {
                    self.upload_traffic(job_id, Path::new(file), action).await
                }
                ConfigStep::SetScanType { scan_type } => {
                    self.set_scan_type(job_id, scan_type).await
                }
            };
            result.map_err(|e| step_failed(step.label(), &e))?;
        }
        Ok(())
    }

    /// Patch one node of the job's scan template.
    async fn update_scant_node(
        &self,
        job_id: &str,
        node: &str,
        value: &str,
        encrypt: bool,
    ) -> Result<(), ProviderError> {
        self.ensure_session()?;

        debug!("updating scant node {node} on job {job_id}");
        let form = vec![
            ("scantNodeXpath".to_string(), node.to_string()),
            ("scantNodeNewValue".to_string(), value.to_string()),
            ("encryptNodeValue".to_string(), encrypt.to_string()),
        ];
        let url = self.url(&format!("/jobs/{job_id}/dastconfig/updatescant"));
        let response = self.client.post_form(&url, &self.headers(), &form).await?;
        expect_ok(response.status())
    }

    async fn designate_agent_server(
        &self,
        job_id: &str,
        server_id: &str,
    ) -> Result<(), ProviderError> {
        self.ensure_session()?;

        let url = self.url(&format!("/jobs/{job_id}/designateAgentServer/{server_id}"));
        let response = self.client.post_form(&url, &self.headers(), &[]).await?;
        expect_ok(response.status())
    }

    /// Upload a traffic file and attach it to the job.
    ///
    /// `action` is `login` for a login recording and `add` for explore data.
    async fn upload_traffic(
        &self,
        job_id: &str,
        file: &Path,
        action: &str,
    ) -> Result<(), ProviderError> {
        self.ensure_session()?;
        if !file.is_file() {
            return Err(ProviderError::Upload(format!(
                "traffic file not found: {}",
                file.display()
            )));
        }

        let part = FilePart::from_path(UPLOADED_FILE_FIELD, file, "multipart/form-data")
            .await
            .map_err(|e| ProviderError::Upload(e.to_string()))?;
        let url = self.url(&format!("/jobs/{job_id}/dastconfig/updatetraffic/{action}"));
        let response = self
            .client
            .post_multipart(&url, &self.headers(), vec![part])
            .await?;
        expect_ok(response.status())
    }

    async fn set_scan_type(&self, job_id: &str, scan_type: &str) -> Result<(), ProviderError> {
        self.ensure_session()?;

        // Scan-type selection is guarded by the job's concurrency token,
        // fetched immediately beforehand and never reused.
        let etag = self.fetch_etag(job_id).await?;
        let base = self.url("/jobs/scantype");
        let url =
            AppScanClient::url_with_params(&base, &[("scanTypeId", scan_type), ("jobId", job_id)]);
        let mut headers = self.headers();
        headers.push(("If-Match".to_string(), etag));
        let response = self.client.put(&url, &headers).await?;
        expect_ok(response.status())
    }

    async fn run_job(&self, job_id: &str) -> Result<(), ProviderError> {
        self.ensure_session()?;

        info!("executing job {job_id}");
        let etag = self.fetch_etag(job_id).await?;
        let url = self.url(&format!("/jobs/{job_id}/actions"));
        let mut headers = self.headers();
        headers.push(("If-Match".to_string(), etag));
        let form = vec![("type".to_string(), "run".to_string())];
        let response = self.client.post_form(&url, &headers, &form).await?;

        if response.status() == 200 {
            info!("job {job_id} is running");
            Ok(())
        } else {
            Err(ProviderError::Submission(format!(
                "run action returned HTTP {}",
                response.status()
            )))
        }
    }

    /// Fetch a fresh concurrency token from the job resource.
    async fn fetch_etag(&self, job_id: &str) -> Result<String, ProviderError> {
        let url = self.url(&format!("/jobs/{job_id}"));
        let response = self.client.get(&url, &self.headers()).await?;
        if response.status() != 200 {
            return Err(ProviderError::UnexpectedResponse(format!(
                "job lookup for ETag returned HTTP {}",
                response.status()
            )));
        }
        response
            .header("ETag")
            .map(String::from)
            .ok_or_else(|| ProviderError::UnexpectedResponse("job resource had no ETag".to_string()))
    }

    /// Resolve the report pack that holds the job's generated reports.
    ///
    /// The real lookup endpoint is tried first. When it fails or returns
    /// nothing usable, this falls back to the service's id-arithmetic
    /// convention (`jobId + 1`). The convention is a compatibility shim, not
    /// a documented contract; keep every use of it behind this function.
    pub async fn report_pack_id(&self, job_id: &str) -> Result<String, ProviderError> {
        let url = self.url(&format!("/folderitems/{job_id}/reportPack"));
        if let Ok(response) = self.client.get(&url, &self.headers()).await
            && response.status() == 200
            && let Some(json) = response.body_json()
            && let Some(id) = json
                .get("reportPackId")
                .and_then(|v| json_scalar_to_string(v))
        {
            return Ok(id);
        }

        warn!("report pack lookup failed for job {job_id}, falling back to id arithmetic");
        let numeric: u64 = job_id.parse().map_err(|_| {
            ProviderError::UnexpectedResponse(format!("job id is not numeric: {job_id}"))
        })?;
        Ok((numeric + 1).to_string())
    }

    /// Workflow-state name of a folder item (job or report pack).
    pub async fn folder_item_state(
        &self,
        item_id: &str,
        item_kind: &str,
    ) -> Result<Option<String>, ProviderError> {
        let url = self.url(&format!("/folderitems/{item_id}"));
        let response = self.client.get(&url, &self.headers()).await?;
        if response.status() != 200 {
            return Ok(None);
        }
        Ok(response.body_json().and_then(|json| {
            json.get(item_kind)
                .and_then(|item| item.get("state"))
                .and_then(|state| state.get("name"))
                .and_then(|name| name.as_str().map(String::from))
        }))
    }

    /// Scan templates a job can be created from.
    pub async fn templates(&self) -> Result<Vec<AseComponent>, ProviderError> {
        self.list_components(&self.url("/templates"), &[], "id", "name")
            .await
    }

    /// Folders a job can be filed under. The service's built-in templates
    /// folder is not a valid destination and is left out.
    pub async fn folders(&self) -> Result<Vec<AseComponent>, ProviderError> {
        let folders = self
            .list_components(&self.url("/folders"), &[], "folderId", "folderPath")
            .await?;
        Ok(folders
            .into_iter()
            .filter(|f| f.id != TEMPLATES_FOLDER_ID)
            .collect())
    }

    /// Agent servers available for the `agentServer` job parameter.
    pub async fn agent_servers(&self) -> Result<Vec<AseComponent>, ProviderError> {
        self.list_components(&self.url("/agentServer"), &[], "serverId", "name")
            .await
    }

    /// Applications a job can be associated with.
    pub async fn applications(&self) -> Result<Vec<AseComponent>, ProviderError> {
        let url =
            AppScanClient::url_with_params(&self.url("/applications"), &[("columns", "name")]);
        // The applications listing is paginated by a Range header.
        let range = [("Range".to_string(), "items=0-999999".to_string())];
        self.list_components(&url, &range, "id", "name").await
    }

    async fn list_components(
        &self,
        url: &str,
        extra_headers: &[(String, String)],
        id_key: &str,
        name_key: &str,
    ) -> Result<Vec<AseComponent>, ProviderError> {
        self.ensure_session()?;

        let mut headers = self.headers();
        headers.extend_from_slice(extra_headers);
        let response = self.client.get(url, &headers).await?;
        if !response.is_success() {
            return Err(ProviderError::UnexpectedResponse(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let json = response.body_json().ok_or_else(|| {
            ProviderError::UnexpectedResponse("listing was not JSON".to_string())
        })?;
        Ok(components_from_listing(&json, id_key, name_key))
    }

    async fn security_issue_counts(
        &self,
        job_id: &str,
    ) -> Result<Option<Vec<SeverityCount>>, ProviderError> {
        let pack_id = self.report_pack_id(job_id).await?;
        let url = self.url(&format!("/folderitems/{pack_id}/reports"));
        let response = self.client.get(&url, &self.headers()).await?;
        if response.status() != 200 {
            return Ok(None);
        }
        let json = response.body_json().ok_or_else(|| {
            ProviderError::UnexpectedResponse("reports listing was not JSON".to_string())
        })?;
        Ok(security_issue_counts_from_reports(&json))
    }
}

/// One pending configuration call against a freshly created job.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConfigStep {
    UpdateNode {
        step: &'static str,
        node: &'static str,
        value: String,
        encrypt: bool,
    },
    DesignateAgent {
        server_id: String,
    },
    UploadTraffic {
        step: &'static str,
        file: String,
        action: &'static str,
    },
    SetScanType {
        scan_type: String,
    },
}

impl ConfigStep {
    fn label(&self) -> &'static str {
        match self {
            ConfigStep::UpdateNode { step, .. } | ConfigStep::UploadTraffic { step, .. } => *step,
            ConfigStep::DesignateAgent { .. } => "agent server",
            ConfigStep::SetScanType { .. } => "scan type",
        }
    }
}

/// Expand the parameter map into the ordered configuration calls.
///
/// The order is significant: the caller stops at the first step that fails,
/// so everything listed after it is never invoked.
fn config_plan(params: &BTreeMap<String, String>) -> Result<Vec<ConfigStep>, ProviderError> {
    let mut plan = Vec::new();

    if let Some(url) = non_empty(params, "startingURL") {
        plan.push(ConfigStep::UpdateNode {
            step: "starting URL",
            node: "StartingUrl",
            value: url.to_string(),
            encrypt: false,
        });
    }

    if let Some(server) = non_empty(params, "agentServer") {
        plan.push(ConfigStep::DesignateAgent {
            server_id: server.to_string(),
        });
    }

    if let Some(login) = non_empty(params, "loginType") {
        plan.push(ConfigStep::UpdateNode {
            step: "login method",
            node: "LoginMethod",
            value: login.to_string(),
            encrypt: false,
        });
        match LoginType::from_str(login) {
            Ok(LoginType::Automatic) => {
                let username = params.get("userName").cloned().unwrap_or_default();
                let password = params.get("password").cloned().unwrap_or_default();
                plan.push(ConfigStep::UpdateNode {
                    step: "login username",
                    node: "LoginUsername",
                    value: username,
                    encrypt: false,
                });
                // The password is flagged for encryption in its transit
                // representation.
                plan.push(ConfigStep::UpdateNode {
                    step: "login password",
                    node: "LoginPassword",
                    value: password,
                    encrypt: true,
                });
            }
            Ok(LoginType::Manual) => {
                let traffic = non_empty(params, "trafficFile").ok_or_else(|| {
                    ProviderError::Submission("manual login requires a trafficFile".to_string())
                })?;
                plan.push(ConfigStep::UploadTraffic {
                    step: "login traffic",
                    file: traffic.to_string(),
                    action: "login",
                });
            }
            Err(e) => return Err(ProviderError::Submission(e)),
        }
    }

    if let Some(explore) = non_empty(params, "exploreData") {
        plan.push(ConfigStep::UploadTraffic {
            step: "explore data",
            file: explore.to_string(),
            action: "add",
        });
    }

    if let Some(scan_type) = non_empty(params, "scanType") {
        plan.push(ConfigStep::SetScanType {
            scan_type: scan_type.to_string(),
        });
    }

    if let Some(optimization) = non_empty(params, "testOptimization") {
        plan.push(ConfigStep::UpdateNode {
            step: "test optimization",
            node: "TestOptimization",
            value: optimization.to_string(),
            encrypt: false,
        });
    }

    Ok(plan)
}

fn create_job_form(params: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let field = |from: &str, to: &str| {
        params
            .get(from)
            .map(|v| (to.to_string(), v.clone()))
    };
    [
        field("testPolicyId", "testPolicyId"),
        field("folder", "folderId"),
        field("application", "applicationId"),
        field("ScanName", "name"),
        field("description", "description"),
        field("contact", "contact"),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn non_empty<'a>(params: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn step_failed(step: &str, cause: &ProviderError) -> ProviderError {
    ProviderError::Submission(format!("job configuration failed at {step}: {cause}"))
}

fn expect_ok(status: u16) -> Result<(), ProviderError> {
    if status == 200 {
        Ok(())
    } else {
        Err(ProviderError::UnexpectedResponse(format!("HTTP {status}")))
    }
}

fn json_id(json: &serde_json::Value, key: &str) -> Option<String> {
    json.get(key).and_then(json_scalar_to_string)
}

/// Collect id/name pairs from a listing document. Entries missing either
/// field are skipped; numeric ids are tolerated.
fn components_from_listing(
    json: &serde_json::Value,
    id_key: &str,
    name_key: &str,
) -> Vec<AseComponent> {
    json.as_array()
        .map(|array| {
            array
                .iter()
                .filter_map(|entry| {
                    let id = entry.get(id_key).and_then(json_scalar_to_string)?;
                    let name = entry
                        .get(name_key)
                        .and_then(|v| v.as_str().map(String::from))?;
                    Some(AseComponent { id, name })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn json_scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract the per-severity issue counts from the report pack's "Security
/// Issues" report document.
fn security_issue_counts_from_reports(json: &serde_json::Value) -> Option<Vec<SeverityCount>> {
    let reports = json.get("reports")?.get("report")?.as_array()?;
    let security = reports.iter().find(|r| {
        r.get("name")
            .and_then(|n| n.as_str())
            .is_some_and(|n| n.eq_ignore_ascii_case("Security Issues"))
    })?;
    let issue_counts = security
        .get("issue-counts-severity")?
        .get("issue-count")?
        .as_array()?;

    let mut counts = Vec::with_capacity(issue_counts.len());
    for entry in issue_counts {
        let name = entry
            .get("severity")
            .and_then(|s| s.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("Unknown");
        let count = entry
            .get("count")
            .and_then(|c| match c {
                serde_json::Value::String(s) => s.parse::<u64>().ok(),
                serde_json::Value::Number(n) => n.as_u64(),
                _ => None,
            })
            .unwrap_or(0);
        counts.push(SeverityCount {
            severity: name.to_string(),
            count,
        });
    }
    Some(counts)
}

impl ScanServiceProvider for AseScanService {
    /// Create, configure and run a job. A failure at any configuration step
    /// aborts the remaining steps; no job id is returned even though the job
    /// itself may exist remotely.
    async fn create_and_execute_scan(
        &self,
        _scan_type: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String, ProviderError> {
        let job_id = self.create_job(params).await?;
        self.configure_job(params, &job_id).await?;
        self.run_job(&job_id).await?;
        Ok(job_id)
    }

    async fn submit_file(&self, _file: &Path) -> Result<String, ProviderError> {
        // Files are attached during job configuration on this service.
        Err(ProviderError::Upload(
            "standalone file upload is not supported by the on-premises service".to_string(),
        ))
    }

    /// Only the workflow state is fetched here. Findings are read through
    /// `get_non_compliant_issues`, and only once the caller has observed a
    /// terminal-success state, so an in-progress job never triggers the
    /// report-pack lookups.
    async fn get_scan_details(&self, job_id: &str) -> Result<ScanDetail, ProviderError> {
        self.ensure_session()?;

        let state = match self.folder_item_state(job_id, "content-scan-job").await {
            Ok(state) => state,
            Err(ProviderError::Transport(e)) if e.is_unreachable() => {
                warn!("scan service unreachable while fetching job state: {e}");
                return Ok(ScanDetail::Unknown);
            }
            Err(e) => return Err(e),
        };
        let Some(state) = state else {
            return Ok(ScanDetail::InvalidJobId);
        };

        Ok(ScanDetail::Detail(JobDetail {
            name: None,
            latest_execution: ExecutionDetail {
                id: None,
                status: state,
                user_message: None,
                total_issues: None,
                critical_issues: None,
                high_issues: None,
                medium_issues: None,
                low_issues: None,
                info_issues: None,
            },
        }))
    }

    async fn get_non_compliant_issues(
        &self,
        job_id: &str,
    ) -> Result<Vec<SeverityCount>, ProviderError> {
        self.ensure_session()?;
        self.security_issue_counts(job_id)
            .await?
            .ok_or_else(|| ProviderError::UnexpectedResponse("no report pack found".to_string()))
    }
}
