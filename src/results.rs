//! Job status polling and findings summaries.
//!
//! The two backends report progress with different status vocabularies;
//! [`JobStatus`] is the normalized view the rest of the crate works with.
//! [`ResultsPoller`] owns one job's polling state and caches the severity
//! breakdown once the job is ready.

use std::time::Duration;

use log::{debug, info, warn};

use crate::provider::{ProviderError, ScanDetail, ScanServiceProvider, SeverityCount};
use crate::report::{CancelHandle, PollOptions};

/// Normalized job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Accepted, waiting for an execution slot.
    Queued,
    Running,
    /// Pause requested but not yet in effect.
    Pausing,
    Paused,
    Suspended,
    /// Finished successfully; findings are available.
    Ready,
    Failed,
    /// The service could not be reached or reported a state outside the
    /// known vocabulary. Not terminal: a later poll may re-resolve it.
    Unknown,
}

impl JobStatus {
    /// Normalize a backend status string. Unrecognized values map to
    /// [`JobStatus::Unknown`] rather than failing the poll.
    #[must_use]
    pub fn from_remote(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "inqueue" | "queued" | "pending" => JobStatus::Queued,
            "running" | "starting" => JobStatus::Running,
            "pausing" => JobStatus::Pausing,
            "paused" => JobStatus::Paused,
            "suspended" => JobStatus::Suspended,
            "ready" => JobStatus::Ready,
            "failed" => JobStatus::Failed,
            other => {
                debug!("unrecognized job status '{other}'");
                JobStatus::Unknown
            }
        }
    }

    /// Whether the job will not transition any further.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Failed)
    }

    /// Whether findings can be fetched in this status.
    #[must_use]
    pub fn has_results(&self) -> bool {
        matches!(self, JobStatus::Ready)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Pausing => "Pausing",
            JobStatus::Paused => "Paused",
            JobStatus::Suspended => "Suspended",
            JobStatus::Ready => "Ready",
            JobStatus::Failed => "Failed",
            JobStatus::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Finding counts bucketed by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindingsSummary {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub info: u64,
    pub total: u64,
}

impl FindingsSummary {
    /// Build a summary from the severity aggregation rows. The total is the
    /// sum of the buckets; rows with unknown severity names are counted in
    /// the total only.
    #[must_use]
    pub fn from_severity_counts(counts: &[SeverityCount]) -> Self {
        let mut summary = FindingsSummary::default();
        for row in counts {
            match row.severity.to_ascii_lowercase().as_str() {
                "critical" => summary.critical += row.count,
                "high" => summary.high += row.count,
                "medium" => summary.medium += row.count,
                "low" => summary.low += row.count,
                "informational" | "information" | "info" => summary.info += row.count,
                other => warn!("uncategorized severity '{other}' ({} issues)", row.count),
            }
            summary.total += row.count;
        }
        summary
    }
}

impl std::fmt::Display for FindingsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} issues ({} critical, {} high, {} medium, {} low, {} informational)",
            self.total, self.critical, self.high, self.medium, self.low, self.info
        )
    }
}

/// Polls one job's detail document and normalizes its progress.
///
/// The poller carries no shared state; create one per job. The severity
/// breakdown is fetched at most once, on the first refresh that observes
/// [`JobStatus::Ready`], and cached for the poller's lifetime.
pub struct ResultsPoller<P> {
    job_id: String,
    provider: P,
    status: JobStatus,
    message: Option<String>,
    scan_name: Option<String>,
    summary: Option<FindingsSummary>,
}

impl<P: ScanServiceProvider + Sync> ResultsPoller<P> {
    #[must_use]
    pub fn new(job_id: String, provider: P) -> Self {
        Self {
            job_id,
            provider,
            status: JobStatus::Unknown,
            message: None,
            scan_name: None,
            summary: None,
        }
    }

    /// The job this poller observes.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The status observed by the most recent refresh.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// The backend's user-facing message for paused, suspended or failed
    /// jobs, verbatim.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The scan name from the detail document, once one has been seen.
    #[must_use]
    pub fn scan_name(&self) -> Option<&str> {
        self.scan_name.as_deref()
    }

    /// The cached severity breakdown. `None` until a refresh has observed
    /// the job ready.
    #[must_use]
    pub fn findings(&self) -> Option<&FindingsSummary> {
        self.summary.as_ref()
    }

    /// Fetch the job's current detail document and update the normalized
    /// status. While the job is queued or running no findings call is made;
    /// the first refresh that sees the job ready also fetches and caches the
    /// severity breakdown.
    ///
    /// # Errors
    ///
    /// Propagates provider errors. An unreachable service is not an error
    /// here: it surfaces as [`JobStatus::Unknown`], and nothing is cached
    /// for it, so a later refresh can re-resolve the job.
    pub async fn refresh(&mut self) -> Result<JobStatus, ProviderError> {
        match self.provider.get_scan_details(&self.job_id).await? {
            ScanDetail::Unknown => {
                self.status = JobStatus::Unknown;
            }
            ScanDetail::InvalidJobId => {
                self.status = JobStatus::Failed;
                self.message = Some(format!("the service rejected job id '{}'", self.job_id));
            }
            ScanDetail::Unauthorized => {
                self.status = JobStatus::Failed;
                self.message = Some(format!("not authorized to view job '{}'", self.job_id));
            }
            ScanDetail::Detail(detail) => {
                let execution = &detail.latest_execution;
                self.status = JobStatus::from_remote(&execution.status);
                self.message = execution.user_message.clone();
                if detail.name.is_some() {
                    self.scan_name = detail.name.clone();
                }
                if self.status == JobStatus::Ready && self.summary.is_none() {
                    let counts = self.provider.get_non_compliant_issues(&self.job_id).await?;
                    let summary = FindingsSummary::from_severity_counts(&counts);
                    info!("job {} ready: {summary}", self.job_id);
                    self.summary = Some(summary);
                }
            }
        }
        Ok(self.status)
    }

    /// Refresh on a fixed interval until the job reaches a terminal state,
    /// the attempt budget runs out or the cancel handle fires. Returns the
    /// last observed status.
    ///
    /// # Errors
    ///
    /// Propagates the first provider error; the loop does not continue past
    /// one.
    pub async fn wait_for_completion(
        &mut self,
        options: &PollOptions,
        cancel: Option<&CancelHandle>,
    ) -> Result<JobStatus, ProviderError> {
        let interval = Duration::from_millis(options.interval_ms);
        for attempt in 0..options.max_attempts {
            if let Some(handle) = cancel
                && handle.is_cancelled()
            {
                info!("polling cancelled for job {}", self.job_id);
                return Ok(self.status);
            }
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }
            let status = self.refresh().await?;
            debug!("job {} status: {status}", self.job_id);
            if status.is_terminal() {
                return Ok(status);
            }
        }
        warn!(
            "job {} still {} after {} polls",
            self.job_id, self.status, options.max_attempts
        );
        Ok(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::provider::{ExecutionDetail, JobDetail};

    struct ScriptedProvider {
        details: Mutex<VecDeque<ScanDetail>>,
        counts: Vec<SeverityCount>,
        detail_calls: AtomicUsize,
        issue_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(details: Vec<ScanDetail>, counts: Vec<SeverityCount>) -> Self {
            Self {
                details: Mutex::new(details.into()),
                counts,
                detail_calls: AtomicUsize::new(0),
                issue_calls: AtomicUsize::new(0),
            }
        }
    }

    impl ScanServiceProvider for ScriptedProvider {
        async fn create_and_execute_scan(
            &self,
            _scan_type: &str,
            _params: &BTreeMap<String, String>,
        ) -> Result<String, ProviderError> {
            unimplemented!("not used by poller tests")
        }

        async fn submit_file(&self, _file: &Path) -> Result<String, ProviderError> {
            unimplemented!("not used by poller tests")
        }

        async fn get_scan_details(&self, _job_id: &str) -> Result<ScanDetail, ProviderError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            let mut details = self.details.lock().unwrap();
            Ok(details.pop_front().expect("script exhausted"))
        }

        async fn get_non_compliant_issues(
            &self,
            _job_id: &str,
        ) -> Result<Vec<SeverityCount>, ProviderError> {
            self.issue_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.counts.clone())
        }
    }

    fn detail(status: &str, message: Option<&str>) -> ScanDetail {
        ScanDetail::Detail(JobDetail {
            name: Some("nightly-dast".to_string()),
            latest_execution: ExecutionDetail {
                id: Some("exec-1".to_string()),
                status: status.to_string(),
                user_message: message.map(str::to_string),
                total_issues: None,
                critical_issues: None,
                high_issues: None,
                medium_issues: None,
                low_issues: None,
                info_issues: None,
            },
        })
    }

    fn severity(name: &str, count: u64) -> SeverityCount {
        SeverityCount {
            severity: name.to_string(),
            count,
        }
    }

    #[test]
    fn test_status_normalization() {
        assert_eq!(JobStatus::from_remote("InQueue"), JobStatus::Queued);
        assert_eq!(JobStatus::from_remote("RUNNING"), JobStatus::Running);
        assert_eq!(JobStatus::from_remote("Ready"), JobStatus::Ready);
        assert_eq!(JobStatus::from_remote("Suspended"), JobStatus::Suspended);
        assert_eq!(
            JobStatus::from_remote("Post-Scan Analysis"),
            JobStatus::Unknown
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Ready.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_summary_total_is_sum_of_buckets() {
        let summary = FindingsSummary::from_severity_counts(&[
            severity("Critical", 1),
            severity("High", 2),
            severity("Medium", 3),
            severity("Low", 4),
            severity("Informational", 5),
        ]);
        assert_eq!(summary.total, 15);
        assert_eq!(
            summary.total,
            summary.critical + summary.high + summary.medium + summary.low + summary.info
        );
    }

    #[tokio::test]
    async fn test_no_summary_fetch_while_queued_or_running() {
        let provider = ScriptedProvider::new(
            vec![detail("InQueue", None), detail("Running", None)],
            vec![severity("High", 1)],
        );
        let mut poller = ResultsPoller::new("job-1".to_string(), provider);

        assert_eq!(poller.refresh().await.unwrap(), JobStatus::Queued);
        assert_eq!(poller.refresh().await.unwrap(), JobStatus::Running);

        assert!(poller.findings().is_none());
        assert_eq!(poller.provider.issue_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ready_fetches_summary_exactly_once() {
        let provider = ScriptedProvider::new(
            vec![detail("Ready", None), detail("Ready", None)],
            vec![severity("High", 2), severity("Low", 3)],
        );
        let mut poller = ResultsPoller::new("job-1".to_string(), provider);

        assert_eq!(poller.refresh().await.unwrap(), JobStatus::Ready);
        assert_eq!(poller.refresh().await.unwrap(), JobStatus::Ready);

        let findings = poller.findings().unwrap();
        assert_eq!(findings.high, 2);
        assert_eq!(findings.low, 3);
        assert_eq!(findings.total, 5);
        assert_eq!(poller.provider.issue_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_is_not_cached_and_re_resolves() {
        let provider = ScriptedProvider::new(
            vec![ScanDetail::Unknown, detail("Ready", None)],
            vec![severity("Medium", 1)],
        );
        let mut poller = ResultsPoller::new("job-1".to_string(), provider);

        assert_eq!(poller.refresh().await.unwrap(), JobStatus::Unknown);
        assert!(poller.findings().is_none());

        assert_eq!(poller.refresh().await.unwrap(), JobStatus::Ready);
        assert_eq!(poller.findings().unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_invalid_job_id_reports_failure_with_message() {
        let provider = ScriptedProvider::new(vec![ScanDetail::InvalidJobId], Vec::new());
        let mut poller = ResultsPoller::new("bogus".to_string(), provider);

        assert_eq!(poller.refresh().await.unwrap(), JobStatus::Failed);
        assert!(poller.message().unwrap().contains("bogus"));
        assert_eq!(poller.provider.issue_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_job_surfaces_user_message_verbatim() {
        let provider = ScriptedProvider::new(
            vec![detail("Failed", Some("Scan was stopped by the operator."))],
            Vec::new(),
        );
        let mut poller = ResultsPoller::new("job-1".to_string(), provider);

        assert_eq!(poller.refresh().await.unwrap(), JobStatus::Failed);
        assert_eq!(poller.message(), Some("Scan was stopped by the operator."));
        assert_eq!(poller.provider.issue_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_paused_is_message_bearing_but_not_failed() {
        let provider = ScriptedProvider::new(
            vec![detail("Paused", Some("Paused by user."))],
            Vec::new(),
        );
        let mut poller = ResultsPoller::new("job-1".to_string(), provider);

        assert_eq!(poller.refresh().await.unwrap(), JobStatus::Paused);
        assert_eq!(poller.message(), Some("Paused by user."));
        assert!(!poller.status().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_completion_polls_until_ready() {
        let provider = ScriptedProvider::new(
            vec![
                detail("InQueue", None),
                detail("Running", None),
                detail("Ready", None),
            ],
            vec![severity("High", 1)],
        );
        let mut poller = ResultsPoller::new("job-1".to_string(), provider);

        let options = PollOptions::default();
        let status = poller.wait_for_completion(&options, None).await.unwrap();

        assert_eq!(status, JobStatus::Ready);
        assert_eq!(poller.provider.detail_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_for_completion_respects_cancel() {
        let provider = ScriptedProvider::new(vec![detail("Running", None)], Vec::new());
        let mut poller = ResultsPoller::new("job-1".to_string(), provider);

        let cancel = CancelHandle::new();
        cancel.cancel();
        let status = poller
            .wait_for_completion(&PollOptions::default(), Some(&cancel))
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Unknown);
        assert_eq!(poller.provider.detail_calls.load(Ordering::SeqCst), 0);
    }
}
