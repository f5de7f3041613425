//! Persisted app deployment status
//!
//! Everything in this module is written into the CR status by the reconcile
//! caller and read back on the next pass. Serialized field names and enum
//! values are wire-stable; renaming them is a breaking schema change and
//! requires a version bump plus a migration (see [`crate::migration`]).

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::AppFrameworkSpec;

/// Persisted status schema written by the 0.2.x operator line
pub const AFW_PHASE_2: u16 = 2;

/// Persisted status schema written by this operator
pub const CURRENT_AFW_VERSION: u16 = 3;

/// Pipeline phase an app package moves through
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum AppPhaseType {
    /// Streaming the package from the remote store to the staging volume
    #[default]
    Download,
    /// Pushing the staged package into the target pod
    PodCopy,
    /// Triggering the install inside the target pod
    Install,
}

impl AppPhaseType {
    /// The phase a completed worker hands off to, if any
    pub fn next(self) -> Option<AppPhaseType> {
        match self {
            Self::Download => Some(Self::PodCopy),
            Self::PodCopy => Some(Self::Install),
            Self::Install => None,
        }
    }

    /// Pending status constant of this phase
    pub fn pending(self) -> AppPhaseStatus {
        match self {
            Self::Download => AppPhaseStatus::DownloadPending,
            Self::PodCopy => AppPhaseStatus::PodCopyPending,
            Self::Install => AppPhaseStatus::InstallPending,
        }
    }

    /// In-progress status constant of this phase
    pub fn in_progress(self) -> AppPhaseStatus {
        match self {
            Self::Download => AppPhaseStatus::DownloadInProgress,
            Self::PodCopy => AppPhaseStatus::PodCopyInProgress,
            Self::Install => AppPhaseStatus::InstallInProgress,
        }
    }

    /// Complete status constant of this phase
    pub fn complete(self) -> AppPhaseStatus {
        match self {
            Self::Download => AppPhaseStatus::DownloadComplete,
            Self::PodCopy => AppPhaseStatus::PodCopyComplete,
            Self::Install => AppPhaseStatus::InstallComplete,
        }
    }

    /// Error status constant of this phase
    pub fn error(self) -> AppPhaseStatus {
        match self {
            Self::Download => AppPhaseStatus::DownloadError,
            Self::PodCopy => AppPhaseStatus::PodCopyError,
            Self::Install => AppPhaseStatus::InstallError,
        }
    }
}

impl std::fmt::Display for AppPhaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Download => write!(f, "download"),
            Self::PodCopy => write!(f, "podCopy"),
            Self::Install => write!(f, "install"),
        }
    }
}

/// Per-phase progress of an app package
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AppPhaseStatus {
    /// Queued for download
    #[default]
    DownloadPending,
    /// Download task running
    DownloadInProgress,
    /// Package staged on the operator volume
    DownloadComplete,
    /// Download retries exhausted
    DownloadError,
    /// Queued for pod copy
    PodCopyPending,
    /// Copy task running
    PodCopyInProgress,
    /// Package present inside the target pod
    PodCopyComplete,
    /// Pod copy retries exhausted
    PodCopyError,
    /// Queued for install
    InstallPending,
    /// Install command running
    InstallInProgress,
    /// App installed on the target pod
    InstallComplete,
    /// Install retries exhausted
    InstallError,
}

impl AppPhaseStatus {
    /// Phase this status belongs to
    pub fn phase(self) -> AppPhaseType {
        match self {
            Self::DownloadPending
            | Self::DownloadInProgress
            | Self::DownloadComplete
            | Self::DownloadError => AppPhaseType::Download,
            Self::PodCopyPending
            | Self::PodCopyInProgress
            | Self::PodCopyComplete
            | Self::PodCopyError => AppPhaseType::PodCopy,
            Self::InstallPending
            | Self::InstallInProgress
            | Self::InstallComplete
            | Self::InstallError => AppPhaseType::Install,
        }
    }

    /// True for the terminal error status of any phase
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::DownloadError | Self::PodCopyError | Self::InstallError
        )
    }
}

/// Phase, status, and retry budget of one app package journey
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseInfo {
    /// Current pipeline phase
    #[serde(default)]
    pub phase: AppPhaseType,

    /// Progress within the phase
    #[serde(default)]
    pub status: AppPhaseStatus,

    /// Failed attempts in the current phase
    #[serde(default)]
    pub retry_count: u32,
}

impl PhaseInfo {
    /// A fresh journey: queued for download, zero retries
    pub fn download_pending() -> Self {
        Self {
            phase: AppPhaseType::Download,
            status: AppPhaseStatus::DownloadPending,
            retry_count: 0,
        }
    }

    /// Queued at the head of the named phase, zero retries
    pub fn pending_for(phase: AppPhaseType) -> Self {
        Self {
            phase,
            status: phase.pending(),
            retry_count: 0,
        }
    }

    /// Terminal success: installed, zero retries
    pub fn install_complete() -> Self {
        Self {
            phase: AppPhaseType::Install,
            status: AppPhaseStatus::InstallComplete,
            retry_count: 0,
        }
    }
}

/// Whether the package still exists in the remote listing
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AppRepoState {
    /// Present in the latest listing
    #[default]
    Active,
    /// Missing from the latest listing; kept to drive cleanup
    Deleted,
}

/// Coarse deployment outcome surfaced to the CR status
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AppDeployStatus {
    /// Not started or re-queued by a listing change
    #[default]
    Pending,
    /// Somewhere in the pipeline
    InProgress,
    /// Installed (or staged, for cluster scope)
    Complete,
    /// Retries exhausted
    Error,
}

/// Deployment record of one app package
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploymentInfo {
    /// Package file name, e.g. `app1.tgz`
    pub app_name: String,

    /// Remote object timestamp, opaque to the scheduler
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_modified_time: String,

    /// Remote ETag with surrounding quotes stripped; may be `hex-N` form
    pub object_hash: String,

    /// Package size in bytes, from the remote listing
    #[serde(default)]
    pub size: u64,

    /// Listing presence
    #[serde(default)]
    pub repo_state: AppRepoState,

    /// Coarse outcome
    #[serde(default)]
    pub deploy_status: AppDeployStatus,

    /// Pipeline journey of this package
    #[serde(default)]
    pub phase_info: PhaseInfo,

    /// Per-replica journeys for multi-replica workloads, phases after
    /// Download. Empty for single-replica workloads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aux_phase_info: Vec<PhaseInfo>,
}

impl AppDeploymentInfo {
    /// True when every replica slot reports Install/Complete
    ///
    /// An empty slot vector means there is nothing to aggregate and the
    /// answer is yes; callers gate on replica count before asking.
    pub fn installed_on_all_replicas(&self) -> bool {
        self.aux_phase_info.iter().all(|info| {
            info.phase == AppPhaseType::Install
                && info.status == AppPhaseStatus::InstallComplete
        })
    }
}

/// Deployment records belonging to one app source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSrcDeployInfo {
    /// One record per app package seen in the source
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_deployment_info: Vec<AppDeploymentInfo>,
}

impl AppSrcDeployInfo {
    /// Find a package record by app name
    pub fn app(&self, app_name: &str) -> Option<&AppDeploymentInfo> {
        self.app_deployment_info
            .iter()
            .find(|info| info.app_name == app_name)
    }

    /// Find a package record by app name, mutably
    pub fn app_mut(&mut self, app_name: &str) -> Option<&mut AppDeploymentInfo> {
        self.app_deployment_info
            .iter_mut()
            .find(|info| info.app_name == app_name)
    }
}

/// Progress of the external bundle push for cluster-scoped sources
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BundlePushStage {
    /// No cluster-scoped apps staged yet
    #[default]
    Uninitialized,
    /// All cluster-scoped apps staged; push not started
    Pending,
    /// External push running
    InProgress,
    /// External push finished
    Complete,
}

/// Persisted scheduler state for one CR
///
/// Mutated only by the reconcile caller's single invocation; the pipeline
/// works on per-package copies and the entry point writes results back here
/// at yield.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploymentContext {
    /// Status schema version; discriminates migrator behavior
    #[serde(default)]
    pub version: u16,

    /// True while any package is mid-journey
    #[serde(default)]
    pub is_deployment_in_progress: bool,

    /// Epoch seconds of the last remote listing refresh
    #[serde(default)]
    pub last_app_info_check_time: i64,

    /// Poll interval in effect, seconds
    #[serde(default)]
    pub apps_repo_status_poll_interval: i64,

    /// Concurrent download cap in effect for this CR
    #[serde(default)]
    pub apps_status_max_concurrent_app_downloads: u32,

    /// External bundle-push bookkeeping for cluster scope
    #[serde(default)]
    pub bundle_push_stage: BundlePushStage,

    /// Per-source deployment records
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub apps_src_deploy_status: BTreeMap<String, AppSrcDeployInfo>,

    /// Snapshot of the spec the records were built against
    #[serde(default)]
    pub app_framework_config: AppFrameworkSpec,
}

impl AppDeploymentContext {
    /// A context freshly initialized from a CR spec
    pub fn new(config: &AppFrameworkSpec) -> Self {
        Self {
            version: CURRENT_AFW_VERSION,
            apps_repo_status_poll_interval: config.apps_repo_poll_interval,
            apps_status_max_concurrent_app_downloads: config.max_concurrent_app_downloads,
            app_framework_config: config.clone(),
            ..Self::default()
        }
    }
}

/// True when every cluster-scoped app has been staged on its target pod
///
/// The push itself is the external collaborator's job; this is the predicate
/// it polls.
pub fn bundle_push_needed<'a, I>(cluster_scoped_apps: I) -> bool
where
    I: IntoIterator<Item = &'a AppDeploymentInfo>,
{
    let mut any = false;
    for info in cluster_scoped_apps {
        any = true;
        if info.phase_info.phase != AppPhaseType::PodCopy
            || info.phase_info.status != AppPhaseStatus::PodCopyComplete
        {
            return false;
        }
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_ordering_is_download_podcopy_install() {
        assert_eq!(AppPhaseType::Download.next(), Some(AppPhaseType::PodCopy));
        assert_eq!(AppPhaseType::PodCopy.next(), Some(AppPhaseType::Install));
        assert_eq!(AppPhaseType::Install.next(), None);
    }

    #[test]
    fn status_constants_round_trip_through_phase() {
        for phase in [
            AppPhaseType::Download,
            AppPhaseType::PodCopy,
            AppPhaseType::Install,
        ] {
            assert_eq!(phase.pending().phase(), phase);
            assert_eq!(phase.in_progress().phase(), phase);
            assert_eq!(phase.complete().phase(), phase);
            assert_eq!(phase.error().phase(), phase);
            assert!(phase.error().is_error());
            assert!(!phase.complete().is_error());
        }
    }

    #[test]
    fn wire_values_are_camel_case() {
        assert_eq!(
            serde_json::to_string(&AppPhaseStatus::PodCopyInProgress).unwrap(),
            "\"podCopyInProgress\""
        );
        assert_eq!(
            serde_json::to_string(&AppPhaseType::PodCopy).unwrap(),
            "\"podCopy\""
        );
        assert_eq!(
            serde_json::to_string(&AppRepoState::Deleted).unwrap(),
            "\"deleted\""
        );
        assert_eq!(
            serde_json::to_string(&AppDeployStatus::InProgress).unwrap(),
            "\"inProgress\""
        );
    }

    #[test]
    fn context_round_trips_through_json() {
        let mut ctx = AppDeploymentContext::default();
        ctx.version = CURRENT_AFW_VERSION;
        ctx.apps_src_deploy_status.insert(
            "adminApps".to_string(),
            AppSrcDeployInfo {
                app_deployment_info: vec![AppDeploymentInfo {
                    app_name: "app1.tgz".to_string(),
                    object_hash: "abc123".to_string(),
                    size: 1234,
                    phase_info: PhaseInfo::download_pending(),
                    ..AppDeploymentInfo::default()
                }],
            },
        );

        let json = serde_json::to_string(&ctx).unwrap();
        let back: AppDeploymentContext = serde_json::from_str(&json).unwrap();
        assert_eq!(ctx, back);
    }

    #[test]
    fn installed_on_all_replicas_requires_every_slot() {
        let mut info = AppDeploymentInfo {
            aux_phase_info: vec![PhaseInfo::install_complete(); 5],
            ..AppDeploymentInfo::default()
        };
        assert!(info.installed_on_all_replicas());

        info.aux_phase_info[3] = PhaseInfo::pending_for(AppPhaseType::Install);
        assert!(!info.installed_on_all_replicas());

        info.aux_phase_info[3] = PhaseInfo::pending_for(AppPhaseType::PodCopy);
        assert!(!info.installed_on_all_replicas());
    }

    #[test]
    fn bundle_push_waits_for_every_cluster_app() {
        let mut apps = vec![AppDeploymentInfo::default(); 3];
        assert!(!bundle_push_needed(&apps));

        for app in &mut apps {
            app.phase_info.phase = AppPhaseType::PodCopy;
            app.phase_info.status = AppPhaseStatus::PodCopyComplete;
        }
        assert!(bundle_push_needed(&apps));

        // No cluster-scoped apps means no push either.
        assert!(!bundle_push_needed(&[]));
    }
}
