//! Pipeline worker
//!
//! One worker is one unit of work: a single app package moving through a
//! single phase for a single target pod. Workers share the per-package
//! deployment record through an `Arc<Mutex<_>>`; everything else on the
//! worker is owned, so fan-out clones never alias each other's mutable
//! state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::apps::v1::StatefulSet;
use tracing::warn;

use crate::config::AppSourceScope;
use crate::cr::{pod_ordinal, replica_count, CrKind, CrRef};
use crate::status::{AppDeploymentInfo, AppPhaseType, PhaseInfo};

/// One app package journey bound to one target pod
pub struct PipelineWorker {
    /// CR the package belongs to
    pub cr: CrRef,
    /// App source the package came from
    pub app_src_name: String,
    /// Install scope of the app source
    pub scope: AppSourceScope,
    /// Pod this worker downloads for / copies into / installs on
    pub target_pod_name: String,
    /// Statefulset backing the CR, for the replica count
    pub sts: Option<Arc<StatefulSet>>,
    /// Shared deployment record this worker reports into
    pub deploy_info: Arc<Mutex<AppDeploymentInfo>>,
    /// Set while the worker is dispatched to its stage
    is_active: AtomicBool,
}

impl PipelineWorker {
    /// Worker for one package and one target pod
    pub fn new(
        cr: CrRef,
        app_src_name: impl Into<String>,
        scope: AppSourceScope,
        target_pod_name: impl Into<String>,
        sts: Option<Arc<StatefulSet>>,
        deploy_info: Arc<Mutex<AppDeploymentInfo>>,
    ) -> Self {
        Self {
            cr,
            app_src_name: app_src_name.into(),
            scope,
            target_pod_name: target_pod_name.into(),
            sts,
            deploy_info,
            is_active: AtomicBool::new(false),
        }
    }

    /// Fresh worker for another replica, sharing only the deployment record
    pub fn fan_out_clone(&self, target_pod_name: String) -> Self {
        Self {
            cr: self.cr.clone(),
            app_src_name: self.app_src_name.clone(),
            scope: self.scope,
            target_pod_name,
            sts: self.sts.clone(),
            deploy_info: Arc::clone(&self.deploy_info),
            is_active: AtomicBool::new(false),
        }
    }

    /// Whether the worker is currently dispatched to its stage
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    /// Flag the worker as dispatched (or returned)
    pub fn set_active(&self, active: bool) {
        self.is_active.store(active, Ordering::SeqCst);
    }

    /// Replica count of the backing statefulset, one when absent
    pub fn replica_count(&self) -> i32 {
        replica_count(self.sts.as_deref())
    }

    /// App name of the package under work
    pub fn app_name(&self) -> String {
        self.lock_info().app_name.clone()
    }

    /// Object hash of the package under work
    pub fn object_hash(&self) -> String {
        self.lock_info().object_hash.clone()
    }

    /// Package size in bytes
    pub fn size(&self) -> u64 {
        self.lock_info().size
    }

    /// Whether per-replica slots track this worker's phase
    ///
    /// True only for multi-replica Standalone workloads in phases after
    /// Download; everyone else reports into the main phase info.
    pub fn uses_aux_phase_info(&self, phase: AppPhaseType) -> bool {
        self.cr.kind == CrKind::Standalone
            && self.replica_count() > 1
            && phase != AppPhaseType::Download
    }

    /// Snapshot of the phase info this worker reports into for `phase`
    ///
    /// `None` signals a logic error (unparseable pod name or missing
    /// replica slot); callers skip the worker.
    pub fn phase_info_snapshot(&self, phase: AppPhaseType) -> Option<PhaseInfo> {
        if !self.uses_aux_phase_info(phase) {
            return Some(self.lock_info().phase_info);
        }
        let ordinal = match pod_ordinal(&self.target_pod_name) {
            Ok(ordinal) => ordinal as usize,
            Err(err) => {
                warn!(
                    pod = %self.target_pod_name,
                    error = %err,
                    "Worker has an unusable target pod name"
                );
                return None;
            }
        };
        let info = self.lock_info();
        match info.aux_phase_info.get(ordinal) {
            Some(slot) => Some(*slot),
            None => {
                warn!(
                    pod = %self.target_pod_name,
                    slots = info.aux_phase_info.len(),
                    "Worker's replica slot is out of range"
                );
                None
            }
        }
    }

    /// Rewrite the phase info this worker reports into for `phase`
    ///
    /// Returns false on the same logic errors as [`Self::phase_info_snapshot`].
    pub fn update_phase_info(&self, phase: AppPhaseType, new_info: PhaseInfo) -> bool {
        if !self.uses_aux_phase_info(phase) {
            self.lock_info().phase_info = new_info;
            return true;
        }
        let ordinal = match pod_ordinal(&self.target_pod_name) {
            Ok(ordinal) => ordinal as usize,
            Err(err) => {
                warn!(pod = %self.target_pod_name, error = %err, "Worker has an unusable target pod name");
                return false;
            }
        };
        let mut info = self.lock_info();
        match info.aux_phase_info.get_mut(ordinal) {
            Some(slot) => {
                *slot = new_info;
                true
            }
            None => {
                warn!(
                    pod = %self.target_pod_name,
                    slots = info.aux_phase_info.len(),
                    "Worker's replica slot is out of range"
                );
                false
            }
        }
    }

    /// Record a failed attempt: bump the retry count, fall back to pending
    pub fn record_retry(&self, phase: AppPhaseType) {
        if let Some(current) = self.phase_info_snapshot(phase) {
            self.update_phase_info(
                phase,
                PhaseInfo {
                    phase,
                    status: phase.pending(),
                    retry_count: current.retry_count + 1,
                },
            );
        }
    }

    /// Record a terminal failure: error status, retries spent
    pub fn record_fatal(&self, phase: AppPhaseType, max_retry: u32) {
        self.update_phase_info(
            phase,
            PhaseInfo {
                phase,
                status: phase.error(),
                retry_count: max_retry,
            },
        );
    }

    /// Record phase success: complete status, retry budget restored
    pub fn record_complete(&self, phase: AppPhaseType) {
        self.update_phase_info(
            phase,
            PhaseInfo {
                phase,
                status: phase.complete(),
                retry_count: 0,
            },
        );
    }

    /// Whether the stage manager should hand this worker a run slot
    pub fn eligible_for_run(&self, phase: AppPhaseType, max_retry: u32) -> bool {
        if self.is_active() {
            return false;
        }
        match self.phase_info_snapshot(phase) {
            Some(info) => info.retry_count < max_retry && info.status != phase.complete(),
            None => false,
        }
    }

    fn lock_info(&self) -> std::sync::MutexGuard<'_, AppDeploymentInfo> {
        self.deploy_info.lock().expect("deploy info poisoned")
    }
}

impl std::fmt::Debug for PipelineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineWorker")
            .field("cr", &self.cr.name)
            .field("app_src", &self.app_src_name)
            .field("pod", &self.target_pod_name)
            .field("active", &self.is_active())
            .finish()
    }
}
