//! App install pipeline
//!
//! Three phase queues connected by bounded dispatch channels. A worker
//! lives in exactly one queue at a time; stage managers walk their queue on
//! a fixed tick, hand eligible workers to their dispatch channel, and ask
//! the pipeline to move completed workers forward. The pipeline is built
//! fresh for every reconcile pass and torn down at yield; only the disk
//! tracker outlives it.

mod download;
mod install;
mod podcopy;
mod worker;

pub use worker::PipelineWorker;

pub(crate) use download::download_phase_manager;
pub(crate) use install::install_phase_manager;
pub(crate) use podcopy::pod_copy_phase_manager;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::AppFrameworkSpec;
use crate::cr::CrKind;
use crate::disk::DiskTracker;
use crate::podexec::PodTransport;
use crate::remote::RemoteStoreRegistry;
use crate::scheduler::SchedulerTunables;
use crate::status::{AppPhaseStatus, AppPhaseType, PhaseInfo};

/// Capacity of each phase's dispatch channel
///
/// Large enough that a disk-pressure requeue never fails in practice; the
/// download admission loop still bounds actual concurrency.
const DISPATCH_CHANNEL_CAPACITY: usize = 512;

/// Everything a stage needs besides the pipeline itself
pub(crate) struct StageContext {
    /// Remote store clients by provider tag
    pub remote_stores: Arc<RemoteStoreRegistry>,
    /// Pod exec transport
    pub transport: Arc<dyn PodTransport>,
    /// Spec snapshot for the pass
    pub config: AppFrameworkSpec,
    /// Root of the staging volume
    pub staging_root: PathBuf,
    /// Pass tunables
    pub tunables: SchedulerTunables,
}

/// One stage's queue, dispatch channel, and in-flight task tracker
pub struct PipelinePhase {
    phase: AppPhaseType,
    q: Mutex<Vec<Arc<PipelineWorker>>>,
    tx: mpsc::Sender<Arc<PipelineWorker>>,
    rx: Mutex<Option<mpsc::Receiver<Arc<PipelineWorker>>>>,
    tracker: TaskTracker,
}

impl PipelinePhase {
    fn new(phase: AppPhaseType) -> Self {
        let (tx, rx) = mpsc::channel(DISPATCH_CHANNEL_CAPACITY);
        Self {
            phase,
            q: Mutex::new(Vec::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            tracker: TaskTracker::new(),
        }
    }

    /// Snapshot of the queued workers
    pub fn workers(&self) -> Vec<Arc<PipelineWorker>> {
        self.lock_q().clone()
    }

    /// Number of queued workers
    pub fn len(&self) -> usize {
        self.lock_q().len()
    }

    /// True when no workers are queued
    pub fn is_empty(&self) -> bool {
        self.lock_q().is_empty()
    }

    /// Append workers to the queue
    pub fn add_workers<I>(&self, workers: I)
    where
        I: IntoIterator<Item = Arc<PipelineWorker>>,
    {
        let mut q = self.lock_q();
        for worker in workers {
            debug!(
                phase = %self.phase,
                pod = %worker.target_pod_name,
                app = %worker.app_name(),
                digest = %worker.object_hash(),
                "Adding worker"
            );
            q.push(worker);
        }
    }

    /// Remove one worker, identified by pointer, from the queue
    pub fn remove_worker(&self, worker: &Arc<PipelineWorker>) -> bool {
        let mut q = self.lock_q();
        let before = q.len();
        q.retain(|queued| !Arc::ptr_eq(queued, worker));
        let removed = q.len() != before;
        if removed {
            debug!(
                phase = %self.phase,
                pod = %worker.target_pod_name,
                app = %worker.app_name(),
                "Removed worker"
            );
        }
        removed
    }

    /// Sender side of the dispatch channel
    pub(crate) fn sender(&self) -> mpsc::Sender<Arc<PipelineWorker>> {
        self.tx.clone()
    }

    /// Receiver side of the dispatch channel; present exactly once
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<Arc<PipelineWorker>>> {
        self.rx.lock().expect("phase receiver poisoned").take()
    }

    /// Tracker for this stage's in-flight worker tasks
    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    fn lock_q(&self) -> std::sync::MutexGuard<'_, Vec<Arc<PipelineWorker>>> {
        self.q.lock().expect("phase queue poisoned")
    }
}

/// The three-phase install pipeline of one reconcile pass
pub struct AppInstallPipeline {
    download: PipelinePhase,
    pod_copy: PipelinePhase,
    install: PipelinePhase,
    cancel: CancellationToken,
    disk: Arc<DiskTracker>,
}

impl AppInstallPipeline {
    /// Fresh pipeline over the process-wide disk tracker
    pub fn new(disk: Arc<DiskTracker>) -> Self {
        Self {
            download: PipelinePhase::new(AppPhaseType::Download),
            pod_copy: PipelinePhase::new(AppPhaseType::PodCopy),
            install: PipelinePhase::new(AppPhaseType::Install),
            cancel: CancellationToken::new(),
            disk,
        }
    }

    /// The queue for a phase
    pub fn phase(&self, phase: AppPhaseType) -> &PipelinePhase {
        match phase {
            AppPhaseType::Download => &self.download,
            AppPhaseType::PodCopy => &self.pod_copy,
            AppPhaseType::Install => &self.install,
        }
    }

    /// True when every phase queue is empty
    pub fn is_empty(&self) -> bool {
        self.download.is_empty() && self.pod_copy.is_empty() && self.install.is_empty()
    }

    /// The single termination axis of the pass
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The process-wide staging disk accounting
    pub fn disk(&self) -> &Arc<DiskTracker> {
        &self.disk
    }

    /// Move a worker that completed `current` into `next`
    ///
    /// The one special case is a multi-replica Standalone leaving Download:
    /// the single download worker multiplies into one pod-copy (or install)
    /// worker per replica, each bound to its own replica slot. Every path
    /// ends with the original worker leaving the `current` queue.
    pub fn transition_worker_phase(
        &self,
        worker: &Arc<PipelineWorker>,
        current: AppPhaseType,
        next: AppPhaseType,
    ) {
        let replicas = worker.replica_count();

        if replicas > 1 && current == AppPhaseType::Download && worker.cr.kind == CrKind::Standalone
        {
            self.fan_out(worker, replicas);
        } else {
            worker.set_active(false);
            worker.update_phase_info(next, PhaseInfo::pending_for(next));
            debug!(
                app = %worker.app_name(),
                pod = %worker.target_pod_name,
                from = %current,
                to = %next,
                "Simple transition"
            );
            self.phase(next).add_workers([Arc::clone(worker)]);
        }

        self.phase(current).remove_worker(worker);
    }

    /// Multiply a finished Standalone download into per-replica workers
    fn fan_out(&self, worker: &Arc<PipelineWorker>, replicas: i32) {
        let replicas = replicas as usize;
        let mut copy_workers: Vec<Arc<PipelineWorker>> = Vec::new();
        let mut install_workers: Vec<Arc<PipelineWorker>> = Vec::new();

        let slots: Vec<PhaseInfo> = {
            let mut info = worker.deploy_info.lock().expect("deploy info poisoned");
            if info.aux_phase_info.is_empty() {
                // Download just finished for the first time; every replica
                // starts at pod copy.
                info.aux_phase_info =
                    vec![PhaseInfo::pending_for(AppPhaseType::PodCopy); replicas];
            } else if info.aux_phase_info.len() != replicas {
                // Replica count changed since the slots were allocated.
                // New tail slots start from pod copy; surplus slots vanish
                // with their pods.
                info.aux_phase_info
                    .resize(replicas, PhaseInfo::pending_for(AppPhaseType::PodCopy));
            }
            info.aux_phase_info.clone()
        };

        for (ordinal, slot) in slots.iter().enumerate() {
            let pod_name = match worker.cr.pod_name(ordinal as u32) {
                Ok(name) => name,
                Err(err) => {
                    // Cannot happen for Standalone; guards the contract anyway.
                    tracing::error!(error = %err, "Fan-out target pod name failed");
                    continue;
                }
            };
            let clone = Arc::new(worker.fan_out_clone(pod_name));
            if slot.phase == AppPhaseType::Install
                && slot.status != AppPhaseStatus::InstallComplete
            {
                install_workers.push(clone);
            } else {
                copy_workers.push(clone);
            }
        }

        info!(
            app = %worker.app_name(),
            replicas,
            pod_copy = copy_workers.len(),
            install = install_workers.len(),
            "Fan-out transition"
        );

        self.phase(AppPhaseType::PodCopy).add_workers(copy_workers);
        self.phase(AppPhaseType::Install).add_workers(install_workers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppSourceScope;
    use crate::cr::CrRef;
    use crate::status::AppDeploymentInfo;
    use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};

    fn pipeline() -> AppInstallPipeline {
        AppInstallPipeline::new(Arc::new(DiskTracker::with_capacity(1 << 30)))
    }

    fn statefulset(replicas: i32) -> Arc<StatefulSet> {
        Arc::new(StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..StatefulSetSpec::default()
            }),
            ..StatefulSet::default()
        })
    }

    fn make_worker(kind: CrKind, replicas: i32, app: &str) -> Arc<PipelineWorker> {
        let info = AppDeploymentInfo {
            app_name: app.to_string(),
            object_hash: format!("{app}-hash"),
            phase_info: PhaseInfo {
                phase: AppPhaseType::Download,
                status: AppPhaseStatus::DownloadComplete,
                retry_count: 0,
            },
            ..AppDeploymentInfo::default()
        };
        let cr = CrRef::new(kind, "stack1", "test");
        let pod = cr.pod_name(0).unwrap();
        Arc::new(PipelineWorker::new(
            cr,
            "adminApps",
            AppSourceScope::Local,
            pod,
            Some(statefulset(replicas)),
            Arc::new(Mutex::new(info)),
        ))
    }

    #[test]
    fn queue_removal_handles_first_middle_last_and_missing() {
        let ppln = pipeline();
        let phase = ppln.phase(AppPhaseType::Download);
        let workers: Vec<_> = (0..5)
            .map(|i| make_worker(CrKind::ClusterMaster, 1, &format!("app{i}.tgz")))
            .collect();
        phase.add_workers(workers.iter().cloned());
        assert_eq!(phase.len(), 5);

        // last
        assert!(phase.remove_worker(&workers[4]));
        assert!(!phase.workers().iter().any(|w| Arc::ptr_eq(w, &workers[4])));
        // first
        assert!(phase.remove_worker(&workers[0]));
        assert!(!phase.workers().iter().any(|w| Arc::ptr_eq(w, &workers[0])));
        // middle
        assert!(phase.remove_worker(&workers[2]));
        assert!(!phase.workers().iter().any(|w| Arc::ptr_eq(w, &workers[2])));

        assert_eq!(phase.len(), 2);
        // survivors intact, no duplicates
        for survivor in [&workers[1], &workers[3]] {
            assert_eq!(
                phase
                    .workers()
                    .iter()
                    .filter(|w| Arc::ptr_eq(w, survivor))
                    .count(),
                1
            );
        }

        // missing worker
        let stranger = make_worker(CrKind::ClusterMaster, 1, "ghost.tgz");
        assert!(!phase.remove_worker(&stranger));
        assert_eq!(phase.len(), 2);
    }

    #[test]
    fn simple_transition_moves_single_ownership() {
        let ppln = pipeline();
        let worker = make_worker(CrKind::ClusterMaster, 1, "app0.tgz");
        ppln.phase(AppPhaseType::Download)
            .add_workers([Arc::clone(&worker)]);

        ppln.transition_worker_phase(&worker, AppPhaseType::Download, AppPhaseType::PodCopy);

        assert_eq!(ppln.phase(AppPhaseType::Download).len(), 0);
        let in_copy = ppln.phase(AppPhaseType::PodCopy).workers();
        assert_eq!(in_copy.len(), 1);
        assert!(Arc::ptr_eq(&in_copy[0], &worker));

        let info = worker.phase_info_snapshot(AppPhaseType::PodCopy).unwrap();
        assert_eq!(info.status, AppPhaseStatus::PodCopyPending);
        assert_eq!(info.retry_count, 0);
        assert!(!worker.is_active());
    }

    #[test]
    fn multireplica_nondownload_transition_stays_simple() {
        let ppln = pipeline();
        let worker = make_worker(CrKind::Standalone, 5, "app0.tgz");
        {
            let mut info = worker.deploy_info.lock().unwrap();
            info.aux_phase_info = vec![PhaseInfo::pending_for(AppPhaseType::PodCopy); 5];
        }
        ppln.phase(AppPhaseType::PodCopy)
            .add_workers([Arc::clone(&worker)]);

        ppln.transition_worker_phase(&worker, AppPhaseType::PodCopy, AppPhaseType::Install);

        assert_eq!(ppln.phase(AppPhaseType::PodCopy).len(), 0);
        assert_eq!(ppln.phase(AppPhaseType::Install).len(), 1);
        // The replica slot, not the main record, carries the new phase.
        let info = worker.deploy_info.lock().unwrap();
        assert_eq!(info.aux_phase_info[0].phase, AppPhaseType::Install);
        assert_eq!(info.aux_phase_info[0].status, AppPhaseStatus::InstallPending);
    }

    #[test]
    fn standalone_fan_out_clones_one_worker_per_replica() {
        let ppln = pipeline();
        let worker = make_worker(CrKind::Standalone, 5, "app0.tgz");
        ppln.phase(AppPhaseType::Download)
            .add_workers([Arc::clone(&worker)]);

        ppln.transition_worker_phase(&worker, AppPhaseType::Download, AppPhaseType::PodCopy);

        assert_eq!(ppln.phase(AppPhaseType::Download).len(), 0);
        let clones = ppln.phase(AppPhaseType::PodCopy).workers();
        assert_eq!(clones.len(), 5);
        for (i, clone) in clones.iter().enumerate() {
            assert_eq!(
                clone.target_pod_name,
                format!("splunk-stack1-standalone-{i}")
            );
            assert!(Arc::ptr_eq(&clone.deploy_info, &worker.deploy_info));
            assert!(!Arc::ptr_eq(clone, &worker));
        }

        let info = worker.deploy_info.lock().unwrap();
        assert_eq!(info.aux_phase_info.len(), 5);
        assert!(info
            .aux_phase_info
            .iter()
            .all(|slot| slot.status == AppPhaseStatus::PodCopyPending));
    }

    #[test]
    fn fan_out_resume_honors_existing_slots() {
        let ppln = pipeline();
        let worker = make_worker(CrKind::Standalone, 5, "app0.tgz");
        {
            let mut info = worker.deploy_info.lock().unwrap();
            info.aux_phase_info = vec![PhaseInfo::pending_for(AppPhaseType::PodCopy); 5];
            info.aux_phase_info[2] = PhaseInfo::pending_for(AppPhaseType::Install);
        }
        ppln.phase(AppPhaseType::Download)
            .add_workers([Arc::clone(&worker)]);

        ppln.transition_worker_phase(&worker, AppPhaseType::Download, AppPhaseType::PodCopy);

        assert_eq!(ppln.phase(AppPhaseType::PodCopy).len(), 4);
        let installs = ppln.phase(AppPhaseType::Install).workers();
        assert_eq!(installs.len(), 1);
        assert_eq!(installs[0].target_pod_name, "splunk-stack1-standalone-2");
    }

    #[test]
    fn fan_out_resizes_slots_on_replica_change() {
        let ppln = pipeline();
        let worker = make_worker(CrKind::Standalone, 5, "app0.tgz");
        {
            let mut info = worker.deploy_info.lock().unwrap();
            info.aux_phase_info = vec![PhaseInfo::install_complete(); 3];
        }
        ppln.phase(AppPhaseType::Download)
            .add_workers([Arc::clone(&worker)]);

        ppln.transition_worker_phase(&worker, AppPhaseType::Download, AppPhaseType::PodCopy);

        let info = worker.deploy_info.lock().unwrap();
        assert_eq!(info.aux_phase_info.len(), 5);
        assert_eq!(
            info.aux_phase_info[4].status,
            AppPhaseStatus::PodCopyPending
        );
    }

    #[test]
    fn pipeline_empty_looks_across_all_phases() {
        let ppln = pipeline();
        assert!(ppln.is_empty());
        ppln.phase(AppPhaseType::Install)
            .add_workers([make_worker(CrKind::ClusterMaster, 1, "a.tgz")]);
        assert!(!ppln.is_empty());
    }
}
