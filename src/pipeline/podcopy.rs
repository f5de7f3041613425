//! Pod-copy stage
//!
//! Pushes staged packages into target pods over the exec transport. No
//! admission beyond worker eligibility: channel sends are non-blocking and
//! a full channel simply waits for the next tick. Cluster-scoped apps end
//! their journey here; the external bundle push distributes them.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::paths;
use crate::status::{AppPhaseStatus, AppPhaseType};
use crate::Error;

use super::{AppInstallPipeline, PipelineWorker, StageContext};

/// Pod-copy phase manager; one per reconcile pass
pub(crate) async fn pod_copy_phase_manager(
    ppln: Arc<AppInstallPipeline>,
    stage: Arc<StageContext>,
) {
    info!("Starting pod copy phase manager");
    let cancel = ppln.cancel_token();
    let phase = ppln.phase(AppPhaseType::PodCopy);
    let max_retry = stage.tunables.max_retry_count;

    let runner = tokio::spawn(pod_copy_runner(Arc::clone(&ppln), Arc::clone(&stage)));

    'manager: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Pod copy phase manager received termination");
                break 'manager;
            }
            _ = tokio::time::sleep(stage.tunables.tick) => {}
        }

        'walk: for worker in phase.workers() {
            let Some(info) = worker.phase_info_snapshot(AppPhaseType::PodCopy) else {
                continue;
            };
            if worker.eligible_for_run(AppPhaseType::PodCopy, max_retry) {
                match phase.sender().try_send(Arc::clone(&worker)) {
                    Ok(()) => {
                        debug!(
                            app = %worker.app_name(),
                            pod = %worker.target_pod_name,
                            "Pod copy worker got a run slot"
                        );
                        worker.set_active(true);
                    }
                    Err(_) => break 'walk,
                }
            } else if info.status == AppPhaseStatus::PodCopyComplete {
                if worker.scope.is_cluster_scoped() {
                    // Staged for the bundle push; nothing more to do here.
                    debug!(
                        app = %worker.app_name(),
                        "Cluster-scoped app staged; leaving install to the bundle push"
                    );
                    phase.remove_worker(&worker);
                } else {
                    ppln.transition_worker_phase(
                        &worker,
                        AppPhaseType::PodCopy,
                        AppPhaseType::Install,
                    );
                }
            } else if info.retry_count >= max_retry {
                warn!(
                    app = %worker.app_name(),
                    pod = %worker.target_pod_name,
                    retries = info.retry_count,
                    "Pod copy retries exhausted"
                );
                worker.record_fatal(AppPhaseType::PodCopy, max_retry);
                phase.remove_worker(&worker);
            }
        }
    }

    if let Err(err) = runner.await {
        error!(error = %err, "Pod copy runner task failed");
    }

    let tracker = phase.tracker();
    tracker.close();
    tracker.wait().await;
    info!("Pod copy phase manager finished");
}

/// Channel consumer: one task per dispatched worker
async fn pod_copy_runner(ppln: Arc<AppInstallPipeline>, stage: Arc<StageContext>) {
    let cancel = ppln.cancel_token();
    let phase = ppln.phase(AppPhaseType::PodCopy);
    let Some(mut rx) = phase.take_receiver() else {
        error!("Pod copy dispatch channel already claimed");
        return;
    };

    loop {
        let worker = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(worker) => worker,
                None => break,
            },
        };
        phase
            .tracker()
            .spawn(pod_copy_task(worker, Arc::clone(&stage)));
    }
}

/// Push one staged package into its target pod
async fn pod_copy_task(worker: Arc<PipelineWorker>, stage: Arc<StageContext>) {
    let app_name = worker.app_name();
    let object_hash = worker.object_hash();
    let local_path = paths::staged_package_path(
        &stage.staging_root,
        &worker.cr,
        worker.scope,
        &worker.app_src_name,
        &app_name,
        &object_hash,
    );
    let dest_path = paths::pod_package_path(
        &worker.app_src_name,
        &paths::staged_file_name(&app_name, &object_hash),
    );

    // A vanished staging file cannot heal by retrying; only a fresh
    // download fixes it.
    if !tokio::fs::try_exists(&local_path).await.unwrap_or(false) {
        error!(
            app = %app_name,
            path = %local_path.display(),
            "Staged package missing; failing the pod copy worker"
        );
        worker.record_fatal(AppPhaseType::PodCopy, stage.tunables.max_retry_count);
        worker.set_active(false);
        return;
    }

    match stage
        .transport
        .copy_to_pod(
            &worker.cr.namespace,
            &worker.target_pod_name,
            &local_path,
            &dest_path,
        )
        .await
    {
        Ok(()) => {
            info!(
                app = %app_name,
                pod = %worker.target_pod_name,
                "Package copied into pod"
            );
            worker.record_complete(AppPhaseType::PodCopy);
        }
        Err(err @ Error::Validation(_)) => {
            // Bad arguments never get better on retry.
            error!(
                app = %app_name,
                pod = %worker.target_pod_name,
                error = %err,
                "Pod copy arguments rejected"
            );
            worker.record_fatal(AppPhaseType::PodCopy, stage.tunables.max_retry_count);
        }
        Err(err) => {
            error!(
                app = %app_name,
                pod = %worker.target_pod_name,
                error = %err,
                "Unable to copy package into pod"
            );
            worker.record_retry(AppPhaseType::PodCopy);
        }
    }

    worker.set_active(false);
}
