//! Install stage
//!
//! Runs the install command inside target pods. A single-replica worker
//! finishing here completes the whole journey; a fan-out clone completes
//! only its replica slot, and the journey is done when every slot reports
//! Install/Complete.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::cr::CrKind;
use crate::paths;
use crate::status::{AppDeployStatus, AppPhaseStatus, AppPhaseType, PhaseInfo};

use super::{AppInstallPipeline, PipelineWorker, StageContext};

/// Install phase manager; one per reconcile pass
pub(crate) async fn install_phase_manager(
    ppln: Arc<AppInstallPipeline>,
    stage: Arc<StageContext>,
) {
    info!("Starting install phase manager");
    let cancel = ppln.cancel_token();
    let phase = ppln.phase(AppPhaseType::Install);
    let max_retry = stage.tunables.max_retry_count;

    let runner = tokio::spawn(install_runner(Arc::clone(&ppln), Arc::clone(&stage)));

    'manager: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Install phase manager received termination");
                break 'manager;
            }
            _ = tokio::time::sleep(stage.tunables.tick) => {}
        }

        'walk: for worker in phase.workers() {
            let Some(info) = worker.phase_info_snapshot(AppPhaseType::Install) else {
                continue;
            };
            if worker.eligible_for_run(AppPhaseType::Install, max_retry) {
                match phase.sender().try_send(Arc::clone(&worker)) {
                    Ok(()) => {
                        debug!(
                            app = %worker.app_name(),
                            pod = %worker.target_pod_name,
                            "Install worker got a run slot"
                        );
                        worker.set_active(true);
                    }
                    Err(_) => break 'walk,
                }
            } else if info.status == AppPhaseStatus::InstallComplete {
                finish_worker(&ppln, &worker);
            } else if info.retry_count >= max_retry {
                warn!(
                    app = %worker.app_name(),
                    pod = %worker.target_pod_name,
                    retries = info.retry_count,
                    "Install retries exhausted"
                );
                worker.record_fatal(AppPhaseType::Install, max_retry);
                phase.remove_worker(&worker);
            }
        }
    }

    if let Err(err) = runner.await {
        error!(error = %err, "Install runner task failed");
    }

    let tracker = phase.tracker();
    tracker.close();
    tracker.wait().await;
    info!("Install phase manager finished");
}

/// Retire a worker whose install slot reports complete
///
/// For multi-replica Standalone the package is done only when every
/// replica slot is Install/Complete; the clone that observes the last slot
/// promotes the main record.
fn finish_worker(ppln: &Arc<AppInstallPipeline>, worker: &Arc<PipelineWorker>) {
    let fully_installed = if worker.cr.kind == CrKind::Standalone && worker.replica_count() > 1 {
        worker
            .deploy_info
            .lock()
            .expect("deploy info poisoned")
            .installed_on_all_replicas()
    } else {
        true
    };

    if fully_installed {
        let mut info = worker.deploy_info.lock().expect("deploy info poisoned");
        info.phase_info = PhaseInfo::install_complete();
        info.deploy_status = AppDeployStatus::Complete;
        info!(app = %info.app_name, "App package deployment complete");
    }

    ppln.phase(AppPhaseType::Install).remove_worker(worker);
}

/// Channel consumer: one task per dispatched worker
async fn install_runner(ppln: Arc<AppInstallPipeline>, stage: Arc<StageContext>) {
    let cancel = ppln.cancel_token();
    let phase = ppln.phase(AppPhaseType::Install);
    let Some(mut rx) = phase.take_receiver() else {
        error!("Install dispatch channel already claimed");
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
            .spawn(install_task(worker, Arc::clone(&stage)));
    }
}

/// Run the install command for one package on one pod
async fn install_task(worker: Arc<PipelineWorker>, stage: Arc<StageContext>) {
    let app_name = worker.app_name();
    let object_hash = worker.object_hash();
    let package_path = paths::pod_package_path(
        &worker.app_src_name,
        &paths::staged_file_name(&app_name, &object_hash),
    );

    match stage
        .transport
        .install_app(
            &worker.cr.namespace,
            &worker.target_pod_name,
            &package_path,
        )
        .await
    {
        Ok(()) => {
            info!(
                app = %app_name,
                pod = %worker.target_pod_name,
                "App installed"
            );
            worker.record_complete(AppPhaseType::Install);
        }
        Err(err) => {
            error!(
                app = %app_name,
                pod = %worker.target_pod_name,
                error = %err,
                "Unable to install app"
            );
            worker.record_retry(AppPhaseType::Install);
        }
    }

    worker.set_active(false);
}
