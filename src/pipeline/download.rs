//! Download stage
//!
//! The manager walks the queue and feeds eligible workers to the
//! dispatcher over the phase channel (blocking sends; the dispatcher is
//! the only stage with its own admission control). The dispatcher enforces
//! the concurrency cap and the disk budget, then launches one task per
//! admitted worker to stream the package onto the staging volume.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{AppSourceSpec, VolumeSpec};
use crate::paths;
use crate::remote::{remote_object_key, RemoteStoreClient};
use crate::status::{AppPhaseStatus, AppPhaseType, PhaseInfo};

use super::{AppInstallPipeline, PipelineWorker, StageContext};

/// Download phase manager; one per reconcile pass
pub(crate) async fn download_phase_manager(
    ppln: Arc<AppInstallPipeline>,
    stage: Arc<StageContext>,
) {
    info!("Starting download phase manager");
    let cancel = ppln.cancel_token();
    let phase = ppln.phase(AppPhaseType::Download);
    let max_retry = stage.tunables.max_retry_count;

    let dispatcher = tokio::spawn(download_dispatcher(Arc::clone(&ppln), Arc::clone(&stage)));

    'manager: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Download phase manager received termination");
                break 'manager;
            }
            _ = tokio::time::sleep(stage.tunables.tick) => {}
        }

        for worker in phase.workers() {
            let Some(info) = worker.phase_info_snapshot(AppPhaseType::Download) else {
                continue;
            };
            if worker.eligible_for_run(AppPhaseType::Download, max_retry) {
                // Blocking send; admission is the dispatcher's problem.
                let sender = phase.sender();
                tokio::select! {
                    _ = cancel.cancelled() => break 'manager,
                    sent = sender.send(Arc::clone(&worker)) => {
                        if sent.is_err() {
                            break 'manager;
                        }
                        debug!(
                            app = %worker.app_name(),
                            digest = %worker.object_hash(),
                            "Download worker got a run slot"
                        );
                        worker.set_active(true);
                    }
                }
            } else if info.status == AppPhaseStatus::DownloadComplete {
                ppln.transition_worker_phase(&worker, AppPhaseType::Download, AppPhaseType::PodCopy);
            } else if info.retry_count >= max_retry {
                warn!(
                    app = %worker.app_name(),
                    retries = info.retry_count,
                    "Download retries exhausted"
                );
                worker.record_fatal(AppPhaseType::Download, max_retry);
                phase.remove_worker(&worker);
            }
        }
    }

    if let Err(err) = dispatcher.await {
        error!(error = %err, "Download dispatcher task failed");
    }

    let tracker = phase.tracker();
    tracker.close();
    tracker.wait().await;
    info!("Download phase manager finished");
}

/// Admission loop: concurrency cap, disk budget, then launch
async fn download_dispatcher(ppln: Arc<AppInstallPipeline>, stage: Arc<StageContext>) {
    let cancel = ppln.cancel_token();
    let phase = ppln.phase(AppPhaseType::Download);
    let Some(mut rx) = phase.take_receiver() else {
        error!("Download dispatch channel already claimed");
        return;
    };
    let max_workers = stage.tunables.max_concurrent_app_downloads.max(1);
    let active = Arc::new(AtomicU32::new(0));

    loop {
        if active.load(Ordering::SeqCst) >= max_workers {
            tokio::time::sleep(stage.tunables.tick).await;
            continue;
        }

        let worker = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(worker) => worker,
                None => break,
            },
        };

        admit(&ppln, &stage, &active, worker).await;
    }

    debug!("Download dispatcher finished");
}

/// Apply the admission rules to one worker and launch its download
async fn admit(
    ppln: &Arc<AppInstallPipeline>,
    stage: &Arc<StageContext>,
    active: &Arc<AtomicU32>,
    worker: Arc<PipelineWorker>,
) {
    let phase = ppln.phase(AppPhaseType::Download);
    let app_name = worker.app_name();
    let object_hash = worker.object_hash();

    let Some(source) = stage.config.app_source(&worker.app_src_name).cloned() else {
        warn!(
            app_source = %worker.app_src_name,
            app = %app_name,
            "Worker references an unknown app source; skipping"
        );
        worker.set_active(false);
        return;
    };
    let Some(volume) = stage.config.volume(&source.vol_name).cloned() else {
        warn!(
            app_source = %worker.app_src_name,
            volume = %source.vol_name,
            "App source references an undeclared volume; skipping"
        );
        worker.set_active(false);
        return;
    };

    let local_path = paths::staged_package_path(
        &stage.staging_root,
        &worker.cr,
        worker.scope,
        &worker.app_src_name,
        &app_name,
        &object_hash,
    );

    // Already staged under the exact hash-suffixed name: no admission
    // debit, no task.
    if tokio::fs::try_exists(&local_path).await.unwrap_or(false) {
        info!(
            app = %app_name,
            path = %local_path.display(),
            "Package already staged; skipping download"
        );
        worker.record_complete(AppPhaseType::Download);
        worker.set_active(false);
        return;
    }

    let size = worker.size();
    if ppln.disk().reserve(size).is_err() {
        debug!(
            app = %app_name,
            size,
            available = ppln.disk().available(),
            "Not enough staging space; requeueing download"
        );
        // Back onto the same channel; the retry count is deliberately not
        // touched so large apps are not starved into the error state.
        if phase.sender().try_send(Arc::clone(&worker)).is_err() {
            worker.set_active(false);
        }
        tokio::time::sleep(stage.tunables.tick).await;
        return;
    }

    let retry_count = worker
        .phase_info_snapshot(AppPhaseType::Download)
        .map(|info| info.retry_count)
        .unwrap_or(0);
    worker.update_phase_info(
        AppPhaseType::Download,
        PhaseInfo {
            phase: AppPhaseType::Download,
            status: AppPhaseStatus::DownloadInProgress,
            retry_count,
        },
    );

    if let Some(parent) = local_path.parent() {
        if let Err(err) = tokio::fs::create_dir_all(parent).await {
            error!(
                path = %parent.display(),
                error = %err,
                "Unable to create the staging directory"
            );
            ppln.disk().release(size);
            worker.record_retry(AppPhaseType::Download);
            worker.set_active(false);
            return;
        }
    }

    let client = match stage.remote_stores.client_for_volume(&volume) {
        Ok(client) => client,
        Err(err) => {
            error!(
                provider = %volume.provider,
                error = %err,
                "No remote store client for volume provider"
            );
            ppln.disk().release(size);
            worker.record_retry(AppPhaseType::Download);
            worker.set_active(false);
            return;
        }
    };

    active.fetch_add(1, Ordering::SeqCst);
    phase.tracker().spawn(download_task(
        ppln.clone(),
        worker,
        client,
        volume,
        source,
        local_path,
        Arc::clone(active),
    ));
}

/// Stream one package from the remote store onto the staging volume
async fn download_task(
    ppln: Arc<AppInstallPipeline>,
    worker: Arc<PipelineWorker>,
    client: Arc<dyn RemoteStoreClient>,
    volume: VolumeSpec,
    source: AppSourceSpec,
    local_path: std::path::PathBuf,
    active: Arc<AtomicU32>,
) {
    let app_name = worker.app_name();
    let object_hash = worker.object_hash();
    let remote_key = remote_object_key(&volume, &source, &app_name);

    match client
        .download_app(&volume, &remote_key, &local_path, &object_hash)
        .await
    {
        Ok(()) => {
            info!(
                app = %app_name,
                digest = %object_hash,
                path = %local_path.display(),
                "Finished downloading app package"
            );
            worker.record_complete(AppPhaseType::Download);
        }
        Err(err) => {
            error!(
                app = %app_name,
                key = %remote_key,
                error = %err,
                "Unable to download app package"
            );
            // Drop the partial file and give the bytes back.
            let _ = tokio::fs::remove_file(&local_path).await;
            ppln.disk().release(worker.size());
            worker.record_retry(AppPhaseType::Download);
        }
    }

    active.fetch_sub(1, Ordering::SeqCst);
    worker.set_active(false);
}
