//! Scheduler entry point
//!
//! One call drives one reconcile pass: migrate the persisted status if
//! needed, seed workers for every package that is mid-journey, run the
//! three phase managers until the yield fires, then write the results back
//! into the context for the caller to persist.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::AppFrameworkSpec;
use crate::cr::{replica_count, CrKind, CrRef};
use crate::disk::DiskTracker;
use crate::migration::migrate_app_deployment_context;
use crate::pipeline::{
    download_phase_manager, install_phase_manager, pod_copy_phase_manager, AppInstallPipeline,
    PipelineWorker, StageContext,
};
use crate::podexec::PodTransport;
use crate::remote::RemoteStoreRegistry;
use crate::status::{
    bundle_push_needed, AppDeployStatus, AppDeploymentContext, AppDeploymentInfo, AppPhaseStatus,
    AppPhaseType, AppRepoState, BundlePushStage,
};
use crate::{
    Error, DEFAULT_MAX_CONCURRENT_APP_DOWNLOADS, DEFAULT_YIELD_SECONDS, PIPELINE_PHASE_MAX_RETRY_COUNT,
    PIPELINE_TICK,
};

/// Knobs of one reconcile pass
#[derive(Clone, Debug)]
pub struct SchedulerTunables {
    /// Upper bound on parallel downloads
    pub max_concurrent_app_downloads: u32,
    /// Attempts per phase before a worker goes terminal
    pub max_retry_count: u32,
    /// Wall-clock budget of a pass, seconds
    pub yield_seconds: u64,
    /// Stage manager tick
    pub tick: Duration,
}

impl Default for SchedulerTunables {
    fn default() -> Self {
        Self {
            max_concurrent_app_downloads: DEFAULT_MAX_CONCURRENT_APP_DOWNLOADS,
            max_retry_count: PIPELINE_PHASE_MAX_RETRY_COUNT,
            yield_seconds: DEFAULT_YIELD_SECONDS,
            tick: PIPELINE_TICK,
        }
    }
}

impl SchedulerTunables {
    /// Defaults overridden by whatever the spec pins down
    pub fn for_config(config: &AppFrameworkSpec) -> Self {
        let mut tunables = Self::default();
        if config.max_concurrent_app_downloads > 0 {
            tunables.max_concurrent_app_downloads = config.max_concurrent_app_downloads;
        }
        tunables
    }
}

/// Process-wide collaborator handles the scheduler runs against
pub struct SchedulerHandles {
    /// Remote store clients by provider tag
    pub remote_stores: Arc<RemoteStoreRegistry>,
    /// Pod exec transport
    pub transport: Arc<dyn PodTransport>,
    /// Staging volume accounting
    pub disk: Arc<DiskTracker>,
    /// Root of the staging volume
    pub staging_root: std::path::PathBuf,
}

/// One package picked up for this pass
struct SeededApp {
    src_name: String,
    app_name: String,
    info: Arc<Mutex<AppDeploymentInfo>>,
}

/// Outcome of seeding: write-back handles and cluster-scope tracking
struct SeedOutcome {
    seeded: Vec<SeededApp>,
    cluster_scoped: Vec<Arc<Mutex<AppDeploymentInfo>>>,
}

/// Drive one reconcile pass of the app-framework scheduler
///
/// Returns `Ok(())` on a clean yield; errors are setup failures only
/// (staging volume missing, unschedulable kind, corrupt status schema).
/// Per-package failures never escape; they land in the context as retry
/// counts and error statuses.
pub async fn run_scheduler_pass(
    handles: &SchedulerHandles,
    cr: &CrRef,
    sts: Option<StatefulSet>,
    ctx: &mut AppDeploymentContext,
    config: &AppFrameworkSpec,
    tunables: &SchedulerTunables,
) -> Result<(), Error> {
    if cr.kind == CrKind::IndexerCluster {
        return Err(Error::validation(
            "IndexerCluster is not schedulable; indexer apps flow through the cluster manager bundle push",
        ));
    }
    config.validate()?;

    if tokio::fs::metadata(&handles.staging_root).await.is_err() {
        return Err(Error::validation(format!(
            "staging volume {} is not mounted",
            handles.staging_root.display()
        )));
    }

    let replicas = replica_count(sts.as_ref());
    migrate_app_deployment_context(ctx, replicas)?;

    ctx.apps_status_max_concurrent_app_downloads = tunables.max_concurrent_app_downloads;
    ctx.apps_repo_status_poll_interval = config.apps_repo_poll_interval;

    let ppln = Arc::new(AppInstallPipeline::new(Arc::clone(&handles.disk)));
    let stage = Arc::new(StageContext {
        remote_stores: Arc::clone(&handles.remote_stores),
        transport: Arc::clone(&handles.transport),
        config: config.clone(),
        staging_root: handles.staging_root.clone(),
        tunables: tunables.clone(),
    });

    let sts = sts.map(Arc::new);
    let outcome = seed_workers(&ppln, cr, sts, ctx, config, tunables);
    info!(
        name = %cr.name,
        namespace = %cr.namespace,
        seeded = outcome.seeded.len(),
        cluster_scoped = outcome.cluster_scoped.len(),
        "Seeded pipeline workers for pending app packages"
    );

    let mut managers = JoinSet::new();
    managers.spawn(download_phase_manager(Arc::clone(&ppln), Arc::clone(&stage)));
    managers.spawn(pod_copy_phase_manager(Arc::clone(&ppln), Arc::clone(&stage)));
    managers.spawn(install_phase_manager(Arc::clone(&ppln), Arc::clone(&stage)));

    let yielder = tokio::spawn(run_yielder(
        Arc::clone(&ppln),
        outcome.cluster_scoped.clone(),
        tunables.clone(),
    ));

    debug!("Waiting for the phase managers to finish");
    while managers.join_next().await.is_some() {}
    let _ = yielder.await;
    debug!("All phase managers finished");

    write_back(ctx, &outcome);
    Ok(())
}

/// Create workers for every package whose journey is unfinished
fn seed_workers(
    ppln: &Arc<AppInstallPipeline>,
    cr: &CrRef,
    sts: Option<Arc<StatefulSet>>,
    ctx: &AppDeploymentContext,
    config: &AppFrameworkSpec,
    tunables: &SchedulerTunables,
) -> SeedOutcome {
    let mut outcome = SeedOutcome {
        seeded: Vec::new(),
        cluster_scoped: Vec::new(),
    };
    let replicas = replica_count(sts.as_deref());

    for (src_name, src_info) in &ctx.apps_src_deploy_status {
        let Some(source) = config.app_source(src_name) else {
            // Stale records for a dropped source; the reconciler will mark
            // them deleted on the next listing refresh.
            warn!(app_source = %src_name, "Deploy records reference an unconfigured app source");
            continue;
        };

        for info in &src_info.app_deployment_info {
            let cluster_tracked = source.scope.is_cluster_scoped()
                && info.deploy_status != AppDeployStatus::Complete
                && info.repo_state == AppRepoState::Active;

            let seed_phase = seed_phase_for(info, source.scope.is_cluster_scoped(), tunables);

            if !cluster_tracked && seed_phase.is_none() {
                continue;
            }

            let shared = Arc::new(Mutex::new(info.clone()));
            outcome.seeded.push(SeededApp {
                src_name: src_name.clone(),
                app_name: info.app_name.clone(),
                info: Arc::clone(&shared),
            });
            if cluster_tracked {
                outcome.cluster_scoped.push(Arc::clone(&shared));
            }

            let Some(phase) = seed_phase else { continue };

            let fan_out_resume = cr.kind == CrKind::Standalone
                && replicas > 1
                && phase != AppPhaseType::Download
                && !info.aux_phase_info.is_empty();

            if fan_out_resume {
                for (ordinal, slot) in info.aux_phase_info.iter().enumerate() {
                    if slot.phase == AppPhaseType::Install
                        && slot.status == AppPhaseStatus::InstallComplete
                    {
                        continue;
                    }
                    let target = if slot.phase == AppPhaseType::Install {
                        AppPhaseType::Install
                    } else {
                        AppPhaseType::PodCopy
                    };
                    let Ok(pod_name) = cr.pod_name(ordinal as u32) else {
                        continue;
                    };
                    let worker = Arc::new(PipelineWorker::new(
                        cr.clone(),
                        src_name.clone(),
                        source.scope,
                        pod_name,
                        sts.clone(),
                        Arc::clone(&shared),
                    ));
                    ppln.phase(target).add_workers([worker]);
                }
            } else {
                let Ok(pod_name) = cr.pod_name(0) else {
                    continue;
                };
                let worker = Arc::new(PipelineWorker::new(
                    cr.clone(),
                    src_name.clone(),
                    source.scope,
                    pod_name,
                    sts.clone(),
                    Arc::clone(&shared),
                ));
                ppln.phase(phase).add_workers([worker]);
            }
        }
    }

    outcome
}

/// Which phase a persisted record seeds into, if any
fn seed_phase_for(
    info: &AppDeploymentInfo,
    cluster_scoped: bool,
    tunables: &SchedulerTunables,
) -> Option<AppPhaseType> {
    let phase_info = &info.phase_info;
    if phase_info.retry_count >= tunables.max_retry_count {
        return None;
    }
    if info.repo_state == AppRepoState::Deleted {
        return None;
    }
    match phase_info.phase {
        AppPhaseType::Download => Some(AppPhaseType::Download),
        AppPhaseType::PodCopy => Some(AppPhaseType::PodCopy),
        AppPhaseType::Install => {
            // Cluster scope never installs through the pipeline; the
            // bundle push is external.
            if cluster_scoped || phase_info.status == AppPhaseStatus::InstallComplete {
                None
            } else {
                Some(AppPhaseType::Install)
            }
        }
    }
}

/// Background yielder: single cancellation axis of the pass
async fn run_yielder(
    ppln: Arc<AppInstallPipeline>,
    cluster_scoped: Vec<Arc<Mutex<AppDeploymentInfo>>>,
    tunables: SchedulerTunables,
) {
    let started = tokio::time::Instant::now();
    let budget = Duration::from_secs(tunables.yield_seconds);

    loop {
        if started.elapsed() >= budget || ppln.is_empty() {
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Yielding from the app-framework scheduler"
            );
            ppln.cancel_token().cancel();
            break;
        }

        if !cluster_scoped.is_empty() {
            let snapshot: Vec<AppDeploymentInfo> = cluster_scoped
                .iter()
                .map(|info| info.lock().expect("deploy info poisoned").clone())
                .collect();
            if bundle_push_needed(snapshot.iter()) {
                debug!("All cluster-scoped apps staged; bundle push can proceed");
            }
        }

        tokio::time::sleep(tunables.tick).await;
    }
}

/// Fold the workers' results back into the persisted context
fn write_back(ctx: &mut AppDeploymentContext, outcome: &SeedOutcome) {
    for seeded in &outcome.seeded {
        let updated = seeded.info.lock().expect("deploy info poisoned").clone();
        if let Some(slot) = ctx
            .apps_src_deploy_status
            .get_mut(&seeded.src_name)
            .and_then(|src| src.app_mut(&seeded.app_name))
        {
            *slot = updated;
        }
    }

    ctx.is_deployment_in_progress = ctx.apps_src_deploy_status.values().any(|src| {
        src.app_deployment_info.iter().any(|info| {
            info.repo_state == AppRepoState::Active
                && matches!(
                    info.deploy_status,
                    AppDeployStatus::Pending | AppDeployStatus::InProgress
                )
        })
    });

    if !outcome.cluster_scoped.is_empty() && ctx.bundle_push_stage == BundlePushStage::Uninitialized
    {
        let snapshot: Vec<AppDeploymentInfo> = outcome
            .cluster_scoped
            .iter()
            .map(|info| info.lock().expect("deploy info poisoned").clone())
            .collect();
        if bundle_push_needed(snapshot.iter()) {
            ctx.bundle_push_stage = BundlePushStage::Pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppSourceScope, AppSourceSpec, VolumeSpec};
    use crate::status::{AppSrcDeployInfo, PhaseInfo};
    use k8s_openapi::api::apps::v1::StatefulSetSpec;

    fn config(scope: AppSourceScope) -> AppFrameworkSpec {
        AppFrameworkSpec {
            apps_repo_poll_interval: 60,
            max_concurrent_app_downloads: 5,
            vol_list: vec![VolumeSpec {
                name: "vol1".to_string(),
                endpoint: "https://s3.example.com".to_string(),
                path: "bucket1".to_string(),
                provider: "aws".to_string(),
                ..VolumeSpec::default()
            }],
            app_sources: vec![AppSourceSpec {
                name: "adminApps".to_string(),
                location: "adminAppsRepo".to_string(),
                vol_name: "vol1".to_string(),
                scope,
            }],
        }
    }

    fn context_with_app(scope: AppSourceScope, phase_info: PhaseInfo) -> AppDeploymentContext {
        let mut ctx = AppDeploymentContext::new(&config(scope));
        ctx.apps_src_deploy_status.insert(
            "adminApps".to_string(),
            AppSrcDeployInfo {
                app_deployment_info: vec![AppDeploymentInfo {
                    app_name: "app1.tgz".to_string(),
                    object_hash: "abc123".to_string(),
                    size: 1234,
                    phase_info,
                    ..AppDeploymentInfo::default()
                }],
            },
        );
        ctx
    }

    fn statefulset(replicas: i32) -> Option<Arc<StatefulSet>> {
        Some(Arc::new(StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..StatefulSetSpec::default()
            }),
            ..StatefulSet::default()
        }))
    }

    fn pipeline() -> Arc<AppInstallPipeline> {
        Arc::new(AppInstallPipeline::new(Arc::new(DiskTracker::with_capacity(
            1 << 30,
        ))))
    }

    #[test]
    fn tunables_pick_up_the_spec_download_cap() {
        let tunables = SchedulerTunables::for_config(&config(AppSourceScope::Local));
        assert_eq!(tunables.max_concurrent_app_downloads, 5);
        assert_eq!(tunables.max_retry_count, PIPELINE_PHASE_MAX_RETRY_COUNT);

        let mut cfg = config(AppSourceScope::Local);
        cfg.max_concurrent_app_downloads = 0;
        let tunables = SchedulerTunables::for_config(&cfg);
        assert_eq!(
            tunables.max_concurrent_app_downloads,
            DEFAULT_MAX_CONCURRENT_APP_DOWNLOADS
        );
    }

    #[test]
    fn seeding_places_workers_by_persisted_phase() {
        let tunables = SchedulerTunables::default();
        let cr = CrRef::new(CrKind::ClusterMaster, "stack1", "test");

        for (phase_info, expect_phase) in [
            (PhaseInfo::download_pending(), AppPhaseType::Download),
            (PhaseInfo::pending_for(AppPhaseType::PodCopy), AppPhaseType::PodCopy),
            (PhaseInfo::pending_for(AppPhaseType::Install), AppPhaseType::Install),
        ] {
            let ppln = pipeline();
            let ctx = context_with_app(AppSourceScope::Local, phase_info);
            let outcome = seed_workers(
                &ppln,
                &cr,
                statefulset(1),
                &ctx,
                &config(AppSourceScope::Local),
                &tunables,
            );
            assert_eq!(outcome.seeded.len(), 1);
            assert_eq!(ppln.phase(expect_phase).len(), 1, "{expect_phase}");
        }
    }

    #[test]
    fn seeding_skips_exhausted_and_finished_journeys() {
        let tunables = SchedulerTunables::default();
        let cr = CrRef::new(CrKind::ClusterMaster, "stack1", "test");

        let mut exhausted = PhaseInfo::download_pending();
        exhausted.retry_count = tunables.max_retry_count;
        for phase_info in [exhausted, PhaseInfo::install_complete()] {
            let ppln = pipeline();
            let ctx = context_with_app(AppSourceScope::Local, phase_info);
            seed_workers(
                &ppln,
                &cr,
                statefulset(1),
                &ctx,
                &config(AppSourceScope::Local),
                &tunables,
            );
            assert!(ppln.is_empty());
        }
    }

    #[test]
    fn cluster_scope_never_seeds_into_install() {
        let tunables = SchedulerTunables::default();
        let cr = CrRef::new(CrKind::ClusterMaster, "stack1", "test");
        let ppln = pipeline();
        let ctx = context_with_app(
            AppSourceScope::Cluster,
            PhaseInfo::pending_for(AppPhaseType::Install),
        );
        let outcome = seed_workers(
            &ppln,
            &cr,
            statefulset(1),
            &ctx,
            &config(AppSourceScope::Cluster),
            &tunables,
        );
        assert_eq!(ppln.phase(AppPhaseType::Install).len(), 0);
        // Still tracked for the bundle push predicate.
        assert_eq!(outcome.cluster_scoped.len(), 1);
    }

    #[test]
    fn seeding_is_idempotent_over_an_unchanged_context() {
        let tunables = SchedulerTunables::default();
        let cr = CrRef::new(CrKind::ClusterMaster, "stack1", "test");
        let ctx = context_with_app(AppSourceScope::Local, PhaseInfo::download_pending());

        let first = pipeline();
        seed_workers(&first, &cr, statefulset(1), &ctx, &config(AppSourceScope::Local), &tunables);
        let second = pipeline();
        seed_workers(&second, &cr, statefulset(1), &ctx, &config(AppSourceScope::Local), &tunables);

        for phase in [AppPhaseType::Download, AppPhaseType::PodCopy, AppPhaseType::Install] {
            let a: Vec<String> = first
                .phase(phase)
                .workers()
                .iter()
                .map(|w| w.target_pod_name.clone())
                .collect();
            let b: Vec<String> = second
                .phase(phase)
                .workers()
                .iter()
                .map(|w| w.target_pod_name.clone())
                .collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn standalone_resume_seeds_one_worker_per_unfinished_slot() {
        let tunables = SchedulerTunables::default();
        let cr = CrRef::new(CrKind::Standalone, "stack1", "test");
        let mut ctx = context_with_app(
            AppSourceScope::Local,
            PhaseInfo::pending_for(AppPhaseType::PodCopy),
        );
        {
            let src = ctx.apps_src_deploy_status.get_mut("adminApps").unwrap();
            let app = src.app_mut("app1.tgz").unwrap();
            app.aux_phase_info = vec![PhaseInfo::pending_for(AppPhaseType::PodCopy); 5];
            app.aux_phase_info[1] = PhaseInfo::pending_for(AppPhaseType::Install);
            app.aux_phase_info[4] = PhaseInfo::install_complete();
        }

        let ppln = pipeline();
        seed_workers(&ppln, &cr, statefulset(5), &ctx, &config(AppSourceScope::Local), &tunables);

        assert_eq!(ppln.phase(AppPhaseType::PodCopy).len(), 3);
        let installs = ppln.phase(AppPhaseType::Install).workers();
        assert_eq!(installs.len(), 1);
        assert_eq!(installs[0].target_pod_name, "splunk-stack1-standalone-1");
    }

    #[test]
    fn deleted_records_do_not_seed() {
        let tunables = SchedulerTunables::default();
        let cr = CrRef::new(CrKind::ClusterMaster, "stack1", "test");
        let mut ctx = context_with_app(AppSourceScope::Local, PhaseInfo::download_pending());
        ctx.apps_src_deploy_status
            .get_mut("adminApps")
            .unwrap()
            .app_mut("app1.tgz")
            .unwrap()
            .repo_state = AppRepoState::Deleted;

        let ppln = pipeline();
        let outcome = seed_workers(
            &ppln,
            &cr,
            statefulset(1),
            &ctx,
            &config(AppSourceScope::Local),
            &tunables,
        );
        assert!(ppln.is_empty());
        assert!(outcome.seeded.is_empty());
    }
}
