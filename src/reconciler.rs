//! Manifest reconciler
//!
//! Diffs the remote listings against the persisted deployment records and
//! mutates the records so the pipeline knows which packages must move. The
//! reconciler is pure over its inputs: identical listings and context
//! produce identical mutations, and it never touches the pipeline.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::AppFrameworkSpec;
use crate::remote::{app_name_from_key, is_app_extension, normalize_etag, RemoteListingMap, RemoteObject};
use crate::status::{
    AppDeployStatus, AppDeploymentContext, AppDeploymentInfo, AppRepoState, AppSrcDeployInfo,
    PhaseInfo,
};
use crate::Error;

/// Reconcile the remote listings into the deployment records
///
/// Returns whether any record changed, so the caller knows to persist the
/// context. A listing keyed by a source that is not configured fails the
/// whole pass; a configured source missing from the listings is not an
/// error, its packages are marked deleted.
pub fn handle_app_repo_changes(
    ctx: &mut AppDeploymentContext,
    listings: &RemoteListingMap,
    config: &AppFrameworkSpec,
) -> Result<bool, Error> {
    for src_name in listings.keys() {
        if config.app_source(src_name).is_none() {
            return Err(Error::UnknownAppSource(src_name.clone()));
        }
    }

    let mut modified = false;

    for source in &config.app_sources {
        match listings.get(&source.name) {
            Some(objects) => {
                modified |= merge_source_listing(ctx, &source.name, objects);
            }
            None => {
                if let Some(src_info) = ctx.apps_src_deploy_status.get_mut(&source.name) {
                    if mark_source_deleted(src_info) {
                        info!(
                            app_source = %source.name,
                            "App source missing from remote listings; marked packages deleted"
                        );
                        modified = true;
                    }
                }
            }
        }
    }

    // Records for sources that were dropped from the spec entirely.
    for (src_name, src_info) in ctx.apps_src_deploy_status.iter_mut() {
        if config.app_source(src_name).is_none() && mark_source_deleted(src_info) {
            info!(
                app_source = %src_name,
                "App source no longer configured; marked packages deleted"
            );
            modified = true;
        }
    }

    Ok(modified)
}

/// Merge one source's listing into its deployment records
fn merge_source_listing(
    ctx: &mut AppDeploymentContext,
    src_name: &str,
    objects: &[RemoteObject],
) -> bool {
    let src_info = ctx
        .apps_src_deploy_status
        .entry(src_name.to_string())
        .or_default();

    let mut modified = false;
    let mut seen: Vec<&str> = Vec::with_capacity(objects.len());

    for object in objects {
        let app_name = app_name_from_key(&object.key);
        if !is_app_extension(app_name) {
            debug!(app_source = %src_name, key = %object.key, "Ignoring non-package object");
            continue;
        }
        seen.push(app_name);

        let hash = normalize_etag(&object.etag);
        match src_info.app_mut(app_name) {
            None => {
                info!(
                    app_source = %src_name,
                    app = %app_name,
                    digest = %hash,
                    size = object.size,
                    "New app package discovered"
                );
                src_info.app_deployment_info.push(AppDeploymentInfo {
                    app_name: app_name.to_string(),
                    last_modified_time: format_last_modified(object.last_modified),
                    object_hash: hash.to_string(),
                    size: object.size,
                    repo_state: AppRepoState::Active,
                    deploy_status: AppDeployStatus::Pending,
                    phase_info: PhaseInfo::download_pending(),
                    aux_phase_info: Vec::new(),
                });
                modified = true;
            }
            Some(info) => {
                if info.object_hash != hash {
                    debug!(
                        app_source = %src_name,
                        app = %app_name,
                        old_digest = %info.object_hash,
                        new_digest = %hash,
                        "App package changed on the remote store"
                    );
                    info.object_hash = hash.to_string();
                    info.size = object.size;
                    info.last_modified_time = format_last_modified(object.last_modified);
                    info.repo_state = AppRepoState::Active;
                    info.deploy_status = AppDeployStatus::Pending;
                    info.phase_info = PhaseInfo::download_pending();
                    info.aux_phase_info.clear();
                    modified = true;
                } else if info.repo_state == AppRepoState::Deleted {
                    // Same digest came back after a deletion; resume where
                    // the journey left off.
                    info.repo_state = AppRepoState::Active;
                    modified = true;
                }
            }
        }
    }

    for info in &mut src_info.app_deployment_info {
        if !seen.contains(&info.app_name.as_str()) && info.repo_state != AppRepoState::Deleted {
            info!(
                app_source = %src_name,
                app = %info.app_name,
                "App package disappeared from the remote listing"
            );
            info.repo_state = AppRepoState::Deleted;
            info.deploy_status = AppDeployStatus::Pending;
            modified = true;
        }
    }

    modified
}

/// Mark every record of a source deleted and pending removal
fn mark_source_deleted(src_info: &mut AppSrcDeployInfo) -> bool {
    let mut modified = false;
    for info in &mut src_info.app_deployment_info {
        if info.repo_state != AppRepoState::Deleted
            || info.deploy_status != AppDeployStatus::Pending
        {
            info.repo_state = AppRepoState::Deleted;
            info.deploy_status = AppDeployStatus::Pending;
            modified = true;
        }
    }
    modified
}

fn format_last_modified(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|ts| ts.to_rfc3339()).unwrap_or_default()
}

/// Whether the remote listings should be refreshed this pass
///
/// A manual-update request forces a refresh; otherwise the poll interval
/// gates it, and an interval of zero disables polling outright.
pub fn should_check_remote_storage(
    ctx: &AppDeploymentContext,
    manual_update_on: bool,
    now: DateTime<Utc>,
) -> bool {
    if manual_update_on {
        return true;
    }
    if ctx.apps_repo_status_poll_interval <= 0 {
        return false;
    }
    now.timestamp() - ctx.last_app_info_check_time >= ctx.apps_repo_status_poll_interval
}

/// Record that the remote listings were refreshed at `now`
pub fn mark_remote_storage_checked(ctx: &mut AppDeploymentContext, now: DateTime<Utc>) {
    ctx.last_app_info_check_time = now.timestamp();
}
