//! Persisted status schema migration
//!
//! The 0.2.x operator line persisted per-package status without phase
//! tracking and with the raw quoted ETag. On the first reconcile after an
//! upgrade the context is rewritten in place to the current schema. The
//! rewrite is atomic per context and idempotent: a context already at the
//! current version is left untouched.

use tracing::info;

use crate::remote::normalize_etag;
use crate::status::{
    AppDeployStatus, AppDeploymentContext, AppRepoState, PhaseInfo, AFW_PHASE_2,
    CURRENT_AFW_VERSION,
};
use crate::Error;

/// Migrate a context to the current schema version
///
/// `replicas` is the statefulset replica count of the CR; completed packages
/// get one Install/Complete slot per replica so a later scale-up is visible
/// as missing slots.
///
/// Returns whether the context was rewritten. A context from a future
/// operator version is corruption from our point of view and fails the
/// reconcile before any work starts.
pub fn migrate_app_deployment_context(
    ctx: &mut AppDeploymentContext,
    replicas: i32,
) -> Result<bool, Error> {
    if ctx.version == CURRENT_AFW_VERSION {
        return Ok(false);
    }
    if ctx.version == 0 {
        // A context that has never been persisted; nothing to rewrite.
        ctx.version = CURRENT_AFW_VERSION;
        return Ok(false);
    }
    if ctx.version > CURRENT_AFW_VERSION {
        return Err(Error::migration(format!(
            "status version {} is newer than this operator understands ({})",
            ctx.version, CURRENT_AFW_VERSION
        )));
    }
    if ctx.version != AFW_PHASE_2 {
        return Err(Error::migration(format!(
            "status version {} has no migration path",
            ctx.version
        )));
    }

    let replicas = replicas.max(1) as usize;
    let mut migrated_apps = 0usize;

    for (src_name, src_info) in ctx.apps_src_deploy_status.iter_mut() {
        for info in &mut src_info.app_deployment_info {
            info.object_hash = normalize_etag(&info.object_hash).to_string();

            match (info.repo_state, info.deploy_status) {
                (AppRepoState::Active, AppDeployStatus::Complete) => {
                    info.phase_info = PhaseInfo::install_complete();
                    info.aux_phase_info = vec![PhaseInfo::install_complete(); replicas];
                }
                (AppRepoState::Active, _) => {
                    info.phase_info = PhaseInfo::download_pending();
                    info.aux_phase_info.clear();
                }
                (AppRepoState::Deleted, _) => {
                    info.phase_info = PhaseInfo::default();
                    info.aux_phase_info.clear();
                }
            }
            migrated_apps += 1;
        }
        info!(
            app_source = %src_name,
            "Migrated app source records to the current status schema"
        );
    }

    ctx.version = CURRENT_AFW_VERSION;
    info!(
        apps = migrated_apps,
        version = CURRENT_AFW_VERSION,
        "Status context migration finished"
    );
    Ok(true)
}
