//! Staging volume path layout
//!
//! The layout is an external contract: the pod-copy stage and the operator's
//! cleanup jobs both address packages by these exact paths.
//!
//! `<root>/downloadedApps/<namespace>/<kind>/<crName>/<scope>/<appSrcName>/<appName>_<objectHash>`

use std::path::{Path, PathBuf};

use crate::config::AppSourceScope;
use crate::cr::CrRef;

/// Directory below the staging root holding all downloaded packages
pub const DOWNLOADED_APPS_DIR: &str = "downloadedApps";

/// Directory inside target pods where packages are copied before install
pub const POD_STAGING_DIR: &str = "/operator/appframework";

/// Staging directory for one (CR, scope, app source) combination
pub fn staging_dir(
    staging_root: &Path,
    cr: &CrRef,
    scope: AppSourceScope,
    app_src_name: &str,
) -> PathBuf {
    staging_root
        .join(DOWNLOADED_APPS_DIR)
        .join(&cr.namespace)
        .join(cr.kind.as_str())
        .join(&cr.name)
        .join(scope.as_str())
        .join(app_src_name)
}

/// Staged package file name: `<appName>_<objectHash>`
///
/// The hash suffix makes a listing change visible as a brand-new file, which
/// is what the already-downloaded skip keys on.
pub fn staged_file_name(app_name: &str, object_hash: &str) -> String {
    format!("{app_name}_{object_hash}")
}

/// Full path of a staged package
pub fn staged_package_path(
    staging_root: &Path,
    cr: &CrRef,
    scope: AppSourceScope,
    app_src_name: &str,
    app_name: &str,
    object_hash: &str,
) -> PathBuf {
    staging_dir(staging_root, cr, scope, app_src_name).join(staged_file_name(app_name, object_hash))
}

/// Destination path of a package inside the target pod
pub fn pod_package_path(app_src_name: &str, app_name: &str) -> PathBuf {
    Path::new(POD_STAGING_DIR).join(app_src_name).join(app_name)
}
