//! App-framework configuration types
//!
//! These types mirror the `appFramework` block of the enterprise CR specs.
//! The CRD layer embeds them verbatim; the scheduler treats a spec as
//! immutable for the duration of a reconcile pass.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Install target breadth for an app source
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AppSourceScope {
    /// Each pod installs the app independently
    #[default]
    Local,
    /// Staged on one pod, distributed by the external bundle push
    Cluster,
    /// Preloaded configuration, then bundle pushed
    ClusterWithPreConfig,
}

impl AppSourceScope {
    /// Scope as the literal path segment used on the staging volume
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cluster => "cluster",
            Self::ClusterWithPreConfig => "clusterWithPreConfig",
        }
    }

    /// Cluster-wide scopes are staged but never installed by the scheduler
    pub fn is_cluster_scoped(self) -> bool {
        matches!(self, Self::Cluster | Self::ClusterWithPreConfig)
    }
}

impl std::fmt::Display for AppSourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote object-store volume referenced by app sources
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Volume name, referenced by [`AppSourceSpec::vol_name`]
    pub name: String,

    /// Object-store endpoint URL
    pub endpoint: String,

    /// Bucket path inside the store
    pub path: String,

    /// Name of the secret carrying access credentials
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_ref: String,

    /// Storage API flavor, e.g. "s3"
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub storage_type: String,

    /// Backend provider tag ("aws", "minio", ...)
    pub provider: String,
}

/// A named grouping of app packages sharing a scope and a remote prefix
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSourceSpec {
    /// App source name, unique within the spec
    pub name: String,

    /// Remote location prefix below the volume's bucket path
    pub location: String,

    /// Name of the [`VolumeSpec`] this source reads from
    pub vol_name: String,

    /// Install scope for every package in this source
    #[serde(default)]
    pub scope: AppSourceScope,
}

/// Top-level app-framework block of a CR spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppFrameworkSpec {
    /// Interval in seconds between remote listing polls
    #[serde(default)]
    pub apps_repo_poll_interval: i64,

    /// Upper bound on parallel package downloads
    #[serde(default)]
    pub max_concurrent_app_downloads: u32,

    /// Remote volumes available to the app sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vol_list: Vec<VolumeSpec>,

    /// App sources to reconcile
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_sources: Vec<AppSourceSpec>,
}

impl AppFrameworkSpec {
    /// Look up an app source by name
    pub fn app_source(&self, name: &str) -> Option<&AppSourceSpec> {
        self.app_sources.iter().find(|src| src.name == name)
    }

    /// Look up a volume by name
    pub fn volume(&self, name: &str) -> Option<&VolumeSpec> {
        self.vol_list.iter().find(|vol| vol.name == name)
    }

    /// Resolve the volume an app source reads from
    pub fn volume_for_source(&self, src_name: &str) -> Option<&VolumeSpec> {
        self.app_source(src_name)
            .and_then(|src| self.volume(&src.vol_name))
    }

    /// Scope of a named app source
    pub fn source_scope(&self, src_name: &str) -> Option<AppSourceScope> {
        self.app_source(src_name).map(|src| src.scope)
    }

    /// Validate the spec before a reconcile pass
    ///
    /// Checks that source and volume names are unique and that every
    /// source references a declared volume.
    pub fn validate(&self) -> Result<(), crate::Error> {
        let mut seen = std::collections::BTreeSet::new();
        for vol in &self.vol_list {
            if vol.name.is_empty() {
                return Err(crate::Error::validation("volume with empty name"));
            }
            if !seen.insert(vol.name.as_str()) {
                return Err(crate::Error::validation(format!(
                    "duplicate volume name: {}",
                    vol.name
                )));
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for src in &self.app_sources {
            if src.name.is_empty() {
                return Err(crate::Error::validation("app source with empty name"));
            }
            if !seen.insert(src.name.as_str()) {
                return Err(crate::Error::validation(format!(
                    "duplicate app source name: {}",
                    src.name
                )));
            }
            if self.volume(&src.vol_name).is_none() {
                return Err(crate::Error::validation(format!(
                    "app source {} references undeclared volume {}",
                    src.name, src.vol_name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> AppFrameworkSpec {
        AppFrameworkSpec {
            apps_repo_poll_interval: 60,
            max_concurrent_app_downloads: 5,
            vol_list: vec![VolumeSpec {
                name: "msos_s2s3_vol".to_string(),
                endpoint: "https://s3-eu-west-2.amazonaws.com".to_string(),
                path: "testbucket-rs-london".to_string(),
                secret_ref: "s3-secret".to_string(),
                storage_type: "s3".to_string(),
                provider: "aws".to_string(),
            }],
            app_sources: vec![
                AppSourceSpec {
                    name: "adminApps".to_string(),
                    location: "adminAppsRepo".to_string(),
                    vol_name: "msos_s2s3_vol".to_string(),
                    scope: AppSourceScope::Local,
                },
                AppSourceSpec {
                    name: "clusterApps".to_string(),
                    location: "clusterAppsRepo".to_string(),
                    vol_name: "msos_s2s3_vol".to_string(),
                    scope: AppSourceScope::Cluster,
                },
            ],
        }
    }

    #[test]
    fn lookups_resolve_sources_and_volumes() {
        let spec = sample_spec();
        assert!(spec.app_source("adminApps").is_some());
        assert!(spec.app_source("nosuch").is_none());
        assert_eq!(
            spec.volume_for_source("adminApps").map(|v| v.name.as_str()),
            Some("msos_s2s3_vol")
        );
        assert_eq!(spec.source_scope("clusterApps"), Some(AppSourceScope::Cluster));
    }

    #[test]
    fn validate_accepts_wellformed_spec() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn validate_rejects_dangling_volume_reference() {
        let mut spec = sample_spec();
        spec.app_sources[0].vol_name = "ghost_vol".to_string();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("ghost_vol"));
    }

    #[test]
    fn validate_rejects_duplicate_source_names() {
        let mut spec = sample_spec();
        let dup = spec.app_sources[0].clone();
        spec.app_sources.push(dup);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn scope_serializes_camel_case() {
        let json = serde_json::to_string(&AppSourceScope::ClusterWithPreConfig).unwrap();
        assert_eq!(json, "\"clusterWithPreConfig\"");
        let back: AppSourceScope = serde_json::from_str("\"local\"").unwrap();
        assert_eq!(back, AppSourceScope::Local);
    }

    #[test]
    fn cluster_scopes_are_not_installed_by_scheduler() {
        assert!(!AppSourceScope::Local.is_cluster_scoped());
        assert!(AppSourceScope::Cluster.is_cluster_scoped());
        assert!(AppSourceScope::ClusterWithPreConfig.is_cluster_scoped());
    }
}
