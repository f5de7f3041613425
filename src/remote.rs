//! Remote object-store contract
//!
//! The object-store SDK bindings live outside this crate; the scheduler sees
//! them through [`RemoteStoreClient`]. A [`RemoteStoreRegistry`] built at
//! operator startup maps volume provider tags to client instances.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[cfg(test)]
use mockall::automock;

use crate::config::{AppSourceSpec, VolumeSpec};
use crate::Error;

/// Package file extensions the framework recognizes
const APP_EXTENSIONS: [&str; 2] = [".spl", ".tgz"];

/// One object returned by a remote listing
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteObject {
    /// Opaque digest, possibly wrapped in quotes, possibly `hex-N` form
    pub etag: String,
    /// Object key; the app name is its last path component
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    /// Listing timestamp, when the store provides one
    pub last_modified: Option<DateTime<Utc>>,
    /// Storage class tag, when the store provides one
    pub storage_class: Option<String>,
}

/// Per-source remote listings keyed by app source name
pub type RemoteListingMap = BTreeMap<String, Vec<RemoteObject>>;

/// Strip one pair of surrounding double quotes from an ETag
///
/// S3-compatible stores quote the ETag header; the persisted form never
/// carries the quotes.
pub fn normalize_etag(etag: &str) -> &str {
    etag.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(etag)
}

/// App name of a listing key: its last path component
pub fn app_name_from_key(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// True for file names the framework treats as app packages
pub fn is_app_extension(name: &str) -> bool {
    APP_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Remote key of an app package: bucket path, source location, app name
pub fn remote_object_key(volume: &VolumeSpec, source: &AppSourceSpec, app_name: &str) -> String {
    let mut key = String::new();
    for segment in [volume.path.as_str(), source.location.as_str(), app_name] {
        let segment = segment.trim_matches('/');
        if segment.is_empty() {
            continue;
        }
        if !key.is_empty() {
            key.push('/');
        }
        key.push_str(segment);
    }
    key
}

/// Client for one object-store provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteStoreClient: Send + Sync {
    /// List the objects below a source's location prefix
    async fn list_apps(
        &self,
        volume: &VolumeSpec,
        source: &AppSourceSpec,
    ) -> Result<Vec<RemoteObject>, Error>;

    /// Stream one object into a local file
    ///
    /// `etag` is the digest recorded at listing time; implementations may
    /// use it for conditional fetches or verification.
    async fn download_app(
        &self,
        volume: &VolumeSpec,
        remote_key: &str,
        local_path: &Path,
        etag: &str,
    ) -> Result<(), Error>;
}

/// Provider-tag to client mapping built at operator startup
///
/// Keys are the `provider` field of a [`VolumeSpec`] ("aws", "minio", ...).
#[derive(Default)]
pub struct RemoteStoreRegistry {
    clients: DashMap<String, Arc<dyn RemoteStoreClient>>,
}

impl RemoteStoreRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the client for a provider tag
    pub fn register(&self, provider: impl Into<String>, client: Arc<dyn RemoteStoreClient>) {
        self.clients.insert(provider.into(), client);
    }

    /// Client for a provider tag
    pub fn client(&self, provider: &str) -> Result<Arc<dyn RemoteStoreClient>, Error> {
        self.clients
            .get(provider)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::remote_store(format!("no client registered for provider {provider}")))
    }

    /// Client for the provider a volume names
    pub fn client_for_volume(&self, volume: &VolumeSpec) -> Result<Arc<dyn RemoteStoreClient>, Error> {
        self.client(&volume.provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppSourceScope;

    fn volume() -> VolumeSpec {
        VolumeSpec {
            name: "vol1".to_string(),
            endpoint: "https://s3-eu-west-2.amazonaws.com".to_string(),
            path: "testbucket-rs-london".to_string(),
            provider: "aws".to_string(),
            ..VolumeSpec::default()
        }
    }

    fn source() -> AppSourceSpec {
        AppSourceSpec {
            name: "adminApps".to_string(),
            location: "adminAppsRepo".to_string(),
            vol_name: "vol1".to_string(),
            scope: AppSourceScope::Local,
        }
    }

    #[test]
    fn etag_quotes_are_stripped_once() {
        assert_eq!(normalize_etag("\"abc123\""), "abc123");
        assert_eq!(normalize_etag("abc123"), "abc123");
        assert_eq!(normalize_etag("\"d41d8cd98f00-4\""), "d41d8cd98f00-4");
        // Unbalanced quotes are left alone rather than mangled.
        assert_eq!(normalize_etag("\"abc"), "\"abc");
    }

    #[test]
    fn app_name_is_the_last_key_component() {
        assert_eq!(
            app_name_from_key("bucketpath1/bpath2/locationpath1/app1.tgz"),
            "app1.tgz"
        );
        assert_eq!(app_name_from_key("app1.tgz"), "app1.tgz");
    }

    #[test]
    fn only_spl_and_tgz_are_app_packages() {
        assert!(is_app_extension("app1.tgz"));
        assert!(is_app_extension("security.spl"));
        assert!(!is_app_extension("readme.txt"));
        assert!(!is_app_extension("app1.tar.gz"));
        assert!(!is_app_extension("tgz"));
    }

    #[test]
    fn remote_key_joins_path_location_and_name() {
        assert_eq!(
            remote_object_key(&volume(), &source(), "app1.tgz"),
            "testbucket-rs-london/adminAppsRepo/app1.tgz"
        );

        let mut vol = volume();
        vol.path = "bucket/".to_string();
        let mut src = source();
        src.location = "/repo/".to_string();
        assert_eq!(remote_object_key(&vol, &src, "a.spl"), "bucket/repo/a.spl");
    }

    #[test]
    fn registry_resolves_by_provider_tag() {
        let registry = RemoteStoreRegistry::new();
        assert!(registry.client("aws").is_err());

        let client = Arc::new(MockRemoteStoreClient::new());
        registry.register("aws", client);
        assert!(registry.client("aws").is_ok());
        assert!(registry.client_for_volume(&volume()).is_ok());
        assert!(registry.client("minio").is_err());
    }
}
