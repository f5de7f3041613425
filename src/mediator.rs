//! Manual-update mediator
//!
//! Several CR reconcilers in one namespace share a config map that records,
//! per CR kind, whether an operator-side manual app refresh was requested
//! and how many CRs still have to honor it. Concurrency safety across
//! reconcilers rides on the API server's resource-version conflict
//! semantics: every mutation is a read-modify-write that retries on
//! conflict.
//!
//! Data format, one key per CR kind:
//!
//! ```yaml
//! status: on
//! refCount: 2
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::cr::CrRef;
use crate::Error;

/// API group/version stamped on owner references
const OWNER_API_VERSION: &str = "enterprise.splunk.com/v3";

/// Read-modify-write attempts before a conflict is surfaced
const APPLY_CONFLICT_RETRIES: u32 = 5;

/// Name of the shared manual-update config map in a namespace
pub fn manual_update_config_map_name(namespace: &str) -> String {
    format!("splunk-{namespace}-manual-app-update")
}

/// Per-kind manual-update record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManualUpdateEntry {
    /// True when an operator requested a manual refresh
    pub on: bool,
    /// CRs still to honor the refresh (while `on`), or registered CRs
    /// (while `off`)
    pub ref_count: u32,
}

impl ManualUpdateEntry {
    /// Parse the two-line `status` / `refCount` document
    pub fn parse(data: &str) -> Result<Self, Error> {
        let mut on = None;
        let mut ref_count = None;
        for line in data.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "status" => {
                    on = Some(match value.trim() {
                        "on" => true,
                        "off" => false,
                        other => {
                            return Err(Error::validation(format!(
                                "manual-update status must be on or off, got {other}"
                            )))
                        }
                    });
                }
                "refCount" => {
                    ref_count = Some(value.trim().parse::<u32>().map_err(|_| {
                        Error::validation(format!("manual-update refCount is not a number: {value}"))
                    })?);
                }
                _ => {}
            }
        }
        match (on, ref_count) {
            (Some(on), Some(ref_count)) => Ok(Self { on, ref_count }),
            _ => Err(Error::validation("manual-update entry is missing a field")),
        }
    }

    /// Serialize back to the two-line document
    pub fn format(&self) -> String {
        format!(
            "status: {}\nrefCount: {}",
            if self.on { "on" } else { "off" },
            self.ref_count
        )
    }
}

/// Minimal config-map persistence used by the mediator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    /// Fetch a config map, `None` when absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, Error>;

    /// Create or replace a config map, honoring its resource version
    async fn apply(&self, cm: &ConfigMap) -> Result<ConfigMap, Error>;
}

/// [`ConfigMapStore`] backed by the cluster API server
pub struct KubeConfigMapStore {
    client: Client,
}

impl KubeConfigMapStore {
    /// Store talking to the given cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigMapStore for KubeConfigMapStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply(&self, cm: &ConfigMap) -> Result<ConfigMap, Error> {
        let namespace = cm.metadata.namespace.as_deref().unwrap_or_default();
        let name = cm.metadata.name.as_deref().unwrap_or_default();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);

        if cm.metadata.resource_version.is_some() {
            Ok(api.replace(name, &PostParams::default(), cm).await?)
        } else {
            Ok(api.create(&PostParams::default(), cm).await?)
        }
    }
}

/// Shared manual-update toggle across CR reconcilers
pub struct ManualUpdateMediator {
    store: Arc<dyn ConfigMapStore>,
}

impl ManualUpdateMediator {
    /// Mediator over a config-map store
    pub fn new(store: Arc<dyn ConfigMapStore>) -> Self {
        Self { store }
    }

    /// Join the refcount for the CR's kind, creating the config map and the
    /// kind entry on first contact
    ///
    /// Joining is idempotent per CR: a reconcile re-entry does not inflate
    /// the count. Returns the entry after the join.
    pub async fn register(&self, cr: &CrRef) -> Result<ManualUpdateEntry, Error> {
        self.read_modify_write(cr, |cm, cr| {
            let newly_owned = add_owner_reference(cm, cr);
            let kind = cr.kind.as_str();
            let data = cm.data.get_or_insert_with(BTreeMap::new);

            let mut entry = match data.get(kind) {
                Some(raw) => ManualUpdateEntry::parse(raw)?,
                None => ManualUpdateEntry::default(),
            };
            if newly_owned || !data.contains_key(kind) {
                entry.ref_count += 1;
                info!(
                    kind = %kind,
                    name = %cr.name,
                    ref_count = entry.ref_count,
                    "CR joined the manual-update mediator"
                );
            }
            data.insert(kind.to_string(), entry.format());
            Ok(entry)
        })
        .await
    }

    /// Leave the refcount for the CR's kind
    pub async fn deregister(&self, cr: &CrRef) -> Result<(), Error> {
        self.read_modify_write(cr, |cm, cr| {
            remove_owner_reference(cm, cr);
            let kind = cr.kind.as_str();
            let data = cm.data.get_or_insert_with(BTreeMap::new);
            if let Some(raw) = data.get(kind).cloned() {
                let mut entry = ManualUpdateEntry::parse(&raw)?;
                entry.ref_count = entry.ref_count.saturating_sub(1);
                data.insert(kind.to_string(), entry.format());
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Whether a manual refresh is requested for the CR's kind
    pub async fn manual_update_enabled(&self, cr: &CrRef) -> Result<bool, Error> {
        let name = manual_update_config_map_name(&cr.namespace);
        let Some(cm) = self.store.get(&cr.namespace, &name).await? else {
            return Ok(false);
        };
        let Some(raw) = cm.data.as_ref().and_then(|data| data.get(cr.kind.as_str())) else {
            return Ok(false);
        };
        Ok(ManualUpdateEntry::parse(raw)?.on)
    }

    /// Record that this CR honored the requested refresh
    ///
    /// The CR that brings the remaining count to zero flips the toggle back
    /// off and restores the count to the registered membership.
    pub async fn consume_refresh(&self, cr: &CrRef) -> Result<(), Error> {
        self.read_modify_write(cr, |cm, cr| {
            let members = cm
                .metadata
                .owner_references
                .as_ref()
                .map(|refs| refs.len() as u32)
                .unwrap_or(0);
            let kind = cr.kind.as_str();
            let data = cm.data.get_or_insert_with(BTreeMap::new);
            let raw = match data.get(kind) {
                Some(raw) => raw.clone(),
                None => {
                    warn!(kind = %kind, "Refresh consumed with no mediator entry");
                    return Ok(());
                }
            };
            let mut entry = ManualUpdateEntry::parse(&raw)?;
            if !entry.on {
                return Ok(());
            }
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                entry.on = false;
                entry.ref_count = members.max(1);
                info!(kind = %kind, "Manual update honored by every CR; toggled off");
            }
            data.insert(kind.to_string(), entry.format());
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn read_modify_write<T, F>(&self, cr: &CrRef, mutate: F) -> Result<T, Error>
    where
        F: Fn(&mut ConfigMap, &CrRef) -> Result<T, Error>,
    {
        let name = manual_update_config_map_name(&cr.namespace);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut cm = match self.store.get(&cr.namespace, &name).await? {
                Some(cm) => cm,
                None => empty_config_map(&cr.namespace, &name),
            };
            let value = mutate(&mut cm, cr)?;
            match self.store.apply(&cm).await {
                Ok(_) => return Ok(value),
                Err(err) if is_conflict(&err) && attempt < APPLY_CONFLICT_RETRIES => {
                    debug!(
                        config_map = %name,
                        attempt,
                        "Conflict applying manual-update config map; retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn empty_config_map(namespace: &str, name: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        ..ConfigMap::default()
    }
}

/// Add an owner reference for the CR; returns true when it was not present
fn add_owner_reference(cm: &mut ConfigMap, cr: &CrRef) -> bool {
    let refs = cm.metadata.owner_references.get_or_insert_with(Vec::new);
    let present = refs
        .iter()
        .any(|r| r.kind == cr.kind.as_str() && r.name == cr.name);
    if present {
        return false;
    }
    refs.push(OwnerReference {
        api_version: OWNER_API_VERSION.to_string(),
        kind: cr.kind.as_str().to_string(),
        name: cr.name.clone(),
        uid: cr.uid.clone(),
        ..OwnerReference::default()
    });
    true
}

fn remove_owner_reference(cm: &mut ConfigMap, cr: &CrRef) {
    if let Some(refs) = cm.metadata.owner_references.as_mut() {
        refs.retain(|r| !(r.kind == cr.kind.as_str() && r.name == cr.name));
    }
}

fn is_conflict(err: &Error) -> bool {
    matches!(err, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
}
