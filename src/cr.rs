//! Custom-resource handles and pod naming
//!
//! The scheduler never touches CRD specs directly; it works from a small
//! [`CrRef`] handle carrying the identity of the resource under reconcile.
//! Pod and statefulset names formatted here are external contracts shared
//! with the pod bootstrap layer; they must not drift.

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Api;
use kube::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Error;

/// Custom-resource kinds the scheduler can be invoked for
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CrKind {
    /// Single-instance (optionally multi-replica) deployment
    Standalone,
    /// License manager instance
    LicenseMaster,
    /// Search-head cluster; apps land on the deployer
    SearchHeadCluster,
    /// Indexer cluster members; not schedulable by the app framework
    IndexerCluster,
    /// Cluster manager instance
    ClusterMaster,
    /// Monitoring console instance
    MonitoringConsole,
}

impl CrKind {
    /// Literal pod-name substring for this kind
    ///
    /// IndexerCluster has no pod type: apps for indexer members flow through
    /// the cluster manager's bundle push, never through this scheduler.
    pub fn pod_type(self) -> Option<&'static str> {
        match self {
            Self::Standalone => Some("standalone"),
            Self::LicenseMaster => Some("license-master"),
            Self::SearchHeadCluster => Some("deployer"),
            Self::IndexerCluster => None,
            Self::ClusterMaster => Some("cluster-master"),
            Self::MonitoringConsole => Some("monitoring-console"),
        }
    }

    /// Kind as it appears in the CR TypeMeta
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standalone => "Standalone",
            Self::LicenseMaster => "LicenseMaster",
            Self::SearchHeadCluster => "SearchHeadCluster",
            Self::IndexerCluster => "IndexerCluster",
            Self::ClusterMaster => "ClusterMaster",
            Self::MonitoringConsole => "MonitoringConsole",
        }
    }
}

impl std::fmt::Display for CrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CrKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Standalone" => Ok(Self::Standalone),
            "LicenseMaster" => Ok(Self::LicenseMaster),
            "SearchHeadCluster" => Ok(Self::SearchHeadCluster),
            "IndexerCluster" => Ok(Self::IndexerCluster),
            "ClusterMaster" => Ok(Self::ClusterMaster),
            "MonitoringConsole" => Ok(Self::MonitoringConsole),
            other => Err(Error::validation(format!("unknown CR kind: {other}"))),
        }
    }
}

/// Identity of the custom resource a reconcile pass runs for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrRef {
    /// CR kind
    pub kind: CrKind,
    /// CR name
    pub name: String,
    /// CR namespace
    pub namespace: String,
    /// CR uid, used for config-map owner references; empty when unknown
    pub uid: String,
}

impl CrRef {
    /// Handle without a uid, sufficient for everything but owner references
    pub fn new(kind: CrKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
            uid: String::new(),
        }
    }

    /// Target pod name for a replica ordinal
    ///
    /// Format `splunk-<name>-<podType>-<ordinal>` is consumed by the pod
    /// bootstrap layer and by [`pod_ordinal`].
    pub fn pod_name(&self, ordinal: u32) -> Result<String, Error> {
        let pod_type = self.kind.pod_type().ok_or_else(|| {
            Error::validation(format!("CR kind {} has no schedulable pod type", self.kind))
        })?;
        Ok(format!("splunk-{}-{}-{}", self.name, pod_type, ordinal))
    }

    /// Name of the statefulset backing this CR's pods
    pub fn statefulset_name(&self) -> Result<String, Error> {
        let pod_type = self.kind.pod_type().ok_or_else(|| {
            Error::validation(format!("CR kind {} has no schedulable pod type", self.kind))
        })?;
        Ok(format!("splunk-{}-{}", self.name, pod_type))
    }
}

/// Replica ordinal parsed from a statefulset pod name
///
/// Accepts only the `splunk-<name>-<podType>-<ordinal>` form.
pub fn pod_ordinal(pod_name: &str) -> Result<u32, Error> {
    let rest = pod_name
        .strip_prefix("splunk-")
        .ok_or_else(|| Error::validation(format!("malformed pod name: {pod_name}")))?;

    let (_, ordinal) = rest
        .rsplit_once('-')
        .ok_or_else(|| Error::validation(format!("malformed pod name: {pod_name}")))?;

    ordinal
        .parse::<u32>()
        .map_err(|_| Error::validation(format!("pod name has no ordinal: {pod_name}")))
}

/// Replica count of a statefulset, defaulting to one when unset
pub fn replica_count(sts: Option<&StatefulSet>) -> i32 {
    sts.and_then(|sts| sts.spec.as_ref())
        .and_then(|spec| spec.replicas)
        .unwrap_or(1)
}

/// Fetch the statefulset backing a CR's pods
///
/// Returns `None` (with a warning) when the statefulset does not exist yet;
/// the caller falls back to a single-replica assumption.
pub async fn relevant_statefulset(client: Client, cr: &CrRef) -> Result<Option<StatefulSet>, Error> {
    let name = cr.statefulset_name()?;
    let api: Api<StatefulSet> = Api::namespaced(client, &cr.namespace);
    match api.get_opt(&name).await? {
        Some(sts) => Ok(Some(sts)),
        None => {
            warn!(
                name = %cr.name,
                namespace = %cr.namespace,
                statefulset = %name,
                "Statefulset not found for CR; assuming one replica"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;

    #[test]
    fn pod_names_match_the_bootstrap_contract() {
        let cases = [
            (CrKind::Standalone, "splunk-stack1-standalone-0"),
            (CrKind::LicenseMaster, "splunk-stack1-license-master-0"),
            (CrKind::SearchHeadCluster, "splunk-stack1-deployer-0"),
            (CrKind::ClusterMaster, "splunk-stack1-cluster-master-0"),
            (CrKind::MonitoringConsole, "splunk-stack1-monitoring-console-0"),
        ];
        for (kind, expected) in cases {
            let cr = CrRef::new(kind, "stack1", "test");
            assert_eq!(cr.pod_name(0).unwrap(), expected);
        }
    }

    #[test]
    fn indexer_cluster_has_no_pod_type() {
        let cr = CrRef::new(CrKind::IndexerCluster, "stack1", "test");
        assert!(cr.pod_name(0).is_err());
        assert!(cr.statefulset_name().is_err());
        assert_eq!(CrKind::IndexerCluster.pod_type(), None);
    }

    #[test]
    fn statefulset_name_drops_the_ordinal() {
        let cr = CrRef::new(CrKind::SearchHeadCluster, "stack1", "test");
        assert_eq!(cr.statefulset_name().unwrap(), "splunk-stack1-deployer");
    }

    #[test]
    fn pod_ordinal_parses_the_trailing_index() {
        assert_eq!(pod_ordinal("splunk-s2apps-standalone-2").unwrap(), 2);
        assert_eq!(pod_ordinal("splunk-stack1-cluster-master-0").unwrap(), 0);
    }

    #[test]
    fn pod_ordinal_rejects_malformed_names() {
        assert!(pod_ordinal("splunks2apps-standalone-2").is_err());
        assert!(pod_ordinal("splunk-stack1-standalone-x").is_err());
        assert!(pod_ordinal("standalone").is_err());
    }

    #[test]
    fn replica_count_defaults_to_one() {
        assert_eq!(replica_count(None), 1);

        let sts = StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(5),
                ..StatefulSetSpec::default()
            }),
            ..StatefulSet::default()
        };
        assert_eq!(replica_count(Some(&sts)), 5);

        let bare = StatefulSet::default();
        assert_eq!(replica_count(Some(&bare)), 1);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            CrKind::Standalone,
            CrKind::LicenseMaster,
            CrKind::SearchHeadCluster,
            CrKind::IndexerCluster,
            CrKind::ClusterMaster,
            CrKind::MonitoringConsole,
        ] {
            assert_eq!(kind.as_str().parse::<CrKind>().unwrap(), kind);
        }
        assert!("Deployer".parse::<CrKind>().is_err());
    }
}
