//! Domain types shared by the cache and the syncer.
//!
//! Catalog values are immutable snapshots: a changed entry is a new value
//! under the same [`ResourceReference`] with a higher `modify_index`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// The kind of a catalog entry (e.g. `api-gateway`, `http-route`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Kind(pub String);

impl Kind {
    /// Topic name used for the service-instance registry of the cache.
    pub const SERVICES: &'static str = "service";

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Kind {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Kind {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// The local identity a translator maps a catalog value to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Catalog entries
// ---------------------------------------------------------------------------

/// Primary key of a catalog value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceReference {
    pub kind: Kind,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub partition: String,
}

impl ResourceReference {
    pub fn new(kind: impl Into<Kind>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: String::new(),
            partition: String::new(),
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn in_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }
}

impl fmt::Display for ResourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.kind)?;
        if !self.partition.is_empty() {
            write!(f, "{}/", self.partition)?;
        }
        if !self.namespace.is_empty() {
            write!(f, "{}/", self.namespace)?;
        }
        f.write_str(&self.name)
    }
}

/// A named, namespaced, versioned record in the external catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub reference: ResourceReference,
    #[serde(default)]
    pub modify_index: u64,
    /// Ownership metadata (managed-by marker, datacenter, source name).
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CatalogEntry {
    pub fn new(reference: ResourceReference, modify_index: u64) -> Self {
        Self {
            reference,
            modify_index,
            meta: BTreeMap::new(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// One service instance as read back from the external catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogService {
    pub node: String,
    pub service_id: String,
    pub service_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub modify_index: u64,
}

impl CatalogService {
    /// Cache key for the service topic; instances are keyed by id.
    pub fn reference(&self) -> ResourceReference {
        ResourceReference {
            kind: Kind::from(Kind::SERVICES),
            name: self.service_id.clone(),
            namespace: self.namespace.clone(),
            partition: self.partition.clone(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

// ---------------------------------------------------------------------------
// Registrations
// ---------------------------------------------------------------------------

/// The service half of a [`CatalogRegistration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AgentService {
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Health status attached to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Passing,
    Warning,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Passing => write!(f, "passing"),
            HealthStatus::Warning => write!(f, "warning"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub check_id: String,
    pub name: String,
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// One service instance as written to the external catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRegistration {
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub datacenter: String,
    pub service: AgentService,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<HealthCheck>,
}

impl CatalogRegistration {
    /// The deregistration that removes exactly this instance.
    pub fn deregistration(&self) -> CatalogDeregistration {
        CatalogDeregistration {
            node: self.node.clone(),
            service_id: self.service.id.clone(),
            namespace: self.service.namespace.clone(),
            partition: self.service.partition.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogDeregistration {
    pub node: String,
    pub service_id: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub partition: String,
}

impl From<&CatalogService> for CatalogDeregistration {
    fn from(svc: &CatalogService) -> Self {
        Self {
            node: svc.node.clone(),
            service_id: svc.service_id.clone(),
            namespace: svc.namespace.clone(),
            partition: svc.partition.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Query options
// ---------------------------------------------------------------------------

/// Options for reads against the catalog.
///
/// A non-zero `wait_index` turns a list into a blocking query: the call
/// returns once the catalog index moves past it or `wait_time` elapses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryOptions {
    pub wait_index: u64,
    pub wait_time: Option<Duration>,
    /// `None` means the default namespace; `Some("*")` means all namespaces.
    pub namespace: Option<String>,
    pub partition: Option<String>,
    /// Only return service instances carrying this tag.
    pub tag: Option<String>,
    pub allow_stale: bool,
}

impl QueryOptions {
    pub const ALL_NAMESPACES: &'static str = "*";

    pub fn blocking(wait_index: u64, wait_time: Duration) -> Self {
        Self {
            wait_index,
            wait_time: Some(wait_time),
            ..Self::default()
        }
    }
}

/// Metadata returned alongside a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryMeta {
    pub last_index: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_display_includes_scope() {
        let plain = ResourceReference::new("http-route", "web");
        assert_eq!(plain.to_string(), "http-route:web");

        let scoped = ResourceReference::new("http-route", "web")
            .in_namespace("team-a")
            .in_partition("east");
        assert_eq!(scoped.to_string(), "http-route:east/team-a/web");
    }

    #[test]
    fn service_reference_is_keyed_by_instance_id() {
        let svc = CatalogService {
            node: "k8s-sync".into(),
            service_id: "web-abc".into(),
            service_name: "web".into(),
            namespace: "default".into(),
            partition: String::new(),
            address: "10.0.0.1".into(),
            port: 80,
            tags: vec!["k8s".into()],
            meta: BTreeMap::new(),
            modify_index: 7,
        };
        let reference = svc.reference();
        assert_eq!(reference.kind.as_str(), Kind::SERVICES);
        assert_eq!(reference.name, "web-abc");
        assert!(svc.has_tag("k8s"));
        assert!(!svc.has_tag("other"));
    }

    #[test]
    fn deregistration_mirrors_registration() {
        let reg = CatalogRegistration {
            node: "k8s-sync".into(),
            address: "127.0.0.1".into(),
            datacenter: "dc1".into(),
            service: AgentService {
                id: "web-1".into(),
                service: "web".into(),
                namespace: "ns".into(),
                ..AgentService::default()
            },
            check: None,
        };
        let dereg = reg.deregistration();
        assert_eq!(dereg.node, "k8s-sync");
        assert_eq!(dereg.service_id, "web-1");
        assert_eq!(dereg.namespace, "ns");
    }

    #[test]
    fn registration_serde_roundtrip_keeps_check() {
        let reg = CatalogRegistration {
            node: "n".into(),
            address: String::new(),
            datacenter: String::new(),
            service: AgentService {
                id: "a".into(),
                service: "a".into(),
                ..AgentService::default()
            },
            check: Some(HealthCheck {
                check_id: "a/ready".into(),
                name: "ready".into(),
                status: HealthStatus::Critical,
                output: None,
            }),
        };
        let json = serde_json::to_string(&reg).expect("serialize");
        assert!(json.contains("\"critical\""));
        let back: CatalogRegistration = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, reg);
    }
}
