//! The desired-state snapshot handed to the syncer by its source.

use std::collections::{BTreeMap, BTreeSet};

use catsync_core::CatalogRegistration;
use serde::Serialize;

/// Registrations grouped by namespace, then by service name and instance id.
///
/// With namespaces disabled every registration lives under the `""` key, no
/// matter what namespace it carries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredServiceSet {
    names: BTreeMap<String, BTreeSet<String>>,
    instances: BTreeMap<String, BTreeMap<String, CatalogRegistration>>,
}

/// Difference between two consecutive snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncDelta {
    /// Registrations that are new or changed.
    pub upserted: Vec<CatalogRegistration>,
    /// Registrations that disappeared, as last desired.
    pub removed: Vec<CatalogRegistration>,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }
}

/// Index key for `namespace` under the given namespace mode.
pub fn namespace_key(namespace: &str, namespaces_enabled: bool) -> &str {
    if namespaces_enabled {
        namespace
    } else {
        ""
    }
}

impl DesiredServiceSet {
    pub fn from_registrations<I>(registrations: I, namespaces_enabled: bool) -> Self
    where
        I: IntoIterator<Item = CatalogRegistration>,
    {
        let mut set = Self::default();
        for registration in registrations {
            let namespace =
                namespace_key(&registration.service.namespace, namespaces_enabled).to_owned();
            set.names
                .entry(namespace.clone())
                .or_default()
                .insert(registration.service.service.clone());
            set.instances
                .entry(namespace)
                .or_default()
                .insert(registration.service.id.clone(), registration);
        }
        set
    }

    pub fn contains_service(&self, namespace: &str, service: &str) -> bool {
        self.names
            .get(namespace)
            .is_some_and(|names| names.contains(service))
    }

    /// True when the service name is desired and the instance id is one of
    /// its desired instances.
    pub fn contains_instance(&self, namespace: &str, service: &str, service_id: &str) -> bool {
        self.contains_service(namespace, service)
            && self
                .get(namespace, service_id)
                .is_some_and(|reg| reg.service.service == service)
    }

    pub fn get(&self, namespace: &str, service_id: &str) -> Option<&CatalogRegistration> {
        self.instances.get(namespace)?.get(service_id)
    }

    /// Every registration, ordered by namespace then instance id.
    pub fn registrations(&self) -> impl Iterator<Item = &CatalogRegistration> + '_ {
        self.instances.values().flat_map(BTreeMap::values)
    }

    /// Every `(namespace, service name)` pair.
    pub fn services(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.names.iter().flat_map(|(namespace, names)| {
            names
                .iter()
                .map(move |name| (namespace.as_str(), name.as_str()))
        })
    }

    pub fn service_count(&self) -> usize {
        self.names.values().map(BTreeSet::len).sum()
    }

    /// Number of desired instances.
    pub fn len(&self) -> usize {
        self.instances.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// What changes when `next` replaces `self`.
    pub fn delta(&self, next: &DesiredServiceSet) -> SyncDelta {
        let upserted = next
            .instances
            .iter()
            .flat_map(|(namespace, instances)| {
                instances
                    .iter()
                    .filter(move |(id, reg)| self.get(namespace, id) != Some(*reg))
                    .map(|(_, reg)| reg.clone())
            })
            .collect();
        let removed = self
            .instances
            .iter()
            .flat_map(|(namespace, instances)| {
                instances
                    .iter()
                    .filter(move |(id, _)| next.get(namespace, id).is_none())
                    .map(|(_, reg)| reg.clone())
            })
            .collect();
        SyncDelta { upserted, removed }
    }
}

#[cfg(test)]
mod tests {
    use catsync_core::AgentService;
    use rstest::rstest;

    use super::*;

    fn reg(namespace: &str, service: &str, id: &str) -> CatalogRegistration {
        CatalogRegistration {
            node: "k8s-sync".into(),
            address: "127.0.0.1".into(),
            datacenter: "dc1".into(),
            service: AgentService {
                id: id.into(),
                service: service.into(),
                namespace: namespace.into(),
                tags: vec!["k8s".into()],
                ..AgentService::default()
            },
            check: None,
        }
    }

    #[rstest]
    #[case::namespaces_enabled(true, "team-a")]
    #[case::namespaces_disabled(false, "")]
    fn registrations_are_indexed_by_namespace_key(#[case] enabled: bool, #[case] key: &str) {
        let set = DesiredServiceSet::from_registrations(
            [reg("team-a", "web", "web-1"), reg("team-a", "web", "web-2")],
            enabled,
        );
        assert!(set.contains_service(key, "web"));
        assert!(set.contains_instance(key, "web", "web-2"));
        assert!(!set.contains_instance(key, "web", "web-3"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.service_count(), 1);
        assert_eq!(set.services().collect::<Vec<_>>(), vec![(key, "web")]);
    }

    #[test]
    fn instance_must_match_its_service_name() {
        let set = DesiredServiceSet::from_registrations([reg("", "web", "shared-id")], false);
        assert!(!set.contains_instance("", "api", "shared-id"));
    }

    #[test]
    fn delta_reports_new_changed_and_removed() {
        let before = DesiredServiceSet::from_registrations(
            [reg("", "web", "web-1"), reg("", "web", "web-2"), reg("", "db", "db-1")],
            false,
        );
        let mut changed = reg("", "db", "db-1");
        changed.service.port = 5432;
        let after = DesiredServiceSet::from_registrations(
            [reg("", "web", "web-1"), changed.clone(), reg("", "api", "api-1")],
            false,
        );

        let delta = before.delta(&after);
        let upserted: Vec<_> = delta.upserted.iter().map(|r| r.service.id.as_str()).collect();
        let removed: Vec<_> = delta.removed.iter().map(|r| r.service.id.as_str()).collect();
        assert_eq!(upserted, vec!["api-1", "db-1"]);
        assert_eq!(removed, vec!["web-2"]);
    }

    #[test]
    fn identical_snapshots_have_empty_delta() {
        let regs = [reg("", "web", "web-1")];
        let a = DesiredServiceSet::from_registrations(regs.clone(), false);
        let b = DesiredServiceSet::from_registrations(regs, false);
        assert!(a.delta(&b).is_empty());
        assert_eq!(a, b);
    }
}
