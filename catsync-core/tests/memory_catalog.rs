//! Scope filtering and operation-log behaviour of the in-memory catalog,
//! exercised through the `CatalogClient` trait object.

use std::sync::Arc;

use catsync_core::{
    AgentService, CatalogClient, CatalogEntry, CatalogOp, CatalogRegistration, Kind,
    MemoryCatalog, QueryOptions, ResourceReference,
};
use rstest::rstest;

fn reg(id: &str, namespace: &str) -> CatalogRegistration {
    CatalogRegistration {
        node: "k8s-sync".into(),
        address: "127.0.0.1".into(),
        datacenter: "dc1".into(),
        service: AgentService {
            id: id.into(),
            service: "web".into(),
            namespace: namespace.into(),
            tags: vec!["k8s".into()],
            ..AgentService::default()
        },
        check: None,
    }
}

async fn seeded() -> Arc<dyn CatalogClient> {
    let catalog = Arc::new(MemoryCatalog::new());
    for (id, ns) in [("web-1", "team-a"), ("web-2", "team-b"), ("web-3", "")] {
        catalog.register(&reg(id, ns)).await.expect("register");
    }
    catalog
}

#[rstest]
#[case::default_scope(None, 3)]
#[case::wildcard(Some("*"), 3)]
#[case::team_a(Some("team-a"), 1)]
#[case::empty_namespace(Some(""), 1)]
#[case::unknown(Some("team-z"), 0)]
#[tokio::test]
async fn service_instances_respect_namespace_scope(
    #[case] namespace: Option<&str>,
    #[case] expected: usize,
) {
    let client = seeded().await;
    let opts = QueryOptions {
        namespace: namespace.map(str::to_owned),
        ..QueryOptions::default()
    };
    let (services, _) = client
        .service_instances("web", &opts)
        .await
        .expect("instances");
    assert_eq!(services.len(), expected);
}

#[tokio::test]
async fn operation_log_records_mutations_in_order() {
    let catalog = MemoryCatalog::new();
    let registration = reg("web-1", "");
    catalog.register(&registration).await.expect("register");
    catalog
        .deregister(&registration.deregistration())
        .await
        .expect("deregister");
    let entry = CatalogEntry::new(ResourceReference::new("http-route", "web"), 0);
    catalog.cas_entry(&entry).await.expect("cas");

    assert_eq!(
        catalog.ops(),
        vec![
            CatalogOp::Register {
                node: "k8s-sync".into(),
                service_id: "web-1".into()
            },
            CatalogOp::Deregister {
                node: "k8s-sync".into(),
                service_id: "web-1".into()
            },
            CatalogOp::CasWrite {
                reference: entry.reference.clone(),
                accepted: true
            },
        ]
    );
    assert!(catalog.services().is_empty());

    catalog.clear_ops();
    assert!(catalog.ops().is_empty());
}

#[tokio::test]
async fn list_entries_filters_by_kind() {
    let catalog = MemoryCatalog::new();
    catalog.insert_entry(CatalogEntry::new(ResourceReference::new("http-route", "a"), 0));
    catalog.insert_entry(CatalogEntry::new(ResourceReference::new("tcp-route", "b"), 0));

    let (routes, meta) = catalog
        .list_entries(&Kind::from("http-route"), &QueryOptions::default())
        .await
        .expect("list");
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].reference.name, "a");
    assert_eq!(meta.last_index, catalog.index());
}
