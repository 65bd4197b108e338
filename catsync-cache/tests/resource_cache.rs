//! End-to-end behaviour of the resource cache against the in-memory catalog.

use std::sync::Arc;
use std::time::Duration;

use catsync_cache::{
    CacheConfig, CacheError, Delivery, ResourceCache, Subscription, META_KEY_DATACENTER,
    META_KEY_SOURCE_NAME,
};
use catsync_core::{
    AgentService, CancellationToken, CatalogClient, CatalogEntry, CatalogRegistration, Kind,
    MemoryCatalog, NamespacedName, Operation, ResourceReference,
};
use tokio::task::JoinHandle;

const ROUTE: &str = "http-route";
const GATEWAY: &str = "api-gateway";

struct Harness {
    catalog: Arc<MemoryCatalog>,
    cache: Arc<ResourceCache>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Harness {
    fn new(config: CacheConfig) -> Self {
        let catalog = Arc::new(MemoryCatalog::new().with_default_wait(Duration::from_secs(1)));
        let client: Arc<dyn CatalogClient> = catalog.clone();
        let cache = Arc::new(ResourceCache::new(client, config));
        Self {
            catalog,
            cache,
            token: CancellationToken::new(),
            handle: None,
        }
    }

    fn start(&mut self) {
        let cache = Arc::clone(&self.cache);
        let token = self.token.clone();
        self.handle = Some(tokio::spawn(async move { cache.run(token).await }));
    }

    async fn synced(&self) {
        tokio::time::timeout(Duration::from_secs(30), self.cache.wait_synced(&self.token))
            .await
            .expect("sync within timeout")
            .expect("synced");
    }

    async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.expect("cache run joins");
        }
    }
}

fn config() -> CacheConfig {
    CacheConfig {
        blocking_wait: Duration::from_secs(1),
        ..CacheConfig::with_kinds([ROUTE, GATEWAY])
    }
}

fn route(name: &str) -> CatalogEntry {
    CatalogEntry::new(ResourceReference::new(ROUTE, name), 0)
}

fn by_name(entry: &CatalogEntry) -> Vec<NamespacedName> {
    vec![NamespacedName::new("default", entry.reference.name.clone())]
}

async fn next(subscription: &mut Subscription) -> NamespacedName {
    tokio::time::timeout(Duration::from_secs(30), subscription.recv())
        .await
        .expect("event within timeout")
        .expect("subscription open")
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn initial_refresh_populates_every_topic() {
    let mut harness = Harness::new(config());
    harness.catalog.insert_entry(route("a"));
    harness.catalog.insert_entry(route("b"));
    harness
        .catalog
        .insert_entry(CatalogEntry::new(ResourceReference::new(GATEWAY, "gw"), 0));

    assert!(!harness.cache.is_synced());
    harness.start();
    harness.synced().await;

    assert!(harness.cache.is_synced());
    assert_eq!(harness.cache.sync_progress(), (3, 3));
    let names: Vec<_> = harness
        .cache
        .list(&Kind::from(ROUTE))
        .into_iter()
        .map(|e| e.reference.name)
        .collect();
    assert_eq!(names, vec!["a", "b"]);
    assert!(harness
        .cache
        .get(&ResourceReference::new(GATEWAY, "gw"))
        .is_some());
    assert!(harness.cache.list(&Kind::from("tcp-route")).is_empty());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn only_new_or_bumped_entries_are_delivered() {
    let mut harness = Harness::new(config());
    let first = harness.catalog.insert_entry(route("e1"));
    let mut events = harness
        .cache
        .subscribe(&Kind::from(ROUTE), by_name)
        .expect("subscribe");

    harness.start();
    harness.synced().await;
    assert_eq!(next(&mut events).await.name, "e1");

    harness.catalog.insert_entry(route("e2"));
    assert_eq!(next(&mut events).await.name, "e2");
    settle().await;
    assert_eq!(events.try_recv(), None);

    harness
        .catalog
        .insert_entry(first.with_payload(serde_json::json!({"hostnames": ["a.example"]})));
    assert_eq!(next(&mut events).await.name, "e1");
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn removed_entries_are_delivered_once() {
    let mut harness = Harness::new(config());
    harness.catalog.insert_entry(route("gone"));
    harness.catalog.insert_entry(route("kept"));
    harness.start();
    harness.synced().await;

    let mut events = harness
        .cache
        .subscribe(&Kind::from(ROUTE), by_name)
        .expect("subscribe");
    harness
        .catalog
        .remove_entry(&ResourceReference::new(ROUTE, "gone"));

    assert_eq!(next(&mut events).await.name, "gone");
    settle().await;
    assert_eq!(events.try_recv(), None);
    assert!(harness
        .cache
        .get(&ResourceReference::new(ROUTE, "gone"))
        .is_none());
    assert_eq!(harness.cache.list(&Kind::from(ROUTE)).len(), 1);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_subscription_stops_receiving() {
    let mut harness = Harness::new(config());
    let mut kept = harness
        .cache
        .subscribe(&Kind::from(ROUTE), by_name)
        .expect("subscribe");
    let cancelled = harness
        .cache
        .subscribe(&Kind::from(ROUTE), by_name)
        .expect("subscribe");
    harness.start();
    harness.synced().await;

    cancelled.cancel();
    harness.catalog.insert_entry(route("x"));
    assert_eq!(next(&mut kept).await.name, "x");
    assert!(cancelled.is_cancelled());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn backpressure_delivery_waits_for_slow_readers() {
    let mut harness = Harness::new(CacheConfig {
        delivery: Delivery::Backpressure,
        ..config()
    });
    for name in ["a", "b", "c", "d"] {
        harness.catalog.insert_entry(route(name));
    }
    let mut events = harness
        .cache
        .subscribe(&Kind::from(ROUTE), by_name)
        .expect("subscribe");
    harness.start();

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(next(&mut events).await.name);
    }
    assert_eq!(received, vec!["a", "b", "c", "d"]);
    assert_eq!(events.dropped(), 0);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn ownership_filter_skips_foreign_entries() {
    let mut harness = Harness::new(CacheConfig {
        datacenter: Some("dc1".into()),
        unfiltered_kinds: vec![Kind::from(GATEWAY)],
        ..config()
    });
    harness.catalog.insert_entry(
        route("ours")
            .with_meta(META_KEY_SOURCE_NAME, "ours")
            .with_meta(META_KEY_DATACENTER, "dc1"),
    );
    harness.catalog.insert_entry(
        route("theirs")
            .with_meta(META_KEY_SOURCE_NAME, "theirs")
            .with_meta(META_KEY_DATACENTER, "dc2"),
    );
    harness.catalog.insert_entry(route("user-created"));
    harness
        .catalog
        .insert_entry(CatalogEntry::new(ResourceReference::new(GATEWAY, "gw"), 0));

    harness.start();
    harness.synced().await;

    let routes: Vec<_> = harness
        .cache
        .list(&Kind::from(ROUTE))
        .into_iter()
        .map(|e| e.reference.name)
        .collect();
    assert_eq!(routes, vec!["ours"]);
    assert_eq!(harness.cache.list(&Kind::from(GATEWAY)).len(), 1);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stale_write_is_rejected_without_mutation() {
    let mut harness = Harness::new(config());
    let stored = harness.catalog.insert_entry(route("web"));
    harness.start();
    harness.synced().await;

    harness
        .catalog
        .insert_entry(stored.clone().with_payload(serde_json::json!({"rev": 2})));
    let before = harness.catalog.entries();
    harness.catalog.clear_ops();

    let stale = stored.clone().with_payload(serde_json::json!({"rev": "mine"}));
    let err = harness.cache.write(&stale).await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::StaleEntry { ref reference, modify_index }
            if reference.name == "web" && modify_index == stored.modify_index
    ));
    assert_eq!(harness.catalog.entries(), before);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stale_write_creates_no_namespace() {
    let mut harness = Harness::new(CacheConfig {
        namespaces_enabled: true,
        ..config()
    });
    let reference = ResourceReference::new(ROUTE, "web").in_namespace("team-a");
    let stored = harness
        .catalog
        .insert_entry(CatalogEntry::new(reference.clone(), 0));
    harness.start();
    harness.synced().await;
    harness.catalog.clear_ops();

    let stale = CatalogEntry::new(reference, stored.modify_index + 7);
    let err = harness.cache.write(&stale).await.unwrap_err();
    assert!(matches!(err, CacheError::StaleEntry { .. }));
    assert!(harness.catalog.namespaces().is_empty());
    assert!(harness.catalog.ops().is_empty());

    let fresh = CatalogEntry::new(ResourceReference::new(ROUTE, "api").in_namespace("team-b"), 0);
    harness.cache.write(&fresh).await.expect("write");
    assert_eq!(harness.catalog.namespaces(), vec!["team-b".to_string()]);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn current_write_lands_and_identical_write_is_skipped() {
    let mut harness = Harness::new(config());
    harness.catalog.insert_entry(route("web"));
    harness.start();
    harness.synced().await;

    let cached = harness
        .cache
        .get(&ResourceReference::new(ROUTE, "web"))
        .expect("cached");
    harness.catalog.clear_ops();
    harness.cache.write(&cached).await.expect("identical write");
    assert!(harness.catalog.ops().is_empty());

    let updated = cached.with_payload(serde_json::json!({"rev": 2}));
    harness.cache.write(&updated).await.expect("write");
    assert_eq!(
        harness.catalog.entries()[0].payload,
        serde_json::json!({"rev": 2})
    );
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn delete_removes_cached_entries_only() {
    let mut harness = Harness::new(config());
    harness.catalog.insert_entry(route("web"));
    harness.start();
    harness.synced().await;

    harness
        .cache
        .delete(&ResourceReference::new(ROUTE, "missing"))
        .await
        .expect("noop delete");
    assert!(harness.catalog.ops().is_empty());

    harness
        .cache
        .delete(&ResourceReference::new(ROUTE, "web"))
        .await
        .expect("delete");
    assert!(harness.catalog.entries().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn subscribe_rejects_unknown_kind_and_second_service_subscriber() {
    let harness = Harness::new(config());
    let err = harness
        .cache
        .subscribe(&Kind::from("tcp-route"), by_name)
        .unwrap_err();
    assert!(matches!(err, CacheError::UnknownKind(ref kind) if kind.as_str() == "tcp-route"));

    let first = harness
        .cache
        .subscribe_services(|svc| vec![NamespacedName::new(svc.namespace.clone(), svc.service_name.clone())])
        .expect("first service subscriber");
    let second = harness.cache.subscribe_services(|_| Vec::new());
    assert!(matches!(second, Err(CacheError::DuplicateServiceSubscriber)));

    drop(first);
    harness
        .cache
        .subscribe_services(|_| Vec::new())
        .expect("slot freed once the first subscription is gone");
}

#[tokio::test(start_paused = true)]
async fn service_topic_delivers_registered_instances() {
    let mut harness = Harness::new(config());
    let mut events = harness
        .cache
        .subscribe_services(|svc| vec![NamespacedName::new("default", svc.service_name.clone())])
        .expect("subscribe services");
    harness.start();
    harness.synced().await;

    harness
        .catalog
        .register(&CatalogRegistration {
            node: "k8s-sync".into(),
            address: "127.0.0.1".into(),
            datacenter: "dc1".into(),
            service: AgentService {
                id: "web-1".into(),
                service: "web".into(),
                ..AgentService::default()
            },
            check: None,
        })
        .await
        .expect("register");

    assert_eq!(next(&mut events).await.name, "web");
    assert_eq!(harness.cache.list_services().len(), 1);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_errors_are_retried() {
    let mut harness = Harness::new(config());
    harness.catalog.insert_entry(route("a"));
    harness.catalog.fail_next(Operation::ListEntries, 3);
    harness.catalog.fail_next(Operation::ListServices, 2);

    harness.start();
    harness.synced().await;
    assert_eq!(harness.cache.list(&Kind::from(ROUTE)).len(), 1);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wait_synced_returns_cancelled_when_token_fires() {
    let harness = Harness::new(config());
    let token = CancellationToken::new();
    token.cancel();
    let err = harness.cache.wait_synced(&token).await.unwrap_err();
    assert!(matches!(err, CacheError::Cancelled));
}
