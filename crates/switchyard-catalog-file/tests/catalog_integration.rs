//! File catalog and pointer state wired into the routing engine

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use switchyard_catalog_file::{FileCatalog, JsonPointerStore};
use switchyard_core::{
    AttemptResult, ChannelGroupStore, Constraints, Error, PointerStore, UpstreamStore,
};
use switchyard_routing::{
    CachedUpstreamStore, GroupRouter, PointerPersistence, Scheduler, build_default_channel_ring,
};
use tempfile::TempDir;

const YAML_CATALOG: &str = r#"
channels:
  - id: 1
    type: openai_compatible
    name: primary
    priority: 10
    endpoints:
      - id: 10
        base_url: https://primary.example.com/v1
        credentials:
          - id: 100
  - id: 2
    type: openai_compatible
    name: backup
    endpoints:
      - id: 20
        base_url: https://backup.example.com/v1
        credentials:
          - id: 200
groups:
  - id: 1
    name: default
    max_attempts: 6
    members:
      - channel: 1
        priority: 10
      - channel: 2
"#;

const TOML_CATALOG: &str = r#"
[[channels]]
id = 5
type = "anthropic"
name = "claude"

[[channels.endpoints]]
id = 50
base_url = "https://anthropic.example.com"

[[channels.endpoints.credentials]]
id = 500

[[groups]]
id = 1
name = "default"

[[groups.members]]
channel = 5
"#;

fn write_file(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn load(path: &Path) -> Arc<FileCatalog> {
    Arc::new(FileCatalog::from_file(path).unwrap())
}

#[tokio::test]
async fn test_from_file_yaml() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "catalog.yaml", YAML_CATALOG);

    let catalog = load(&path);
    let summary = catalog.summary();
    assert_eq!(summary.channels, 2);
    assert_eq!(summary.endpoints, 2);
    assert_eq!(summary.credentials, 2);
    assert_eq!(summary.groups, 1);
    assert_eq!(catalog.path(), Some(path.as_path()));

    let root = catalog.get_channel_group_by_name("default").await.unwrap().unwrap();
    assert_eq!(root.max_attempts, 6);
}

#[tokio::test]
async fn test_from_file_toml() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "catalog.toml", TOML_CATALOG);

    let catalog = load(&path);
    let credentials = catalog.list_anthropic_credentials_by_endpoint(50).await.unwrap();
    assert_eq!(credentials.len(), 1);
    assert_eq!(credentials[0].id, 500);
    assert!(catalog.list_openai_compatible_credentials_by_endpoint(50).await.unwrap().is_empty());
}

#[test]
fn test_from_file_reports_parse_and_io_errors() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "catalog.yaml", "channels: [ {");
    assert!(matches!(FileCatalog::from_file(&path), Err(Error::Config(_))));

    let missing = dir.path().join("missing.yaml");
    assert!(matches!(FileCatalog::from_file(&missing), Err(Error::Io(_))));
}

#[tokio::test]
async fn test_default_ring_from_file_catalog() {
    let dir = TempDir::new().unwrap();
    let catalog = load(&write_file(&dir, "catalog.yaml", YAML_CATALOG));

    let ring = build_default_channel_ring(catalog.as_ref(), "default").await.unwrap();
    assert_eq!(ring, vec![1, 2]);
}

#[tokio::test]
async fn test_router_fails_over_across_file_channels() {
    let dir = TempDir::new().unwrap();
    let catalog = load(&write_file(&dir, "catalog.yaml", YAML_CATALOG));
    let upstream = CachedUpstreamStore::wrap(catalog.clone(), Duration::from_secs(30));
    let scheduler = Arc::new(Scheduler::with_defaults(upstream));

    let mut router =
        GroupRouter::new(catalog.clone(), scheduler.clone(), 42, "", Constraints::default());
    let mut seen = Vec::new();
    for _ in 0..4 {
        let sel = router.next().await.unwrap();
        seen.push(sel.channel_id);
        assert_eq!(sel.route_group, "default");
        scheduler.report(&sel, &AttemptResult::failure(true, Some(502), None));
    }

    assert_eq!(seen[0], 1);
    assert!(seen.contains(&2));
}

#[tokio::test]
async fn test_pointer_state_survives_new_store_instance() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state").join("pointers.json");

    let first = JsonPointerStore::new(&path);
    let record = switchyard_core::GroupPointerRecord {
        group_id: 1,
        channel_id: 2,
        pinned: true,
        moved_at_unix_ms: 1_700_000_000_000,
        reason: switchyard_core::PointerReason::Manual,
    };
    first.upsert_group_pointer(&record).await.unwrap();

    let second = JsonPointerStore::new(&path);
    assert_eq!(second.get_group_pointer(1).await.unwrap(), Some(record));
    assert!(second.get_channel_pointer().await.unwrap().is_none());
}

#[tokio::test]
async fn test_pinned_pointer_restored_after_restart() {
    let dir = TempDir::new().unwrap();
    let catalog = load(&write_file(&dir, "catalog.yaml", YAML_CATALOG));
    let state_path = dir.path().join("pointers.json");

    {
        let store = Arc::new(JsonPointerStore::new(&state_path));
        let persistence = Arc::new(PointerPersistence::new(store));
        let scheduler = Scheduler::with_defaults(catalog.clone())
            .with_pointer_persistence(persistence.clone());
        scheduler.set_channel_ring(&[1, 2]);
        scheduler.pin_channel(2);
        persistence
            .write_channel_pointer(&scheduler.channel_pointer())
            .await
            .unwrap();
    }

    let store = Arc::new(JsonPointerStore::new(&state_path));
    let persistence = Arc::new(PointerPersistence::new(store));
    let scheduler =
        Arc::new(Scheduler::with_defaults(catalog.clone()).with_pointer_persistence(persistence));
    assert!(scheduler.restore_pointer().await.unwrap());

    let pointer = scheduler.channel_pointer();
    assert_eq!(pointer.channel_id, 2);
    assert!(pointer.pinned);

    let mut router =
        GroupRouter::new(catalog.clone(), scheduler.clone(), 7, "", Constraints::default());
    let sel = router.next().await.unwrap();
    assert_eq!(sel.channel_id, 2);
    assert_eq!(sel.credential_id, 200);
}
