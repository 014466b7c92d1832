use super::*;
use crate::BackendError;
use crate::Error;

#[tokio::test]
async fn missing_entry_reads_as_absent() {
    let backend = MemoryBackend::new();
    let snapshot = backend.read_with_watch("/prefsync/app").await.unwrap();
    assert!(!snapshot.exists);
    assert_eq!(snapshot.version, 0);
    assert!(snapshot.data.is_empty());
}

#[tokio::test]
async fn created_entry_reads_back_with_fresh_version() {
    let backend = MemoryBackend::new();
    backend
        .create_node("/prefsync", b"", CreateMode::Persistent)
        .await
        .unwrap();
    let cv = backend
        .create_node("/prefsync/app", b"blob", CreateMode::Persistent)
        .await
        .unwrap();
    assert_eq!(cv, 1);

    let snapshot = backend.read_with_watch("/prefsync/app").await.unwrap();
    assert!(snapshot.exists);
    assert_eq!(snapshot.data, b"blob");
    assert_eq!(snapshot.version, FRESH_ENTRY_DATA_VERSION);
}

#[tokio::test]
async fn create_requires_an_existing_parent() {
    let backend = MemoryBackend::new();
    let result = backend
        .create_node("/prefsync/app", b"", CreateMode::Persistent)
        .await;
    assert!(matches!(
        result,
        Err(Error::Backend(BackendError::NoNode(_)))
    ));
}

#[tokio::test]
async fn duplicate_create_conflicts() {
    let backend = MemoryBackend::new();
    backend
        .create_node("/prefsync", b"", CreateMode::Persistent)
        .await
        .unwrap();
    let result = backend
        .create_node("/prefsync", b"", CreateMode::Persistent)
        .await;
    assert!(matches!(
        result,
        Err(Error::Backend(BackendError::NodeExists(_)))
    ));
}

#[tokio::test]
async fn writes_bump_the_data_version() {
    let backend = MemoryBackend::new();
    backend
        .create_node("/prefsync", b"a", CreateMode::Persistent)
        .await
        .unwrap();
    assert_eq!(backend.write_data("/prefsync", b"b").await.unwrap(), 2);
    assert_eq!(backend.write_data("/prefsync", b"c").await.unwrap(), 3);
    let missing = backend.write_data("/nope", b"x").await;
    assert!(matches!(
        missing,
        Err(Error::Backend(BackendError::NoNode(_)))
    ));
}

#[tokio::test]
async fn child_membership_is_versioned() {
    let backend = MemoryBackend::new();
    backend
        .create_node("/prefsync", b"", CreateMode::Persistent)
        .await
        .unwrap();
    let cv1 = backend
        .create_node("/prefsync/b", b"", CreateMode::Persistent)
        .await
        .unwrap();
    let cv2 = backend
        .create_node("/prefsync/a", b"", CreateMode::Persistent)
        .await
        .unwrap();
    assert_eq!((cv1, cv2), (1, 2));

    let children = backend.read_children_with_watch("/prefsync").await.unwrap();
    assert_eq!(children.names, vec!["a", "b"]);
    assert_eq!(children.version, 2);

    let missing = backend.read_children_with_watch("/absent").await;
    assert!(matches!(
        missing,
        Err(Error::Backend(BackendError::NoNode(_)))
    ));
}

#[tokio::test]
async fn delete_removes_the_whole_subtree_deepest_first() {
    let backend = MemoryBackend::new();
    for path in ["/p", "/p/a", "/p/a/b"] {
        backend
            .create_node(path, b"", CreateMode::Persistent)
            .await
            .unwrap();
    }
    let mut rx = backend.subscribe();
    let cv = backend.delete_node("/p/a").await.unwrap();
    assert_eq!(cv, 2);
    assert!(!backend.read_with_watch("/p/a").await.unwrap().exists);
    assert!(!backend.read_with_watch("/p/a/b").await.unwrap().exists);

    let mut deletions = Vec::new();
    let mut membership = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            BackendEvent::Deleted { path } => deletions.push(path),
            BackendEvent::ChildrenChanged { path } => membership.push(path),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(deletions, vec!["/p/a/b", "/p/a"]);
    assert_eq!(membership, vec!["/p"]);
}

#[tokio::test]
async fn deleting_a_missing_entry_fails() {
    let backend = MemoryBackend::new();
    let result = backend.delete_node("/absent").await;
    assert!(matches!(
        result,
        Err(Error::Backend(BackendError::NoNode(_)))
    ));
}

#[tokio::test]
async fn disconnected_backend_rejects_everything() {
    let backend = MemoryBackend::new();
    backend
        .create_node("/prefsync", b"", CreateMode::Persistent)
        .await
        .unwrap();

    let mut rx = backend.subscribe();
    backend.set_connected(false);
    for result in [
        backend.read_with_watch("/prefsync").await.err(),
        backend.write_data("/prefsync", b"x").await.err(),
        backend.delete_node("/prefsync").await.err(),
    ] {
        assert!(matches!(
            result,
            Some(Error::Backend(BackendError::ConnectionLost))
        ));
    }
    backend.set_connected(true);
    assert!(backend.read_with_watch("/prefsync").await.unwrap().exists);

    let transitions: Vec<BackendEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert!(matches!(
        transitions[0],
        BackendEvent::Connection(ConnectionState::Disconnected)
    ));
    assert!(matches!(
        transitions[1],
        BackendEvent::Connection(ConnectionState::Connected)
    ));
}

#[tokio::test]
async fn ephemeral_entries_expire_with_the_session() {
    let backend = MemoryBackend::new();
    backend
        .create_node("/prefsync", b"", CreateMode::Persistent)
        .await
        .unwrap();
    backend
        .create_node("/prefsync/keep", b"", CreateMode::Persistent)
        .await
        .unwrap();
    backend
        .create_node("/prefsync/tmp", b"", CreateMode::Ephemeral)
        .await
        .unwrap();
    backend
        .create_node("/prefsync/tmp/sub", b"", CreateMode::Persistent)
        .await
        .unwrap();

    let mut rx = backend.subscribe();
    backend.set_connected(false);
    backend.set_connected(true);

    assert!(!backend.read_with_watch("/prefsync/tmp").await.unwrap().exists);
    assert!(!backend
        .read_with_watch("/prefsync/tmp/sub")
        .await
        .unwrap()
        .exists);
    assert!(backend.read_with_watch("/prefsync/keep").await.unwrap().exists);
    let children = backend.read_children_with_watch("/prefsync").await.unwrap();
    assert_eq!(children.names, vec!["keep"]);
    assert_eq!(children.version, 3);

    let events: Vec<BackendEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert!(
        matches!(&events[0], BackendEvent::Deleted { path } if path == "/prefsync/tmp/sub")
    );
    assert!(matches!(&events[1], BackendEvent::Deleted { path } if path == "/prefsync/tmp"));
    assert!(
        matches!(&events[2], BackendEvent::ChildrenChanged { path } if path == "/prefsync")
    );
    assert!(matches!(
        events[3],
        BackendEvent::Connection(ConnectionState::Disconnected)
    ));
    assert!(matches!(
        events[4],
        BackendEvent::Connection(ConnectionState::Connected)
    ));
}

#[tokio::test]
async fn mutations_emit_change_notifications() {
    let backend = MemoryBackend::new();
    backend
        .create_node("/prefsync", b"", CreateMode::Persistent)
        .await
        .unwrap();
    let mut rx = backend.subscribe();

    backend
        .create_node("/prefsync/app", b"", CreateMode::Persistent)
        .await
        .unwrap();
    backend.write_data("/prefsync/app", b"x").await.unwrap();

    let events: Vec<BackendEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert!(matches!(
        &events[0],
        BackendEvent::DataChanged { path } if path == "/prefsync/app"
    ));
    assert!(matches!(
        &events[1],
        BackendEvent::ChildrenChanged { path } if path == "/prefsync"
    ));
    assert!(matches!(
        &events[2],
        BackendEvent::DataChanged { path } if path == "/prefsync/app"
    ));
}
