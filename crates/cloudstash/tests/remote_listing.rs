//! Browsing bucket folders through the transfer tool.

#![cfg(unix)]

mod common;

use cloudstash::transfer::EntryKind;
use cloudstash::{CloudstashError, RemoteError};

use common::{TestHarness, ToolBehavior};

#[tokio::test]
async fn test_list_remote_folder() {
    let h = TestHarness::new(ToolBehavior::Succeed);

    let entries = h.service.list_remote("docs/", &h.bucket.id).await.unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "2026-01-01_02-00-00");
    assert_eq!(entries[0].kind, EntryKind::Dir);
    assert_eq!(entries[0].size, None);
    assert_eq!(entries[1].name, "notes.txt");
    assert_eq!(entries[1].kind, EntryKind::File);
    assert_eq!(entries[1].size, Some(42));

    assert_eq!(h.tool.calls(), vec!["lsjson cloudstash:test-bucket/docs"]);
}

#[tokio::test]
async fn test_list_remote_unknown_bucket() {
    let h = TestHarness::new(ToolBehavior::Succeed);

    let result = h.service.list_remote("", "missing").await;

    assert!(matches!(
        result,
        Err(CloudstashError::Remote(RemoteError::BucketNotFound(id))) if id == "missing"
    ));
    assert!(h.tool.calls().is_empty());
}
