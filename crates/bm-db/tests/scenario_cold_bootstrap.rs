//! A database that has never been opened bootstraps its schema on first
//! connect and reports itself ready and quiescent.

#[tokio::test]
async fn fresh_database_bootstraps_and_is_quiescent() {
    let (conn, _clock) = bm_testkit::test_connector(1_700_000_000).await;

    assert_eq!(conn.get_version().await.unwrap(), Some(1));
    assert!(!conn.has_pending_operations().await);
}

#[tokio::test]
async fn reopening_an_existing_database_does_not_reset_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bm.sqlite");
    let url = format!("sqlite://{}", path.display());

    let first = bm_db::Connector::open(&url, None).await.unwrap();
    let change = first
        .add_change(bm_db::NewChange { who: "alice".into(), when: 1, ..Default::default() })
        .await
        .unwrap();
    drop(first);

    let second = bm_db::Connector::open(&url, None).await.unwrap();
    let fetched = second.get_change(change.changeid).await.unwrap().unwrap();
    assert_eq!(fetched.who, "alice");
}
