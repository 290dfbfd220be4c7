//! New changes get dense, ascending ids and are immediately visible to
//! `get_changes_greater_than`, in the order they were assigned rather than
//! the order fields were built in.

use bm_db::NewChange;

#[tokio::test]
async fn appended_changes_are_ascending_and_immediately_visible() {
    let (conn, _clock) = bm_testkit::test_connector(1_700_000_000).await;

    let c1 = conn
        .add_change(NewChange { who: "alice".into(), comments: "first".into(), when: 10, ..Default::default() })
        .await
        .unwrap();
    let c2 = conn
        .add_change(NewChange { who: "bob".into(), comments: "second".into(), when: 20, ..Default::default() })
        .await
        .unwrap();

    assert_eq!(c1.changeid, 1);
    assert_eq!(c2.changeid, 2);

    let since_zero = conn.get_changes_greater_than(0).await.unwrap();
    let ids: Vec<i64> = since_zero.iter().map(|c| c.changeid).collect();
    assert_eq!(ids, vec![1, 2]);

    let since_first = conn.get_changes_greater_than(c1.changeid).await.unwrap();
    assert_eq!(since_first.len(), 1);
    assert_eq!(since_first[0].who, "bob");
}
