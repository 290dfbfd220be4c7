//! Resubmitting a buildrequest clears its claim but keeps its priority and
//! original submission time, so it doesn't lose its place in the queue.

use bm_db::{NewBuildSet, NewSourceStamp, RequestedBuild};

#[tokio::test]
async fn resubmitted_request_keeps_priority_and_submission_order() {
    let (conn, _clock) = bm_testkit::test_connector(1_700_000_000).await;

    let ssid = conn
        .run_interaction_async(|txn| Box::pin(conn.ensure_sourcestamp(txn, NewSourceStamp::default())))
        .await
        .unwrap();
    let bsid = conn
        .create_buildset(NewBuildSet {
            sourcestampid: ssid,
            builders: vec![RequestedBuild { buildername: "linux".into(), priority: 9 }],
            ..Default::default()
        })
        .await
        .unwrap();
    let brids = conn.get_buildrequestids_for_buildset(bsid).await.unwrap();

    conn.claim_buildrequests(&brids, "master-a", "incarnation-1").await.unwrap();
    conn.resubmit_buildrequests(&brids).await.unwrap();

    let unclaimed = conn
        .get_unclaimed_buildrequests("linux", conn.now() - 600, "master-b", "incarnation-2")
        .await
        .unwrap();
    assert_eq!(unclaimed.len(), 1);
    assert_eq!(unclaimed[0].priority, 9);
    assert_eq!(unclaimed[0].submitted_at, conn.now());
}
