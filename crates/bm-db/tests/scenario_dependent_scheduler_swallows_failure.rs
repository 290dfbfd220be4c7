//! A `Dependent` scheduler does not emit anything when the upstream buildset
//! it is watching completes with a failing result — it still unsubscribes,
//! so the failed buildset isn't inspected again on the next poll.

use bm_db::{BuildResult, DependentScheduler, DependentSpec, NewBuildSet, NewSourceStamp};

#[tokio::test]
async fn upstream_failure_is_swallowed() {
    let (conn, _clock) = bm_testkit::test_connector(1_700_000_000).await;

    let spec = DependentSpec { name: "packaging".into() };
    let reg = conn.register_schedulers(&[&spec]).await.unwrap().remove(0);
    let dependent =
        DependentScheduler::new(reg.schedulerid, reg.name, "ci".into(), vec!["package".into()]);

    let ssid = conn
        .run_interaction_async(|txn| Box::pin(conn.ensure_sourcestamp(txn, NewSourceStamp::default())))
        .await
        .unwrap();
    let upstream_bsid = conn
        .create_buildset(NewBuildSet {
            sourcestampid: ssid,
            builders: vec![bm_db::RequestedBuild { buildername: "compile".into(), priority: 0 }],
            ..Default::default()
        })
        .await
        .unwrap();

    conn.run_interaction_async(|txn| Box::pin(dependent.watch(&conn, txn, upstream_bsid)))
        .await
        .unwrap();

    let brids = conn.get_buildrequestids_for_buildset(upstream_bsid).await.unwrap();
    conn.retire_buildrequests(&brids, BuildResult::Failure).await.unwrap();

    assert!(dependent.poll(&conn).await.unwrap().is_empty());
    // Unsubscribed already: polling again must not re-examine the same buildset.
    assert!(dependent.poll(&conn).await.unwrap().is_empty());
}
