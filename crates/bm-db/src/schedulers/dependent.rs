//! The `Dependent` scheduler: the one scheduler policy this crate implements
//! directly, since its entire state lives in the subscription join table
//! rather than arbitrary scheduler-private state. Watches an upstream
//! scheduler's buildsets and, on success, emits its own buildset over the
//! same sourcestamp against a fixed builder list.
//!
//! Grounded on `spec.md` §4.4 steps 2–3 and `original_source/buildbot/db.py`'s
//! `scheduler_subscribe_to_buildset` / `scheduler_get_subscribed_buildsets` /
//! `scheduler_unsubscribe_buildset`, which back the original
//! `buildbot.scheduler.Dependent`.

use crate::buildsets::{NewBuildSet, RequestedBuild};
use crate::connector::{Connector, Txn};
use crate::error::Result;
use crate::schedulers::SchedulerRegistration;

/// Registration input for a `Dependent` scheduler: it carries no meaningful
/// initial state, since which upstream buildsets it's watching is tracked
/// entirely through `scheduler_upstream_buildsets`.
pub struct DependentSpec {
    pub name: String,
}

impl SchedulerRegistration for DependentSpec {
    fn name(&self) -> &str {
        &self.name
    }
    fn initial_state(&self, _max_changeid_at_registration: i64) -> serde_json::Value {
        serde_json::json!({})
    }
}

/// A registered `Dependent` scheduler, ready to watch buildsets and react to
/// their completion.
pub struct DependentScheduler {
    pub schedulerid: i64,
    pub name: String,
    pub upstream_name: String,
    pub builders: Vec<String>,
}

impl DependentScheduler {
    pub fn new(
        schedulerid: i64,
        name: String,
        upstream_name: String,
        builders: Vec<String>,
    ) -> Self {
        DependentScheduler { schedulerid, name, upstream_name, builders }
    }

    /// Starts watching a buildset the upstream scheduler just created.
    /// Called by whatever observes the upstream's `add-buildset`
    /// notification, with the upstream's `bsid`.
    pub async fn watch(&self, conn: &Connector, txn: &mut Txn<'_>, bsid: i64) -> Result<()> {
        conn.subscribe_to_buildset(txn, self.schedulerid, bsid).await
    }

    /// Reacts to every upstream buildset that has completed since the last
    /// poll: unsubscribes from it, and if it succeeded, emits a new buildset
    /// over its sourcestamp targeting this scheduler's builders. A failed
    /// upstream buildset is unsubscribed from and otherwise ignored — no
    /// downstream buildset is emitted (`spec.md` §4.4 step 3).
    ///
    /// Returns the bsids of any buildsets this call emitted.
    pub async fn poll(&self, conn: &Connector) -> Result<Vec<i64>> {
        let schedulerid = self.schedulerid;
        let completed = conn
            .run_interaction_async(move |txn| {
                Box::pin(async move {
                    let subs = conn.get_subscribed_buildsets(txn, schedulerid).await?;
                    let mut completed = Vec::new();
                    for sub in subs {
                        if sub.complete {
                            conn.unsubscribe_buildset(txn, schedulerid, sub.bsid).await?;
                            completed.push(sub);
                        }
                    }
                    Ok(completed)
                })
            })
            .await?;

        let mut emitted = Vec::new();
        for sub in completed {
            let successful = sub.results.map(|r| r.is_successful()).unwrap_or(false);
            if !successful {
                continue;
            }
            let bsid = conn
                .create_buildset(NewBuildSet {
                    reason: Some(format!("downstream of {}", self.upstream_name)),
                    sourcestampid: sub.ssid,
                    builders: self
                        .builders
                        .iter()
                        .cloned()
                        .map(|buildername| RequestedBuild { buildername, priority: 0 })
                        .collect(),
                    ..Default::default()
                })
                .await?;
            emitted.push(bsid);
        }
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildsets::RequestedBuild as RB;
    use crate::results::BuildResult;
    use crate::sourcestamps::NewSourceStamp;
    use std::sync::Arc;

    async fn connector() -> Arc<Connector> {
        Connector::open("sqlite::memory:", None).await.unwrap()
    }

    async fn upstream_buildset(conn: &Arc<Connector>) -> i64 {
        let ssid = conn
            .run_interaction_async(|txn| {
                Box::pin(conn.ensure_sourcestamp(txn, NewSourceStamp::default()))
            })
            .await
            .unwrap();
        conn.create_buildset(NewBuildSet {
            sourcestampid: ssid,
            builders: vec![RB { buildername: "upstream-builder".into(), priority: 0 }],
            ..Default::default()
        })
        .await
        .unwrap()
    }

    async fn register_dependent(conn: &Arc<Connector>) -> DependentScheduler {
        let spec = DependentSpec { name: "downstream".into() };
        let reg = conn.register_schedulers(&[&spec]).await.unwrap()[0].clone();
        DependentScheduler::new(
            reg.schedulerid,
            reg.name,
            "upstream".into(),
            vec!["pkg-builder".into()],
        )
    }

    #[tokio::test]
    async fn successful_upstream_emits_downstream_buildset() {
        let conn = connector().await;
        let dep = register_dependent(&conn).await;
        let upstream_bsid = upstream_buildset(&conn).await;

        conn.run_interaction_async(|txn| Box::pin(dep.watch(&conn, txn, upstream_bsid)))
            .await
            .unwrap();

        let brids = conn.get_buildrequestids_for_buildset(upstream_bsid).await.unwrap();
        conn.retire_buildrequests(&brids, BuildResult::Success).await.unwrap();

        let emitted = dep.poll(&conn).await.unwrap();
        assert_eq!(emitted.len(), 1);
        let info = conn.get_buildset_info(emitted[0]).await.unwrap().unwrap();
        assert_eq!(info.reason.as_deref(), Some("downstream of upstream"));

        // Already unsubscribed, a second poll is a no-op.
        assert!(dep.poll(&conn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_upstream_emits_nothing() {
        let conn = connector().await;
        let dep = register_dependent(&conn).await;
        let upstream_bsid = upstream_buildset(&conn).await;

        conn.run_interaction_async(|txn| Box::pin(dep.watch(&conn, txn, upstream_bsid)))
            .await
            .unwrap();

        let brids = conn.get_buildrequestids_for_buildset(upstream_bsid).await.unwrap();
        conn.retire_buildrequests(&brids, BuildResult::Failure).await.unwrap();

        let emitted = dep.poll(&conn).await.unwrap();
        assert!(emitted.is_empty());
    }
}
