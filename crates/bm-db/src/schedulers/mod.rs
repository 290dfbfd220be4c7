//! Scheduler store: per-scheduler JSON state plus the two join tables
//! (`scheduler_changes`, `scheduler_upstream_buildsets`).
//!
//! Grounded on `original_source/buildbot/db.py::_addSchedulers` /
//! `scheduler_get_state` / `scheduler_set_state` / `scheduler_classify_change`
//! / `scheduler_get_classified_changes` / `scheduler_retire_changes` /
//! `scheduler_subscribe_to_buildset` / `scheduler_get_subscribed_buildsets` /
//! `scheduler_unsubscribe_buildset`.

pub mod dependent;

use sqlx::Row;

use crate::changes::Change;
use crate::connector::{next_id, Bind, Connector, Txn};
use crate::error::{Error, Result};
use crate::results::BuildResult;
use std::sync::Arc;

/// Supplies a scheduler's name and the JSON state it should start with, given
/// the highest `changeid` present at registration time — new schedulers must
/// ignore changes that predate them (`spec.md` §4.4's `register_schedulers`).
pub trait SchedulerRegistration {
    fn name(&self) -> &str;
    fn initial_state(&self, max_changeid_at_registration: i64) -> serde_json::Value;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredScheduler {
    pub schedulerid: i64,
    pub name: String,
}

/// A buildset a dependent scheduler is waiting on, as returned by
/// [`Connector::get_subscribed_buildsets`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribedBuildset {
    pub bsid: i64,
    pub ssid: i64,
    pub complete: bool,
    pub results: Option<BuildResult>,
}

impl Connector {
    /// For each scheduler without an existing row: allocates `schedulerid`
    /// (max+1), captures the current max `changeid` as a cutoff, asks it for
    /// its initial state given that cutoff, and inserts the row. Schedulers
    /// that already have a row keep their id and state untouched.
    pub async fn register_schedulers(
        &self,
        specs: &[&dyn SchedulerRegistration],
    ) -> Result<Vec<RegisteredScheduler>> {
        self.run_interaction_async(move |txn| {
            Box::pin(async move {
                let mut out = Vec::with_capacity(specs.len());
                for spec in specs {
                    let existing = self
                        .fetch_optional_txn(
                            txn,
                            "SELECT schedulerid FROM schedulers WHERE name = ?",
                            &[Bind::from(spec.name().to_string())],
                        )
                        .await?;
                    let schedulerid = if let Some(row) = existing {
                        row.try_get::<i64, _>(0)?
                    } else {
                        let schedulerid = next_id(txn, "schedulers", "schedulerid").await?;
                        let max_changeid = self
                            .fetch_all_txn(txn, "SELECT MAX(changeid) FROM changes", &[])
                            .await?
                            .first()
                            .and_then(|r| r.try_get::<Option<i64>, _>(0).ok().flatten())
                            .unwrap_or(0);
                        let state = spec.initial_state(max_changeid);
                        let state_json = serde_json::to_string(&state).map_err(|e| {
                            Error::InvariantViolation(format!("encode scheduler state: {e}"))
                        })?;
                        self.exec_txn(
                            txn,
                            "INSERT INTO schedulers (schedulerid, name, state) VALUES (?,?,?)",
                            &[
                                Bind::Int(schedulerid),
                                Bind::from(spec.name().to_string()),
                                Bind::from(state_json),
                            ],
                        )
                        .await?;
                        schedulerid
                    };
                    out.push(RegisteredScheduler { schedulerid, name: spec.name().to_string() });
                }
                Ok(out)
            })
        })
        .await
    }

    pub async fn get_state(
        &self,
        txn: &mut Txn<'_>,
        schedulerid: i64,
    ) -> Result<serde_json::Value> {
        let row = self
            .fetch_optional_txn(
                txn,
                "SELECT state FROM schedulers WHERE schedulerid = ?",
                &[Bind::Int(schedulerid)],
            )
            .await?
            .ok_or_else(|| {
                Error::InvariantViolation(format!("no scheduler row for id {schedulerid}"))
            })?;
        let state_json: String = row.try_get(0)?;
        serde_json::from_str(&state_json)
            .map_err(|e| Error::InvariantViolation(format!("decode scheduler state: {e}")))
    }

    pub async fn set_state(
        &self,
        txn: &mut Txn<'_>,
        schedulerid: i64,
        state: &serde_json::Value,
    ) -> Result<()> {
        let state_json = serde_json::to_string(state)
            .map_err(|e| Error::InvariantViolation(format!("encode scheduler state: {e}")))?;
        self.exec_txn(
            txn,
            "UPDATE schedulers SET state = ? WHERE schedulerid = ?",
            &[Bind::from(state_json), Bind::Int(schedulerid)],
        )
        .await?;
        Ok(())
    }

    pub async fn classify_change(
        &self,
        txn: &mut Txn<'_>,
        schedulerid: i64,
        changeid: i64,
        important: bool,
    ) -> Result<()> {
        self.exec_txn(
            txn,
            "INSERT INTO scheduler_changes (schedulerid, changeid, important) VALUES (?,?,?)",
            &[Bind::Int(schedulerid), Bind::Int(changeid), Bind::from(important)],
        )
        .await?;
        Ok(())
    }

    /// `(important, unimportant)`, joined with the Change store. Neither list
    /// has a specific order beyond what the caller imposes.
    pub async fn get_classified_changes(
        &self,
        txn: &mut Txn<'_>,
        schedulerid: i64,
    ) -> Result<(Vec<Arc<Change>>, Vec<Arc<Change>>)> {
        let rows = self
            .fetch_all_txn(
                txn,
                "SELECT changeid, important FROM scheduler_changes WHERE schedulerid = ?",
                &[Bind::Int(schedulerid)],
            )
            .await?;
        let mut important = Vec::new();
        let mut unimportant = Vec::new();
        for row in rows {
            let changeid: i64 = row.try_get(0)?;
            let is_important: i64 = row.try_get(1)?;
            let Some(change) = self.get_change_in_txn(txn, changeid).await? else {
                continue;
            };
            if is_important != 0 {
                important.push(change);
            } else {
                unimportant.push(change);
            }
        }
        Ok((important, unimportant))
    }

    pub async fn retire_changes(
        &self,
        txn: &mut Txn<'_>,
        schedulerid: i64,
        changeids: &[i64],
    ) -> Result<()> {
        if changeids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "DELETE FROM scheduler_changes WHERE schedulerid = ? AND changeid IN {}",
            self.placeholders(changeids.len())
        );
        let mut binds = vec![Bind::Int(schedulerid)];
        binds.extend(changeids.iter().map(|id| Bind::Int(*id)));
        self.exec_txn(txn, &sql, &binds).await?;
        Ok(())
    }

    pub async fn subscribe_to_buildset(
        &self,
        txn: &mut Txn<'_>,
        schedulerid: i64,
        bsid: i64,
    ) -> Result<()> {
        self.exec_txn(
            txn,
            "INSERT INTO scheduler_upstream_buildsets (buildsetid, schedulerid, active) \
             VALUES (?,?,1)",
            &[Bind::Int(bsid), Bind::Int(schedulerid)],
        )
        .await?;
        Ok(())
    }

    /// Only `active=1` rows.
    pub async fn get_subscribed_buildsets(
        &self,
        txn: &mut Txn<'_>,
        schedulerid: i64,
    ) -> Result<Vec<SubscribedBuildset>> {
        let rows = self
            .fetch_all_txn(
                txn,
                "SELECT bs.id, bs.sourcestampid, bs.complete, bs.results \
                 FROM scheduler_upstream_buildsets AS s, buildsets AS bs \
                 WHERE s.buildsetid = bs.id AND s.schedulerid = ? AND s.active = 1",
                &[Bind::Int(schedulerid)],
            )
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let bsid: i64 = row.try_get(0)?;
            let ssid: i64 = row.try_get(1)?;
            let complete: i64 = row.try_get(2)?;
            let results: Option<i64> = row.try_get(3)?;
            out.push(SubscribedBuildset {
                bsid,
                ssid,
                complete: complete != 0,
                results: results.and_then(BuildResult::from_i64),
            });
        }
        Ok(out)
    }

    pub async fn unsubscribe_buildset(
        &self,
        txn: &mut Txn<'_>,
        schedulerid: i64,
        bsid: i64,
    ) -> Result<()> {
        self.exec_txn(
            txn,
            "UPDATE scheduler_upstream_buildsets SET active = 0 \
             WHERE buildsetid = ? AND schedulerid = ?",
            &[Bind::Int(bsid), Bind::Int(schedulerid)],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: String,
    }
    impl SchedulerRegistration for Fixed {
        fn name(&self) -> &str {
            &self.name
        }
        fn initial_state(&self, max_changeid_at_registration: i64) -> serde_json::Value {
            serde_json::json!({ "last_processed": max_changeid_at_registration })
        }
    }

    async fn connector() -> Arc<Connector> {
        Connector::open("sqlite::memory:", None).await.unwrap()
    }

    #[tokio::test]
    async fn register_is_idempotent_on_name() {
        let conn = connector().await;
        let spec = Fixed { name: "U".into() };
        let first = conn.register_schedulers(&[&spec]).await.unwrap();
        let second = conn.register_schedulers(&[&spec]).await.unwrap();
        assert_eq!(first[0].schedulerid, second[0].schedulerid);
    }

    #[tokio::test]
    async fn set_state_then_get_state_round_trips() {
        let conn = connector().await;
        let spec = Fixed { name: "U".into() };
        let reg = conn.register_schedulers(&[&spec]).await.unwrap()[0].clone();

        conn.run_interaction_async(|txn| {
            Box::pin(async move {
                conn.set_state(txn, reg.schedulerid, &serde_json::json!({"x": 1})).await
            })
        })
        .await
        .unwrap();

        let state = conn
            .run_interaction_async(|txn| Box::pin(conn.get_state(txn, reg.schedulerid)))
            .await
            .unwrap();
        assert_eq!(state, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn classify_then_retire_changes() {
        let conn = connector().await;
        let spec = Fixed { name: "U".into() };
        let reg = conn.register_schedulers(&[&spec]).await.unwrap()[0].clone();
        let c1 = conn
            .add_change(crate::changes::NewChange { who: "a".into(), ..Default::default() })
            .await
            .unwrap();

        conn.run_interaction_async(|txn| {
            Box::pin(conn.classify_change(txn, reg.schedulerid, c1.changeid, true))
        })
        .await
        .unwrap();

        let (important, unimportant) = conn
            .run_interaction_async(|txn| Box::pin(conn.get_classified_changes(txn, reg.schedulerid)))
            .await
            .unwrap();
        assert_eq!(important.len(), 1);
        assert!(unimportant.is_empty());

        conn.run_interaction_async(|txn| {
            Box::pin(conn.retire_changes(txn, reg.schedulerid, &[c1.changeid]))
        })
        .await
        .unwrap();

        let (important, _) = conn
            .run_interaction_async(|txn| Box::pin(conn.get_classified_changes(txn, reg.schedulerid)))
            .await
            .unwrap();
        assert!(important.is_empty());
    }
}
