//! BuildSet / BuildRequest / Build store.
//!
//! Grounded on `original_source/buildbot/db.py::create_buildset`,
//! `get_unclaimed_buildrequests`, `claim_buildrequests`,
//! `resubmit_buildrequests`, `build_started`, `builds_finished`,
//! `get_build_info`, `get_buildnums_for_brid`, `retire_buildrequests` /
//! `_txn_retire_buildreqs` / `_check_buildset`, `get_buildrequestids_for_buildset`,
//! `examine_buildset` / `_txn_examine_buildset`, `get_active_buildset_ids`,
//! `get_buildset_info`.

use std::collections::BTreeMap;

use sqlx::Row;

use crate::changes::PropertyValue;
use crate::connector::{next_id, Bind, Connector, Txn};
use crate::error::{Error, Result};
use crate::notify::Category;
use crate::results::BuildResult;

/// One builder a new buildset should dispatch a buildrequest to.
#[derive(Debug, Clone)]
pub struct RequestedBuild {
    pub buildername: String,
    pub priority: i64,
}

/// A buildset not yet persisted: a sourcestamp, a reason, and the builders
/// it should fan out a buildrequest to.
#[derive(Debug, Clone, Default)]
pub struct NewBuildSet {
    pub external_idstring: Option<String>,
    pub reason: Option<String>,
    pub sourcestampid: i64,
    pub properties: BTreeMap<String, PropertyValue>,
    pub builders: Vec<RequestedBuild>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildSetInfo {
    pub bsid: i64,
    pub external_idstring: Option<String>,
    pub reason: Option<String>,
    pub sourcestampid: i64,
    pub submitted_at: i64,
    pub complete: bool,
    pub complete_at: Option<i64>,
    pub results: Option<BuildResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequestRow {
    pub brid: i64,
    pub buildsetid: i64,
    pub buildername: String,
    pub priority: i64,
    pub submitted_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildInfo {
    pub id: i64,
    pub number: i64,
    pub brid: i64,
    pub start_time: i64,
    pub finish_time: Option<i64>,
}

impl Connector {
    /// Inserts the buildset, its properties, and one buildrequest per
    /// builder, all in one transaction. Notifies `add-buildset` and
    /// `add-buildrequest` once committed.
    pub async fn create_buildset(&self, bs: NewBuildSet) -> Result<i64> {
        let now = self.now();
        let builder_count = bs.builders.len();
        let bsid = self
            .run_interaction_async(move |txn| Box::pin(self.insert_buildset(txn, bs, now)))
            .await?;

        self.notify(Category::AddBuildset, vec![bsid]).await;
        if builder_count > 0 {
            let brids = self.get_buildrequestids_for_buildset(bsid).await?;
            self.notify(Category::AddBuildrequest, brids).await;
        }
        Ok(bsid)
    }

    async fn insert_buildset(&self, txn: &mut Txn<'_>, bs: NewBuildSet, now: i64) -> Result<i64> {
        let bsid = next_id(txn, "buildsets", "id").await?;
        self.exec_txn(
            txn,
            "INSERT INTO buildsets \
                (id, external_idstring, reason, sourcestampid, submitted_at, complete) \
             VALUES (?,?,?,?,?,0)",
            &[
                Bind::Int(bsid),
                Bind::from(bs.external_idstring.clone()),
                Bind::from(bs.reason.clone()),
                Bind::Int(bs.sourcestampid),
                Bind::Int(now),
            ],
        )
        .await?;

        for (name, prop) in &bs.properties {
            let encoded = serde_json::to_string(&(&prop.value, &prop.source))
                .map_err(|e| Error::InvariantViolation(format!("encode property {name}: {e}")))?;
            self.exec_txn(
                txn,
                "INSERT INTO buildset_properties (buildsetid, property_name, property_value) \
                 VALUES (?,?,?)",
                &[Bind::Int(bsid), Bind::from(name.clone()), Bind::from(encoded)],
            )
            .await?;
        }

        for builder in &bs.builders {
            let brid = next_id(txn, "buildrequests", "id").await?;
            self.exec_txn(
                txn,
                "INSERT INTO buildrequests \
                    (id, buildsetid, buildername, priority, claimed_at, complete, submitted_at) \
                 VALUES (?,?,?,?,0,0,?)",
                &[
                    Bind::Int(brid),
                    Bind::Int(bsid),
                    Bind::from(builder.buildername.clone()),
                    Bind::Int(builder.priority),
                    Bind::Int(now),
                ],
            )
            .await?;
        }

        Ok(bsid)
    }

    /// Buildrequests for `buildername` that are either untouched or whose
    /// claim has gone stale: either `claimed_at < stale_before`, or the claim
    /// is held under `master_name` but a different incarnation (a prior,
    /// crashed run of this same master — safe to reclaim immediately since
    /// no other process can still be acting on it). Ordered by priority
    /// descending, then submission order.
    pub async fn get_unclaimed_buildrequests(
        &self,
        buildername: &str,
        stale_before: i64,
        master_name: &str,
        master_incarnation: &str,
    ) -> Result<Vec<BuildRequestRow>> {
        let rows = self
            .run_query_async(
                "SELECT id, buildsetid, buildername, priority, submitted_at \
                 FROM buildrequests \
                 WHERE buildername = ? AND complete = 0 \
                   AND (claimed_at < ? \
                        OR (claimed_by_name = ? AND claimed_by_incarnation <> ?)) \
                 ORDER BY priority DESC, submitted_at ASC",
                &[
                    Bind::from(buildername.to_string()),
                    Bind::Int(stale_before),
                    Bind::from(master_name.to_string()),
                    Bind::from(master_incarnation.to_string()),
                ],
            )
            .await?;
        rows.into_iter().map(Self::build_request_row).collect()
    }

    fn build_request_row(row: sqlx::any::AnyRow) -> Result<BuildRequestRow> {
        Ok(BuildRequestRow {
            brid: row.try_get(0)?,
            buildsetid: row.try_get(1)?,
            buildername: row.try_get(2)?,
            priority: row.try_get(3)?,
            submitted_at: row.try_get(4)?,
        })
    }

    /// Unconditionally stamps the given buildrequests as claimed. No
    /// compare-and-swap against the previous claim: callers are expected to
    /// have already selected a disjoint set via
    /// [`Connector::get_unclaimed_buildrequests`] inside the same logical
    /// step, matching the original's literal `UPDATE ... WHERE id IN (...)`.
    pub async fn claim_buildrequests(
        &self,
        brids: &[i64],
        claimed_by_name: &str,
        incarnation: &str,
    ) -> Result<()> {
        if brids.is_empty() {
            return Ok(());
        }
        let now = self.now();
        let sql = format!(
            "UPDATE buildrequests SET claimed_at = ?, claimed_by_name = ?, \
                claimed_by_incarnation = ? WHERE id IN {}",
            self.placeholders(brids.len())
        );
        let mut binds = vec![
            Bind::Int(now),
            Bind::from(claimed_by_name.to_string()),
            Bind::from(incarnation.to_string()),
        ];
        binds.extend(brids.iter().map(|id| Bind::Int(*id)));
        self.run_query_async(&sql, &binds).await?;
        Ok(())
    }

    /// Clears a claim without touching `submitted_at` or `priority`, so a
    /// resubmitted request keeps its place in the queue. Notifies
    /// `add-buildrequest` for each, since it re-enters the unclaimed pool.
    pub async fn resubmit_buildrequests(&self, brids: &[i64]) -> Result<()> {
        if brids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE buildrequests SET claimed_at = 0, claimed_by_name = NULL, \
                claimed_by_incarnation = NULL WHERE id IN {} AND complete = 0",
            self.placeholders(brids.len())
        );
        let binds: Vec<Bind> = brids.iter().map(|id| Bind::Int(*id)).collect();
        self.run_query_async(&sql, &binds).await?;
        self.notify(Category::AddBuildrequest, brids.to_vec()).await;
        Ok(())
    }

    /// Allocates a build row under a builder-assigned build `number` and
    /// records its start time. Notifies `add-build`.
    pub async fn build_started(&self, brid: i64, number: i64, start_time: i64) -> Result<i64> {
        let id = self
            .run_interaction_async(move |txn| {
                Box::pin(async move {
                    let id = next_id(txn, "builds", "id").await?;
                    self.exec_txn(
                        txn,
                        "INSERT INTO builds (id, number, brid, start_time, finish_time) \
                         VALUES (?,?,?,?,NULL)",
                        &[Bind::Int(id), Bind::Int(number), Bind::Int(brid), Bind::Int(start_time)],
                    )
                    .await?;
                    Ok(id)
                })
            })
            .await?;
        self.notify(Category::AddBuild, vec![id]).await;
        Ok(id)
    }

    pub async fn builds_finished(&self, bids: &[i64], finish_time: i64) -> Result<()> {
        if bids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE builds SET finish_time = ? WHERE id IN {}",
            self.placeholders(bids.len())
        );
        let mut binds = vec![Bind::Int(finish_time)];
        binds.extend(bids.iter().map(|id| Bind::Int(*id)));
        self.run_query_async(&sql, &binds).await?;
        Ok(())
    }

    pub async fn get_build_info(&self, bid: i64) -> Result<Option<BuildInfo>> {
        let rows = self
            .run_query_async(
                "SELECT id, number, brid, start_time, finish_time FROM builds WHERE id = ?",
                &[Bind::Int(bid)],
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        Ok(Some(BuildInfo {
            id: row.try_get(0)?,
            number: row.try_get(1)?,
            brid: row.try_get(2)?,
            start_time: row.try_get(3)?,
            finish_time: row.try_get(4)?,
        }))
    }

    pub async fn get_buildnums_for_brid(&self, brid: i64) -> Result<Vec<i64>> {
        let rows = self
            .run_query_async(
                "SELECT number FROM builds WHERE brid = ? ORDER BY number ASC",
                &[Bind::Int(brid)],
            )
            .await?;
        rows.into_iter().map(|r| Ok(r.try_get(0)?)).collect()
    }

    /// Marks each buildrequest complete with `results`, then rolls each
    /// touched buildset's completion up: a buildset becomes complete once
    /// every one of its buildrequests is complete, with `results = Failure`
    /// if any buildrequest failed, else `Success`. Notifies
    /// `retire-buildrequest` for every request in `brids` and
    /// `modify-buildset` for each buildset that became complete as a result.
    /// Returns those newly-complete bsids.
    pub async fn retire_buildrequests(
        &self,
        brids: &[i64],
        results: BuildResult,
    ) -> Result<Vec<i64>> {
        if brids.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.now();
        let brids_vec = brids.to_vec();
        let newly_complete = self
            .run_interaction_async(move |txn| {
                Box::pin(async move {
                    let mut bsids = Vec::new();
                    for &brid in &brids_vec {
                        let row = self
                            .fetch_optional_txn(
                                txn,
                                "SELECT buildsetid FROM buildrequests WHERE id = ?",
                                &[Bind::Int(brid)],
                            )
                            .await?;
                        let Some(row) = row else { continue };
                        let bsid: i64 = row.try_get(0)?;
                        if !bsids.contains(&bsid) {
                            bsids.push(bsid);
                        }
                        self.exec_txn(
                            txn,
                            "UPDATE buildrequests SET complete = 1, results = ?, complete_at = ? \
                             WHERE id = ?",
                            &[Bind::Int(results.as_i64()), Bind::Int(now), Bind::Int(brid)],
                        )
                        .await?;
                    }

                    let mut newly_complete = Vec::new();
                    for bsid in bsids {
                        if self.check_buildset_complete(txn, bsid, now).await? {
                            newly_complete.push(bsid);
                        }
                    }
                    Ok(newly_complete)
                })
            })
            .await?;

        self.notify(Category::RetireBuildrequest, brids.to_vec()).await;
        if !newly_complete.is_empty() {
            self.notify(Category::ModifyBuildset, newly_complete.clone()).await;
        }
        Ok(newly_complete)
    }

    async fn check_buildset_complete(
        &self,
        txn: &mut Txn<'_>,
        bsid: i64,
        now: i64,
    ) -> Result<bool> {
        let already = self
            .fetch_optional_txn(
                txn,
                "SELECT complete FROM buildsets WHERE id = ?",
                &[Bind::Int(bsid)],
            )
            .await?
            .map(|r| r.try_get::<i64, _>(0))
            .transpose()?
            .unwrap_or(0);
        if already != 0 {
            return Ok(false);
        }

        let rows = self
            .fetch_all_txn(
                txn,
                "SELECT complete, results FROM buildrequests WHERE buildsetid = ?",
                &[Bind::Int(bsid)],
            )
            .await?;
        if rows.is_empty() || rows.iter().any(|r| matches!(r.try_get::<i64, _>(0), Ok(0))) {
            return Ok(false);
        }

        let any_failed = rows.iter().any(|r| {
            let results: Option<i64> = r.try_get(1).unwrap_or(None);
            !results.and_then(BuildResult::from_i64).map(|r| r.is_successful()).unwrap_or(false)
        });
        let bs_results = if any_failed { BuildResult::Failure } else { BuildResult::Success };

        self.exec_txn(
            txn,
            "UPDATE buildsets SET complete = 1, complete_at = ?, results = ? WHERE id = ?",
            &[Bind::Int(now), Bind::Int(bs_results.as_i64()), Bind::Int(bsid)],
        )
        .await?;
        Ok(true)
    }

    pub async fn get_buildrequestids_for_buildset(&self, bsid: i64) -> Result<Vec<i64>> {
        let rows = self
            .run_query_async(
                "SELECT id FROM buildrequests WHERE buildsetid = ?",
                &[Bind::Int(bsid)],
            )
            .await?;
        rows.into_iter().map(|r| Ok(r.try_get(0)?)).collect()
    }

    /// `(successful, finished)`. `successful` is `None` until `finished`.
    pub async fn examine_buildset(&self, bsid: i64) -> Result<(Option<bool>, bool)> {
        let info = self.get_buildset_info(bsid).await?.ok_or_else(|| {
            Error::InvariantViolation(format!("no buildset row for id {bsid}"))
        })?;
        Ok((info.results.map(BuildResult::is_successful), info.complete))
    }

    pub async fn get_active_buildset_ids(&self) -> Result<Vec<i64>> {
        let rows = self
            .run_query_async("SELECT id FROM buildsets WHERE complete = 0", &[])
            .await?;
        rows.into_iter().map(|r| Ok(r.try_get(0)?)).collect()
    }

    pub async fn get_buildset_info(&self, bsid: i64) -> Result<Option<BuildSetInfo>> {
        let rows = self
            .run_query_async(
                "SELECT id, external_idstring, reason, sourcestampid, submitted_at, \
                        complete, complete_at, results \
                 FROM buildsets WHERE id = ?",
                &[Bind::Int(bsid)],
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let complete: i64 = row.try_get(5)?;
        let results: Option<i64> = row.try_get(7)?;
        Ok(Some(BuildSetInfo {
            bsid: row.try_get(0)?,
            external_idstring: row.try_get(1)?,
            reason: row.try_get(2)?,
            sourcestampid: row.try_get(3)?,
            submitted_at: row.try_get(4)?,
            complete: complete != 0,
            complete_at: row.try_get(6)?,
            results: results.and_then(BuildResult::from_i64),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sourcestamps::NewSourceStamp;
    use std::sync::Arc;

    async fn connector() -> Arc<Connector> {
        Connector::open("sqlite::memory:", None).await.unwrap()
    }

    async fn sourcestamp(conn: &Arc<Connector>) -> i64 {
        conn.run_interaction_async(|txn| {
            Box::pin(conn.ensure_sourcestamp(txn, NewSourceStamp::default()))
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_buildset_fans_out_one_request_per_builder() {
        let conn = connector().await;
        let ssid = sourcestamp(&conn).await;
        let bsid = conn
            .create_buildset(NewBuildSet {
                sourcestampid: ssid,
                builders: vec![
                    RequestedBuild { buildername: "linux".into(), priority: 0 },
                    RequestedBuild { buildername: "mac".into(), priority: 0 },
                ],
                ..Default::default()
            })
            .await
            .unwrap();
        let brids = conn.get_buildrequestids_for_buildset(bsid).await.unwrap();
        assert_eq!(brids.len(), 2);
    }

    #[tokio::test]
    async fn claim_then_unclaimed_excludes_it() {
        let conn = connector().await;
        let ssid = sourcestamp(&conn).await;
        let bsid = conn
            .create_buildset(NewBuildSet {
                sourcestampid: ssid,
                builders: vec![RequestedBuild { buildername: "linux".into(), priority: 0 }],
                ..Default::default()
            })
            .await
            .unwrap();
        let brids = conn.get_buildrequestids_for_buildset(bsid).await.unwrap();

        let unclaimed =
            conn.get_unclaimed_buildrequests("linux", 40, "master0", "incA").await.unwrap();
        assert_eq!(unclaimed.len(), 1);

        conn.claim_buildrequests(&brids, "master1", "incA").await.unwrap();
        let unclaimed =
            conn.get_unclaimed_buildrequests("linux", 40, "master2", "incB").await.unwrap();
        assert!(unclaimed.is_empty());
    }

    #[tokio::test]
    async fn stale_claim_is_reclaimable_by_same_incarnation() {
        let conn = connector().await;
        let ssid = sourcestamp(&conn).await;
        let bsid = conn
            .create_buildset(NewBuildSet {
                sourcestampid: ssid,
                builders: vec![RequestedBuild { buildername: "linux".into(), priority: 0 }],
                ..Default::default()
            })
            .await
            .unwrap();
        let brids = conn.get_buildrequestids_for_buildset(bsid).await.unwrap();
        conn.claim_buildrequests(&brids, "master1", "incA").await.unwrap();

        // `stale_before = 0` rules out the staleness branch entirely (any
        // real claim timestamp is positive), so this can only match through
        // the same-master/different-incarnation branch.
        let reclaimable =
            conn.get_unclaimed_buildrequests("linux", 0, "master1", "incB").await.unwrap();
        assert_eq!(reclaimable.len(), 1);
    }

    #[tokio::test]
    async fn retire_buildrequests_completes_buildset_when_all_done() {
        let conn = connector().await;
        let ssid = sourcestamp(&conn).await;
        let bsid = conn
            .create_buildset(NewBuildSet {
                sourcestampid: ssid,
                builders: vec![
                    RequestedBuild { buildername: "linux".into(), priority: 0 },
                    RequestedBuild { buildername: "mac".into(), priority: 0 },
                ],
                ..Default::default()
            })
            .await
            .unwrap();
        let brids = conn.get_buildrequestids_for_buildset(bsid).await.unwrap();

        let newly_complete =
            conn.retire_buildrequests(&brids[..1], BuildResult::Success).await.unwrap();
        assert!(newly_complete.is_empty());
        let (_, finished) = conn.examine_buildset(bsid).await.unwrap();
        assert!(!finished);

        let newly_complete =
            conn.retire_buildrequests(&brids[1..], BuildResult::Failure).await.unwrap();
        assert_eq!(newly_complete, vec![bsid]);
        let (successful, finished) = conn.examine_buildset(bsid).await.unwrap();
        assert!(finished);
        assert_eq!(successful, Some(false));
    }

    #[tokio::test]
    async fn resubmit_preserves_priority_and_submitted_at() {
        let conn = connector().await;
        let ssid = sourcestamp(&conn).await;
        let bsid = conn
            .create_buildset(NewBuildSet {
                sourcestampid: ssid,
                builders: vec![RequestedBuild { buildername: "linux".into(), priority: 7 }],
                ..Default::default()
            })
            .await
            .unwrap();
        let brids = conn.get_buildrequestids_for_buildset(bsid).await.unwrap();
        conn.claim_buildrequests(&brids, "master1", "incA").await.unwrap();
        conn.resubmit_buildrequests(&brids).await.unwrap();

        let unclaimed = conn
            .get_unclaimed_buildrequests("linux", conn.now() - 60, "master2", "incB")
            .await
            .unwrap();
        assert_eq!(unclaimed.len(), 1);
        assert_eq!(unclaimed[0].priority, 7);
    }
}
