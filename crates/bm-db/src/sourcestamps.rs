//! SourceStamp store: immutable `(branch, revision, optional patch,
//! associated changes)` tuples.
//!
//! Grounded on `original_source/buildbot/db.py::_txn_getSourceStampNumbered`
//! / `get_sourcestampid`.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sqlx::Row;

use crate::changes::Change;
use crate::connector::{Bind, Connector, Txn};
use crate::error::Result;

/// An immutable patch applied on top of a checkout. Stored base64-encoded
/// (`patch_base64`) so the column type may be plain text on both backends.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub id: i64,
    pub level: i64,
    pub bytes: Vec<u8>,
    pub subdir: Option<String>,
}

/// An unsaved patch — the input half of [`Patch`], before `ensure_sourcestamp`
/// assigns it an id.
#[derive(Debug, Clone)]
pub struct NewPatch {
    pub level: i64,
    pub bytes: Vec<u8>,
    pub subdir: Option<String>,
}

/// `(branch, revision, optional patch, ordered changes)`. Immutable once
/// `ssid` is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceStamp {
    pub ssid: i64,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub patch: Option<Patch>,
    pub changes: Vec<Arc<Change>>,
}

/// A sourcestamp not yet persisted.
#[derive(Debug, Clone, Default)]
pub struct NewSourceStamp {
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub patch: Option<NewPatch>,
    pub changeids: Vec<i64>,
}

impl Connector {
    /// Cache-through read by id.
    pub async fn get_sourcestamp(&self, ssid: i64) -> Result<Option<Arc<SourceStamp>>> {
        if let Some(hit) = self.sourcestamp_cache.get(&ssid) {
            return Ok(Some(hit));
        }
        let loaded = self
            .run_interaction_async(move |txn| Box::pin(self.load_sourcestamp(txn, ssid)))
            .await?;
        match loaded {
            Some(ss) => {
                let ss = Arc::new(ss);
                self.sourcestamp_cache.put(ssid, ss.clone());
                Ok(Some(ss))
            }
            None => Ok(None),
        }
    }

    async fn load_sourcestamp(&self, txn: &mut Txn<'_>, ssid: i64) -> Result<Option<SourceStamp>> {
        let rows = self
            .fetch_all_txn(
                txn,
                "SELECT branch, revision, patchid FROM sourcestamps WHERE id = ?",
                &[Bind::Int(ssid)],
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let branch: Option<String> = row.try_get(0)?;
        let revision: Option<String> = row.try_get(1)?;
        let patchid: Option<i64> = row.try_get(2)?;

        let patch = match patchid {
            Some(patchid) => {
                let prows = self
                    .fetch_all_txn(
                        txn,
                        "SELECT patchlevel, patch_base64, subdir FROM patches WHERE id = ?",
                        &[Bind::Int(patchid)],
                    )
                    .await?;
                let prow = prows
                    .into_iter()
                    .next()
                    .ok_or_else(|| crate::error::Error::InvariantViolation(format!(
                        "sourcestamp {ssid} references missing patch {patchid}"
                    )))?;
                let level: i64 = prow.try_get(0)?;
                let encoded: String = prow.try_get(1)?;
                let subdir: Option<String> = prow.try_get(2)?;
                let bytes = BASE64.decode(encoded.as_bytes()).map_err(|e| {
                    crate::error::Error::InvariantViolation(format!("decode patch {patchid}: {e}"))
                })?;
                Some(Patch { id: patchid, level, bytes, subdir })
            }
            None => None,
        };

        let changeid_rows = self
            .fetch_all_txn(
                txn,
                "SELECT changeid FROM sourcestamp_changes WHERE sourcestampid = ? \
                 ORDER BY changeid ASC",
                &[Bind::Int(ssid)],
            )
            .await?;
        let mut changes = Vec::with_capacity(changeid_rows.len());
        for r in changeid_rows {
            let changeid: i64 = r.try_get(0)?;
            if let Some(c) = self.get_change_in_txn(txn, changeid).await? {
                changes.push(c);
            }
        }

        Ok(Some(SourceStamp { ssid, branch, revision, patch, changes }))
    }

    /// If `ss` already has an assigned `ssid`, nothing is written and the
    /// caller can keep using the cached value; otherwise allocates `ssid`
    /// (and a `patchid`, if a patch is present) by the max+1 rule, writes the
    /// sourcestamp row, one `sourcestamp_changes` row per change in the
    /// order given, and returns the new id. Must run inside a caller-owned
    /// transaction since it usually accompanies `create_buildset`.
    pub async fn ensure_sourcestamp(
        &self,
        txn: &mut Txn<'_>,
        ss: NewSourceStamp,
    ) -> Result<i64> {
        let patchid = match &ss.patch {
            Some(patch) => {
                let id = crate::connector::next_id(txn, "patches", "id").await?;
                let encoded = BASE64.encode(&patch.bytes);
                self.exec_txn(
                    txn,
                    "INSERT INTO patches (id, patchlevel, patch_base64, subdir) \
                     VALUES (?,?,?,?)",
                    &[
                        Bind::Int(id),
                        Bind::Int(patch.level),
                        Bind::from(encoded),
                        Bind::from(patch.subdir.clone()),
                    ],
                )
                .await?;
                Some(id)
            }
            None => None,
        };

        let ssid = crate::connector::next_id(txn, "sourcestamps", "id").await?;
        self.exec_txn(
            txn,
            "INSERT INTO sourcestamps (id, branch, revision, patchid) VALUES (?,?,?,?)",
            &[
                Bind::Int(ssid),
                Bind::from(ss.branch.clone()),
                Bind::from(ss.revision.clone()),
                Bind::from(patchid),
            ],
        )
        .await?;

        for changeid in &ss.changeids {
            self.exec_txn(
                txn,
                "INSERT INTO sourcestamp_changes (sourcestampid, changeid) VALUES (?,?)",
                &[Bind::Int(ssid), Bind::Int(*changeid)],
            )
            .await?;
        }

        Ok(ssid)
    }
}
