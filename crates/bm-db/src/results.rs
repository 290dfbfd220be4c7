//! Build result codes.
//!
//! Stored as the `results` column on `buildrequests` and `buildsets` (`NULL`
//! until the row completes). Values match the canonical buildbot status
//! codes `examine_buildset`/`_check_buildset` compare against — the result
//! constants lived in `buildbot.status.builder`, which the retrieved
//! `original_source/` snapshot doesn't carry, so the numbering here follows
//! upstream buildbot's well-known `SUCCESS=0 .. RETRY=5` ordering.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResult {
    Success,
    Warnings,
    Failure,
    Skipped,
    Exception,
    Retry,
}

impl BuildResult {
    /// `true` for the two codes `examine_buildset`/the roll-up treat as
    /// "good enough to call the buildset successful" (`spec.md` §4.4 step 2,
    /// §4.5.1).
    pub fn is_successful(self) -> bool {
        matches!(self, BuildResult::Success | BuildResult::Warnings)
    }

    pub fn as_i64(self) -> i64 {
        match self {
            BuildResult::Success => 0,
            BuildResult::Warnings => 1,
            BuildResult::Failure => 2,
            BuildResult::Skipped => 3,
            BuildResult::Exception => 4,
            BuildResult::Retry => 5,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(BuildResult::Success),
            1 => Some(BuildResult::Warnings),
            2 => Some(BuildResult::Failure),
            3 => Some(BuildResult::Skipped),
            4 => Some(BuildResult::Exception),
            5 => Some(BuildResult::Retry),
            _ => None,
        }
    }
}
