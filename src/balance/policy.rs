//! Which history breakpoint is safe to persist as a snapshot.

use chrono::{DateTime, Duration, Utc};

use crate::engine::{EngineResult, GrantBurnDownHistory};
use crate::snapshot::Snapshot;

/// The snapshot at the start of the latest segment that began more than
/// `grace` before `now`.
///
/// Anything later may still change through backdated grants, voids, resets
/// or late usage.
pub fn select_snapshot(
    history: &GrantBurnDownHistory,
    now: DateTime<Utc>,
    grace: Duration,
) -> EngineResult<Option<Snapshot>> {
    let cutoff = now - grace;
    history
        .segments()
        .iter()
        .rposition(|segment| segment.period.from < cutoff)
        .map(|index| history.snapshot_at_start_of_segment(index))
        .transpose()
}
