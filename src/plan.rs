//! Deterministic shard allocation.
//!
//! Pure function mapping (total shard count, shards-per-worker) to an
//! ordered, non-overlapping set of contiguous ranges. Identical inputs
//! always produce identical output, so re-planning after a partial failure
//! never reshuffles unaffected workers.

use crate::error::OrchestratorError;

/// One worker's slice of the shard space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRange {
    /// Worker id, unique for the orchestrator's lifetime and reused across
    /// respawns of the same range.
    pub worker_id: u32,
    /// First shard id (inclusive).
    pub start: u32,
    /// Last shard id (exclusive).
    pub end: u32,
}

impl ShardRange {
    /// Shard ids in ascending order.
    pub fn shard_ids(&self) -> impl Iterator<Item = u32> {
        self.start..self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split `[0, total)` into contiguous ranges of at most `per_worker` shards.
///
/// `None` means a single worker takes every shard. The final range is
/// shorter than `per_worker` when `total` is not evenly divisible.
pub fn plan(total: u32, per_worker: Option<u32>) -> Result<Vec<ShardRange>, OrchestratorError> {
    let per_worker = per_worker.unwrap_or(total);
    if total < 1 || per_worker < 1 {
        return Err(OrchestratorError::InvalidPlan { total, per_worker });
    }

    let worker_count = total.div_ceil(per_worker);
    let mut ranges = Vec::with_capacity(worker_count.min(1024) as usize);
    for worker_id in 0..worker_count {
        // start < total always holds; start + per_worker can exceed u32.
        let start = worker_id * per_worker;
        let end = start.saturating_add(per_worker).min(total);
        ranges.push(ShardRange {
            worker_id,
            start,
            end,
        });
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ranges: &[ShardRange]) -> Vec<Vec<u32>> {
        ranges.iter().map(|r| r.shard_ids().collect()).collect()
    }

    #[test]
    fn even_split() {
        let ranges = plan(6, Some(3)).unwrap();
        assert_eq!(ids(&ranges), vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[test]
    fn remainder_goes_to_short_final_range() {
        let ranges = plan(7, Some(3)).unwrap();
        assert_eq!(ids(&ranges), vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[test]
    fn absent_per_worker_means_single_worker() {
        assert_eq!(plan(5, None).unwrap(), plan(5, Some(5)).unwrap());
        let ranges = plan(5, None).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ids(&ranges), vec![vec![0, 1, 2, 3, 4]]);
    }

    #[test]
    fn invalid_inputs_rejected() {
        assert!(matches!(
            plan(0, Some(3)),
            Err(OrchestratorError::InvalidPlan { total: 0, .. })
        ));
        assert!(matches!(
            plan(4, Some(0)),
            Err(OrchestratorError::InvalidPlan { per_worker: 0, .. })
        ));
        assert!(matches!(plan(0, None), Err(_)));
    }

    #[test]
    fn partition_property_holds_over_a_grid() {
        for total in 1..64u32 {
            for per_worker in 1..=total {
                let ranges = plan(total, Some(per_worker)).unwrap();

                // Ascending, contiguous, non-empty, length <= per_worker.
                let mut next = 0u32;
                for (i, r) in ranges.iter().enumerate() {
                    assert_eq!(r.worker_id, i as u32);
                    assert_eq!(r.start, next, "gap or overlap at worker {i}");
                    assert!(!r.is_empty());
                    assert!(r.len() <= per_worker);
                    next = r.end;
                }
                // Union covers exactly [0, total).
                assert_eq!(next, total);
            }
        }
    }

    #[test]
    fn extreme_totals_near_u32_max_do_not_overflow() {
        let ranges = plan(u32::MAX, Some(u32::MAX - 1)).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[0].end, u32::MAX - 1);
        assert_eq!(ranges[1].start, u32::MAX - 1);
        assert_eq!(ranges[1].end, u32::MAX);
        assert_eq!(ranges[1].len(), 1);

        let all = plan(u32::MAX, Some(u32::MAX)).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].len(), u32::MAX);
        assert_eq!(plan(u32::MAX, None).unwrap(), all);
    }

    #[test]
    fn identical_inputs_give_identical_output() {
        let a = plan(19, Some(4)).unwrap();
        let b = plan(19, Some(4)).unwrap();
        assert_eq!(a, b);
    }
}
