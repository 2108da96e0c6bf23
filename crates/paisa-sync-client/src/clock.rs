//! Per-table sync clock bookkeeping.
//!
//! One clock row per table: the last server clock observed locally, the last
//! successful sync timestamp, and the count of local mutations awaiting push.

use serde::{Deserialize, Serialize};

/// Clock state for one `(user, table)` pair.
///
/// `last_server_clock` is non-decreasing for the life of the pair;
/// `pending_ops` only drops when pushed operations are acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableClock {
    pub last_server_clock: i64,
    /// Epoch milliseconds of the last successful sync, 0 if never synced.
    pub last_sync_ts: i64,
    pub pending_ops: i64,
}

impl TableClock {
    /// Advance to a newer server clock. A stale value is ignored, never
    /// applied backwards.
    pub fn advance(&mut self, server_clock: i64, sync_ts: i64) {
        if server_clock > self.last_server_clock {
            self.last_server_clock = server_clock;
        }
        self.last_sync_ts = sync_ts;
    }

    /// Acknowledge `n` pushed operations, flooring at zero.
    pub fn acknowledge(&mut self, n: i64) {
        self.pending_ops = (self.pending_ops - n).max(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let mut clock = TableClock::default();
        clock.advance(5, 100);
        assert_eq!(clock.last_server_clock, 5);
        clock.advance(3, 200);
        assert_eq!(clock.last_server_clock, 5);
        assert_eq!(clock.last_sync_ts, 200);
        clock.advance(9, 300);
        assert_eq!(clock.last_server_clock, 9);
    }

    #[test]
    fn acknowledge_floors_at_zero() {
        let mut clock = TableClock {
            pending_ops: 2,
            ..Default::default()
        };
        clock.acknowledge(5);
        assert_eq!(clock.pending_ops, 0);
    }

    #[test]
    fn acknowledge_counts_down() {
        let mut clock = TableClock {
            pending_ops: 3,
            ..Default::default()
        };
        clock.acknowledge(3);
        assert_eq!(clock.pending_ops, 0);
    }
}
