//! Causal consistency clock
//!
//! Tracks the newest `operationTime` and `$clusterTime` a session has observed.
//! Both only move forward; stale values from late replies are ignored.

use bson::{Document, Timestamp};
use parking_lot::RwLock;

#[inline]
fn order_key(ts: Timestamp) -> (u32, u32) {
    (ts.time, ts.increment)
}

/// Whether `candidate` is strictly newer than `current`
pub fn is_newer(candidate: Timestamp, current: Option<Timestamp>) -> bool {
    current.map_or(true, |cur| order_key(candidate) > order_key(cur))
}

/// A `$clusterTime` document together with its embedded timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTime {
    timestamp: Timestamp,
    document: Document,
}

impl ClusterTime {
    /// Parse the `$clusterTime` field of a reply. Returns `None` when the
    /// document carries no `clusterTime` timestamp.
    pub fn from_document(document: Document) -> Option<Self> {
        let timestamp = document.get_timestamp("clusterTime").ok()?;
        Some(Self {
            timestamp,
            document,
        })
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The document as gossiped back to the server, signature included
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn is_newer_than(&self, other: Option<&ClusterTime>) -> bool {
        is_newer(self.timestamp, other.map(ClusterTime::timestamp))
    }

    /// The newer of two optional cluster times
    pub fn max(a: Option<&ClusterTime>, b: Option<&ClusterTime>) -> Option<ClusterTime> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if b.is_newer_than(Some(a)) { b.clone() } else { a.clone() }),
            (Some(a), None) => Some(a.clone()),
            (None, b) => b.cloned(),
        }
    }
}

/// Per-session causal state
#[derive(Debug, Clone, Default)]
pub struct CausalState {
    operation_time: Option<Timestamp>,
    cluster_time: Option<ClusterTime>,
}

impl CausalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Move operationTime forward. Returns `false` if `ts` is not strictly newer.
    pub fn advance_operation_time(&mut self, ts: Timestamp) -> bool {
        if !is_newer(ts, self.operation_time) {
            return false;
        }
        self.operation_time = Some(ts);
        true
    }

    /// Move `$clusterTime` forward. Returns `false` if `ct` is not strictly newer.
    pub fn advance_cluster_time(&mut self, ct: &ClusterTime) -> bool {
        if !ct.is_newer_than(self.cluster_time.as_ref()) {
            return false;
        }
        self.cluster_time = Some(ct.clone());
        true
    }
}

/// Client-wide `$clusterTime`, gossiped across all sessions of a client
#[derive(Debug, Default)]
pub struct ClusterClock {
    current: RwLock<Option<ClusterTime>>,
}

impl ClusterClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<ClusterTime> {
        self.current.read().clone()
    }

    pub fn advance(&self, ct: &ClusterTime) {
        let mut current = self.current.write();
        if ct.is_newer_than(current.as_ref()) {
            *current = Some(ct.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use proptest::prelude::*;

    fn ts(time: u32, increment: u32) -> Timestamp {
        Timestamp { time, increment }
    }

    fn cluster_time(time: u32, increment: u32) -> ClusterTime {
        ClusterTime::from_document(doc! {
            "clusterTime": ts(time, increment),
            "signature": { "keyId": 0_i64 },
        })
        .unwrap()
    }

    #[test]
    fn test_operation_time_ordering() {
        let mut state = CausalState::new();
        assert!(state.operation_time().is_none());

        assert!(state.advance_operation_time(ts(10, 2)));
        assert!(!state.advance_operation_time(ts(10, 2)));
        assert!(!state.advance_operation_time(ts(10, 1)));
        assert!(!state.advance_operation_time(ts(9, 99)));
        assert!(state.advance_operation_time(ts(10, 3)));
        assert_eq!(state.operation_time(), Some(ts(10, 3)));
    }

    #[test]
    fn test_cluster_time_ordering() {
        let mut state = CausalState::new();
        assert!(state.advance_cluster_time(&cluster_time(5, 1)));
        assert!(!state.advance_cluster_time(&cluster_time(4, 9)));
        assert_eq!(state.cluster_time().unwrap().timestamp(), ts(5, 1));
    }

    #[test]
    fn test_cluster_time_requires_timestamp() {
        assert!(ClusterTime::from_document(doc! { "clusterTime": 5 }).is_none());
        assert!(ClusterTime::from_document(doc! {}).is_none());
    }

    #[test]
    fn test_cluster_clock() {
        let clock = ClusterClock::new();
        assert!(clock.get().is_none());

        clock.advance(&cluster_time(3, 0));
        clock.advance(&cluster_time(2, 0));
        assert_eq!(clock.get().unwrap().timestamp(), ts(3, 0));

        let max = ClusterTime::max(Some(&cluster_time(1, 0)), clock.get().as_ref());
        assert_eq!(max.unwrap().timestamp(), ts(3, 0));
    }

    proptest! {
        #[test]
        fn prop_operation_time_is_running_max(updates in prop::collection::vec((0u32..50, 0u32..5), 1..40)) {
            let mut state = CausalState::new();
            for &(time, increment) in &updates {
                state.advance_operation_time(ts(time, increment));
            }
            let expected = updates.iter().copied().max().unwrap();
            prop_assert_eq!(state.operation_time(), Some(ts(expected.0, expected.1)));
        }
    }
}
