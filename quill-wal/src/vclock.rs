use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// Upper bound on node ids in a replication group.
pub const VCLOCK_MAX: u32 = 32;

/// Per-origin replication progress: a sparse map from node id to the highest
/// LSN observed from that node. An absent entry is distinct from an entry
/// with value 0: the latter means the node is a known member with no rows
/// yet.
#[derive(Clone, PartialEq, Eq)]
pub struct VClock {
    lsn: [i64; VCLOCK_MAX as usize],
}

impl Default for VClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VClock {
    pub fn new() -> Self {
        VClock {
            lsn: [-1; VCLOCK_MAX as usize],
        }
    }

    pub fn get(&self, node_id: u32) -> Option<i64> {
        if node_id >= VCLOCK_MAX {
            return None;
        }
        let lsn = self.lsn[node_id as usize];
        (lsn >= 0).then_some(lsn)
    }

    pub fn has(&self, node_id: u32) -> bool {
        self.get(node_id).is_some()
    }

    /// Create the entry for a new group member with no progress yet.
    pub fn add_node(&mut self, node_id: u32) -> Result<()> {
        if node_id >= VCLOCK_MAX {
            return Err(Error::NodeIdOutOfRange(node_id));
        }
        if self.lsn[node_id as usize] < 0 {
            self.lsn[node_id as usize] = 0;
        }
        Ok(())
    }

    /// Confirm `lsn` from `node_id`. LSNs from one origin are confirmed in
    /// strictly increasing order; anything else is a logic error upstream.
    pub fn follow(&mut self, node_id: u32, lsn: i64) -> i64 {
        assert!(lsn >= 0);
        assert!(node_id < VCLOCK_MAX, "node id {node_id} out of range");
        let prev = self.lsn[node_id as usize];
        if lsn <= prev {
            panic!(
                "LSN for node {node_id} is used twice or commit order is broken: \
                 confirmed {prev}, new {lsn}"
            );
        }
        self.lsn[node_id as usize] = lsn;
        prev
    }

    /// Bump and return the next LSN for a local write.
    pub fn inc(&mut self, node_id: u32) -> i64 {
        let next = self.get(node_id).unwrap_or(0) + 1;
        self.follow(node_id, next);
        next
    }

    /// Forget a node, e.g. the bootstrap placeholder once the real node id
    /// is allocated.
    pub fn del(&mut self, node_id: u32) {
        if node_id < VCLOCK_MAX {
            self.lsn[node_id as usize] = -1;
        }
    }

    /// Componentwise max, used when seeding the frontier from a snapshot
    /// followed by an older xlog.
    pub fn merge(&mut self, with: &VClock) {
        for (node_id, lsn) in with.iter() {
            if lsn > self.lsn[node_id as usize] {
                self.lsn[node_id as usize] = lsn;
            }
        }
    }

    /// Sum of all defined entries: a total order compatible with filename
    /// sorting and with the monotonic growth of a single writer.
    pub fn signature(&self) -> i64 {
        self.iter().map(|(_, lsn)| lsn).sum()
    }

    /// True if every defined entry of `self` is covered by `other`
    /// (an entry absent in `other` counts as 0).
    pub fn le(&self, other: &VClock) -> bool {
        self.iter()
            .all(|(node_id, lsn)| lsn <= other.get(node_id).unwrap_or(0))
    }

    /// Componentwise partial order; `None` for incomparable clocks.
    pub fn partial_cmp(&self, other: &VClock) -> Option<Ordering> {
        let mut le = true;
        let mut ge = true;
        for node_id in 0..VCLOCK_MAX as usize {
            let a = self.lsn[node_id].max(0);
            let b = other.lsn[node_id].max(0);
            le &= a <= b;
            ge &= a >= b;
        }
        match (le, ge) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, i64)> + '_ {
        self.lsn
            .iter()
            .enumerate()
            .filter(|(_, lsn)| **lsn >= 0)
            .map(|(node_id, lsn)| (node_id as u32, *lsn))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Parse the compact `{id: lsn, ...}` form used in segment preambles.
    pub fn parse(s: &str) -> Result<VClock> {
        let bad = || Error::VclockFormat(s.to_string());
        let body = s
            .trim()
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(bad)?;
        let mut vclock = VClock::new();
        for pair in body.split(',') {
            if pair.trim().is_empty() {
                continue;
            }
            let (id, lsn) = pair.split_once(':').ok_or_else(bad)?;
            let id: u32 = id.trim().parse().map_err(|_| bad())?;
            let lsn: i64 = lsn.trim().parse().map_err(|_| bad())?;
            if id >= VCLOCK_MAX || lsn < 0 || vclock.has(id) {
                return Err(bad());
            }
            vclock.lsn[id as usize] = lsn;
        }
        Ok(vclock)
    }
}

impl fmt::Display for VClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (node_id, lsn)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{node_id}: {lsn}")?;
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for VClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_advances_and_returns_prev() {
        let mut v = VClock::new();
        assert_eq!(v.follow(1, 10), -1);
        assert_eq!(v.follow(1, 11), 10);
        assert_eq!(v.get(1), Some(11));
        assert_eq!(v.get(2), None);
    }

    #[test]
    #[should_panic]
    fn follow_rejects_stale_lsn() {
        let mut v = VClock::new();
        v.follow(1, 10);
        v.follow(1, 10);
    }

    #[test]
    fn added_node_is_present_with_zero() {
        let mut v = VClock::new();
        v.add_node(3).unwrap();
        assert_eq!(v.get(3), Some(0));
        assert_eq!(v.signature(), 0);
        assert_eq!(v.inc(3), 1);
    }

    #[test]
    fn node_id_bounds() {
        let mut v = VClock::new();
        assert!(v.add_node(VCLOCK_MAX).is_err());
        assert_eq!(v.get(VCLOCK_MAX + 1), None);
    }

    #[test]
    fn signature_sums_defined_entries() {
        let mut v = VClock::new();
        v.follow(0, 4);
        v.follow(7, 6);
        assert_eq!(v.signature(), 10);
    }

    #[test]
    fn partial_order() {
        let mut a = VClock::new();
        let mut b = VClock::new();
        a.follow(1, 2);
        b.follow(1, 3);
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Less));
        b.follow(2, 1);
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Less));
        a.follow(3, 5);
        assert_eq!(a.partial_cmp(&b), None);
        assert_eq!(a.partial_cmp(&a.clone()), Some(Ordering::Equal));
    }

    #[test]
    fn le_treats_absent_as_zero() {
        let mut file = VClock::new();
        let key = VClock::new();
        assert!(file.le(&key));
        file.add_node(1).unwrap();
        assert!(file.le(&key));
        file.follow(1, 1);
        assert!(!file.le(&key));
    }

    #[test]
    fn merge_takes_componentwise_max() {
        let mut a = VClock::parse("{1: 5, 2: 1}").unwrap();
        let b = VClock::parse("{2: 7, 3: 2}").unwrap();
        a.merge(&b);
        assert_eq!(a, VClock::parse("{1: 5, 2: 7, 3: 2}").unwrap());
    }

    #[test]
    fn format_parse_round_trip() {
        for s in ["{}", "{0: 1}", "{1: 10, 3: 4, 31: 9000000000}"] {
            let v = VClock::parse(s).unwrap();
            assert_eq!(v.to_string(), s);
            assert_eq!(VClock::parse(&v.to_string()).unwrap(), v);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        for s in ["", "{1: }", "{1 2}", "{32: 1}", "{1: -4}", "{1: 1, 1: 2}"] {
            assert!(VClock::parse(s).is_err(), "{s}");
        }
    }
}
