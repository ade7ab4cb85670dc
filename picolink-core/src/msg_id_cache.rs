use std::collections::{HashMap, HashSet};

use crate::addr::LinkAddr;
use crate::error::{Error, Result};

/// Associative per-peer message ID cache.
///
/// Tracks recent message IDs from all peers and detects duplicates, the
/// first half of the replay defense (the second half is the timestamp
/// window).
///
/// The cache is tick-driven: the owner calls [`tick`] once per configured
/// time unit (the runtime layer wires this to a timer). An entry inserted
/// at some point survives between `max_age` and `max_age + 1` ticks.
///
/// [`tick`]: MsgIdCache::tick
#[derive(Debug)]
pub struct MsgIdCache {
    max_age: u8,

    /// Tick counter, used instead of timestamps.
    tick_num: u16,

    /// Mapping address -> tick of expiry -> set of message IDs.
    cache: HashMap<LinkAddr, HashMap<u16, HashSet<u16>>>,
}

impl MsgIdCache {
    /// Constructs a new cache.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArg` if `max_age` is zero.
    pub fn new(max_age: u8) -> Result<Self> {
        if max_age == 0 {
            return Err(Error::InvalidArg);
        }
        Ok(MsgIdCache {
            max_age,
            tick_num: 0,
            cache: HashMap::new(),
        })
    }

    /// Inserts a new entry if not already present.
    ///
    /// Returns false when the pair is already cached (duplicate).
    pub fn insert(&mut self, addr: &LinkAddr, id: u16) -> bool {
        let buckets = self.cache.entry(addr.clone()).or_default();

        if buckets.values().any(|ids| ids.contains(&id)) {
            return false;
        }

        let expiry = self.tick_num.wrapping_add(u16::from(self.max_age) + 1);
        buckets.entry(expiry).or_default().insert(id);
        true
    }

    /// Advances the tick counter and drops expired entries.
    pub fn tick(&mut self) {
        self.tick_num = self.tick_num.wrapping_add(1);
        let tick_num = self.tick_num;
        self.cache.retain(|_, buckets| {
            buckets.remove(&tick_num);
            !buckets.is_empty()
        });
    }
}
