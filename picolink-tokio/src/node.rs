use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use rand::RngCore;

use picolink_core::{Error, LinkAddr, MsgIdCache, NodeConfig, Peer, Result};

use crate::time::steady_now_ms;
use crate::timer::Timer;

/// Shared node base services.
///
/// Everything a node role needs regardless of being client, gateway or
/// relay: the message-ID allocator, the duplicate cache with its tick
/// timer, the timestamp window validation and the report topic builder.
pub struct Node {
    conf: NodeConfig,
    msg_id: AtomicU16,
    msg_id_cache: Arc<Mutex<MsgIdCache>>,
    _cache_timer: Timer,
}

impl Node {
    /// Constructs the node base. Must be called from within a tokio
    /// runtime (the cache tick timer is spawned here).
    ///
    /// The message-ID counter is seeded from the OS random source: a
    /// constant seed would restart the sequence at every reboot and allow
    /// replaying old messages against peers whose ID caches survived.
    ///
    /// # Errors
    ///
    /// `InvalidArg` when `msg_id_cache.max_age` is zero or
    /// `msg_id_cache.time_unit` is below one millisecond.
    pub fn new(conf: NodeConfig) -> Result<Self> {
        if conf.msg_id_cache.time_unit.as_millis() == 0 {
            return Err(Error::InvalidArg);
        }

        let msg_id_cache = Arc::new(Mutex::new(MsgIdCache::new(conf.msg_id_cache.max_age)?));

        let mut seed = [0u8; 2];
        OsRng.fill_bytes(&mut seed);

        let tick_cache = msg_id_cache.clone();
        let cache_timer = Timer::new(conf.msg_id_cache.time_unit, move || {
            let cache = tick_cache.clone();
            async move {
                cache.lock().unwrap().tick();
            }
        });

        Ok(Node {
            conf,
            msg_id: AtomicU16::new(u16::from_le_bytes(seed)),
            msg_id_cache,
            _cache_timer: cache_timer,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.conf
    }

    /// Allocates the next message ID (wrapping).
    pub fn next_msg_id(&self) -> u16 {
        self.msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Validates a peer message ID against the duplicate cache.
    ///
    /// A fresh pair is recorded as a side effect. Returns false on a
    /// duplicate.
    pub fn validate_msg_id(&self, addr: &LinkAddr, id: u16) -> bool {
        self.msg_id_cache.lock().unwrap().insert(addr, id)
    }

    /// Current message timestamp in configured time units, as it should be
    /// stamped into an outbound message for a gateway with the given time
    /// difference.
    pub fn msg_timestamp(&self, gw_ts_diff_ms: i64) -> u16 {
        let unit_ms = self.conf.msg_id_cache.time_unit.as_millis() as i64;
        ((steady_now_ms() + gw_ts_diff_ms) / unit_ms) as u16
    }

    /// Validates a message timestamp against the acceptance window.
    ///
    /// Accepts `ts` iff it lies in the closed window
    /// `[now - (max_age - 1), now]` of time units. The comparison is done
    /// on the wrapping difference, so the window works across the `u16`
    /// wrap and a future timestamp falls out as a huge difference.
    pub fn validate_msg_timestamp(&self, ts: u16, gw_ts_diff_ms: i64) -> bool {
        let now_units = self.msg_timestamp(gw_ts_diff_ms);
        now_units.wrapping_sub(ts) <= u16::from(self.conf.msg_id_cache.max_age - 1)
    }

    /// Builds the RSSI report topic for `peer`:
    /// `{base_topic}{sep}{rssi_subtopic}{sep}{hex addr}`.
    pub fn build_report_rssi_topic(&self, peer: &Peer) -> String {
        let sep = &self.conf.topic_tokens.level_separator;
        format!(
            "{}{sep}{}{sep}{}",
            self.conf.reporting.base_topic, self.conf.reporting.rssi_subtopic, peer.addr
        )
    }
}
