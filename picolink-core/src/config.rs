use std::time::Duration;

/// Local delivery parameters.
#[derive(Debug, Clone)]
pub struct LocalDelivery {
    /// Generic message response timeout.
    ///
    /// Applies to `PROBE_RES`, `OK` and `FAIL` responses.
    pub resp_timeout: Duration,
}

impl Default for LocalDelivery {
    fn default() -> Self {
        LocalDelivery {
            resp_timeout: Duration::from_millis(500),
        }
    }
}

/// Message-ID cache parameters.
#[derive(Debug, Clone)]
pub struct MsgIdCacheConfig {
    /// Interval of checking expiration times of message ID cache entries.
    ///
    /// Must be low enough to keep the cache size low, and high enough that
    /// ordinary time drifts plus transmission delays don't cause false
    /// positive duplicates (see `max_age`).
    ///
    /// This is also the unit of the replay-protection timestamps inside
    /// messages, so it has to be the SAME VALUE FOR ALL COMMUNICATING
    /// NODES.
    pub time_unit: Duration,

    /// Max age of cache entries as a multiple of `time_unit`.
    ///
    /// Each cache entry lives between `max_age * time_unit` and
    /// `(max_age + 1) * time_unit`. The product `(max_age - 1) * time_unit`
    /// is the maximum accepted time drift of a received message.
    ///
    /// With the defaults an entry lives between 1.5 and 2 seconds and the
    /// accepted drift is 1 second. Must be at least 1.
    pub max_age: u8,
}

impl Default for MsgIdCacheConfig {
    fn default() -> Self {
        MsgIdCacheConfig {
            time_unit: Duration::from_millis(500),
            max_age: 3,
        }
    }
}

/// Reporting topics.
#[derive(Debug, Clone)]
pub struct Reporting {
    /// Base topic for reporting purposes.
    pub base_topic: String,

    /// Subtopic for RSSI reporting.
    pub rssi_subtopic: String,
}

impl Default for Reporting {
    fn default() -> Self {
        Reporting {
            base_topic: "_report".to_string(),
            rssi_subtopic: "rssi".to_string(),
        }
    }
}

/// Topic level tokens.
///
/// All three must be non-empty and pairwise distinct.
#[derive(Debug, Clone)]
pub struct TopicTokens {
    /// Separator used between topic levels.
    pub level_separator: String,

    /// Token used as single-level wildcard.
    pub single_level_wildcard: String,

    /// Token used as multi-level wildcard.
    pub multi_level_wildcard: String,
}

impl Default for TopicTokens {
    fn default() -> Self {
        TopicTokens {
            level_separator: "/".to_string(),
            single_level_wildcard: "+".to_string(),
            multi_level_wildcard: "#".to_string(),
        }
    }
}

/// Generic configuration for any node role.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub local_delivery: LocalDelivery,
    pub msg_id_cache: MsgIdCacheConfig,
    pub reporting: Reporting,
    pub topic_tokens: TopicTokens,
}
