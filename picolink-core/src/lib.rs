//! # PicoLink Core
//!
//! Runtime-agnostic core of PicoLink, a lightweight publish/subscribe
//! client for resource-constrained nodes that talk to a gateway over a
//! pluggable link-level transport (wireless broadcast media with channels,
//! radio links, serial buses).
//!
//! This crate contains the data model and the pure logic shared by all
//! node roles:
//!
//! - **Addresses and peers** - opaque link-level addresses, gateway peer
//!   records and their fixed-capacity retained form for deep-sleep storage
//! - **Messages** - the link message contract spoken between clients,
//!   gateways and relays
//! - **Wildcard trie** - MQTT-style topic routing with `+` / `#` wildcards
//! - **Message-ID cache** - per-peer duplicate detection with tick-based
//!   expiry, the first half of the replay defense
//!
//! It is platform-agnostic and has no async runtime dependencies; anything
//! that needs a clock or a task lives in the runtime layer crate
//! (`picolink-tokio`).

pub mod addr;
pub mod config;
pub mod error;
pub mod message;
pub mod msg_id_cache;
pub mod peer;
pub mod pubsub;
pub mod trie;

// Convenience re-exports
pub use addr::LinkAddr;
pub use config::{LocalDelivery, MsgIdCacheConfig, NodeConfig, Reporting, TopicTokens};
pub use error::{Error, Result};
pub use message::{FailReason, LinkMsg, MsgKind, NodeType};
pub use msg_id_cache::MsgIdCache;
pub use peer::{Peer, RetainedPeer, RETAINED_ADDR_CAPACITY};
pub use pubsub::{PubData, SubCb, SubData, SubReq};
pub use trie::WildcardTrie;

/// Peer preference "unknown" value.
pub const PREF_UNKNOWN: i16 = i16::MIN;

/// RSSI "unknown" value.
pub const RSSI_UNKNOWN: i16 = i16::MIN;
