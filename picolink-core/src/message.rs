use core::fmt;

use crate::addr::LinkAddr;
use crate::pubsub::{PubData, SubData};
use crate::{PREF_UNKNOWN, RSSI_UNKNOWN};

/// Link message types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MsgKind {
    #[default]
    None,
    /// Positive acknowledgement of a request.
    Ok,
    /// Negative acknowledgement of a request, with a [`FailReason`].
    Fail,
    /// Gateway discovery / time sync probe.
    ProbeReq,
    /// Response to a probe, carrying preference and time difference.
    ProbeRes,
    /// Coalesced publications, subscriptions and unsubscriptions.
    PubSubUnsub,
    /// Server-initiated delivery of subscription data.
    SubData,
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MsgKind::None => "NONE",
            MsgKind::Ok => "OK",
            MsgKind::Fail => "FAIL",
            MsgKind::ProbeReq => "PROBE_REQ",
            MsgKind::ProbeRes => "PROBE_RES",
            MsgKind::PubSubUnsub => "PUB_SUB_UNSUB",
            MsgKind::SubData => "SUB_DATA",
        };
        write!(f, "{s}")
    }
}

/// Node role carried inside every message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NodeType {
    #[default]
    Unknown,
    Client,
    Gateway,
    Relay,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Unknown => "UNKNOWN",
            NodeType::Client => "CLIENT",
            NodeType::Gateway => "GATEWAY",
            NodeType::Relay => "RELAY",
        };
        write!(f, "{s}")
    }
}

/// FAIL message reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FailReason {
    /// No/unknown failure.
    #[default]
    None,

    /// Duplicate message ID (replay protection, deduplication).
    ///
    /// Never sent back in FAIL messages by this client: an attacker could
    /// DoS the node just by replaying duplicates in a loop.
    DupId,

    /// Invalid timestamp (replay protection).
    ///
    /// Never sent back in FAIL messages, same reasoning as [`DupId`].
    ///
    /// [`DupId`]: FailReason::DupId
    InvalidTs,

    /// Processing failed, e.g. transmission over the remote bridge or
    /// relaying.
    ProcessingFailed,

    /// Unknown message sender.
    UnknownSender,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailReason::None => "NONE",
            FailReason::DupId => "DUP_ID",
            FailReason::InvalidTs => "INVALID_TS",
            FailReason::ProcessingFailed => "PROCESSING_FAILED",
            FailReason::UnknownSender => "UNKNOWN_SENDER",
        };
        write!(f, "{s}")
    }
}

/// Link message.
///
/// The contract spoken between the client and its link transport in both
/// directions. On send `addr` is the destination (empty means broadcast),
/// on receive it is the source.
#[derive(Debug, Clone)]
pub struct LinkMsg {
    /// Type of message.
    pub kind: MsgKind,

    /// Source/destination address. Empty means broadcast.
    pub addr: LinkAddr,

    /// Relayed address, set by relay nodes.
    pub relayed_addr: LinkAddr,

    /// Publications (`PUB_SUB_UNSUB` only).
    pub pubs: Vec<PubData>,

    /// Topics of subscriptions (`PUB_SUB_UNSUB` only).
    pub subs: Vec<String>,

    /// Topics of unsubscriptions (`PUB_SUB_UNSUB` only).
    pub unsubs: Vec<String>,

    /// Subscription data (`SUB_DATA` only).
    pub subs_data: Vec<SubData>,

    /// Message ID.
    pub id: u16,

    /// Timestamp in configured time units.
    pub ts: u16,

    /// Message ID of the corresponding request (`OK`, `FAIL`, `PROBE_RES`
    /// only).
    pub req_id: u16,

    /// Sender node type.
    pub node_type: NodeType,

    /// Fail reason (`FAIL` only).
    pub fail_reason: FailReason,

    /// RSSI corresponding to the message.
    ///
    /// Only relevant for RF transports. A received message carries its own
    /// RSSI; a message to be sent should carry the RSSI of the
    /// corresponding received message so that a suitable data rate can be
    /// chosen.
    pub rssi: i16,

    /// Peer preference (weight), used for gateway selection
    /// (`PROBE_RES` only).
    pub pref: i16,

    /// Gateway time difference in milliseconds, calculated as the
    /// gateway's timestamp minus the local steady clock
    /// (`PROBE_RES` only).
    pub ts_diff_ms: i64,
}

impl Default for LinkMsg {
    fn default() -> Self {
        LinkMsg {
            kind: MsgKind::None,
            addr: LinkAddr::default(),
            relayed_addr: LinkAddr::default(),
            pubs: Vec::new(),
            subs: Vec::new(),
            unsubs: Vec::new(),
            subs_data: Vec::new(),
            id: 0,
            ts: 0,
            req_id: 0,
            node_type: NodeType::Unknown,
            fail_reason: FailReason::None,
            rssi: RSSI_UNKNOWN,
            pref: PREF_UNKNOWN,
            ts_diff_ms: 0,
        }
    }
}

/// Payload equality: transmission bookkeeping (`id`, `ts`, `req_id`,
/// metadata) is deliberately left out, so a prepared copy of a message
/// still compares equal to its blueprint.
impl PartialEq for LinkMsg {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.addr == other.addr
            && self.relayed_addr == other.relayed_addr
            && self.pubs == other.pubs
            && self.subs == other.subs
            && self.unsubs == other.unsubs
            && self.subs_data == other.subs_data
    }
}

impl Eq for LinkMsg {}

impl fmt::Display for LinkMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if self.addr.is_empty() {
            write!(f, " (no addr)")?;
        } else {
            write!(f, " {}", self.addr)?;
        }
        if !self.relayed_addr.is_empty() {
            write!(f, " {}", self.relayed_addr)?;
        }

        match self.kind {
            MsgKind::Fail => write!(f, " | failed due to {}", self.fail_reason),
            MsgKind::ProbeRes => write!(f, " | pref {}", self.pref),
            MsgKind::PubSubUnsub => {
                let items: Vec<String> = self
                    .pubs
                    .iter()
                    .map(|p| format!("PUB {p}"))
                    .chain(self.subs.iter().map(|s| format!("SUB {s}")))
                    .chain(self.unsubs.iter().map(|u| format!("UNSUB {u}")))
                    .collect();
                write!(f, " | {}", items.join(", "))
            }
            MsgKind::SubData => {
                let items: Vec<String> =
                    self.subs_data.iter().map(|d| d.to_string()).collect();
                write!(f, " | {}", items.join(", "))
            }
            _ => Ok(()),
        }
    }
}
