use core::fmt;
use core::hash::{Hash, Hasher};

use crate::addr::LinkAddr;
use crate::{PREF_UNKNOWN, RSSI_UNKNOWN};

/// Maximum address length a retained peer can carry.
pub const RETAINED_ADDR_CAPACITY: usize = 32;

/// Link-level peer info.
///
/// Identity is the address alone; `channel`, `pref`, `rssi` and
/// `ts_diff_ms` are metadata used during gateway selection and time
/// synchronization.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address.
    pub addr: LinkAddr,

    /// Wireless channel. `0` means default/no channel switch.
    pub channel: u16,

    /// Peer preference (weight) for gateway selection.
    ///
    /// Transport specific, thus not comparable between different link
    /// layers. Higher value means higher preference.
    pub pref: i16,

    /// RSSI of the last received message, if the transport reports one.
    pub rssi: i16,

    /// Gateway time difference in milliseconds (gateway clock minus local
    /// steady clock), obtained from probe responses.
    pub ts_diff_ms: i64,
}

impl Default for Peer {
    fn default() -> Self {
        Peer {
            addr: LinkAddr::default(),
            channel: 0,
            pref: PREF_UNKNOWN,
            rssi: RSSI_UNKNOWN,
            ts_diff_ms: 0,
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl Peer {
    /// Checks whether the peer is empty (no address).
    pub fn is_empty(&self) -> bool {
        self.addr.is_empty()
    }

    /// Converts to the fixed-capacity retained form.
    ///
    /// At most [`RETAINED_ADDR_CAPACITY`] address bytes are kept; a longer
    /// address is truncated and will no longer compare equal to the
    /// original after a round trip.
    pub fn retain(&self) -> RetainedPeer {
        let bytes = self.addr.as_bytes();
        let take = bytes.len().min(RETAINED_ADDR_CAPACITY);
        let mut addr = heapless::Vec::new();
        let _ = addr.extend_from_slice(&bytes[..take]);
        RetainedPeer {
            addr,
            channel: self.channel,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)?;
        if self.channel != 0 {
            write!(f, " (channel {})", self.channel)?;
        }
        if self.pref != PREF_UNKNOWN {
            write!(f, " (pref {})", self.pref)?;
        }
        Ok(())
    }
}

/// Retained link-level peer info.
///
/// Special form of [`Peer`] without any heap allocation, intended for
/// storage in RTC-like memory of IoT microcontrollers during deep sleep.
/// Not used for anything else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetainedPeer {
    pub addr: heapless::Vec<u8, RETAINED_ADDR_CAPACITY>,
    pub channel: u16,
}

impl RetainedPeer {
    /// Converts back to a full [`Peer`].
    ///
    /// Preference, RSSI and time difference are unknown after a power
    /// cycle and come back as their sentinel defaults.
    pub fn unretain(&self) -> Peer {
        Peer {
            addr: LinkAddr::from(self.addr.as_slice()),
            channel: self.channel,
            ..Peer::default()
        }
    }
}
