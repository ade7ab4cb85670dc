use core::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Publication data structure.
///
/// Contains topic and payload, and in the future maybe more settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubData {
    pub topic: String,
    pub payload: Bytes,
}

impl PubData {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        PubData {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Converts to [`SubData`].
    ///
    /// Useful when a publication is immediately turned back into a
    /// subscription delivery.
    pub fn to_sub_data(&self) -> SubData {
        SubData {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
        }
    }
}

impl fmt::Display for PubData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({} B)", self.topic, self.payload.len())
    }
}

/// Subscription delivery data.
///
/// One received `(topic, payload)` tuple matching a prior subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubData {
    pub topic: String,
    pub payload: Bytes,
}

impl SubData {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        SubData {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

impl fmt::Display for SubData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({} B)", self.topic, self.payload.len())
    }
}

/// Subscription callback.
///
/// Runs on the receive path, so it must not block for long; while it runs,
/// no further inbound traffic is dispatched.
pub type SubCb = Arc<dyn Fn(&SubData) + Send + Sync>;

/// Subscription request: a topic pattern plus the callback invoked for
/// matching deliveries.
#[derive(Clone)]
pub struct SubReq {
    pub topic: String,
    pub cb: SubCb,
}

impl SubReq {
    pub fn new(topic: impl Into<String>, cb: impl Fn(&SubData) + Send + Sync + 'static) -> Self {
        SubReq {
            topic: topic.into(),
            cb: Arc::new(cb),
        }
    }
}

impl fmt::Debug for SubReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubReq")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
