use std::future::Future;
use std::sync::Arc;

use picolink_core::{LinkMsg, Result};

/// Inbound delivery hook installed by the client.
///
/// Implementations of [`LinkLayer`] call it from their own receive
/// context; it never blocks (internally it only enqueues the message for
/// the client's dispatcher).
pub type RecvCb = Arc<dyn Fn(LinkMsg) + Send + Sync>;

/// Pluggable link-level transport port.
///
/// Concrete backends (a wireless broadcast medium with channels, a radio
/// link, a serial bus) implement this trait; the client drives it and
/// never assumes anything about the medium beyond this contract.
///
/// The futures carry a `Send` bound so the client's background tasks stay
/// spawnable for any transport.
pub trait LinkLayer: Send + Sync + 'static {
    /// Sends one prepared message to the node given by `msg.addr`
    /// (broadcast when empty). May block briefly.
    ///
    /// # Errors
    ///
    /// `InvalidSize` when the supplied data is too big for the medium, or
    /// any other transport-specific code; the client forwards these to its
    /// callers unchanged.
    fn send(&self, msg: &LinkMsg) -> impl Future<Output = Result<()>> + Send;

    /// Lists selectable channels.
    ///
    /// An empty list means the transport has no channel concept; the
    /// client then never calls [`set_channel`].
    ///
    /// [`set_channel`]: LinkLayer::set_channel
    fn channels(&self) -> Vec<u16>;

    /// Switches to `channel`. Channel 0 is treated as the default one.
    ///
    /// # Errors
    ///
    /// `NotSupported` when the transport advertises no channels,
    /// `InvalidArg` for an out-of-range channel.
    fn set_channel(&self, channel: u16) -> impl Future<Output = Result<()>> + Send;

    /// Installs (`Some`) or clears (`None`) the inbound delivery hook.
    ///
    /// The client installs its dispatcher hook in the constructor and
    /// clears it again on shutdown.
    fn set_recv_cb(&self, cb: Option<RecvCb>);
}
