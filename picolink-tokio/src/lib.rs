//! # PicoLink Tokio
//!
//! Tokio runtime layer of PicoLink.
//!
//! This crate provides the client state machine plus everything that needs
//! a clock or a task: the rescheduleable periodic [`Timer`], the node base
//! services (message-ID allocation, duplicate/timestamp validation) and
//! the [`LinkLayer`] port that concrete transports implement. It
//! re-exports all types from `picolink-core` for convenience.
//!
//! ## Usage
//!
//! ```no_run
//! use picolink_tokio::{Client, ClientConfig, SubData};
//! # use picolink_tokio::{LinkLayer, LinkMsg, RecvCb, Result};
//! # struct MyRadio;
//! # impl LinkLayer for MyRadio {
//! #     async fn send(&self, _msg: &LinkMsg) -> Result<()> { Ok(()) }
//! #     fn channels(&self) -> Vec<u16> { Vec::new() }
//! #     async fn set_channel(&self, _channel: u16) -> Result<()> { Ok(()) }
//! #     fn set_recv_cb(&self, _cb: Option<RecvCb>) {}
//! # }
//!
//! # async fn run() -> Result<()> {
//! let link = MyRadio;
//! let client = Client::new(ClientConfig::default(), link, None).await?;
//!
//! client
//!     .subscribe("sensors/+/temp", |data: &SubData| {
//!         println!("{}: {:?}", data.topic, data.payload);
//!     })
//!     .await?;
//! client.publish("status", "online").await?;
//! # Ok(())
//! # }
//! ```

// Re-export core for convenience
pub use picolink_core::*;

pub mod client;
pub mod config;
pub mod link;
pub mod node;
pub mod time;
pub mod timer;

pub use client::{Client, ClientRetainedState, RETAINED_STATE_LEN};
pub use config::{
    ClientConfig, ClientReporting, GatewayDiscovery, SubDbConfig, SystemTimeHook, TimeSyncConfig,
};
pub use link::{LinkLayer, RecvCb};
pub use node::Node;
pub use timer::Timer;
