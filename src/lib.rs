//! An async client/server library for FreeSWITCH's **EventSocket**
//! protocol.
//!
//! FreeSWITCH exposes a text-oriented TCP control channel through which a
//! program can issue API commands, execute dialplan applications on
//! calls, and receive asynchronous call-state events. This crate speaks
//! that protocol in both directions:
//!
//! - [`inbound`] dials FreeSWITCH, authenticates, and returns a ready
//!   [`Engine`].
//! - [`outbound`] listens for FreeSWITCH-initiated connections (one per
//!   call) and returns an `Engine` bound to that call's channel.
//!
//! Both modes hand back the same [`Engine`]: a cheaply cloneable handle
//! onto a connection actor task that owns the wire framing, FIFO reply
//! correlation, and event-subscription fan-out. [`ops`] adds a
//! representative set of dialplan/API convenience wrappers on top of the
//! engine's core operations.

#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

mod correlator;
mod engine;
mod error;
mod framer;
mod message;
mod ops;
mod router;

#[cfg(feature = "inbound")]
pub mod inbound;

#[cfg(feature = "outbound")]
pub mod outbound;

pub use engine::{DisconnectCallback, Engine, EventCallback};
pub use error::{Error, Result};
pub use message::{HeaderMap, Message};
pub use ops::GlobalGetvarResult;
pub use router::SubscriptionId;
