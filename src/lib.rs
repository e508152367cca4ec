//! # nat-pinger - UDP Hole Punching
//!
//! `nat-pinger` establishes direct UDP paths between two hosts that both sit
//! behind NAT devices. Each side binds a set of candidate ports and keeps
//! sending short datagrams toward the peer's candidate ports; the first
//! datagram that makes it through confirms a punched pair. The winning socket
//! is either returned to the caller or stapled to a local service proxy so
//! that an already-running UDP service (a VPN listener, typically) can serve
//! the punched path without rebinding.
//!
//! Candidate port lists travel over an external signaling channel that is not
//! part of this crate; both sides are expected to start punching at roughly
//! the same time.
//!
//! ## Architecture
//!
//! - [`port`] - ephemeral UDP port pool with process-wide reservations
//! - [`punch`] - parallel pair probing across candidate port lists
//! - [`pinger`] - the role engines (`ping_consumer`, `ping_provider`,
//!   `ping_peer`) and lifecycle control
//! - [`event`] - fire-and-forget lifecycle event sink
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nat_pinger::event::NoopPublisher;
//! use nat_pinger::pinger::{PingConfig, Pinger};
//!
//! # #[tokio::main]
//! # async fn main() -> nat_pinger::error::Result<()> {
//! let pinger = Pinger::new(PingConfig::default(), Arc::new(NoopPublisher));
//!
//! // Port lists come from the signaling channel.
//! let pairs = pinger
//!     .ping_peer("198.51.100.7".parse().unwrap(), &[51200], &[51201], 1, 1)
//!     .await?;
//! let _socket = pairs.into_iter().next().unwrap().into_socket();
//!
//! pinger.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! `Pinger` is `Send + Sync`; wrap it in an `Arc` to drive both roles from
//! separate tasks. Punched sockets are owned, never aliased: a probe hands its
//! socket to exactly one of the caller or the proxy.

pub mod error;
pub mod event;
pub mod pinger;
pub mod port;
pub mod punch;

mod proxy;
mod socket;
