//! # leasekeeper
//!
//! A DHCP server library implementing RFC 2131 (DHCP) and RFC 2132 (DHCP Options).
//!
//! ## Features
//!
//! - DISCOVER, OFFER, REQUEST, ACK, NAK, RELEASE, DECLINE and INFORM
//! - Per-client lease lifecycle: Released, Offered, Bound, Expired
//! - Sticky address reuse and reclamation of released addresses
//! - Option overload decoding (options carried in `sname`/`file`)
//! - Relay agent replies via `giaddr`
//! - Lease persistence with retries across restarts
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use leasekeeper::{Config, DhcpServer};
//!
//! #[tokio::main]
//! async fn main() -> leasekeeper::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let server = DhcpServer::new(config).await?;
//!     server
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`DhcpOption`] - option codec registry per RFC 2132
//! - [`DhcpPacket`] - packet decoding and encoding
//! - [`LeaseTable`] - client records keyed by [`ClientId`]
//! - [`Allocator`] - address selection from the pool
//! - [`state_machine`] - per-message transitions and the expiry sweep
//! - [`Persistence`] - retrying load/save over a [`LeaseStore`]
//! - [`DhcpServer`] - the UDP loop tying it together

pub mod allocator;
pub mod config;
pub mod error;
pub mod lease;
pub mod options;
pub mod packet;
pub mod persistence;
pub mod server;
pub mod state_machine;

pub use allocator::Allocator;
pub use config::{AddressPool, Config, ExtraOption};
pub use error::{Error, Result};
pub use lease::{ClientId, Lease, LeaseState, LeaseTable, StateDuration};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use persistence::{JsonFileStore, LeaseStore, Persistence, RetryPolicy};
pub use server::DhcpServer;
