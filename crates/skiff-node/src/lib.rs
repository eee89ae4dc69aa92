//! # skiff-node
//!
//! A UDP endpoint around the `skiff-transport` engine. It owns the socket,
//! the table of established peers and the worker threads, and reports
//! completed messages and handshake outcomes as [`NodeEvent`]s.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # fn demo(crypto: Arc<dyn skiff_transport::crypto::CryptoService>) -> anyhow::Result<()> {
//! use skiff_node::{Endpoint, NodeConfig, NodeEvent};
//!
//! let config = NodeConfig::from_toml_str("bind = \"0.0.0.0:7000\"")?;
//! let endpoint = Endpoint::bind(config, crypto)?;
//! let peer = "192.0.2.10:7000".parse()?;
//! endpoint.connect(peer, bytes::Bytes::from_static(b"peer identity"))?;
//! endpoint.submit_message(peer, bytes::Bytes::from_static(b"hello"))?;
//! while let Ok(event) = endpoint.events().recv() {
//!     if let NodeEvent::MessageComplete { payload, .. } = event {
//!         println!("{} bytes", payload.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod endpoint;
pub mod socket;

pub use config::NodeConfig;
pub use endpoint::{Endpoint, MessageFailure, MessageHandle, NodeEvent, NodeStats, PeerStats};
pub use socket::DatagramSocket;

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber. `RUST_LOG` wins over `default_filter`.
/// Does nothing if a global subscriber is already set.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
