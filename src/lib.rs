//! # Velum
//!
//! A multiplexed, ciphered tunnel transport.
//!
//! Many logical sessions ride a small pool of authenticated,
//! encrypted carriers (*underlays*). The multiplex controller owns
//! that pool:
//!
//! ```text
//! client                                server
//! ──────                                ──────
//! dial ──► pick-or-create underlay      endpoint listeners
//!          attach session          ──►  accept underlays
//!          ▲                            bridge sessions
//!          │ idle collector             ▼
//!          └─── underlay pool ───► shared accept queue
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── mux.rs          # The multiplex controller (dial/listen/pool)
//! ├── underlay/       # Carriers: stream, datagram, scheduler, sessions
//! ├── cipher/         # Password-derived block ciphers, user hashing
//! ├── endpoint.rs     # Endpoint descriptors and network strings
//! ├── config.rs       # JSON options and controller builders
//! ├── metrics.rs      # Process-wide underlay counters
//! └── shutdown.rs     # One-shot completion signal
//! ```

pub mod cipher;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod mux;
pub mod shutdown;
pub mod underlay;

// Re-exports for convenience
pub use config::{ClientConfig, EndpointConfig, ServerConfig, User};
pub use endpoint::{Endpoint, UnderlayNetwork};
pub use error::{Error, Result};
pub use mux::{Mux, Role};
pub use underlay::{Session, Underlay};
