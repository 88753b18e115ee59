//! burrow-agent: the firewall-side half of a burrow tunnel.
//!
//! Opens one outbound control connection to a broker, learns the public
//! port the broker allocated, and for every user session the broker
//! announces, dials the protected service on loopback and relays bytes
//! both ways.
//!
//! # Quick Start
//!
//! ```no_run
//! use burrow_agent::Tunnel;
//!
//! # async fn example() -> burrow_core::TunnelResult<()> {
//! let tunnel = Tunnel::open(3000, "tunnel.example.com:34567").await?;
//! println!("service exposed on public port {}", tunnel.public_port());
//!
//! // ... runs until stopped
//! tunnel.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod tunnel;

// Re-export primary public types.
pub use tunnel::Tunnel;

// Re-export burrow-core error types for convenience.
pub use burrow_core::{TunnelError, TunnelResult};
