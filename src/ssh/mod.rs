//! SSH tunnel transport: a persistent multiplexed SSH session used purely
//! as a TCP dialer (component E), and a fixed-size pool of them
//! (component F), both behind the [`TunnelTransport`] trait (§9's
//! unification of the two historically-separate transport topologies).

mod client;
mod pool;
mod transport;

pub use client::TunnelClient;
pub use pool::TunnelPool;
pub use transport::{BoxedDuplex, TunnelError, TunnelTransport};
