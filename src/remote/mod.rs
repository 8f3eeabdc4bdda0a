//! Remote agent channel
//!
//! Client side of the streaming protocol used to delegate server-only
//! operations (firmware programming, device reset, log streaming, debug
//! session bracketing) to a remote agent.

pub mod client;
pub mod protocol;

pub use client::{ChannelSecurity, RpcClient};
