mod client;
mod error;
mod transport;
mod wire;

pub use client::{CdpClient, CdpConfig, CdpSession};
pub use error::CdpError;
pub use wire::CdpEvent;
