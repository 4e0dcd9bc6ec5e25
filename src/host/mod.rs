//! Bridge to the host shell that owns the platform update service.

pub mod bridge;
pub mod channel;
pub mod contract;
pub mod stdio;

pub use bridge::HostBridge;
pub use channel::HostCommandServer;
