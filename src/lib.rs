pub mod analyzer;
pub mod capture;
pub mod config;
pub mod export;
pub mod format;
pub mod protocol;
pub mod session;

pub use analyzer::{PacketAnalyzer, SharedAnalyzer};
pub use protocol::packet::{DecodeError, Packet};
pub use session::{LiveSession, SessionEvent, SessionState};
