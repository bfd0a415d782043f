// Library module for capsule
// Re-exports modules for use in integration tests and external crates

pub mod config;
pub mod protocol;

pub use config::CapsuleConfig;
pub use protocol::CapsuleError;
