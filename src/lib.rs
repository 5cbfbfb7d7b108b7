pub mod client;
pub mod config;
pub mod core;
pub mod errors;
pub mod tls;

// Re-export commonly used items for convenience
pub use client::{ClientGuard, VocalsClient};
pub use config::{AudioConfig, Settings};
pub use core::*;
pub use errors::{ErrorKind, VocalsError, VocalsResult};
