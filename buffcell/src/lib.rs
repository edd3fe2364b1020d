pub mod cell;
pub mod config;
pub mod error;
pub mod registry;
pub mod signal;

// Re-export the cell and its registry for convenience
pub use cell::BufferCell;
pub use registry::BufferRegistry;

// Re-export config and error types
pub use config::{RegistryConfig, DEFAULT_CHANNEL_CAPACITY};
pub use error::{BuffError, ReloadError, Result};

// Re-export signal types
pub use signal::{BusyClaim, Claim, IdleWaiter, SignalChannel};
