//! Shared foundation for pixel-relay: configuration, errors, domain types,
//! and the clock / identifier service.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use error::{PixelError, PixelResult};
