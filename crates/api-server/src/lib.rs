//! HTTP surface: the tracking endpoints, operational probes, and the
//! background-task facility that keeps handler-spawned work alive.

pub mod rest;
pub mod server;
pub mod tasks;

pub use rest::AppState;
pub use server::{build_router, start_metrics};
pub use tasks::TaskSpawner;
