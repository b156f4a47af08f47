//! Types shared between grainhost crates.

pub mod errors;

pub use errors::{GrainhostError, GrainhostResult};
