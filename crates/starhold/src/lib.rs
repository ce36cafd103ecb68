//! Umbrella crate for Starhold.
//!
//! Re-exports the engine and protocol crates so downstream code can depend on a
//! single crate name (`starhold`).

pub use starhold_engine as engine;
pub use starhold_protocol as protocol;
