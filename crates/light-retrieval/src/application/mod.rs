//! # Application Layer
//!
//! Backend wiring and the block-producer sync gate.

pub mod backend;
pub mod producer_gate;

pub use backend::LightBackend;
pub use producer_gate::{ProducerGate, SyncEvent, WatchExit};
