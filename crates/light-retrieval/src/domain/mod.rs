//! # Domain Module
//!
//! Core domain types for the retrieval core: identifiers, peer facts, slot
//! outcomes, errors and the pure scoring rules every component shares.

pub mod entities;
pub mod errors;
pub mod invariants;
pub mod value_objects;

pub use entities::*;
pub use errors::*;
pub use invariants::*;
pub use value_objects::*;
