//! Domain Layer
//!
//! Port traits and the boundary types exchanged with external systems.

pub mod ports;

pub use ports::*;
