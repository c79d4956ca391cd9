//! Server implementations.

pub mod world;
