//! Veldt - tile-grid MMORPG world server
//!
//! Server-side simulation core: spatial world grid, session protocol
//! state machine, wire framing, visibility broadcast, and the world
//! update loop.

/// Server configuration (YAML)
pub mod config;
/// Process lifecycle (shutdown flag, tick cadence)
pub mod core;
/// Wire framing and protocol command codes
pub mod network;
/// World simulation (grid, objects, AI, GM commands)
pub mod game;
/// Per-connection session handling and protocol phases
pub mod session;
/// Server implementations (world)
pub mod servers;
