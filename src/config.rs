//! Server configuration module
//!
//! Parses server and world-content configuration from YAML. Defining a
//! field on the struct is all it takes - serde handles parsing, defaults
//! and type conversion.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the world listener.
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_world_port")]
    pub world_port: u16,

    /// Coordinator (inter-server) endpoint. Empty = standalone.
    #[serde(default)]
    pub coordinator_ip: String,

    #[serde(default = "default_coordinator_port")]
    pub coordinator_port: u16,

    /// This server's id in coordinator handoffs.
    #[serde(default)]
    pub server_id: u16,

    // ============================================
    // Simulation cadence and broadcast radii
    // ============================================
    /// World update loop period in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Broadcast radius for movement/combat (tiles, Chebyshev).
    #[serde(default = "default_view_radius")]
    pub view_radius: u16,

    /// Broadcast radius for local chat.
    #[serde(default = "default_chat_radius")]
    pub chat_radius: u16,

    /// Seconds a connection may stay idle before teardown.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds a dropped item persists before the update loop reaps it.
    #[serde(default = "default_item_expiry")]
    pub item_expiry_secs: u64,

    // ============================================
    // Entry point for new arrivals
    // ============================================
    #[serde(default = "default_start_map")]
    pub start_map: u16,

    #[serde(default = "default_start_coord")]
    pub start_x: u16,

    #[serde(default = "default_start_coord")]
    pub start_y: u16,

    // ============================================
    // World content
    // ============================================
    #[serde(default)]
    pub maps: Vec<MapDef>,
}

/// Static definition of one map, loaded once at world start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDef {
    pub id: u16,
    pub name: String,
    pub width: u16,
    pub height: u16,

    /// Behavioral flags, each with an optional integer parameter.
    #[serde(default)]
    pub flags: Vec<FlagDef>,

    /// Statically impassable tiles.
    #[serde(default)]
    pub blocked: Vec<(u16, u16)>,

    #[serde(default)]
    pub spawns: Vec<SpawnDef>,

    #[serde(default)]
    pub npcs: Vec<NpcDef>,

    #[serde(default)]
    pub events: Vec<EventDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagDef {
    pub name: String,
    #[serde(default = "default_flag_param")]
    pub param: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnDef {
    pub mob_id: u16,
    #[serde(default)]
    pub look: u16,
    pub x: u16,
    pub y: u16,
    #[serde(default = "default_spawn_count")]
    pub count: u16,
    #[serde(default = "default_mob_hp")]
    pub hp: u32,
    #[serde(default = "default_leash")]
    pub leash: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpcDef {
    pub npc_id: u16,
    pub name: String,
    #[serde(default)]
    pub look: u16,
    pub x: u16,
    pub y: u16,
    #[serde(default)]
    pub wander: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDef {
    pub x: u16,
    pub y: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Warp destination; mutually exclusive with `hook` in practice,
    /// warp wins when both are present.
    #[serde(default)]
    pub warp: Option<WarpDest>,
    #[serde(default)]
    pub hook: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarpDest {
    pub map: u16,
    pub x: u16,
    pub y: u16,
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_world_port() -> u16 {
    2500
}
fn default_coordinator_port() -> u16 {
    2600
}
fn default_tick_ms() -> u64 {
    500
}
fn default_view_radius() -> u16 {
    18
}
fn default_chat_radius() -> u16 {
    15
}
fn default_idle_timeout() -> u64 {
    30
}
fn default_item_expiry() -> u64 {
    120
}
fn default_start_map() -> u16 {
    1
}
fn default_start_coord() -> u16 {
    10
}
fn default_flag_param() -> i32 {
    1
}
fn default_spawn_count() -> u16 {
    1
}
fn default_mob_hp() -> u32 {
    20
}
fn default_leash() -> u16 {
    8
}
fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Parse configuration from a YAML string.
    pub fn from_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse YAML configuration")
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Cannot read config: {}", path.as_ref().display()))?;
        Self::from_str(&content)
    }

    /// A minimal single-map configuration for tests.
    pub fn test_only() -> Self {
        Self::from_str(
            r#"
maps:
  - id: 1
    name: plains
    width: 100
    height: 100
"#,
        )
        .expect("test config must parse")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            world_port: default_world_port(),
            coordinator_ip: String::new(),
            coordinator_port: default_coordinator_port(),
            server_id: 0,
            tick_ms: default_tick_ms(),
            view_radius: default_view_radius(),
            chat_radius: default_chat_radius(),
            idle_timeout_secs: default_idle_timeout(),
            item_expiry_secs: default_item_expiry(),
            start_map: default_start_map(),
            start_x: default_start_coord(),
            start_y: default_start_coord(),
            maps: Vec::new(),
        }
    }
}
