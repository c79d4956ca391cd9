//! World simulation modules.

pub mod gm;
pub mod id;
pub mod map;
pub mod mob;
pub mod npc;
pub mod object;
pub mod world;
