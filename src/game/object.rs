//! Map objects: players, monsters, NPCs, dropped items, event triggers.
//!
//! Objects are owned by the [`Map`](crate::game::map::Map) registry;
//! they hold only the numeric id of their map, never a reference back,
//! so there is no Player <-> Map <-> Cell ownership cycle.

use std::time::Instant;

use crate::game::id::{EntityId, ObjectKind};
use crate::network::frame::Frame;
use crate::network::{cmd, OutboundTx};

/// Logical facing on the tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    North = 0,
    East = 1,
    South = 2,
    West = 3,
}

impl Direction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Direction::North),
            1 => Some(Direction::East),
            2 => Some(Direction::South),
            3 => Some(Direction::West),
            _ => None,
        }
    }

    /// Tile delta for one step in this direction. Y grows southward.
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::East => (1, 0),
            Direction::South => (0, 1),
            Direction::West => (-1, 0),
        }
    }
}

/// Per-kind object state.
#[derive(Debug)]
pub enum ObjectBody {
    Player(PlayerBody),
    Monster(MonsterBody),
    Npc(NpcBody),
    Item(ItemBody),
    Event(EventBody),
}

#[derive(Debug)]
pub struct PlayerBody {
    pub name: String,
    /// Appearance sprite/equipment composite sent to observers.
    pub look: u16,
    /// Connection that owns this player.
    pub conn_id: u64,
    pub tx: OutboundTx,
}

#[derive(Debug)]
pub struct MonsterBody {
    /// Static definition id (mob table key).
    pub mob_id: u16,
    pub look: u16,
    pub hp: u32,
    pub max_hp: u32,
    /// Spawn anchor; wander and leash are relative to this tile.
    pub spawn_x: u16,
    pub spawn_y: u16,
    pub leash: u16,
    pub target: Option<EntityId>,
    /// Ticks to wait before the next voluntary move.
    pub move_cooldown: u8,
}

#[derive(Debug)]
pub struct NpcBody {
    pub npc_id: u16,
    pub name: String,
    pub look: u16,
    /// Wandering NPCs drift up to two tiles from home.
    pub wander: bool,
    pub home_x: u16,
    pub home_y: u16,
}

#[derive(Debug)]
pub struct ItemBody {
    pub item_id: u16,
    pub amount: u16,
    /// Pickup protection: only this player may take it while protected.
    pub owner: Option<EntityId>,
    pub expires_at: Instant,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    /// Stepping on the trigger warps the actor.
    Warp { map: u16, x: u16, y: u16 },
    /// Named hook dispatched to the script layer.
    Script { hook: String },
}

#[derive(Debug)]
pub struct EventBody {
    pub enabled: bool,
    pub kind: EventKind,
}

/// One live entity on a map.
#[derive(Debug)]
pub struct GameObject {
    pub id: EntityId,
    /// Numeric id of the owning map; 0 while unregistered.
    pub map_id: u16,
    pub x: u16,
    pub y: u16,
    pub dir: Direction,
    pub body: ObjectBody,
}

impl GameObject {
    pub fn new(id: EntityId, x: u16, y: u16, body: ObjectBody) -> Self {
        Self {
            id,
            map_id: 0,
            x,
            y,
            dir: Direction::South,
            body,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self.body {
            ObjectBody::Player(_) => ObjectKind::Player,
            ObjectBody::Monster(_) => ObjectKind::Monster,
            ObjectBody::Npc(_) => ObjectKind::Npc,
            ObjectBody::Item(_) => ObjectKind::Item,
            ObjectBody::Event(_) => ObjectKind::Event,
        }
    }

    pub fn as_player(&self) -> Option<&PlayerBody> {
        match &self.body {
            ObjectBody::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_monster_mut(&mut self) -> Option<&mut MonsterBody> {
        match &mut self.body {
            ObjectBody::Monster(m) => Some(m),
            _ => None,
        }
    }

    /// Event triggers sit invisibly on the grid; everything else is drawn.
    pub fn is_visible(&self) -> bool {
        !matches!(self.body, ObjectBody::Event(_))
    }

    /// Appearance payload pushed to newly-in-range observers.
    ///
    /// Layout: id u32, dir u8, kind u8, look u16, name_len u8, name bytes.
    pub fn appearance(&self) -> Frame {
        let (look, name): (u16, &str) = match &self.body {
            ObjectBody::Player(p) => (p.look, p.name.as_str()),
            ObjectBody::Monster(m) => (m.look, ""),
            ObjectBody::Npc(n) => (n.look, n.name.as_str()),
            ObjectBody::Item(i) => (i.item_id, ""),
            ObjectBody::Event(_) => (0, ""),
        };
        let mut payload = Vec::with_capacity(9 + name.len());
        payload.extend_from_slice(&self.id.raw().to_le_bytes());
        payload.push(self.dir as u8);
        payload.push(self.kind() as u8);
        payload.extend_from_slice(&look.to_le_bytes());
        let nb = name.as_bytes();
        let nlen = nb.len().min(255);
        payload.push(nlen as u8);
        payload.extend_from_slice(&nb[..nlen]);
        Frame::with_params(cmd::SC_APPEAR, self.x, self.y, 0).payload(payload)
    }

    /// Removal notice for observers the object leaves behind.
    pub fn vanish(&self) -> Frame {
        Frame::with_params(cmd::SC_VANISH, self.x, self.y, 0)
            .payload(self.id.raw().to_le_bytes().to_vec())
    }
}
