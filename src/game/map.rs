//! Spatial world grid.
//!
//! One [`Map`] per numeric map id, created at world load and never
//! destroyed. The map owns the unified object registry, the per-category
//! registries, and the 2-D cell array; all of them are guarded by a
//! single per-map mutex so every mutation is atomic relative to range
//! queries. Grid operations are synchronous, bounded and in-memory -
//! they must never block on I/O.
//!
//! Distances are Chebyshev (max of |dx|, |dy|), matching tile-grid
//! adjacency semantics used by all broadcast logic.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;

use crate::game::id::{EntityId, ObjectKind};
use crate::game::object::{Direction, GameObject, ObjectBody};
use crate::network::cmd;
use crate::network::frame::Frame;
use crate::network::OutboundTx;

/// Canonical broadcast radius for movement and combat.
pub const DEFAULT_VIEW_RADIUS: u16 = 18;
/// Ring scan limit for free-tile searches.
pub const RING_SCAN_MAX_RADIUS: i32 = 4;

/// Per-map behavioral flag, optionally carrying an integer parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapFlag {
    SafeZone,
    NoPk,
    NoTeleport,
    NoDrop,
    DeathPenalty,
}

impl MapFlag {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "safe_zone" => Some(MapFlag::SafeZone),
            "no_pk" => Some(MapFlag::NoPk),
            "no_teleport" => Some(MapFlag::NoTeleport),
            "no_drop" => Some(MapFlag::NoDrop),
            "death_penalty" => Some(MapFlag::DeathPenalty),
            _ => None,
        }
    }
}

/// Cheap handle to a player's outbound queue, cloneable outside the lock.
#[derive(Debug, Clone)]
pub struct PlayerHandle {
    pub id: EntityId,
    pub conn_id: u64,
    pub x: u16,
    pub y: u16,
    pub tx: OutboundTx,
}

impl PlayerHandle {
    pub fn send(&self, frame: &Frame) {
        let _ = self.tx.send(Bytes::from(frame.encode()));
    }
}

/// Edge of an event-object trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventEdge {
    Enter,
    Leave,
}

/// A recorded crossing of an event object's cell, dispatched by the
/// world update loop after the cell transition has committed.
#[derive(Debug, Clone)]
pub struct EventHit {
    pub event: EntityId,
    pub actor: EntityId,
    pub edge: EventEdge,
}

/// One grid square: the objects occupying it, plus the subset that are
/// event triggers.
#[derive(Default)]
struct Cell {
    objects: Vec<EntityId>,
    events: Vec<EntityId>,
}

impl Cell {
    fn insert(&mut self, id: EntityId, kind: ObjectKind) {
        self.objects.push(id);
        if kind == ObjectKind::Event {
            self.events.push(id);
        }
    }

    fn remove(&mut self, id: EntityId) {
        self.objects.retain(|&o| o != id);
        self.events.retain(|&o| o != id);
    }
}

struct MapInner {
    objects: HashMap<EntityId, GameObject>,
    players: HashSet<EntityId>,
    monsters: HashSet<EntityId>,
    npcs: HashSet<EntityId>,
    items: HashSet<EntityId>,
    cells: Vec<Cell>,
    /// Tiles administratively locked (GM), on top of static collision.
    locked: HashSet<(u16, u16)>,
    event_queue: Vec<EventHit>,
}

/// One tile-grid map and its spatial index.
pub struct Map {
    pub id: u16,
    pub name: String,
    pub width: u16,
    pub height: u16,
    pub view_radius: u16,
    flags: HashMap<MapFlag, i32>,
    /// Static collision data, row-major, true = impassable.
    collision: Vec<bool>,
    inner: Mutex<MapInner>,
}

impl Map {
    pub fn new(id: u16, name: impl Into<String>, width: u16, height: u16) -> Self {
        let mut cells = Vec::with_capacity(width as usize * height as usize);
        cells.resize_with(width as usize * height as usize, Cell::default);
        Self {
            id,
            name: name.into(),
            width,
            height,
            view_radius: DEFAULT_VIEW_RADIUS,
            flags: HashMap::new(),
            collision: vec![false; width as usize * height as usize],
            inner: Mutex::new(MapInner {
                objects: HashMap::new(),
                players: HashSet::new(),
                monsters: HashSet::new(),
                npcs: HashSet::new(),
                items: HashSet::new(),
                cells,
                locked: HashSet::new(),
                event_queue: Vec::new(),
            }),
        }
    }

    pub fn with_flags(mut self, flags: HashMap<MapFlag, i32>) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_blocked_tiles(mut self, tiles: &[(u16, u16)]) -> Self {
        for &(x, y) in tiles {
            if x < self.width && y < self.height {
                self.collision[y as usize * self.width as usize + x as usize] = true;
            }
        }
        self
    }

    pub fn flag(&self, flag: MapFlag) -> Option<i32> {
        self.flags.get(&flag).copied()
    }

    pub fn has_flag(&self, flag: MapFlag) -> bool {
        self.flags.contains_key(&flag)
    }

    fn lock(&self) -> MutexGuard<'_, MapInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cell_index(&self, x: u16, y: u16) -> usize {
        y as usize * self.width as usize + x as usize
    }

    fn in_bounds(&self, x: u16, y: u16) -> bool {
        x < self.width && y < self.height
    }

    /// True if (x, y) is out of bounds, administratively locked, or
    /// statically blocked by collision data.
    pub fn is_blocked(&self, x: u16, y: u16) -> bool {
        if !self.in_bounds(x, y) {
            return true;
        }
        if self.collision[self.cell_index(x, y)] {
            return true;
        }
        self.lock().locked.contains(&(x, y))
    }

    /// GM tile lock; blocks movement into the tile until unlocked.
    pub fn lock_tile(&self, x: u16, y: u16) {
        self.lock().locked.insert((x, y));
    }

    pub fn unlock_tile(&self, x: u16, y: u16) {
        self.lock().locked.remove(&(x, y));
    }

    // ---- registration -----------------------------------------------------

    /// Register `obj` at (x, y).
    ///
    /// Rejects out-of-bounds coordinates and duplicate ids without
    /// mutating anything. On success the object lands in the unified
    /// registry, its category registry and the cell, and every player
    /// within view radius is pushed its appearance payload. A player
    /// being added is itself sent a clear-objects frame followed by one
    /// appearance per currently-visible object.
    pub fn add_object(&self, mut obj: GameObject, x: u16, y: u16) -> bool {
        if !self.in_bounds(x, y) {
            tracing::debug!(
                "[world] [grid] add_object {} out of bounds ({},{}) on map {}",
                obj.id,
                x,
                y,
                self.id
            );
            return false;
        }

        let mut inner = self.lock();
        if inner.objects.contains_key(&obj.id) {
            tracing::debug!("[world] [grid] add_object duplicate id {}", obj.id);
            return false;
        }

        obj.x = x;
        obj.y = y;
        obj.map_id = self.id;
        let id = obj.id;
        let kind = obj.kind();

        let idx = self.cell_index(x, y);
        inner.cells[idx].insert(id, kind);
        match kind {
            ObjectKind::Player => inner.players.insert(id),
            ObjectKind::Monster => inner.monsters.insert(id),
            ObjectKind::Npc => inner.npcs.insert(id),
            ObjectKind::Item => inner.items.insert(id),
            _ => true,
        };

        let appearance = if obj.is_visible() {
            Some(obj.appearance())
        } else {
            None
        };
        let new_player_tx = obj.as_player().map(|p| p.tx.clone());
        inner.objects.insert(id, obj);

        // Post-mutation range query: observers see the finished state.
        if let Some(appearance) = appearance {
            let bytes = Bytes::from(appearance.encode());
            for handle in Self::players_in_range_locked(&inner, x, y, self.view_radius) {
                if handle.id != id {
                    let _ = handle.tx.send(bytes.clone());
                }
            }
        }

        // Map (re)entry resend: clear the client's object list, then one
        // appearance per visible object already in range.
        if let Some(tx) = new_player_tx {
            let _ = tx.send(Bytes::from(Frame::new(cmd::SC_CLEAR_OBJECTS).encode()));
            for other in Self::objects_in_range_locked(self, &inner, x, y, self.view_radius) {
                if other == id {
                    continue;
                }
                if let Some(o) = inner.objects.get(&other) {
                    if o.is_visible() {
                        let _ = tx.send(Bytes::from(o.appearance().encode()));
                    }
                }
            }
        }
        true
    }

    /// Remove and return an object, pushing removal notices to the
    /// players that could previously see it.
    pub fn take_object(&self, id: EntityId) -> Option<GameObject> {
        let mut inner = self.lock();
        let mut obj = inner.objects.remove(&id)?;
        let idx = self.cell_index(obj.x, obj.y);
        inner.cells[idx].remove(id);
        inner.players.remove(&id);
        inner.monsters.remove(&id);
        inner.npcs.remove(&id);
        inner.items.remove(&id);

        if obj.is_visible() {
            let bytes = Bytes::from(obj.vanish().encode());
            for handle in Self::players_in_range_locked(&inner, obj.x, obj.y, self.view_radius) {
                let _ = handle.tx.send(bytes.clone());
            }
        }
        obj.map_id = 0;
        Some(obj)
    }

    /// Inverse of [`add_object`](Self::add_object). Returns false if the
    /// object was not registered here.
    pub fn remove_object(&self, id: EntityId) -> bool {
        self.take_object(id).is_some()
    }

    /// Move an object to (new_x, new_y).
    ///
    /// Rejects blocked and out-of-bounds destinations, no-ops (true) when
    /// source equals destination. Cell and position mutate as one unit
    /// under the map lock; enter/leave hits on event objects in the old
    /// and new cells are queued for the update loop (the moving object
    /// itself and disabled events excluded).
    pub fn move_object(&self, id: EntityId, new_x: u16, new_y: u16) -> bool {
        if self.is_blocked(new_x, new_y) {
            return false;
        }

        let mut inner = self.lock();
        let (old_x, old_y, kind) = match inner.objects.get(&id) {
            Some(o) => (o.x, o.y, o.kind()),
            None => return false,
        };
        if (old_x, old_y) == (new_x, new_y) {
            return true;
        }

        let old_idx = self.cell_index(old_x, old_y);
        let new_idx = self.cell_index(new_x, new_y);
        inner.cells[old_idx].remove(id);
        if let Some(o) = inner.objects.get_mut(&id) {
            o.x = new_x;
            o.y = new_y;
        }
        inner.cells[new_idx].insert(id, kind);

        let mut hits = Vec::new();
        for (idx, edge) in [(old_idx, EventEdge::Leave), (new_idx, EventEdge::Enter)] {
            for &ev in &inner.cells[idx].events {
                if ev == id {
                    continue;
                }
                let enabled = matches!(
                    inner.objects.get(&ev),
                    Some(GameObject {
                        body: ObjectBody::Event(b),
                        ..
                    }) if b.enabled
                );
                if enabled {
                    hits.push(EventHit {
                        event: ev,
                        actor: id,
                        edge,
                    });
                }
            }
        }
        inner.event_queue.extend(hits);
        true
    }

    /// Turn an object in place.
    pub fn set_direction(&self, id: EntityId, dir: Direction) -> bool {
        let mut inner = self.lock();
        match inner.objects.get_mut(&id) {
            Some(o) => {
                o.dir = dir;
                true
            }
            None => false,
        }
    }

    // ---- queries ----------------------------------------------------------

    pub fn position_of(&self, id: EntityId) -> Option<(u16, u16)> {
        self.lock().objects.get(&id).map(|o| (o.x, o.y))
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.lock().objects.contains_key(&id)
    }

    /// Read access to one object under the map lock.
    pub fn with_object<R>(&self, id: EntityId, f: impl FnOnce(&GameObject) -> R) -> Option<R> {
        self.lock().objects.get(&id).map(f)
    }

    /// Mutable access to one object under the map lock.
    pub fn with_object_mut<R>(
        &self,
        id: EntityId,
        f: impl FnOnce(&mut GameObject) -> R,
    ) -> Option<R> {
        self.lock().objects.get_mut(&id).map(f)
    }

    /// Snapshot of the ids occupying one cell.
    pub fn object_at(&self, x: u16, y: u16) -> Vec<EntityId> {
        if !self.in_bounds(x, y) {
            return Vec::new();
        }
        self.lock().cells[self.cell_index(x, y)].objects.clone()
    }

    /// Number of objects currently occupying (x, y).
    pub fn dup_count(&self, x: u16, y: u16) -> usize {
        if !self.in_bounds(x, y) {
            return 0;
        }
        self.lock().cells[self.cell_index(x, y)].objects.len()
    }

    fn objects_in_range_locked(
        &self,
        inner: &MapInner,
        cx: u16,
        cy: u16,
        radius: u16,
    ) -> Vec<EntityId> {
        let r = radius as i32;
        let x0 = (cx as i32 - r).max(0) as u16;
        let y0 = (cy as i32 - r).max(0) as u16;
        let x1 = (cx as i32 + r).min(self.width as i32 - 1) as u16;
        let y1 = (cy as i32 + r).min(self.height as i32 - 1) as u16;
        let mut out = Vec::new();
        for y in y0..=y1 {
            for x in x0..=x1 {
                out.extend_from_slice(&inner.cells[self.cell_index(x, y)].objects);
            }
        }
        out
    }

    fn players_in_range_locked(
        inner: &MapInner,
        cx: u16,
        cy: u16,
        radius: u16,
    ) -> Vec<PlayerHandle> {
        let mut out = Vec::new();
        for &pid in &inner.players {
            if let Some(o) = inner.objects.get(&pid) {
                if chebyshev(o.x, o.y, cx, cy) <= radius as u32 {
                    if let ObjectBody::Player(p) = &o.body {
                        out.push(PlayerHandle {
                            id: pid,
                            conn_id: p.conn_id,
                            x: o.x,
                            y: o.y,
                            tx: p.tx.clone(),
                        });
                    }
                }
            }
        }
        out
    }

    fn category_in_range(
        &self,
        cx: u16,
        cy: u16,
        radius: u16,
        pick: impl Fn(&MapInner) -> &HashSet<EntityId>,
    ) -> Vec<EntityId> {
        let inner = self.lock();
        pick(&inner)
            .iter()
            .filter(|&&id| {
                inner
                    .objects
                    .get(&id)
                    .is_some_and(|o| chebyshev(o.x, o.y, cx, cy) <= radius as u32)
            })
            .copied()
            .collect()
    }

    /// All objects within Chebyshev `radius` of (cx, cy).
    pub fn objects_in_range(&self, cx: u16, cy: u16, radius: u16) -> Vec<EntityId> {
        let inner = self.lock();
        self.objects_in_range_locked(&inner, cx, cy, radius)
    }

    /// Players within range, with their outbound queue handles.
    pub fn players_in_range(&self, cx: u16, cy: u16, radius: u16) -> Vec<PlayerHandle> {
        Self::players_in_range_locked(&self.lock(), cx, cy, radius)
    }

    pub fn monsters_in_range(&self, cx: u16, cy: u16, radius: u16) -> Vec<EntityId> {
        self.category_in_range(cx, cy, radius, |i| &i.monsters)
    }

    pub fn npcs_in_range(&self, cx: u16, cy: u16, radius: u16) -> Vec<EntityId> {
        self.category_in_range(cx, cy, radius, |i| &i.npcs)
    }

    pub fn items_in_range(&self, cx: u16, cy: u16, radius: u16) -> Vec<EntityId> {
        self.category_in_range(cx, cy, radius, |i| &i.items)
    }

    /// Outbound handle for one specific player on this map.
    pub fn player_handle(&self, id: EntityId) -> Option<PlayerHandle> {
        let inner = self.lock();
        let o = inner.objects.get(&id)?;
        match &o.body {
            ObjectBody::Player(p) => Some(PlayerHandle {
                id,
                conn_id: p.conn_id,
                x: o.x,
                y: o.y,
                tx: p.tx.clone(),
            }),
            _ => None,
        }
    }

    /// Snapshots of the per-category registries, for AI iteration.
    pub fn monster_ids(&self) -> Vec<EntityId> {
        self.lock().monsters.iter().copied().collect()
    }

    pub fn npc_ids(&self) -> Vec<EntityId> {
        self.lock().npcs.iter().copied().collect()
    }

    pub fn player_count(&self) -> usize {
        self.lock().players.len()
    }

    // ---- broadcast --------------------------------------------------------

    /// Push `frame` to every player within `radius` of (cx, cy), minus
    /// `exclude` (typically the actor, to avoid echo). The range query
    /// runs against post-mutation state by construction: callers mutate
    /// first, broadcast second.
    pub fn broadcast_near(
        &self,
        cx: u16,
        cy: u16,
        radius: u16,
        exclude: Option<EntityId>,
        frame: &Frame,
    ) {
        let bytes = Bytes::from(frame.encode());
        for handle in self.players_in_range(cx, cy, radius) {
            if Some(handle.id) != exclude {
                let _ = handle.tx.send(bytes.clone());
            }
        }
    }

    /// Move an object and push every resulting view change: a move frame
    /// to observers that keep it in range, appear/vanish notices to
    /// observers it enters/leaves, and the symmetric delta to the mover's
    /// own view when the mover is a player. Range queries run after the
    /// mutation. Both session movement and AI steps route through here;
    /// a raw [`move_object`](Self::move_object) emits no notices at all.
    pub fn move_with_visibility(&self, mover: EntityId, nx: u16, ny: u16, radius: u16) -> bool {
        let Some((ox, oy)) = self.position_of(mover) else {
            return false;
        };
        if !self.move_object(mover, nx, ny) {
            return false;
        }
        if (ox, oy) == (nx, ny) {
            return true;
        }

        let move_frame = self
            .with_object(mover, |o| {
                Frame::with_params(cmd::SC_MOVE, nx, ny, o.dir as u16)
                    .payload(mover.raw().to_le_bytes().to_vec())
            })
            .unwrap_or_else(|| Frame::with_params(cmd::SC_MOVE, nx, ny, 0));
        let appear = self.with_object(mover, |o| o.appearance());
        let vanish = self.with_object(mover, |o| o.vanish());

        let old_players = self.players_in_range(ox, oy, radius);
        let new_players = self.players_in_range(nx, ny, radius);
        let new_ids: HashSet<EntityId> = new_players.iter().map(|h| h.id).collect();
        let old_ids: HashSet<EntityId> = old_players.iter().map(|h| h.id).collect();

        for h in &new_players {
            if h.id == mover {
                continue;
            }
            if old_ids.contains(&h.id) {
                h.send(&move_frame);
            } else if let Some(appear) = &appear {
                // Newly in range: they need the full appearance payload.
                h.send(appear);
            }
        }
        if let Some(vanish) = &vanish {
            for h in &old_players {
                if h.id != mover && !new_ids.contains(&h.id) {
                    h.send(vanish);
                }
            }
        }

        // The mover's own view delta, players only.
        if let Some(me) = self.player_handle(mover) {
            let old_view: HashSet<EntityId> =
                self.objects_in_range(ox, oy, radius).into_iter().collect();
            let new_view: HashSet<EntityId> =
                self.objects_in_range(nx, ny, radius).into_iter().collect();
            for gone in old_view.difference(&new_view) {
                if let Some(Some(f)) = self.with_object(*gone, |o| {
                    if o.is_visible() {
                        Some(o.vanish())
                    } else {
                        None
                    }
                }) {
                    me.send(&f);
                }
            }
            for seen in new_view.difference(&old_view) {
                if let Some(Some(f)) = self.with_object(*seen, |o| {
                    if o.is_visible() {
                        Some(o.appearance())
                    } else {
                        None
                    }
                }) {
                    me.send(&f);
                }
            }
        }
        true
    }

    // ---- placement helpers ------------------------------------------------

    /// Walk the fixed concentric-ring offset table (radius 1..=4) around
    /// (cx, cy) and return the free tile with the lowest occupancy; ties
    /// favor the earlier-scanned offset. The center tile is considered
    /// first. Used for spawn and item-drop placement.
    pub fn find_free_tile(&self, cx: u16, cy: u16) -> Option<(u16, u16)> {
        let mut best: Option<((u16, u16), usize)> = None;
        for (dx, dy) in std::iter::once((0, 0)).chain(ring_offsets()) {
            let x = cx as i32 + dx;
            let y = cy as i32 + dy;
            if x < 0 || y < 0 {
                continue;
            }
            let (x, y) = (x as u16, y as u16);
            if self.is_blocked(x, y) {
                continue;
            }
            let occupancy = self.dup_count(x, y);
            if occupancy == 0 {
                return Some((x, y));
            }
            if best.map_or(true, |(_, n)| occupancy < n) {
                best = Some(((x, y), occupancy));
            }
        }
        best.map(|(tile, _)| tile)
    }

    // ---- update-loop support ----------------------------------------------

    /// Remove items whose expiry timestamp has passed, with removal
    /// notices to observers. Returns how many were reaped.
    pub fn reap_expired_items(&self, now: Instant) -> usize {
        let expired: Vec<EntityId> = {
            let inner = self.lock();
            inner
                .items
                .iter()
                .filter(|&&id| {
                    matches!(
                        inner.objects.get(&id),
                        Some(GameObject {
                            body: ObjectBody::Item(it),
                            ..
                        }) if it.expires_at <= now
                    )
                })
                .copied()
                .collect()
        };
        let n = expired.len();
        for id in expired {
            self.remove_object(id);
        }
        n
    }

    /// Drain queued event-object crossings.
    pub fn drain_events(&self) -> Vec<EventHit> {
        std::mem::take(&mut self.lock().event_queue)
    }
}

fn chebyshev(x0: u16, y0: u16, x1: u16, y1: u16) -> u32 {
    let dx = (x0 as i32 - x1 as i32).unsigned_abs();
    let dy = (y0 as i32 - y1 as i32).unsigned_abs();
    dx.max(dy)
}

/// Fixed scan order for free-tile searches: ring radius 1 first, then 2,
/// 3, 4; within each ring row-major from the top-left corner.
fn ring_offsets() -> impl Iterator<Item = (i32, i32)> {
    (1..=RING_SCAN_MAX_RADIUS).flat_map(|r| {
        (-r..=r).flat_map(move |dy| {
            (-r..=r).filter_map(move |dx| {
                if dx.abs().max(dy.abs()) == r {
                    Some((dx, dy))
                } else {
                    None
                }
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::id::IdAllocator;
    use crate::game::object::{EventBody, EventKind, ItemBody, MonsterBody, PlayerBody};
    use crate::network::cmd;
    use crate::network::frame::FrameScanner;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_map() -> Map {
        Map::new(1, "plains", 100, 100)
    }

    fn player_at(alloc: &IdAllocator, x: u16, y: u16) -> (GameObject, crate::network::OutboundRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = alloc.next_id(ObjectKind::Player);
        let obj = GameObject::new(
            id,
            x,
            y,
            ObjectBody::Player(PlayerBody {
                name: format!("P{}", id.sequence()),
                look: 1,
                conn_id: id.sequence() as u64,
                tx,
            }),
        );
        (obj, rx)
    }

    fn monster_at(alloc: &IdAllocator, x: u16, y: u16) -> GameObject {
        let id = alloc.next_id(ObjectKind::Monster);
        GameObject::new(
            id,
            x,
            y,
            ObjectBody::Monster(MonsterBody {
                mob_id: 1,
                look: 9,
                hp: 10,
                max_hp: 10,
                spawn_x: x,
                spawn_y: y,
                leash: 8,
                target: None,
                move_cooldown: 0,
            }),
        )
    }

    fn drain_commands(rx: &mut crate::network::OutboundRx) -> Vec<u16> {
        let mut sc = FrameScanner::new();
        while let Ok(b) = rx.try_recv() {
            sc.push(&b);
        }
        let mut cmds = Vec::new();
        while let Some(f) = sc.next_frame() {
            cmds.push(f.command);
        }
        cmds
    }

    #[test]
    fn test_add_rejects_out_of_bounds() {
        let map = test_map();
        let alloc = IdAllocator::new();
        let (p, _rx) = player_at(&alloc, 0, 0);
        let id = p.id;
        assert!(!map.add_object(p, 100, 50));
        assert!(!map.contains(id));
    }

    #[test]
    fn test_add_then_move_updates_cells() {
        let map = test_map();
        let alloc = IdAllocator::new();
        let m = monster_at(&alloc, 10, 10);
        let id = m.id;
        assert!(map.add_object(m, 10, 10));
        assert!(map.move_object(id, 12, 11));
        assert!(map.object_at(12, 11).contains(&id));
        assert!(!map.object_at(10, 10).contains(&id));
        assert_eq!(map.position_of(id), Some((12, 11)));
    }

    #[test]
    fn test_move_out_of_bounds_leaves_position() {
        let map = test_map();
        let alloc = IdAllocator::new();
        let m = monster_at(&alloc, 10, 10);
        let id = m.id;
        map.add_object(m, 10, 10);
        assert!(!map.move_object(id, 100, 10));
        assert_eq!(map.position_of(id), Some((10, 10)));
    }

    #[test]
    fn test_move_to_same_tile_is_noop_true() {
        let map = test_map();
        let alloc = IdAllocator::new();
        let m = monster_at(&alloc, 5, 5);
        let id = m.id;
        map.add_object(m, 5, 5);
        assert!(map.move_object(id, 5, 5));
        assert_eq!(map.object_at(5, 5), vec![id]);
    }

    #[test]
    fn test_move_to_blocked_tile_rejected() {
        let map = Map::new(1, "walls", 20, 20).with_blocked_tiles(&[(6, 5)]);
        let alloc = IdAllocator::new();
        let m = monster_at(&alloc, 5, 5);
        let id = m.id;
        map.add_object(m, 5, 5);
        assert!(!map.move_object(id, 6, 5));
        assert_eq!(map.position_of(id), Some((5, 5)));
    }

    #[test]
    fn test_remove_missing_returns_false() {
        let map = test_map();
        assert!(!map.remove_object(EntityId::new(ObjectKind::Monster, 42)));
    }

    #[test]
    fn test_is_blocked_locked_tile() {
        let map = test_map();
        assert!(!map.is_blocked(3, 3));
        map.lock_tile(3, 3);
        assert!(map.is_blocked(3, 3));
        map.unlock_tile(3, 3);
        assert!(!map.is_blocked(3, 3));
    }

    #[test]
    fn test_range_symmetry_chebyshev() {
        let map = test_map();
        let alloc = IdAllocator::new();
        // (14, 14) is exactly at Chebyshev distance 4; (15, 10) at 5.
        let positions = [(10u16, 10u16), (14, 14), (15, 10), (10, 15), (6, 6)];
        for &(x, y) in &positions {
            let (p, rx) = player_at(&alloc, x, y);
            std::mem::forget(rx);
            map.add_object(p, x, y);
        }
        let in_range: Vec<(u16, u16)> = map
            .players_in_range(10, 10, 4)
            .iter()
            .map(|h| (h.x, h.y))
            .collect();
        for &(x, y) in &positions {
            let expected = chebyshev(x, y, 10, 10) <= 4;
            assert_eq!(
                in_range.contains(&(x, y)),
                expected,
                "({},{}) range membership",
                x,
                y
            );
        }
    }

    #[test]
    fn test_mutual_visibility_on_add() {
        let map = test_map();
        let alloc = IdAllocator::new();
        let (a, mut a_rx) = player_at(&alloc, 10, 10);
        let (b, mut b_rx) = player_at(&alloc, 15, 15);
        map.add_object(a, 10, 10);
        map.add_object(b, 15, 15);

        // A got the clear/resend for its own entry, then exactly one
        // appearance push when B entered range.
        let a_cmds = drain_commands(&mut a_rx);
        assert_eq!(
            a_cmds.iter().filter(|&&c| c == cmd::SC_APPEAR).count(),
            1,
            "A sees B exactly once"
        );

        // B's entry resend contains A exactly once.
        let b_cmds = drain_commands(&mut b_rx);
        assert_eq!(b_cmds.first(), Some(&cmd::SC_CLEAR_OBJECTS));
        assert_eq!(
            b_cmds.iter().filter(|&&c| c == cmd::SC_APPEAR).count(),
            1,
            "B sees A exactly once"
        );
    }

    #[test]
    fn test_remove_pushes_vanish() {
        let map = test_map();
        let alloc = IdAllocator::new();
        let (a, mut a_rx) = player_at(&alloc, 10, 10);
        map.add_object(a, 10, 10);
        let m = monster_at(&alloc, 12, 12);
        let mid = m.id;
        map.add_object(m, 12, 12);
        drain_commands(&mut a_rx);

        assert!(map.remove_object(mid));
        let cmds = drain_commands(&mut a_rx);
        assert_eq!(cmds, vec![cmd::SC_VANISH]);
    }

    #[test]
    fn test_move_with_visibility_boundary_notices() {
        let map = Map::new(1, "strip", 60, 40);
        let alloc = IdAllocator::new();
        let (obs, mut obs_rx) = player_at(&alloc, 10, 10);
        map.add_object(obs, 10, 10);
        // Distance 18: just inside the view radius.
        let m = monster_at(&alloc, 28, 10);
        let mid = m.id;
        map.add_object(m, 28, 10);
        drain_commands(&mut obs_rx);

        // Stepping out of range must leave no ghost behind.
        assert!(map.move_with_visibility(mid, 29, 10, DEFAULT_VIEW_RADIUS));
        assert_eq!(drain_commands(&mut obs_rx), vec![cmd::SC_VANISH]);

        // Stepping back in needs the full appearance payload, not a move.
        assert!(map.move_with_visibility(mid, 28, 10, DEFAULT_VIEW_RADIUS));
        assert_eq!(drain_commands(&mut obs_rx), vec![cmd::SC_APPEAR]);

        // A step that stays in range is a plain move notice.
        assert!(map.move_with_visibility(mid, 27, 10, DEFAULT_VIEW_RADIUS));
        assert_eq!(drain_commands(&mut obs_rx), vec![cmd::SC_MOVE]);
    }

    #[test]
    fn test_event_enter_leave_queued() {
        let map = test_map();
        let alloc = IdAllocator::new();
        let ev_id = alloc.next_id(ObjectKind::Event);
        let ev = GameObject::new(
            ev_id,
            6,
            5,
            ObjectBody::Event(EventBody {
                enabled: true,
                kind: EventKind::Warp { map: 2, x: 1, y: 1 },
            }),
        );
        map.add_object(ev, 6, 5);

        let m = monster_at(&alloc, 5, 5);
        let id = m.id;
        map.add_object(m, 5, 5);

        map.move_object(id, 6, 5);
        map.move_object(id, 7, 5);

        let hits = map.drain_events();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].edge, EventEdge::Enter);
        assert_eq!(hits[0].actor, id);
        assert_eq!(hits[0].event, ev_id);
        assert_eq!(hits[1].edge, EventEdge::Leave);
        assert!(map.drain_events().is_empty());
    }

    #[test]
    fn test_disabled_event_ignored() {
        let map = test_map();
        let alloc = IdAllocator::new();
        let ev = GameObject::new(
            alloc.next_id(ObjectKind::Event),
            6,
            5,
            ObjectBody::Event(EventBody {
                enabled: false,
                kind: EventKind::Script { hook: "trap".into() },
            }),
        );
        map.add_object(ev, 6, 5);
        let m = monster_at(&alloc, 5, 5);
        let id = m.id;
        map.add_object(m, 5, 5);
        map.move_object(id, 6, 5);
        assert!(map.drain_events().is_empty());
    }

    #[test]
    fn test_find_free_tile_prefers_empty() {
        let map = test_map();
        let alloc = IdAllocator::new();
        // Center occupied; first ring offset is (-1,-1).
        let m = monster_at(&alloc, 10, 10);
        map.add_object(m, 10, 10);
        assert_eq!(map.find_free_tile(10, 10), Some((9, 9)));
    }

    #[test]
    fn test_find_free_tile_least_occupied_tie_break() {
        let map = Map::new(1, "corner", 2, 1);
        let alloc = IdAllocator::new();
        // Two objects at (0,0), one at (1,0): scan must settle on (1,0).
        for _ in 0..2 {
            let m = monster_at(&alloc, 0, 0);
            map.add_object(m, 0, 0);
        }
        let m = monster_at(&alloc, 1, 0);
        map.add_object(m, 1, 0);
        assert_eq!(map.find_free_tile(0, 0), Some((1, 0)));
    }

    #[test]
    fn test_dup_count() {
        let map = test_map();
        let alloc = IdAllocator::new();
        assert_eq!(map.dup_count(4, 4), 0);
        for _ in 0..3 {
            let m = monster_at(&alloc, 4, 4);
            map.add_object(m, 4, 4);
        }
        assert_eq!(map.dup_count(4, 4), 3);
    }

    #[test]
    fn test_reap_expired_items() {
        let map = test_map();
        let alloc = IdAllocator::new();
        let now = Instant::now();
        for (offset, expired) in [(0u64, true), (60, false)] {
            let id = alloc.next_id(ObjectKind::Item);
            let it = GameObject::new(
                id,
                8,
                8,
                ObjectBody::Item(ItemBody {
                    item_id: 3,
                    amount: 1,
                    owner: None,
                    expires_at: now + Duration::from_secs(offset),
                }),
            );
            map.add_object(it, 8, 8);
            let _ = expired;
        }
        let reaped = map.reap_expired_items(now + Duration::from_secs(1));
        assert_eq!(reaped, 1);
        assert_eq!(map.items_in_range(8, 8, 0).len(), 1);
    }

    #[test]
    fn test_atomic_move_concurrent_readers() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let map = Arc::new(test_map());
        let alloc = IdAllocator::new();
        let m = monster_at(&alloc, 10, 10);
        let id = m.id;
        map.add_object(m, 10, 10);

        let stop = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..4 {
            let map = Arc::clone(&map);
            let stop = Arc::clone(&stop);
            readers.push(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let seen = map
                        .objects_in_range(10, 10, 18)
                        .iter()
                        .filter(|&&o| o == id)
                        .count();
                    assert_eq!(seen, 1, "object must be in exactly one cell");
                }
            }));
        }

        for i in 0..2_000u16 {
            let (x, y) = (10 + (i % 2), 10 + ((i / 2) % 2));
            assert!(map.move_object(id, x, y) || map.position_of(id) == Some((x, y)));
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn test_map_flags() {
        let mut flags = HashMap::new();
        flags.insert(MapFlag::SafeZone, 1);
        flags.insert(MapFlag::DeathPenalty, 25);
        let map = Map::new(3, "town", 10, 10).with_flags(flags);
        assert!(map.has_flag(MapFlag::SafeZone));
        assert_eq!(map.flag(MapFlag::DeathPenalty), Some(25));
        assert!(!map.has_flag(MapFlag::NoPk));
        assert_eq!(MapFlag::from_name("no_pk"), Some(MapFlag::NoPk));
        assert_eq!(MapFlag::from_name("bogus"), None);
    }
}
