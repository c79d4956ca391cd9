//! The world service: map registry, global player directory, and the
//! update tick.
//!
//! Constructed once at startup from the static map definitions and
//! injected wherever it is needed; there is no implicit global state.
//! Maps are long-lived singletons keyed by numeric id and are never
//! destroyed while the process runs.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{MapDef, ServerConfig};
use crate::game::id::{EntityId, IdAllocator, ObjectKind};
use crate::game::map::{EventEdge, Map, MapFlag};
use crate::game::object::{
    EventBody, EventKind, GameObject, ItemBody, MonsterBody, NpcBody, ObjectBody,
};
use crate::game::{mob, npc};

/// Directory record for one connected player.
#[derive(Debug, Clone)]
pub struct PlayerEntry {
    pub id: EntityId,
    pub name: String,
    pub map_id: u16,
    pub conn_id: u64,
}

#[derive(Default)]
struct Directory {
    by_id: HashMap<EntityId, PlayerEntry>,
    /// Keyed by lowercase name.
    by_name: HashMap<String, EntityId>,
}

pub struct World {
    maps: HashMap<u16, Arc<Map>>,
    pub ids: IdAllocator,
    pub item_expiry: Duration,
    directory: RwLock<Directory>,
}

impl World {
    /// Build the world from static map definitions. Fails startup when
    /// no maps are defined or a definition is degenerate; a broken grid
    /// is a fatal error, not something to limp past.
    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        if config.maps.is_empty() {
            anyhow::bail!("no maps defined; the world needs at least one");
        }
        let world = Self {
            maps: HashMap::new(),
            ids: IdAllocator::new(),
            item_expiry: Duration::from_secs(config.item_expiry_secs),
            directory: RwLock::new(Directory::default()),
        };
        let mut world = world;
        for def in &config.maps {
            let map = world.build_map(def, config.view_radius)?;
            world.maps.insert(def.id, Arc::new(map));
        }
        // Populate after all maps exist so warp events can be sanity
        // checked against their destination map.
        for def in &config.maps {
            world.populate_map(def);
        }
        tracing::info!("[world] [load] {} maps loaded", world.maps.len());
        Ok(world)
    }

    fn build_map(&self, def: &MapDef, view_radius: u16) -> anyhow::Result<Map> {
        if def.width == 0 || def.height == 0 {
            anyhow::bail!("map {} ({}) has zero dimension", def.id, def.name);
        }
        let mut flags = HashMap::new();
        for f in &def.flags {
            match MapFlag::from_name(&f.name) {
                Some(flag) => {
                    flags.insert(flag, f.param);
                }
                None => {
                    tracing::warn!("[world] [load] map {} unknown flag '{}'", def.id, f.name)
                }
            }
        }
        let mut map = Map::new(def.id, def.name.clone(), def.width, def.height)
            .with_flags(flags)
            .with_blocked_tiles(&def.blocked);
        map.view_radius = view_radius;
        Ok(map)
    }

    fn populate_map(&self, def: &MapDef) {
        let Some(map) = self.maps.get(&def.id) else {
            return;
        };
        for spawn in &def.spawns {
            for _ in 0..spawn.count {
                self.spawn_monster(map, spawn.mob_id, spawn.look, spawn.x, spawn.y, spawn.hp, spawn.leash);
            }
        }
        for n in &def.npcs {
            let id = self.ids.next_id(ObjectKind::Npc);
            let obj = GameObject::new(
                id,
                n.x,
                n.y,
                ObjectBody::Npc(NpcBody {
                    npc_id: n.npc_id,
                    name: n.name.clone(),
                    look: n.look,
                    wander: n.wander,
                    home_x: n.x,
                    home_y: n.y,
                }),
            );
            if !map.add_object(obj, n.x, n.y) {
                tracing::warn!("[world] [load] npc '{}' rejected at ({},{})", n.name, n.x, n.y);
            }
        }
        for e in &def.events {
            let kind = match (&e.warp, &e.hook) {
                (Some(w), _) => {
                    if !self.maps.contains_key(&w.map) {
                        tracing::warn!(
                            "[world] [load] warp on map {} targets unknown map {}",
                            def.id,
                            w.map
                        );
                    }
                    EventKind::Warp {
                        map: w.map,
                        x: w.x,
                        y: w.y,
                    }
                }
                (None, Some(h)) => EventKind::Script { hook: h.clone() },
                (None, None) => {
                    tracing::warn!("[world] [load] event on map {} has no action", def.id);
                    continue;
                }
            };
            let id = self.ids.next_id(ObjectKind::Event);
            let obj = GameObject::new(
                id,
                e.x,
                e.y,
                ObjectBody::Event(EventBody {
                    enabled: e.enabled,
                    kind,
                }),
            );
            map.add_object(obj, e.x, e.y);
        }
    }

    pub fn map(&self, id: u16) -> Option<Arc<Map>> {
        self.maps.get(&id).cloned()
    }

    pub fn maps(&self) -> impl Iterator<Item = &Arc<Map>> {
        self.maps.values()
    }

    // ---- player directory -------------------------------------------------

    /// Register a player in the by-id and by-name directories. Rejects
    /// duplicate names (case-insensitive) without mutation.
    pub fn register_player(&self, entry: PlayerEntry) -> bool {
        let mut dir = self
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let key = entry.name.to_ascii_lowercase();
        if dir.by_name.contains_key(&key) {
            return false;
        }
        dir.by_name.insert(key, entry.id);
        dir.by_id.insert(entry.id, entry);
        true
    }

    pub fn unregister_player(&self, id: EntityId) {
        let mut dir = self
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = dir.by_id.remove(&id) {
            dir.by_name.remove(&entry.name.to_ascii_lowercase());
        }
    }

    pub fn player_entry(&self, id: EntityId) -> Option<PlayerEntry> {
        self.directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .cloned()
    }

    pub fn player_by_name(&self, name: &str) -> Option<PlayerEntry> {
        let dir = self
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let id = dir.by_name.get(&name.to_ascii_lowercase())?;
        dir.by_id.get(id).cloned()
    }

    pub fn set_player_map(&self, id: EntityId, map_id: u16) {
        let mut dir = self
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = dir.by_id.get_mut(&id) {
            entry.map_id = map_id;
        }
    }

    pub fn online_count(&self) -> usize {
        self.directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    // ---- spawning ---------------------------------------------------------

    /// Spawn a monster near (x, y), scattering onto the first free tile.
    pub fn spawn_monster(
        &self,
        map: &Map,
        mob_id: u16,
        look: u16,
        x: u16,
        y: u16,
        hp: u32,
        leash: u16,
    ) -> Option<EntityId> {
        let (sx, sy) = map.find_free_tile(x, y)?;
        let id = self.ids.next_id(ObjectKind::Monster);
        let obj = GameObject::new(
            id,
            sx,
            sy,
            ObjectBody::Monster(MonsterBody {
                mob_id,
                look,
                hp,
                max_hp: hp,
                spawn_x: sx,
                spawn_y: sy,
                leash,
                target: None,
                move_cooldown: 0,
            }),
        );
        if map.add_object(obj, sx, sy) {
            Some(id)
        } else {
            tracing::warn!("[world] [spawn] mob {} rejected at ({},{})", mob_id, sx, sy);
            None
        }
    }

    /// Drop an item near (x, y) on the first free tile, owner-protected.
    pub fn drop_item(
        &self,
        map: &Map,
        item_id: u16,
        amount: u16,
        x: u16,
        y: u16,
        owner: Option<EntityId>,
    ) -> Option<EntityId> {
        let (dx, dy) = map.find_free_tile(x, y)?;
        let id = self.ids.next_id(ObjectKind::Item);
        let obj = GameObject::new(
            id,
            dx,
            dy,
            ObjectBody::Item(ItemBody {
                item_id,
                amount,
                owner,
                expires_at: Instant::now() + self.item_expiry,
            }),
        );
        if map.add_object(obj, dx, dy) {
            Some(id)
        } else {
            None
        }
    }

    /// Move an object to another map (or another place on the same map),
    /// preserving its identity. Lands on the nearest free tile to the
    /// requested destination.
    pub fn warp_object(&self, from_map: u16, id: EntityId, to_map: u16, x: u16, y: u16) -> bool {
        let Some(src) = self.map(from_map) else {
            return false;
        };
        let Some(dst) = self.map(to_map) else {
            return false;
        };
        let Some((dx, dy)) = dst.find_free_tile(x, y) else {
            return false;
        };
        let Some(obj) = src.take_object(id) else {
            return false;
        };
        if !dst.add_object(obj, dx, dy) {
            // Destination refused; the object is gone from the source
            // already, so this is a hard failure worth shouting about.
            tracing::error!(
                "[world] [warp] {} lost in transit {}->{} ({},{})",
                id,
                from_map,
                to_map,
                dx,
                dy
            );
            return false;
        }
        if id.kind() == Some(ObjectKind::Player) {
            self.set_player_map(id, to_map);
        }
        true
    }

    // ---- update loop ------------------------------------------------------

    /// One world update pass: advance monster and NPC AI, reap expired
    /// items, then dispatch queued event-object crossings. Driven at a
    /// fixed cadence by the process entry point, never self-scheduling.
    pub fn tick(&self, rng: &mut impl Rng, now: Instant) {
        for map in self.maps.values() {
            let reaped = map.reap_expired_items(now);
            if reaped > 0 {
                tracing::debug!("[world] [tick] map {} reaped {} items", map.id, reaped);
            }
            mob::tick(map, rng);
            npc::tick(map, rng);
        }
        // Events after AI so steps from this very tick are included.
        for map in self.maps.values().cloned().collect::<Vec<_>>() {
            for hit in map.drain_events() {
                self.dispatch_event(&map, hit.event, hit.actor, hit.edge);
            }
        }
    }

    fn dispatch_event(&self, map: &Arc<Map>, event: EntityId, actor: EntityId, edge: EventEdge) {
        let kind = map.with_object(event, |o| match &o.body {
            ObjectBody::Event(b) if b.enabled => Some(b.kind.clone()),
            _ => None,
        });
        let Some(Some(kind)) = kind else {
            return;
        };
        match (kind, edge) {
            (EventKind::Warp { map: to, x, y }, EventEdge::Enter) => {
                if !self.warp_object(map.id, actor, to, x, y) {
                    tracing::debug!("[world] [event] warp failed for {}", actor);
                }
            }
            (EventKind::Warp { .. }, EventEdge::Leave) => {}
            (EventKind::Script { hook }, edge) => {
                tracing::debug!(
                    "[world] [event] script hook '{}' {:?} actor={}",
                    hook,
                    edge,
                    actor
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_map_world() -> World {
        let cfg = ServerConfig::from_str(
            r#"
maps:
  - id: 1
    name: plains
    width: 50
    height: 50
    events:
      - x: 5
        y: 6
        warp:
          map: 2
          x: 10
          y: 10
  - id: 2
    name: cave
    width: 30
    height: 30
"#,
        )
        .unwrap();
        World::from_config(&cfg).unwrap()
    }

    #[test]
    fn test_empty_world_rejected() {
        let cfg = ServerConfig::from_str("maps: []").unwrap();
        assert!(World::from_config(&cfg).is_err());
    }

    #[test]
    fn test_spawns_and_npcs_populated() {
        let cfg = ServerConfig::from_str(
            r#"
maps:
  - id: 1
    name: plains
    width: 50
    height: 50
    spawns:
      - mob_id: 7
        x: 10
        y: 10
        count: 4
    npcs:
      - npc_id: 1
        name: Guard
        x: 20
        y: 20
"#,
        )
        .unwrap();
        let world = World::from_config(&cfg).unwrap();
        let map = world.map(1).unwrap();
        assert_eq!(map.monsters_in_range(10, 10, 5).len(), 4);
        assert_eq!(map.npcs_in_range(20, 20, 0).len(), 1);
    }

    #[test]
    fn test_player_directory_case_insensitive() {
        let world = two_map_world();
        let id = world.ids.next_id(ObjectKind::Player);
        assert!(world.register_player(PlayerEntry {
            id,
            name: "Yuria".into(),
            map_id: 1,
            conn_id: 1,
        }));
        let other = world.ids.next_id(ObjectKind::Player);
        assert!(!world.register_player(PlayerEntry {
            id: other,
            name: "YURIA".into(),
            map_id: 1,
            conn_id: 2,
        }));
        assert_eq!(world.player_by_name("yuria").unwrap().id, id);
        world.unregister_player(id);
        assert!(world.player_by_name("Yuria").is_none());
    }

    #[test]
    fn test_warp_event_moves_monster_between_maps() {
        let world = two_map_world();
        let plains = world.map(1).unwrap();
        let cave = world.map(2).unwrap();
        let mob_id = world.spawn_monster(&plains, 7, 0, 5, 5, 10, 0).unwrap();
        let (sx, sy) = plains.position_of(mob_id).unwrap();
        assert_eq!((sx, sy), (5, 5));

        assert!(plains.move_object(mob_id, 5, 6)); // onto the warp tile
        let mut rng = StdRng::seed_from_u64(1);
        world.tick(&mut rng, Instant::now());

        assert!(!plains.contains(mob_id));
        assert!(cave.contains(mob_id));
        let (x, y) = cave.position_of(mob_id).unwrap();
        assert!(x.abs_diff(10) <= 4 && y.abs_diff(10) <= 4);
    }

    #[test]
    fn test_drop_item_scatters_to_free_tile() {
        let world = two_map_world();
        let map = world.map(1).unwrap();
        let a = world.drop_item(&map, 3, 1, 8, 8, None).unwrap();
        let b = world.drop_item(&map, 3, 1, 8, 8, None).unwrap();
        let pa = map.position_of(a).unwrap();
        let pb = map.position_of(b).unwrap();
        assert_ne!(pa, pb, "second drop must scatter off the occupied tile");
        assert_eq!(pa, (8, 8));
    }

    #[test]
    fn test_warp_to_unknown_map_fails() {
        let world = two_map_world();
        let plains = world.map(1).unwrap();
        let mob_id = world.spawn_monster(&plains, 7, 0, 5, 5, 10, 0).unwrap();
        assert!(!world.warp_object(1, mob_id, 99, 1, 1));
        assert!(plains.contains(mob_id));
    }
}
