//! Monster AI tick.
//!
//! Each update-loop pass advances every live monster one step: chase an
//! acquired target, acquire the nearest player inside aggro range, or
//! wander within leash distance of the spawn anchor. A failure for one
//! monster is logged and never aborts the tick for the rest.

use rand::{Rng, RngExt};

use crate::game::id::EntityId;
use crate::game::map::{Map, DEFAULT_VIEW_RADIUS};
use crate::game::object::{Direction, ObjectBody};

/// Chebyshev radius inside which a monster notices players.
pub const AGGRO_RADIUS: u16 = 9;
/// Ticks a monster idles between voluntary wander steps.
const WANDER_COOLDOWN: u8 = 3;

/// Advance every monster on `map` one AI step.
pub fn tick(map: &Map, rng: &mut impl Rng) {
    for id in map.monster_ids() {
        step_monster(map, id, rng);
    }
}

fn step_monster(map: &Map, id: EntityId, rng: &mut impl Rng) {
    let Some((x, y)) = map.position_of(id) else {
        // Removed between snapshot and step; nothing to do.
        return;
    };

    let state = map.with_object_mut(id, |o| match &mut o.body {
        ObjectBody::Monster(m) => {
            if m.move_cooldown > 0 {
                m.move_cooldown -= 1;
                None
            } else {
                m.move_cooldown = WANDER_COOLDOWN;
                Some((m.target, m.spawn_x, m.spawn_y, m.leash))
            }
        }
        _ => None,
    });
    let Some(Some((target, spawn_x, spawn_y, leash))) = state else {
        return;
    };

    // Validate the current target, or acquire the nearest player.
    let target = target
        .filter(|&t| {
            map.position_of(t)
                .is_some_and(|(tx, ty)| chebyshev(x, y, tx, ty) <= DEFAULT_VIEW_RADIUS as u32)
        })
        .or_else(|| nearest_player(map, x, y, AGGRO_RADIUS));
    map.with_object_mut(id, |o| {
        if let ObjectBody::Monster(m) = &mut o.body {
            m.target = target;
        }
    });

    let dest = match target.and_then(|t| map.position_of(t)) {
        Some((tx, ty)) if chebyshev(x, y, tx, ty) > 1 => step_toward(x, y, tx, ty),
        Some(_) => None, // adjacent: combat is handled by the attack path
        None => wander_step(x, y, spawn_x, spawn_y, leash, rng),
    };

    if let Some((nx, ny)) = dest {
        if !map.move_with_visibility(id, nx, ny, DEFAULT_VIEW_RADIUS) {
            tracing::debug!("[world] [mob] {} blocked moving to ({},{})", id, nx, ny);
        }
    }
}

fn nearest_player(map: &Map, x: u16, y: u16, radius: u16) -> Option<EntityId> {
    map.players_in_range(x, y, radius)
        .into_iter()
        .min_by_key(|h| chebyshev(x, y, h.x, h.y))
        .map(|h| h.id)
}

/// One Chebyshev step toward the target, both axes at once when diagonal.
fn step_toward(x: u16, y: u16, tx: u16, ty: u16) -> Option<(u16, u16)> {
    let nx = (x as i32 + (tx as i32 - x as i32).signum()).max(0) as u16;
    let ny = (y as i32 + (ty as i32 - y as i32).signum()).max(0) as u16;
    if (nx, ny) == (x, y) {
        None
    } else {
        Some((nx, ny))
    }
}

fn wander_step(
    x: u16,
    y: u16,
    spawn_x: u16,
    spawn_y: u16,
    leash: u16,
    rng: &mut impl Rng,
) -> Option<(u16, u16)> {
    // Kited past the leash: walk straight back to the spawn anchor.
    if chebyshev(x, y, spawn_x, spawn_y) > leash as u32 {
        return step_toward(x, y, spawn_x, spawn_y);
    }
    // Half the ticks a monster just stands still.
    if rng.random_bool(0.5) {
        return None;
    }
    let dir = Direction::from_u8(rng.random_range(0..4))?;
    let (dx, dy) = dir.delta();
    let nx = x as i32 + dx;
    let ny = y as i32 + dy;
    if nx < 0 || ny < 0 {
        return None;
    }
    let (nx, ny) = (nx as u16, ny as u16);
    if chebyshev(nx, ny, spawn_x, spawn_y) > leash as u32 {
        return None;
    }
    Some((nx, ny))
}

fn chebyshev(x0: u16, y0: u16, x1: u16, y1: u16) -> u32 {
    let dx = (x0 as i32 - x1 as i32).unsigned_abs();
    let dy = (y0 as i32 - y1 as i32).unsigned_abs();
    dx.max(dy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::id::{IdAllocator, ObjectKind};
    use crate::game::object::{GameObject, MonsterBody, PlayerBody};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::mpsc;

    fn spawn_monster(map: &Map, alloc: &IdAllocator, x: u16, y: u16, leash: u16) -> EntityId {
        let id = alloc.next_id(ObjectKind::Monster);
        let m = GameObject::new(
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
                leash,
                target: None,
                move_cooldown: 0,
            }),
        );
        assert!(map.add_object(m, x, y));
        id
    }

    fn spawn_player(map: &Map, alloc: &IdAllocator, x: u16, y: u16) -> EntityId {
        let (id, rx) = spawn_player_rx(map, alloc, x, y);
        std::mem::forget(rx);
        id
    }

    fn spawn_player_rx(
        map: &Map,
        alloc: &IdAllocator,
        x: u16,
        y: u16,
    ) -> (EntityId, crate::network::OutboundRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = alloc.next_id(ObjectKind::Player);
        let p = GameObject::new(
            id,
            x,
            y,
            ObjectBody::Player(PlayerBody {
                name: "bait".into(),
                look: 1,
                conn_id: 1,
                tx,
            }),
        );
        assert!(map.add_object(p, x, y));
        (id, rx)
    }

    fn drain_commands(rx: &mut crate::network::OutboundRx) -> Vec<u16> {
        let mut sc = crate::network::frame::FrameScanner::new();
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
    fn test_step_toward_diagonal() {
        assert_eq!(step_toward(5, 5, 8, 9), Some((6, 6)));
        assert_eq!(step_toward(5, 5, 5, 2), Some((5, 4)));
        assert_eq!(step_toward(5, 5, 5, 5), None);
    }

    #[test]
    fn test_monster_chases_player_in_aggro_range() {
        let map = Map::new(1, "arena", 50, 50);
        let alloc = IdAllocator::new();
        let mob = spawn_monster(&map, &alloc, 10, 10, 20);
        spawn_player(&map, &alloc, 14, 10);

        let mut rng = StdRng::seed_from_u64(7);
        tick(&map, &mut rng);
        assert_eq!(map.position_of(mob), Some((11, 10)));

        // Cooldown: the next few ticks do not move it.
        for _ in 0..WANDER_COOLDOWN {
            tick(&map, &mut rng);
        }
        assert_eq!(map.position_of(mob), Some((11, 10)));
        tick(&map, &mut rng);
        assert_eq!(map.position_of(mob), Some((12, 10)));
    }

    #[test]
    fn test_monster_ignores_player_outside_aggro() {
        let map = Map::new(1, "arena", 80, 80);
        let alloc = IdAllocator::new();
        // Leash 0 pins a wandering monster to its spawn tile.
        let mob = spawn_monster(&map, &alloc, 10, 10, 0);
        spawn_player(&map, &alloc, 40, 40);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            tick(&map, &mut rng);
        }
        assert_eq!(map.position_of(mob), Some((10, 10)));
    }

    #[test]
    fn test_wander_respects_leash() {
        let map = Map::new(1, "pen", 200, 200);
        let alloc = IdAllocator::new();
        let mob = spawn_monster(&map, &alloc, 100, 100, 3);
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..200 {
            tick(&map, &mut rng);
            let (x, y) = map.position_of(mob).unwrap();
            assert!(chebyshev(x, y, 100, 100) <= 3);
        }
    }

    #[test]
    fn test_monster_leaving_view_notifies_observer() {
        let map = Map::new(1, "strip", 60, 20);
        let alloc = IdAllocator::new();
        let (_observer, mut obs_rx) = spawn_player_rx(&map, &alloc, 10, 10);
        // Chase bait due east, away from the observer.
        let bait = spawn_player(&map, &alloc, 46, 10);
        // Distance 18 from both: right on the observer's view boundary.
        let mob = spawn_monster(&map, &alloc, 28, 10, 30);
        map.with_object_mut(mob, |o| {
            o.as_monster_mut().unwrap().target = Some(bait);
        });
        drain_commands(&mut obs_rx);

        let mut rng = StdRng::seed_from_u64(7);
        tick(&map, &mut rng);
        assert_eq!(map.position_of(mob), Some((29, 10)));

        // Distance is now 19: the observer must be told it left view.
        let cmds = drain_commands(&mut obs_rx);
        assert!(
            cmds.contains(&crate::network::cmd::SC_VANISH),
            "observer never told the monster left view; got {:?}",
            cmds
        );
    }

    #[test]
    fn test_kited_monster_returns_to_leash() {
        let map = Map::new(1, "pen", 40, 40);
        let alloc = IdAllocator::new();
        let mob = spawn_monster(&map, &alloc, 10, 10, 2);
        // Drag it far over the leash, then leave it alone.
        assert!(map.move_object(mob, 20, 10));

        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..40 {
            tick(&map, &mut rng);
        }
        let (x, y) = map.position_of(mob).unwrap();
        assert!(
            chebyshev(x, y, 10, 10) <= 2,
            "monster stuck over-leash at ({},{})",
            x,
            y
        );
    }

    #[test]
    fn test_tick_survives_missing_monster() {
        let map = Map::new(1, "arena", 20, 20);
        let alloc = IdAllocator::new();
        let mob = spawn_monster(&map, &alloc, 5, 5, 2);
        map.remove_object(mob);
        let mut rng = StdRng::seed_from_u64(1);
        tick(&map, &mut rng); // must not panic
    }
}
