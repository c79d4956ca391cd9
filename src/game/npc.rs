//! NPC tick: idle facing changes, plus a short drift for wandering NPCs.

use rand::{Rng, RngExt};

use crate::game::id::EntityId;
use crate::game::map::{Map, DEFAULT_VIEW_RADIUS};
use crate::game::object::{Direction, ObjectBody};
use crate::network::cmd;
use crate::network::frame::Frame;

/// Wandering NPCs stay within this Chebyshev distance of home.
const WANDER_RANGE: u16 = 2;

/// Advance every NPC on `map` one tick.
pub fn tick(map: &Map, rng: &mut impl Rng) {
    for id in map.npc_ids() {
        step_npc(map, id, rng);
    }
}

fn step_npc(map: &Map, id: EntityId, rng: &mut impl Rng) {
    let Some((x, y)) = map.position_of(id) else {
        return;
    };
    let Some((wander, home_x, home_y)) = map.with_object(id, |o| match &o.body {
        ObjectBody::Npc(n) => (n.wander, n.home_x, n.home_y),
        _ => (false, 0, 0),
    }) else {
        return;
    };

    // Mostly idle; occasionally turn, rarely step.
    match rng.random_range(0..10) {
        0 => {
            if let Some(dir) = Direction::from_u8(rng.random_range(0..4)) {
                map.set_direction(id, dir);
                let frame = Frame::with_params(cmd::SC_TURN, x, y, dir as u16)
                    .payload(id.raw().to_le_bytes().to_vec());
                map.broadcast_near(x, y, DEFAULT_VIEW_RADIUS, None, &frame);
            }
        }
        1 if wander => {
            let Some(dir) = Direction::from_u8(rng.random_range(0..4)) else {
                return;
            };
            let (dx, dy) = dir.delta();
            let nx = x as i32 + dx;
            let ny = y as i32 + dy;
            if nx < 0 || ny < 0 {
                return;
            }
            let (nx, ny) = (nx as u16, ny as u16);
            let off_home = (nx as i32 - home_x as i32)
                .unsigned_abs()
                .max((ny as i32 - home_y as i32).unsigned_abs());
            if off_home > WANDER_RANGE as u32 {
                return;
            }
            map.move_with_visibility(id, nx, ny, DEFAULT_VIEW_RADIUS);
        }
        _ => {}
    }
}
