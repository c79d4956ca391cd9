//! Command dispatch for the `Verified` phase.
//!
//! Handlers translate grid-level boolean failures into player-visible
//! messages; nothing in here crashes a session over bad input. Unknown
//! command codes get a generic acknowledgement and the connection
//! continues.

use std::sync::Arc;

use crate::game::gm::GmContext;
use crate::game::id::EntityId;
use crate::game::map::{Map, MapFlag};
use crate::game::object::{Direction, ObjectBody};
use crate::network::cmd;
use crate::network::frame::Frame;
use crate::servers::world::{combat_forbidden, WorldState};
use crate::session::{FrameOutcome, SessionCtx};

/// Base melee damage until the external skill tables weigh in.
const BASE_ATTACK_DAMAGE: u32 = 5;

pub async fn dispatch(
    state: &Arc<WorldState>,
    sess: &mut SessionCtx,
    frame: Frame,
) -> FrameOutcome {
    match frame.command {
        cmd::CS_PING => {
            sess.send(&Frame::with_params(
                cmd::SC_PONG,
                frame.param1,
                frame.param2,
                frame.param3,
            ));
            FrameOutcome::Continue
        }
        cmd::CS_LEAVE => FrameOutcome::Disconnect,
        cmd::CS_WALK => handle_move(state, sess, &frame, false),
        cmd::CS_RUN => handle_move(state, sess, &frame, true),
        cmd::CS_TURN => handle_turn(state, sess, &frame),
        cmd::CS_STOP => FrameOutcome::Continue,
        cmd::CS_ATTACK => handle_attack(state, sess),
        cmd::CS_CHAT => handle_chat(state, sess, &frame),
        cmd::CS_WHISPER => handle_whisper(state, sess, &frame),
        cmd::CS_PICKUP => handle_pickup(state, sess),
        cmd::CS_DROP => handle_drop(state, sess, &frame),
        cmd::CS_EQUIP => handle_look_change(state, sess, &frame, true),
        cmd::CS_UNEQUIP => handle_look_change(state, sess, &frame, false),
        cmd::CS_USE_ITEM => {
            // Item effects live in the external content tables.
            sess.system_message("Nothing happens.");
            FrameOutcome::Continue
        }
        other => {
            tracing::debug!(
                "[world] [dispatch] conn={} unrecognized cmd={:04X}",
                sess.conn_id,
                other
            );
            sess.send(&Frame::with_params(cmd::SC_UNRECOGNIZED, other, 0, 0));
            FrameOutcome::Continue
        }
    }
}

/// Resolve the session's player to the map it currently stands on.
///
/// The directory is authoritative: a GM warp can move the player to
/// another map mid-session, so the cached `map_id` is refreshed here
/// rather than trusted.
fn actor_on_map(state: &WorldState, sess: &mut SessionCtx) -> Option<(Arc<Map>, EntityId)> {
    let id = sess.player?;
    let entry = state.world.player_entry(id)?;
    sess.map_id = entry.map_id;
    let map = state.world.map(entry.map_id)?;
    if map.contains(id) {
        Some((map, id))
    } else {
        None
    }
}

// ---- movement ---------------------------------------------------------

fn handle_move(
    state: &Arc<WorldState>,
    sess: &mut SessionCtx,
    frame: &Frame,
    run: bool,
) -> FrameOutcome {
    let Some((map, id)) = actor_on_map(state, sess) else {
        return FrameOutcome::Continue;
    };
    let Some(dir) = Direction::from_u8(frame.param1 as u8) else {
        return FrameOutcome::Continue;
    };
    let Some((x, y)) = map.position_of(id) else {
        return FrameOutcome::Continue;
    };

    map.set_direction(id, dir);
    let steps = if run { 2 } else { 1 };
    let (dx, dy) = dir.delta();
    let mut ok = true;
    for _ in 0..steps {
        let Some((cx, cy)) = map.position_of(id) else {
            break;
        };
        let nx = cx as i32 + dx;
        let ny = cy as i32 + dy;
        if nx < 0 || ny < 0 {
            ok = false;
            break;
        }
        if !map.move_with_visibility(id, nx as u16, ny as u16, map.view_radius) {
            ok = false;
            break;
        }
    }
    if !ok {
        // Authoritative correction: snap the client back to where the
        // server thinks it stands.
        let (cx, cy) = map.position_of(id).unwrap_or((x, y));
        sess.send(
            &Frame::with_params(cmd::SC_MOVE, cx, cy, dir as u16)
                .payload(id.raw().to_le_bytes().to_vec()),
        );
    }
    FrameOutcome::Continue
}

fn handle_turn(state: &Arc<WorldState>, sess: &mut SessionCtx, frame: &Frame) -> FrameOutcome {
    let Some((map, id)) = actor_on_map(state, sess) else {
        return FrameOutcome::Continue;
    };
    let Some(dir) = Direction::from_u8(frame.param1 as u8) else {
        return FrameOutcome::Continue;
    };
    if map.set_direction(id, dir) {
        if let Some((x, y)) = map.position_of(id) {
            let f = Frame::with_params(cmd::SC_TURN, x, y, dir as u16)
                .payload(id.raw().to_le_bytes().to_vec());
            map.broadcast_near(x, y, map.view_radius, Some(id), &f);
        }
    }
    FrameOutcome::Continue
}

// ---- combat ------------------------------------------------------------

fn handle_attack(state: &Arc<WorldState>, sess: &mut SessionCtx) -> FrameOutcome {
    let Some((map, id)) = actor_on_map(state, sess) else {
        return FrameOutcome::Continue;
    };
    if combat_forbidden(&map) {
        sess.system_message("You cannot fight here.");
        return FrameOutcome::Continue;
    }
    let Some(((x, y), dir)) = map
        .with_object(id, |o| ((o.x, o.y), o.dir))
    else {
        return FrameOutcome::Continue;
    };

    // Swing animation to everyone else in view.
    let swing = Frame::with_params(cmd::SC_ATTACK, x, y, dir as u16)
        .payload(id.raw().to_le_bytes().to_vec());
    map.broadcast_near(x, y, map.view_radius, Some(id), &swing);

    let (dx, dy) = dir.delta();
    let tx = x as i32 + dx;
    let ty = y as i32 + dy;
    if tx < 0 || ty < 0 {
        return FrameOutcome::Continue;
    }
    let (tx, ty) = (tx as u16, ty as u16);

    let Some(target) = map.monsters_in_range(tx, ty, 0).into_iter().next() else {
        return FrameOutcome::Continue;
    };

    let damage = BASE_ATTACK_DAMAGE;
    let remaining = map.with_object_mut(target, |o| match &mut o.body {
        ObjectBody::Monster(m) => {
            m.hp = m.hp.saturating_sub(damage);
            m.target = Some(id);
            Some((m.hp, m.mob_id))
        }
        _ => None,
    });
    let Some(Some((hp_left, mob_id))) = remaining else {
        return FrameOutcome::Continue;
    };

    let mut payload = target.raw().to_le_bytes().to_vec();
    payload.extend_from_slice(&(damage as u16).to_le_bytes());
    payload.extend_from_slice(&hp_left.to_le_bytes());
    let hit = Frame::with_params(cmd::SC_DAMAGE, tx, ty, 0).payload(payload);
    map.broadcast_near(tx, ty, map.view_radius, None, &hit);

    if hp_left == 0 {
        map.remove_object(target);
        // The kill drops its loot owner-protected onto a nearby tile.
        if state.world.drop_item(&map, mob_id, 1, tx, ty, Some(id)).is_none() {
            tracing::debug!("[world] [combat] no free tile for loot of mob {}", mob_id);
        }
    }
    FrameOutcome::Continue
}

// ---- chat and social -----------------------------------------------------

fn handle_chat(state: &Arc<WorldState>, sess: &mut SessionCtx, frame: &Frame) -> FrameOutcome {
    let Some((map, id)) = actor_on_map(state, sess) else {
        return FrameOutcome::Continue;
    };
    let text = String::from_utf8_lossy(&frame.payload).to_string();

    if let Some(line) = text.strip_prefix('/') {
        let ctx = GmContext {
            world: &state.world,
            sessions: &state.sessions,
            actor: id,
            actor_map: sess.map_id,
            reply: sess.tx.clone(),
        };
        state.gm.run_line(&ctx, line);
        return FrameOutcome::Continue;
    }

    let Some((x, y, name)) = map.with_object(id, |o| {
        let name = match &o.body {
            ObjectBody::Player(p) => p.name.clone(),
            _ => String::new(),
        };
        (o.x, o.y, name)
    }) else {
        return FrameOutcome::Continue;
    };

    let mut payload = id.raw().to_le_bytes().to_vec();
    payload.push(name.len().min(255) as u8);
    payload.extend_from_slice(&name.as_bytes()[..name.len().min(255)]);
    payload.extend_from_slice(text.as_bytes());
    let f = Frame::with_params(cmd::SC_CHAT, x, y, 0).payload(payload);
    // The speaker hears themself; no exclusion for chat.
    map.broadcast_near(x, y, state.config.chat_radius, None, &f);
    FrameOutcome::Continue
}

fn handle_whisper(state: &Arc<WorldState>, sess: &mut SessionCtx, frame: &Frame) -> FrameOutcome {
    let Some(id) = sess.player else {
        return FrameOutcome::Continue;
    };
    // Payload: name_len u8, name, text.
    let Some((&nlen, rest)) = frame.payload.split_first() else {
        return FrameOutcome::Continue;
    };
    let nlen = nlen as usize;
    if rest.len() < nlen {
        return FrameOutcome::Continue;
    }
    let name = String::from_utf8_lossy(&rest[..nlen]).to_string();
    let text = &rest[nlen..];

    let Some(entry) = state.world.player_by_name(&name) else {
        sess.system_message(&format!("{} is not online.", name));
        return FrameOutcome::Continue;
    };
    let Some(handle) = state
        .world
        .map(entry.map_id)
        .and_then(|m| m.player_handle(entry.id))
    else {
        sess.system_message(&format!("{} is not online.", name));
        return FrameOutcome::Continue;
    };

    let mut payload = id.raw().to_le_bytes().to_vec();
    payload.push(0); // whispers carry no speaker name block
    payload.extend_from_slice(text);
    handle.send(&Frame::with_params(cmd::SC_CHAT, 0, 0, 1).payload(payload));
    FrameOutcome::Continue
}

// ---- items ---------------------------------------------------------------

fn handle_pickup(state: &Arc<WorldState>, sess: &mut SessionCtx) -> FrameOutcome {
    let Some((map, id)) = actor_on_map(state, sess) else {
        return FrameOutcome::Continue;
    };
    let Some((x, y)) = map.position_of(id) else {
        return FrameOutcome::Continue;
    };
    let Some(item) = map.items_in_range(x, y, 0).into_iter().next() else {
        sess.system_message("There is nothing here.");
        return FrameOutcome::Continue;
    };
    let info = map.with_object(item, |o| match &o.body {
        ObjectBody::Item(it) => Some((it.item_id, it.amount, it.owner)),
        _ => None,
    });
    let Some(Some((item_id, amount, owner))) = info else {
        return FrameOutcome::Continue;
    };
    if let Some(owner) = owner {
        if owner != id {
            sess.system_message("That belongs to someone else.");
            return FrameOutcome::Continue;
        }
    }
    map.remove_object(item);
    sess.system_message(&format!("You pick up item {} x{}.", item_id, amount));
    FrameOutcome::Continue
}

fn handle_drop(state: &Arc<WorldState>, sess: &mut SessionCtx, frame: &Frame) -> FrameOutcome {
    let Some((map, id)) = actor_on_map(state, sess) else {
        return FrameOutcome::Continue;
    };
    if map.has_flag(MapFlag::NoDrop) {
        sess.system_message("You cannot drop items here.");
        return FrameOutcome::Continue;
    }
    let Some((x, y)) = map.position_of(id) else {
        return FrameOutcome::Continue;
    };
    let item_id = frame.param1;
    let amount = frame.param2.max(1);
    match state.world.drop_item(&map, item_id, amount, x, y, Some(id)) {
        Some(_) => {}
        None => sess.system_message("There is no room to drop that."),
    }
    FrameOutcome::Continue
}

fn handle_look_change(
    state: &Arc<WorldState>,
    sess: &mut SessionCtx,
    frame: &Frame,
    equip: bool,
) -> FrameOutcome {
    let Some((map, id)) = actor_on_map(state, sess) else {
        return FrameOutcome::Continue;
    };
    let look = if equip { frame.param1 } else { 1 };
    let updated = map.with_object_mut(id, |o| match &mut o.body {
        ObjectBody::Player(p) => {
            p.look = look;
            true
        }
        _ => false,
    });
    if updated == Some(true) {
        if let Some((x, y)) = map.position_of(id) {
            let f = Frame::with_params(cmd::SC_LOOK_CHANGE, x, y, look)
                .payload(id.raw().to_le_bytes().to_vec());
            map.broadcast_near(x, y, map.view_radius, None, &f);
        }
    }
    FrameOutcome::Continue
}
