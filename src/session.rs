//! Session management with async I/O.
//!
//! One session per client connection: an accept spawns a task that owns
//! the socket, accumulates bytes into the frame scanner, walks the
//! protocol phase machine, and drains the outbound queue. Disconnection
//! from any phase tears the session down through the same path:
//! deregister the player from the grid and the directory, fire a
//! best-effort persistence flush, release the connection slot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;

use crate::game::id::{EntityId, ObjectKind};
use crate::game::object::{GameObject, ObjectBody, PlayerBody};
use crate::game::world::PlayerEntry;
use crate::network::cmd;
use crate::network::frame::{Frame, FrameScanner};
use crate::network::OutboundTx;
use crate::servers::world::{
    handlers, AccountRecord, AccountRequest, BulkLoad, DataRequest, WorldState,
};

/// Connection identifier, unique per process lifetime.
pub type ConnId = u64;

/// Authentication phase of one session. Transitions only move forward;
/// there is no way back from `Verified` short of disconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotVerified,
    WaitingDbInfo,
    WaitingConfirm,
    Verified,
}

/// What the dispatcher wants done with the connection after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    Disconnect,
}

/// Registry entry for one live connection.
#[derive(Clone)]
pub struct SessionInfo {
    pub addr: SocketAddr,
    pub tx: OutboundTx,
    pub kill: Arc<Notify>,
}

/// Global connection registry. Its lock scope is independent of every
/// map lock and the player directory.
pub struct SessionManager {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<ConnId, SessionInfo>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, addr: SocketAddr, tx: OutboundTx) -> (ConnId, Arc<Notify>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kill = Arc::new(Notify::new());
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                SessionInfo {
                    addr,
                    tx,
                    kill: kill.clone(),
                },
            );
        (id, kill)
    }

    pub fn remove(&self, id: ConnId) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Ask a session's task to tear itself down.
    pub fn kill(&self, id: ConnId) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(&id) {
            Some(info) => {
                info.kill.notify_one();
                true
            }
            None => false,
        }
    }

    /// Push one frame to every connected session.
    pub fn broadcast_all(&self, frame: &Frame) {
        let bytes = Bytes::from(frame.encode());
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        for info in sessions.values() {
            let _ = info.tx.send(bytes.clone());
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection protocol context.
pub struct SessionCtx {
    pub conn_id: ConnId,
    pub addr: SocketAddr,
    pub phase: Phase,
    pub player: Option<EntityId>,
    pub map_id: u16,
    pub record: Option<AccountRecord>,
    pub tx: OutboundTx,
}

impl SessionCtx {
    pub fn send(&self, frame: &Frame) {
        let _ = self.tx.send(Bytes::from(frame.encode()));
    }

    pub fn system_message(&self, text: &str) {
        self.send(&Frame::new(cmd::SC_SYSTEM_MESSAGE).payload(text.as_bytes().to_vec()));
    }
}

/// Handle one accepted connection until it dies.
pub async fn handle_connection(state: Arc<WorldState>, stream: TcpStream, addr: SocketAddr) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let (conn_id, kill) = state.sessions.register(addr, tx.clone());
    tracing::info!("[world] [session] new connection conn={} addr={}", conn_id, addr);

    let mut sess = SessionCtx {
        conn_id,
        addr,
        phase: Phase::NotVerified,
        player: None,
        map_id: 0,
        record: None,
        tx,
    };

    let (mut rd, mut wr) = stream.into_split();
    let mut scanner = FrameScanner::new();
    let mut read_buf = vec![0u8; 4096];
    let idle_timeout = Duration::from_secs(state.config.idle_timeout_secs);
    let mut last_activity = Instant::now();
    // Pending account/character lookup (WaitingDbInfo).
    let mut lookup: Option<oneshot::Receiver<Option<AccountRecord>>> = None;

    'conn: loop {
        tokio::select! {
            result = rd.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        tracing::debug!("[world] [session] conn={} closed by peer", conn_id);
                        break 'conn;
                    }
                    Ok(n) => {
                        last_activity = Instant::now();
                        scanner.push(&read_buf[..n]);
                        while let Some(frame) = scanner.next_frame() {
                            let outcome = handle_frame(&state, &mut sess, frame, &mut lookup).await;
                            if outcome == FrameOutcome::Disconnect {
                                break 'conn;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!("[world] [session] conn={} read error: {}", conn_id, e);
                        break 'conn;
                    }
                }
            }

            maybe = rx.recv() => {
                let Some(bytes) = maybe else {
                    break 'conn;
                };
                if let Err(e) = wr.write_all(&bytes).await {
                    tracing::debug!("[world] [session] conn={} write error: {}", conn_id, e);
                    break 'conn;
                }
                // Drain whatever else is already queued in one pass.
                while let Ok(more) = rx.try_recv() {
                    if let Err(e) = wr.write_all(&more).await {
                        tracing::debug!("[world] [session] conn={} write error: {}", conn_id, e);
                        break 'conn;
                    }
                }
            }

            result = async { lookup.as_mut().expect("guarded by branch condition").await },
                if lookup.is_some() =>
            {
                lookup = None;
                match result {
                    Ok(Some(record)) => on_lookup_complete(&mut sess, record),
                    Ok(None) => {
                        tracing::info!("[world] [session] conn={} lookup rejected", conn_id);
                        sess.system_message("Account verification failed.");
                        break 'conn;
                    }
                    Err(_) => {
                        tracing::warn!("[world] [session] conn={} lookup dropped", conn_id);
                        break 'conn;
                    }
                }
            }

            _ = kill.notified() => {
                tracing::info!("[world] [session] conn={} killed", conn_id);
                break 'conn;
            }

            _ = tokio::time::sleep_until(last_activity + idle_timeout) => {
                tracing::info!(
                    "[world] [session] conn={} idle timeout ({}s)",
                    conn_id,
                    idle_timeout.as_secs()
                );
                break 'conn;
            }
        }
    }

    teardown(&state, &mut sess).await;
    state.sessions.remove(conn_id);
    tracing::info!("[world] [session] closed conn={}", conn_id);
}

/// Route one decoded frame through the phase machine.
pub async fn handle_frame(
    state: &Arc<WorldState>,
    sess: &mut SessionCtx,
    frame: Frame,
    lookup: &mut Option<oneshot::Receiver<Option<AccountRecord>>>,
) -> FrameOutcome {
    match sess.phase {
        Phase::NotVerified => {
            // Whatever arrives first is the verification string.
            let token = String::from_utf8_lossy(&frame.payload).trim().to_string();
            begin_verification(state, sess, token, lookup).await;
            FrameOutcome::Continue
        }
        Phase::WaitingDbInfo => {
            // Only the async lookup may advance this phase.
            tracing::debug!(
                "[world] [session] conn={} discarding cmd={:04X} while waiting on db",
                sess.conn_id,
                frame.command
            );
            FrameOutcome::Continue
        }
        Phase::WaitingConfirm => {
            if frame.command == cmd::CS_CONFIRM_DIALOG {
                confirm_and_enter_world(state, sess).await
            } else {
                tracing::debug!(
                    "[world] [session] conn={} ignoring cmd={:04X} before confirm",
                    sess.conn_id,
                    frame.command
                );
                FrameOutcome::Continue
            }
        }
        Phase::Verified => handlers::dispatch(state, sess, frame).await,
    }
}

async fn begin_verification(
    state: &Arc<WorldState>,
    sess: &mut SessionCtx,
    token: String,
    lookup: &mut Option<oneshot::Receiver<Option<AccountRecord>>>,
) {
    sess.phase = Phase::WaitingDbInfo;
    let (reply_tx, reply_rx) = oneshot::channel();
    *lookup = Some(reply_rx);

    // A coordinator handoff short-circuits the account service.
    if let Some(record) = state.take_handoff(&token).await {
        tracing::debug!("[world] [session] conn={} verified via handoff", sess.conn_id);
        let _ = reply_tx.send(Some(record));
        return;
    }

    let request = AccountRequest {
        token,
        reply: reply_tx,
    };
    if state.accounts.send(request).await.is_err() {
        tracing::error!("[world] [session] conn={} account service unavailable", sess.conn_id);
        // The dropped oneshot sender surfaces as a lookup error.
    }
}

fn on_lookup_complete(sess: &mut SessionCtx, record: AccountRecord) {
    sess.record = Some(record);
    sess.phase = Phase::WaitingConfirm;
    sess.send(&Frame::new(cmd::SC_FIRST_DIALOG).payload(b"Welcome back. Ready?".to_vec()));
}

/// Confirm-dialog in `WaitingConfirm`: build the Player, put it on the
/// grid, request the bulk character data, go `Verified`.
async fn confirm_and_enter_world(state: &Arc<WorldState>, sess: &mut SessionCtx) -> FrameOutcome {
    let Some(record) = sess.record.clone() else {
        tracing::warn!("[world] [session] conn={} confirm without record", sess.conn_id);
        return FrameOutcome::Disconnect;
    };

    let Some(map) = state.world.map(state.config.start_map) else {
        tracing::error!("[world] [session] start map {} missing", state.config.start_map);
        return FrameOutcome::Disconnect;
    };

    let id = state.world.ids.next_id(ObjectKind::Player);
    if !state.world.register_player(PlayerEntry {
        id,
        name: record.character.clone(),
        map_id: map.id,
        conn_id: sess.conn_id,
    }) {
        sess.system_message("That character is already in the world.");
        return FrameOutcome::Disconnect;
    }

    let Some((x, y)) = map.find_free_tile(state.config.start_x, state.config.start_y) else {
        tracing::error!("[world] [session] no free start tile on map {}", map.id);
        state.world.unregister_player(id);
        return FrameOutcome::Disconnect;
    };

    let obj = GameObject::new(
        id,
        x,
        y,
        ObjectBody::Player(PlayerBody {
            name: record.character.clone(),
            look: 1,
            conn_id: sess.conn_id,
            tx: sess.tx.clone(),
        }),
    );
    if !map.add_object(obj, x, y) {
        state.world.unregister_player(id);
        return FrameOutcome::Disconnect;
    }

    sess.player = Some(id);
    sess.map_id = map.id;
    sess.phase = Phase::Verified;

    // Bulk character data from the backing service; fire and forget.
    for what in [
        BulkLoad::Skills,
        BulkLoad::Equipment,
        BulkLoad::Bag,
        BulkLoad::Bank,
        BulkLoad::PetBank,
        BulkLoad::Quests,
    ] {
        let _ = state
            .data
            .send(DataRequest::Load {
                char_id: record.char_id,
                what,
            })
            .await;
    }

    tracing::info!(
        "[world] [session] conn={} entered world as {} ({})",
        sess.conn_id,
        record.character,
        id
    );
    FrameOutcome::Continue
}

/// Normal disconnect path, valid from every phase. A session that never
/// reached `Verified` simply has no player to unwind.
async fn teardown(state: &Arc<WorldState>, sess: &mut SessionCtx) {
    if let Some(id) = sess.player.take() {
        if let Some(map) = state.world.map(sess.map_id) {
            if !map.remove_object(id) {
                // Warped away since the last command; scan for it.
                for map in state.world.maps() {
                    if map.remove_object(id) {
                        break;
                    }
                }
            }
        }
        state.world.unregister_player(id);
        if let Some(record) = &sess.record {
            // Best-effort persistence flush.
            let _ = state
                .data
                .send(DataRequest::Flush {
                    char_id: record.char_id,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::world::WorldState;

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

    fn test_session(state: &WorldState) -> (SessionCtx, crate::network::OutboundRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (conn_id, _kill) = state.sessions.register("127.0.0.1:9".parse().unwrap(), tx.clone());
        (
            SessionCtx {
                conn_id,
                addr: "127.0.0.1:9".parse().unwrap(),
                phase: Phase::NotVerified,
                player: None,
                map_id: 0,
                record: None,
                tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_full_login_sequence() {
        let state = WorldState::test_only();
        let (mut sess, mut rx) = test_session(&state);
        let mut lookup = None;

        // verification string
        let verify = Frame::new(0).payload(b"verify:Yuria".to_vec());
        handle_frame(&state, &mut sess, verify, &mut lookup).await;
        assert_eq!(sess.phase, Phase::WaitingDbInfo);

        // phase gating: commands while waiting are discarded
        let stray = Frame::new(cmd::CS_WALK);
        handle_frame(&state, &mut sess, stray, &mut lookup).await;
        assert_eq!(sess.phase, Phase::WaitingDbInfo);
        assert!(drain_commands(&mut rx).is_empty(), "no side effects while waiting");

        // lookup completes: exactly one first-dialog, phase advances
        let record = lookup.take().unwrap().await.unwrap().unwrap();
        on_lookup_complete(&mut sess, record);
        assert_eq!(sess.phase, Phase::WaitingConfirm);
        assert_eq!(drain_commands(&mut rx), vec![cmd::SC_FIRST_DIALOG]);

        // a non-confirm message in WaitingConfirm is ignored
        handle_frame(&state, &mut sess, Frame::new(cmd::CS_CHAT), &mut lookup).await;
        assert_eq!(sess.phase, Phase::WaitingConfirm);

        // confirm: player registered on the grid, phase Verified
        let confirm = Frame::new(cmd::CS_CONFIRM_DIALOG);
        handle_frame(&state, &mut sess, confirm, &mut lookup).await;
        assert_eq!(sess.phase, Phase::Verified);
        let player = sess.player.expect("player created");
        let map = state.world.map(1).unwrap();
        assert!(map.contains(player));
        assert_eq!(state.world.online_count(), 1);
        assert_eq!(state.world.player_by_name("yuria").unwrap().id, player);
    }

    #[tokio::test]
    async fn test_teardown_before_verified_is_harmless() {
        let state = WorldState::test_only();
        let (mut sess, _rx) = test_session(&state);
        teardown(&state, &mut sess).await;
        assert_eq!(state.world.online_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_removes_player() {
        let state = WorldState::test_only();
        let (mut sess, _rx) = test_session(&state);
        let mut lookup = None;
        handle_frame(
            &state,
            &mut sess,
            Frame::new(0).payload(b"verify:Drifter".to_vec()),
            &mut lookup,
        )
        .await;
        let record = lookup.take().unwrap().await.unwrap().unwrap();
        on_lookup_complete(&mut sess, record);
        handle_frame(&state, &mut sess, Frame::new(cmd::CS_CONFIRM_DIALOG), &mut lookup).await;
        let player = sess.player.unwrap();

        teardown(&state, &mut sess).await;
        assert!(!state.world.map(1).unwrap().contains(player));
        assert_eq!(state.world.online_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_character_rejected() {
        let state = WorldState::test_only();
        let mut lookup = None;

        let (mut first, _rx1) = test_session(&state);
        handle_frame(
            &state,
            &mut first,
            Frame::new(0).payload(b"verify:Twin".to_vec()),
            &mut lookup,
        )
        .await;
        let record = lookup.take().unwrap().await.unwrap().unwrap();
        on_lookup_complete(&mut first, record);
        handle_frame(&state, &mut first, Frame::new(cmd::CS_CONFIRM_DIALOG), &mut lookup).await;
        assert_eq!(first.phase, Phase::Verified);

        let (mut second, _rx2) = test_session(&state);
        handle_frame(
            &state,
            &mut second,
            Frame::new(0).payload(b"verify:Twin".to_vec()),
            &mut lookup,
        )
        .await;
        let record = lookup.take().unwrap().await.unwrap().unwrap();
        on_lookup_complete(&mut second, record);
        let outcome =
            handle_frame(&state, &mut second, Frame::new(cmd::CS_CONFIRM_DIALOG), &mut lookup)
                .await;
        assert_eq!(outcome, FrameOutcome::Disconnect);
        assert_eq!(state.world.online_count(), 1);
    }

    #[test]
    fn test_session_manager_register_remove() {
        let mgr = SessionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, _kill) = mgr.register("127.0.0.1:1".parse().unwrap(), tx);
        assert_eq!(mgr.count(), 1);
        assert!(mgr.kill(id));
        mgr.remove(id);
        assert_eq!(mgr.count(), 0);
        assert!(!mgr.kill(id));
    }
}
