//! World server state and its collaborator services.
//!
//! `WorldState` is constructed once by the process entry point and
//! injected into every session task; there are no implicit globals.
//! The account and character-data services are external collaborators
//! reached through channels - the in-process stubs exist for standalone
//! operation and tests.

pub mod handlers;
pub mod interserver;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use crate::config::ServerConfig;
use crate::game::gm::{CommandRegistry, GmArg, ScriptFlow};
use crate::game::map::MapFlag;
use crate::game::world::World;
use crate::session::SessionManager;

/// Result of an account/character lookup.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub account: String,
    pub character: String,
    pub login_id: u32,
    pub char_id: u32,
}

/// One lookup request to the account service.
pub struct AccountRequest {
    pub token: String,
    pub reply: tokio::sync::oneshot::Sender<Option<AccountRecord>>,
}

/// Character data categories bulk-loaded on world entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkLoad {
    Skills,
    Equipment,
    Bag,
    Bank,
    PetBank,
    Quests,
}

/// Requests to the backing character-data service.
#[derive(Debug)]
pub enum DataRequest {
    Load { char_id: u32, what: BulkLoad },
    Flush { char_id: u32 },
}

/// Pending coordinator handoff: the player was routed to this server
/// and must present the matching token within the expiry window.
#[derive(Debug, Clone)]
pub struct AuthEntry {
    pub record: AccountRecord,
    pub expires: Instant,
}

/// Seconds a coordinator handoff token stays valid.
pub const AUTH_TOKEN_TTL: Duration = Duration::from_secs(30);

pub struct WorldState {
    pub config: ServerConfig,
    pub world: Arc<World>,
    pub sessions: SessionManager,
    pub accounts: mpsc::Sender<AccountRequest>,
    pub data: mpsc::Sender<DataRequest>,
    pub gm: CommandRegistry,
    /// Handoff tokens from the coordinator: character name -> entry.
    pub auth_db: Mutex<HashMap<String, AuthEntry>>,
}

impl WorldState {
    pub fn new(
        config: ServerConfig,
        world: Arc<World>,
        accounts: mpsc::Sender<AccountRequest>,
        data: mpsc::Sender<DataRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            world,
            sessions: SessionManager::new(),
            accounts,
            data,
            gm: builtin_commands(),
            auth_db: Mutex::new(HashMap::new()),
        })
    }

    /// Standalone state with stub collaborator services and one map.
    pub fn test_only() -> Arc<Self> {
        let config = ServerConfig::test_only();
        let world = Arc::new(World::from_config(&config).expect("test world must build"));
        let (accounts, data) = spawn_stub_services();
        Self::new(config, world, accounts, data)
    }

    /// Consume a pending handoff for `token`, if present and fresh.
    pub async fn take_handoff(&self, token: &str) -> Option<AccountRecord> {
        let key = normalize_token(token);
        let mut auth = self.auth_db.lock().await;
        let entry = auth.remove(&key)?;
        if entry.expires < Instant::now() {
            tracing::debug!("[world] [auth] expired handoff for '{}'", key);
            return None;
        }
        Some(entry.record)
    }

    /// Store a coordinator handoff under the character name.
    pub async fn insert_handoff(&self, record: AccountRecord) {
        let key = record.character.to_ascii_lowercase();
        let mut auth = self.auth_db.lock().await;
        auth.insert(
            key,
            AuthEntry {
                record,
                expires: Instant::now() + AUTH_TOKEN_TTL,
            },
        );
    }

    /// Drop handoff tokens past their expiry window.
    pub async fn expire_handoffs(&self) {
        let now = Instant::now();
        let mut auth = self.auth_db.lock().await;
        auth.retain(|_, e| e.expires > now);
    }
}

/// Verification strings look like `verify:<character>`; a bare token is
/// treated as the character name itself.
pub fn normalize_token(token: &str) -> String {
    token
        .strip_prefix("verify:")
        .unwrap_or(token)
        .trim()
        .to_ascii_lowercase()
}

/// Accept loop: one spawned task per connection.
pub async fn run_listener(state: Arc<WorldState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    crate::session::handle_connection(state, socket, addr).await;
                });
            }
            Err(e) => {
                tracing::error!("[world] [listen] accept error: {}", e);
            }
        }
    }
}

/// In-process stand-ins for the account and character-data services.
/// The account stub accepts any token and derives the character from it;
/// the data stub logs load/flush traffic and drops it.
pub fn spawn_stub_services() -> (mpsc::Sender<AccountRequest>, mpsc::Sender<DataRequest>) {
    let (acc_tx, mut acc_rx) = mpsc::channel::<AccountRequest>(64);
    let (data_tx, mut data_rx) = mpsc::channel::<DataRequest>(256);

    tokio::spawn(async move {
        let mut next_char_id: u32 = 1;
        while let Some(req) = acc_rx.recv().await {
            let name = normalize_token(&req.token);
            let response = if name.is_empty() {
                None
            } else {
                let mut character = name.clone();
                // Directory names are case-insensitive; present them
                // capitalized the way the client sent them.
                if let Some(first) = character.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                let record = AccountRecord {
                    account: name.clone(),
                    character,
                    login_id: next_char_id,
                    char_id: next_char_id,
                };
                next_char_id += 1;
                Some(record)
            };
            let _ = req.reply.send(response);
        }
    });

    tokio::spawn(async move {
        while let Some(req) = data_rx.recv().await {
            match req {
                DataRequest::Load { char_id, what } => {
                    tracing::debug!("[world] [data] load {:?} for char {}", what, char_id)
                }
                DataRequest::Flush { char_id } => {
                    tracing::debug!("[world] [data] flush char {}", char_id)
                }
            }
        }
    });

    (acc_tx, data_tx)
}

/// The built-in GM command table.
fn builtin_commands() -> CommandRegistry {
    let mut reg = CommandRegistry::new();

    reg.register("warp", |ctx, args| {
        let (Some(map), Some(x), Some(y)) = (
            args.first().and_then(GmArg::as_num),
            args.get(1).and_then(GmArg::as_num),
            args.get(2).and_then(GmArg::as_num),
        ) else {
            ctx.reply_text("usage: /warp <map> <x> <y>");
            return ScriptFlow::Continue;
        };
        if ctx
            .world
            .warp_object(ctx.actor_map, ctx.actor, map as u16, x as u16, y as u16)
        {
            ScriptFlow::Stop
        } else {
            ctx.reply_text("Warp failed.");
            ScriptFlow::Continue
        }
    });

    reg.register("spawn", |ctx, args| {
        let Some(mob_id) = args.first().and_then(GmArg::as_num) else {
            ctx.reply_text("usage: /spawn <mob_id> [count]");
            return ScriptFlow::Continue;
        };
        let count = args.get(1).and_then(GmArg::as_num).unwrap_or(1).clamp(1, 50);
        let Some(map) = ctx.world.map(ctx.actor_map) else {
            return ScriptFlow::Continue;
        };
        let Some((x, y)) = map.position_of(ctx.actor) else {
            return ScriptFlow::Continue;
        };
        let mut spawned = 0;
        for _ in 0..count {
            if ctx
                .world
                .spawn_monster(&map, mob_id as u16, mob_id as u16, x, y, 20, 8)
                .is_some()
            {
                spawned += 1;
            }
        }
        ctx.reply_text(&format!("Spawned {} of mob {}.", spawned, mob_id));
        ScriptFlow::Continue
    });

    reg.register("item", |ctx, args| {
        let Some(item_id) = args.first().and_then(GmArg::as_num) else {
            ctx.reply_text("usage: /item <item_id> [amount]");
            return ScriptFlow::Continue;
        };
        let amount = args.get(1).and_then(GmArg::as_num).unwrap_or(1).clamp(1, 999);
        let Some(map) = ctx.world.map(ctx.actor_map) else {
            return ScriptFlow::Continue;
        };
        let Some((x, y)) = map.position_of(ctx.actor) else {
            return ScriptFlow::Continue;
        };
        match ctx
            .world
            .drop_item(&map, item_id as u16, amount as u16, x, y, None)
        {
            Some(_) => ctx.reply_text(&format!("Dropped item {} x{}.", item_id, amount)),
            None => ctx.reply_text("No free tile for the item."),
        }
        ScriptFlow::Continue
    });

    reg.register("kick", |ctx, args| {
        let name = args.first().map(GmArg::as_text).unwrap_or("");
        if name.is_empty() {
            ctx.reply_text("usage: /kick <name>");
            return ScriptFlow::Continue;
        }
        match ctx.world.player_by_name(name) {
            Some(entry) if ctx.sessions.kill(entry.conn_id) => {
                ctx.reply_text(&format!("Kicked {}.", entry.name));
            }
            _ => ctx.reply_text("No such player online."),
        }
        ScriptFlow::Continue
    });

    reg.register("announce", |ctx, args| {
        let text = args
            .iter()
            .map(GmArg::as_display)
            .collect::<Vec<_>>()
            .join(" ");
        if text.is_empty() {
            ctx.reply_text("usage: /announce <text>");
            return ScriptFlow::Continue;
        }
        let frame = crate::network::frame::Frame::new(crate::network::cmd::SC_SYSTEM_MESSAGE)
            .payload(text.into_bytes());
        ctx.sessions.broadcast_all(&frame);
        ScriptFlow::Continue
    });

    reg.register("lock", |ctx, args| {
        let (Some(x), Some(y)) = (
            args.first().and_then(GmArg::as_num),
            args.get(1).and_then(GmArg::as_num),
        ) else {
            ctx.reply_text("usage: /lock <x> <y>");
            return ScriptFlow::Continue;
        };
        if let Some(map) = ctx.world.map(ctx.actor_map) {
            map.lock_tile(x as u16, y as u16);
            ctx.reply_text(&format!("Tile ({},{}) locked.", x, y));
        }
        ScriptFlow::Continue
    });

    reg
}

/// True when PK-style aggression is disallowed at this spot.
pub fn combat_forbidden(map: &crate::game::map::Map) -> bool {
    map.has_flag(MapFlag::SafeZone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("verify:Yuria"), "yuria");
        assert_eq!(normalize_token("  Drifter "), "drifter");
        assert_eq!(normalize_token("verify:"), "");
    }

    #[tokio::test]
    async fn test_handoff_roundtrip() {
        let state = WorldState::test_only();
        state
            .insert_handoff(AccountRecord {
                account: "acct".into(),
                character: "Yuria".into(),
                login_id: 9,
                char_id: 9,
            })
            .await;
        let rec = state.take_handoff("verify:YURIA").await.unwrap();
        assert_eq!(rec.char_id, 9);
        // consumed
        assert!(state.take_handoff("verify:yuria").await.is_none());
    }

    #[tokio::test]
    async fn test_expire_handoffs() {
        let state = WorldState::test_only();
        state
            .insert_handoff(AccountRecord {
                account: "a".into(),
                character: "Ghost".into(),
                login_id: 1,
                char_id: 1,
            })
            .await;
        {
            let mut auth = state.auth_db.lock().await;
            auth.get_mut("ghost").unwrap().expires = Instant::now() - Duration::from_secs(1);
        }
        state.expire_handoffs().await;
        assert!(state.auth_db.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_stub_account_service_accepts_token() {
        let (accounts, _data) = spawn_stub_services();
        let (tx, rx) = tokio::sync::oneshot::channel();
        accounts
            .send(AccountRequest {
                token: "verify:rogue".into(),
                reply: tx,
            })
            .await
            .unwrap();
        let rec = rx.await.unwrap().unwrap();
        assert_eq!(rec.character, "Rogue");
    }

    #[tokio::test]
    async fn test_stub_account_service_rejects_empty() {
        let (accounts, _data) = spawn_stub_services();
        let (tx, rx) = tokio::sync::oneshot::channel();
        accounts
            .send(AccountRequest {
                token: "verify:".into(),
                reply: tx,
            })
            .await
            .unwrap();
        assert!(rx.await.unwrap().is_none());
    }
}
