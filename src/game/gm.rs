//! GM / script command registry.
//!
//! Free-text commands (wire chat lines prefixed with `/`, and script
//! lines) resolve through a name -> handler table. Names are
//! case-insensitive; registering a name twice is rejected and logged,
//! first registration wins. Handlers receive resolved numeric/string
//! arguments and signal "stop executing the remaining script line" via
//! an explicit continuation flag rather than an error.

use std::collections::HashMap;
use std::sync::Arc;

use crate::game::id::EntityId;
use crate::game::world::World;
use crate::network::frame::Frame;
use crate::network::{cmd, OutboundTx};

/// Whether the surrounding script line keeps executing after a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFlow {
    Continue,
    Stop,
}

/// A resolved command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum GmArg {
    Num(i64),
    Text(String),
}

impl GmArg {
    pub fn as_num(&self) -> Option<i64> {
        match self {
            GmArg::Num(n) => Some(*n),
            GmArg::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> &str {
        match self {
            GmArg::Num(_) => "",
            GmArg::Text(s) => s,
        }
    }

    pub fn as_display(&self) -> String {
        match self {
            GmArg::Num(n) => n.to_string(),
            GmArg::Text(s) => s.clone(),
        }
    }
}

/// Execution context handed to every handler.
pub struct GmContext<'a> {
    pub world: &'a World,
    pub sessions: &'a crate::session::SessionManager,
    /// The invoking player.
    pub actor: EntityId,
    pub actor_map: u16,
    /// Direct line back to the invoker for feedback text.
    pub reply: OutboundTx,
}

impl GmContext<'_> {
    /// Push a system-message frame back to the invoker.
    pub fn reply_text(&self, text: &str) {
        let frame = Frame::new(cmd::SC_SYSTEM_MESSAGE).payload(text.as_bytes().to_vec());
        let _ = self.reply.send(bytes::Bytes::from(frame.encode()));
    }
}

pub type GmHandler = Arc<dyn Fn(&GmContext<'_>, &[GmArg]) -> ScriptFlow + Send + Sync>;

/// Case-insensitive, register-once command table.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, GmHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. Returns false (and logs) when the name is
    /// already taken; the existing handler stays.
    pub fn register<F>(&mut self, name: &str, handler: F) -> bool
    where
        F: Fn(&GmContext<'_>, &[GmArg]) -> ScriptFlow + Send + Sync + 'static,
    {
        let key = name.to_ascii_lowercase();
        if self.handlers.contains_key(&key) {
            tracing::warn!("[world] [gm] duplicate command registration '{}'", name);
            return false;
        }
        self.handlers.insert(key, Arc::new(handler));
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_ascii_lowercase())
    }

    /// Dispatch one command. `None` = unknown name.
    pub fn dispatch(&self, name: &str, ctx: &GmContext<'_>, args: &[GmArg]) -> Option<ScriptFlow> {
        let handler = self.handlers.get(&name.to_ascii_lowercase())?.clone();
        Some(handler(ctx, args))
    }

    /// Parse and run a full command line (`warp 2 10 10`). Unknown
    /// commands report back to the invoker and continue.
    pub fn run_line(&self, ctx: &GmContext<'_>, line: &str) -> ScriptFlow {
        let Some((name, args)) = parse_line(line) else {
            return ScriptFlow::Continue;
        };
        match self.dispatch(&name, ctx, &args) {
            Some(flow) => flow,
            None => {
                tracing::debug!("[world] [gm] unknown command '{}'", name);
                ctx.reply_text(&format!("Unknown command: {}", name));
                ScriptFlow::Continue
            }
        }
    }
}

/// Split a command line into its name and resolved arguments. Tokens
/// that parse as integers become [`GmArg::Num`], everything else is
/// [`GmArg::Text`].
pub fn parse_line(line: &str) -> Option<(String, Vec<GmArg>)> {
    let mut tokens = line.split_whitespace();
    let name = tokens.next()?.to_string();
    let args = tokens
        .map(|t| match t.parse::<i64>() {
            Ok(n) => GmArg::Num(n),
            Err(_) => GmArg::Text(t.to_string()),
        })
        .collect();
    Some((name, args))
}
