//! Core server lifecycle: shutdown flag and termination callback.

use std::sync::{Arc, Mutex};

/// Type alias for termination callback functions, called once when the
/// process is asked to shut down.
pub type TermFunc = Box<dyn Fn() + Send + 'static>;

/// Global server state, shared between the accept loop, the update
/// loop, and the signal handler.
pub struct ServerState {
    shutdown_requested: bool,
    term_func: Option<TermFunc>,
}

impl ServerState {
    pub fn new() -> Self {
        ServerState {
            shutdown_requested: false,
            term_func: None,
        }
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_requested
    }

    pub fn set_term_func<F>(&mut self, func: F)
    where
        F: Fn() + Send + 'static,
    {
        self.term_func = Some(Box::new(func));
    }

    pub fn call_term_func(&self) {
        if let Some(ref func) = self.term_func {
            func();
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe shared server state.
pub type SharedServerState = Arc<Mutex<ServerState>>;

pub fn create_server_state() -> SharedServerState {
    Arc::new(Mutex::new(ServerState::new()))
}
