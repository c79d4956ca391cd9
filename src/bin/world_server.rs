use anyhow::{Context, Result};
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use veldt::config::ServerConfig;
use veldt::core;
use veldt::game::world::World;
use veldt::servers::world::{
    interserver, run_listener, spawn_stub_services, WorldState,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/world.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: world_server [--conf FILE]");
                return Ok(());
            }
            "--conf" if i + 1 < args.len() => {
                i += 1;
                conf_file = args[i].clone();
            }
            _ => {}
        }
        i += 1;
    }

    let config = ServerConfig::from_file(&conf_file)
        .with_context(|| format!("Cannot load config: {}", conf_file))?;

    let world = Arc::new(World::from_config(&config).context("World construction failed")?);
    tracing::info!(
        "[world] [init] {} map(s) loaded from {}",
        config.maps.len(),
        conf_file
    );

    // Account and character-data services are external in a full
    // deployment; the in-process stubs keep a standalone server usable.
    let (accounts, data) = spawn_stub_services();
    let state = WorldState::new(config, world, accounts, data);

    let server_state = core::create_server_state();

    if !state.config.coordinator_ip.is_empty() {
        let link_state = Arc::clone(&state);
        tokio::spawn(async move {
            interserver::run_coordinator_link(link_state).await;
        });
    }

    // World update loop on the configured cadence.
    {
        let tick_state = Arc::clone(&state);
        let tick_server_state = Arc::clone(&server_state);
        tokio::spawn(async move {
            let mut rng: StdRng = rand::make_rng();
            let mut interval =
                tokio::time::interval(Duration::from_millis(tick_state.config.tick_ms));
            loop {
                interval.tick().await;
                if tick_server_state
                    .lock()
                    .map(|s| s.should_shutdown())
                    .unwrap_or(true)
                {
                    break;
                }
                tick_state.world.tick(&mut rng, std::time::Instant::now());
                tick_state.expire_handoffs().await;
            }
        });
    }

    let bind = format!("{}:{}", state.config.bind_ip, state.config.world_port);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Cannot bind {}", bind))?;
    tracing::info!("[world] [init] listening on {}", bind);

    let accept_state = Arc::clone(&state);
    tokio::select! {
        _ = run_listener(accept_state, listener) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[world] [init] shutdown signal received");
            if let Ok(mut s) = server_state.lock() {
                s.request_shutdown();
                s.call_term_func();
            }
        }
    }

    tracing::info!(
        "[world] [init] exiting with {} session(s) open",
        state.sessions.count()
    );
    Ok(())
}
