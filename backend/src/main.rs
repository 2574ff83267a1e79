//! AutoMentor Backend - Main Entry Point
//!
//! Builds the runtime, starts the trigger loop and serves the web API.

use automentor_backend::api::run_server;
use automentor_core::{AgentConfig, AgentRuntime, Capabilities};
use std::io;
use std::sync::Arc;

fn to_io(err: automentor_core::AgentError) -> io::Error {
    io::Error::other(err)
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    println!("╔════════════════════════════════════════════════╗");
    println!("║   AutoMentor - Proactive Learning Mentor       ║");
    println!("║   Remember → Plan → Reflect                    ║");
    println!("╚════════════════════════════════════════════════╝");
    println!();

    let config = match std::env::var("AUTOMENTOR_CONFIG") {
        Ok(path) => {
            log::info!("[MAIN] Loading config from {}", path);
            AgentConfig::from_yaml_file(&path).map_err(to_io)?
        }
        Err(_) => AgentConfig::default(),
    };

    let capabilities = Capabilities::offline(&config);
    let runtime = Arc::new(AgentRuntime::new(config, capabilities).map_err(to_io)?);

    let orchestrator_loop = runtime.orchestrator_loop();
    if let Err(e) = orchestrator_loop.start() {
        log::warn!("[MAIN] Trigger loop not started: {}", e);
    }

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let result = run_server(Arc::clone(&runtime), &host, port).await;

    orchestrator_loop.stop();
    if let Err(e) = runtime.shutdown() {
        log::error!("[MAIN] Shutdown failed: {}", e);
    }
    result
}
