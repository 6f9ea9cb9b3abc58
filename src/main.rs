mod api;
mod auth;
mod chat;
mod config;
mod contacts;
mod crypto;
mod error;
mod events;
mod models;
mod privacy;
mod socket;
mod store;

use log::{error, info, warn};
use warp::Filter;

use api::AppState;
use config::Config;
use store::MemoryStore;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let state = AppState::new(MemoryStore::shared());

    let static_files = warp::fs::dir(config.static_dir.clone());

    let routes = api::routes(state)
        .or(static_files)
        .recover(error::handle_rejection)
        .with(warp::cors().allow_any_origin())
        .with(warp::log("chat_privacy"));

    let addr = config.socket_addr();
    if config.tls_available() {
        info!("Starting secure server (HTTPS/WSS) on {}", addr);
        warp::serve(routes)
            .tls()
            .cert_path(&config.tls_cert)
            .key_path(&config.tls_key)
            .run(addr)
            .await;
    } else {
        warn!("TLS unavailable, falling back to HTTP/WS on {}", addr);
        warp::serve(routes).run(addr).await;
    }
}
