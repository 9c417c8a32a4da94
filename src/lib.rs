pub mod cli;
pub mod client;
pub mod gateway;
pub mod models;
pub mod responder;
pub mod server;
pub mod store;

use cli::Args;
use gateway::{ ChatGateway, GatewayConfig };
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;
use store::InMemoryMessageStore;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Chat Endpoint: {}", args.ws_path);
    info!("Heartbeat Interval: {}s", args.heartbeat_secs);
    info!("Auto Response: {}", args.auto_response);
    if args.auto_response {
        info!("Read Sync Delay: {}ms", args.read_sync_delay_ms);
        info!("Brisk Replies: {}", args.brisk_replies);
    }
    info!("Max Message Size: {} bytes", args.max_message_size);
    info!("Connection Rate: {}/s", args.connection_rate);
    info!("Signed Upgrades: {}", args.server_api_key.as_deref().map_or(false, |k| !k.is_empty()));
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let store = Arc::new(InMemoryMessageStore::new());
    let gateway = Arc::new(ChatGateway::new(store, GatewayConfig::from(&args)));
    let server = Server::new(gateway, args);
    server.run().await?;

    Ok(())
}
