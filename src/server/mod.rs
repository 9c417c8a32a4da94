pub mod api;
pub mod websocket;

use crate::cli::Args;
use crate::gateway::ChatGateway;
use log::info;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    gateway: Arc<ChatGateway>,
    args: Args,
}

impl Server {
    pub fn new(gateway: Arc<ChatGateway>, args: Args) -> Self {
        Self { gateway, args }
    }

    /// Serves until the listener fails or Ctrl+C arrives.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let state = api::AppState::new(self.gateway.clone(), &self.args);

        tokio::select! {
            result = api::serve(state, &self.args) => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
            }
        }

        self.gateway.shutdown().await;
        Ok(())
    }
}
