use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address and port for the server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Path of the chat upgrade endpoint.
    #[arg(long, env = "WS_PATH", default_value = "/ws/chat")]
    pub ws_path: String,

    /// Optional shared secret. If set, clients must sign the upgrade with `ts` and `sig` query parameters.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Maximum number of upgrades accepted per second across all clients.
    #[arg(long, env = "CONNECTION_RATE", default_value = "10")]
    pub connection_rate: u32,

    /// Inbound frames larger than this many bytes are dropped.
    #[arg(long, env = "MAX_MESSAGE_SIZE", default_value = "1048576")]
    pub max_message_size: usize,

    // --- Protocol Timing Args ---
    /// Seconds between keep-alive pings on each connection.
    #[arg(long, env = "HEARTBEAT_SECS", default_value = "30")]
    pub heartbeat_secs: u64,

    /// Delay in milliseconds between a simulated reply landing and the peer marking messages read.
    #[arg(long, env = "READ_SYNC_DELAY_MS", default_value = "400")]
    pub read_sync_delay_ms: u64,

    /// Let the scripted peer answer human messages.
    #[arg(long, env = "AUTO_RESPONSE", default_value = "true", action = clap::ArgAction::Set)]
    pub auto_response: bool,

    /// Use near-instant typing and send delays for the scripted peer (demos only).
    #[arg(long, env = "BRISK_REPLIES", default_value = "false")]
    pub brisk_replies: bool,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    /// Optional path to the TLS certificate file (PEM format) for enabling WSS. Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling WSS. Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}
