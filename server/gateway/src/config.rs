use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "lc-gateway", about = "LAN voice-chat relay")]
pub struct Config {
    /// QUIC listen address.
    #[arg(long, default_value = "0.0.0.0:4433")]
    pub addr: String,

    /// HTTP API listen address (health + state).
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub api_addr: String,

    /// SQLite database path.
    #[arg(long, env = "LC_DB", default_value = "lancast.db")]
    pub db: String,

    /// QUIC idle timeout in seconds.
    #[arg(long, default_value_t = 300)]
    pub idle_timeout: u64,

    /// Self-signed certificate validity in days.
    #[arg(long, default_value_t = 365)]
    pub cert_validity: u32,

    /// Global connection cap.
    #[arg(long, default_value_t = 256)]
    pub max_connections: usize,

    /// Connections allowed per source IP.
    #[arg(long, default_value_t = 16)]
    pub per_ip_limit: u32,

    /// Control messages per second per client.
    #[arg(long, default_value_t = 20)]
    pub rate_limit: u32,

    /// Directory for channel recordings.
    #[arg(long, default_value = "recordings")]
    pub recordings_dir: String,

    /// TURN server advertised to clients.
    #[arg(long)]
    pub turn_url: Option<String>,

    #[arg(long)]
    pub turn_username: Option<String>,

    #[arg(long)]
    pub turn_credential: Option<String>,

    #[arg(long)]
    pub tls_cert_pem: Option<String>,

    #[arg(long)]
    pub tls_key_pem: Option<String>,

    #[arg(long, default_value = "lc-relay/1")]
    pub alpn: String,

    /// Server name shown to clients until the owner renames it.
    #[arg(long, default_value = "LAN Voice")]
    pub server_name: String,
}

impl Config {
    /// Port clients should hit for the HTTP API, as advertised in `user_list`.
    pub fn api_port(&self) -> u16 {
        self.api_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080)
    }

    pub fn ice_servers(&self) -> Vec<lc_control::IceServer> {
        match &self.turn_url {
            Some(url) => vec![lc_control::IceServer {
                urls: vec![url.clone()],
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            }],
            None => Vec::new(),
        }
    }
}
