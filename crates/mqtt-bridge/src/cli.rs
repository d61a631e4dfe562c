use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "mqtt-bridge",
    version,
    about = "Forward MQTT-over-WebSocket publishes to the event bus"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "BRIDGE_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Application name used as the source id of every event (overrides config file setting)
    #[arg(short, long, env = "APPLICATION_NAME")]
    pub application_name: Option<String>,

    /// Port to listen on; the bind address comes from the config file
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Event bus publish endpoint (overrides config file setting)
    #[arg(long, env = "EVENT_URL")]
    pub event_url: Option<String>,

    /// OAuth authority whose `/validate` endpoint checks bearer tokens
    /// (overrides config file setting; empty disables validation)
    #[arg(long, env = "OAUTH_URL")]
    pub oauth_url: Option<String>,
}
