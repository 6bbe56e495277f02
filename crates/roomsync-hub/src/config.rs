//! Hub configuration: CLI flags with environment-variable fallbacks via
//! `clap`, so `--help` documents every knob.
//!
//! Environment variables (all optional):
//!   PORT, TCP_PORT  - gossip/hub-stream WebSocket bind port (aliases; `PORT`
//!                      wins if both are set)
//!   HTTP_PORT       - mirror-mode upload endpoint port
//!   DATA_DIR        - sled database directory
//!
//! CLI mode flags: `--relay-only`, `--mirror-only`, `--sync-only`, or any
//! combination. Absence of every `--*-only` flag enables all three modes.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "roomsync-hub", about = "Aggregation hub for room sync peers")]
pub struct Config {
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    #[arg(long, env = "TCP_PORT", default_value_t = 8080)]
    tcp_port: u16,

    #[arg(long, env = "HTTP_PORT", default_value_t = 8081)]
    http_port: u16,

    #[arg(long, env = "DATA_DIR", default_value = "./roomsync-data")]
    pub data_dir: String,

    #[arg(long, env = "ROOMSYNC_BIND_HOST", default_value = "127.0.0.1")]
    pub bind_host: String,

    #[arg(long, env = "ROOMSYNC_MAX_PEERS", default_value_t = 64)]
    pub max_peers_per_room: usize,

    #[arg(long, env = "ROOMSYNC_MAX_ROOMS", default_value_t = 1_000_000)]
    pub max_rooms: usize,

    #[arg(long, env = "ROOMSYNC_MAX_DOC_SIZE", default_value_t = 10 * 1024 * 1024)]
    pub max_doc_size: usize,

    #[arg(long, default_value_t = false)]
    relay_only: bool,

    #[arg(long, default_value_t = false)]
    mirror_only: bool,

    #[arg(long, default_value_t = false)]
    sync_only: bool,
}

/// Which of the hub's three responsibilities are active. Named flags select
/// a subset; with none given, all three run (the hub's default, full-duty
/// behavior).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modes {
    pub relay: bool,
    pub mirror: bool,
    pub sync: bool,
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// `PORT` takes priority over `TCP_PORT` when both are set, matching
    /// the two env vars being documented as aliases for the same bind port.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port.unwrap_or(self.tcp_port))
    }

    pub fn upload_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.http_port)
    }

    pub fn modes(&self) -> Modes {
        if !self.relay_only && !self.mirror_only && !self.sync_only {
            Modes {
                relay: true,
                mirror: true,
                sync: true,
            }
        } else {
            Modes {
                relay: self.relay_only,
                mirror: self.mirror_only,
                sync: self.sync_only,
            }
        }
    }
}
