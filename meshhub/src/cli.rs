use clap::{Parser, Subcommand, ValueEnum};
use meshhub_core::ClientConfig;
use meshhub_core::config::{parse_flag, parse_tcp_devices};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "meshhub")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Output in JSON format
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Connection timeout (e.g. 30s, 1m)
    #[arg(short = 't', long, global = true, default_value = "30s")]
    pub timeout: humantime::Duration,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file (appended)
    #[arg(long, global = true, env = "APP_LOG_NAME")]
    pub app_log: Option<PathBuf>,

    /// Comma-separated TCP radios offered by `scan`
    #[arg(long, global = true, env = "TCP_DEVICES")]
    pub tcp_devices: Option<String>,

    /// Channel message log
    #[arg(long, global = true, env = "CHANNEL_MESSAGE_LOG")]
    pub channel_log: Option<PathBuf>,

    /// Direct message log
    #[arg(long, global = true, env = "DIRECT_MESSAGE_LOG")]
    pub direct_log: Option<PathBuf>,

    /// Request acknowledgment for channel broadcasts (true/yes)
    #[arg(long, global = true, env = "WANT_ACK_BROADCAST")]
    pub want_ack_broadcast: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Merge flags (and their environment fallbacks) over the defaults
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            connect_timeout: self.timeout.into(),
            ..ClientConfig::default()
        };
        if let Some(devices) = &self.tcp_devices {
            config.tcp_devices = parse_tcp_devices(devices);
        }
        if let Some(path) = &self.channel_log {
            config.channel_log = path.clone();
        }
        if let Some(path) = &self.direct_log {
            config.direct_log = path.clone();
        }
        if let Some(flag) = &self.want_ack_broadcast {
            config.want_ack_broadcast = parse_flag(flag);
        }
        config
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover radios on the selected transports
    Scan {
        /// Transports to scan (ble, serial, tcp); all available when omitted
        #[arg(short = 'T', long, value_delimiter = ',')]
        transport: Vec<String>,
    },

    /// Connect to one or more radios and print traffic until Ctrl+C
    Monitor {
        /// Devices as kind:address, e.g. tcp:192.168.1.20 or serial:/dev/ttyUSB0
        #[arg(required = true)]
        devices: Vec<String>,
    },

    /// Broadcast a text message on a channel
    Send {
        /// Device as kind:address
        device: String,

        /// Channel index
        #[arg(short = 'c', long, default_value = "0")]
        channel: u32,

        /// Message text
        #[arg(short = 'm', long)]
        text: String,
    },

    /// Send a direct message to a node by short name
    Direct {
        /// Device as kind:address
        device: String,

        /// Short name of the remote node
        #[arg(long)]
        to: String,

        /// Message text
        #[arg(short = 'm', long)]
        text: String,
    },

    /// Show persisted message history without connecting
    History {
        #[arg(value_enum)]
        kind: HistoryKind,

        /// Only show messages for this device
        #[arg(long)]
        device: Option<String>,
    },

    /// Show the node directory of a radio
    Nodes {
        /// Device as kind:address
        device: String,
    },

    /// Wipe a radio's node database (the radio reboots)
    ResetNodeDb {
        /// Device as kind:address
        device: String,

        /// Confirm the reset
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryKind {
    Channels,
    Direct,
}
