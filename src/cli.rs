use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fleetlink", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file path
    #[arg(short, long, value_name = "FILE")]
    pub config_path: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller (session server + discovery listener)
    Serve,

    /// Send one out-of-band wake packet
    Wake {
        /// Destination address
        #[arg(long)]
        ip: String,

        /// Destination port (defaults to the configured wake port)
        #[arg(long)]
        port: Option<u16>,

        /// Device id to embed in the packet
        #[arg(long)]
        cpe_id: Option<String>,
    },

    /// Mint a session token for a device (ops/test helper; issuance proper
    /// is an external concern)
    MintToken {
        /// Device id the token is bound to
        #[arg(long)]
        cpe_id: String,

        /// Token lifetime in seconds (defaults to the configured TTL)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// Generate a sample configuration file
    ConfigSample {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
