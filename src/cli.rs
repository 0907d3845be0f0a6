use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "peernet")]
#[command(version, about = "Peer network node with load exchange and confidential messaging", long_about = None)]
#[command(author = "PeerNet Team")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node (default mode)
    Run,

    /// Show node identity and configuration
    Info,

    /// Generate a fresh key bundle and print it
    Keygen {
        #[arg(long, default_value = "false", help = "Also print the secret keys")]
        show_secrets: bool,
    },
}
