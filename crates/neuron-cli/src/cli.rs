//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a commander until interrupted
    Commander {
        /// Address to listen on, overrides the configuration
        #[arg(short, long)]
        listen: Option<String>,
        /// Also run the behavior-tree publisher
        #[arg(long)]
        twins: bool,
    },
    /// Run a receiver until interrupted
    Receiver {
        /// Worker identity announced in heartbeats
        #[arg(short, long)]
        node_id: Option<String>,
        /// Commander channel URL, overrides the configuration
        #[arg(short = 'u', long)]
        commander_url: Option<String>,
        /// Also run the behavior-tree subscriber
        #[arg(long)]
        twins: bool,
    },
    /// Queue a frame on a running commander
    Enqueue {
        /// Worker identity, empty to broadcast
        #[arg(short, long, default_value = "")]
        target: String,
        /// Frame to deliver, e.g. `id#?EVAL#System#Ping#**`
        message: String,
        /// Message endpoint URL, derived from the commander URL when absent
        #[arg(short, long)]
        endpoint: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "neuron",
            "--verbose",
            "enqueue",
            "--target",
            "Worker-1",
            "ping#?EVAL#System#Ping#**",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Enqueue {
                target,
                message,
                endpoint,
            } => {
                assert_eq!(target, "Worker-1");
                assert_eq!(message, "ping#?EVAL#System#Ping#**");
                assert!(endpoint.is_none());
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_parse_receiver_overrides() {
        let cli = Cli::try_parse_from(["neuron", "receiver", "-n", "Worker-9", "--twins"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Receiver {
                node_id: Some(ref id),
                twins: true,
                commander_url: None,
            } if id == "Worker-9"
        ));
    }
}
