//! Command handlers for the Neuron CLI

use std::sync::Arc;

use neuron_core::NeuronConfig;
use neuron_runtime::{
    request_enqueue, ActionTable, CancelSignal, Commander, CommanderServer, OperationTable,
    Publisher, Receiver, Subscriber, SystemService,
};
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::message_endpoint;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: NeuronConfig) -> Result<()> {
        match cli.command {
            Commands::Commander { listen, twins } => {
                let config = NeuronConfig {
                    listen_addr: listen.unwrap_or(config.listen_addr),
                    ..config
                };
                Self::handle_commander_command(config, twins).await
            }
            Commands::Receiver {
                node_id,
                commander_url,
                twins,
            } => {
                let config = NeuronConfig {
                    node_id: node_id.unwrap_or(config.node_id),
                    commander_url: commander_url.unwrap_or(config.commander_url),
                    ..config
                };
                config.validate()?;
                Self::handle_receiver_command(config, twins).await
            }
            Commands::Enqueue {
                target,
                message,
                endpoint,
            } => Self::handle_enqueue_command(&config, &target, &message, endpoint).await,
            Commands::Config => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        }
    }

    /// Run the commander server, optionally with the publisher twin
    async fn handle_commander_command(config: NeuronConfig, twins: bool) -> Result<()> {
        let operations = Arc::new(OperationTable::new());
        SystemService::register(&operations);
        let commander = Commander::new(Arc::new(config), Arc::clone(&operations));

        let publisher = twins.then(|| {
            let publisher = Publisher::new(Arc::clone(&commander));
            publisher.register(&operations);
            publisher
        });

        commander.start_service()?;
        let server = CommanderServer::bind(Arc::clone(&commander)).await?;
        info!("Commander ready on {}", server.local_addr()?);
        let shutdown = CancelSignal::new();
        let server_task = server.spawn(shutdown.clone());
        if let Some(publisher) = &publisher {
            publisher.start()?;
        }

        wait_for_interrupt().await?;

        if let Some(publisher) = &publisher {
            publisher.stop().await;
        }
        shutdown.cancel();
        commander.stop_service().await?;
        server_task
            .await
            .map_err(|e| CliError::Task(e.to_string()))??;
        Ok(())
    }

    /// Run the receiver, optionally with the subscriber twin
    async fn handle_receiver_command(config: NeuronConfig, twins: bool) -> Result<()> {
        let config = Arc::new(config);
        let operations = Arc::new(OperationTable::new());
        SystemService::register(&operations);

        let subscriber = twins.then(|| {
            let subscriber = Subscriber::new(Arc::clone(&config), ActionTable::with_builtins());
            subscriber.register(&operations);
            subscriber
        });

        let receiver = Receiver::new(Arc::clone(&config), operations);
        receiver.start_service()?;
        if let Some(subscriber) = &subscriber {
            subscriber.start()?;
        }
        info!("Receiver {} dialing {}", config.node_id, config.commander_url);

        wait_for_interrupt().await?;

        if let Some(subscriber) = &subscriber {
            subscriber.stop().await;
        }
        receiver.stop_service().await?;
        Ok(())
    }

    /// Queue one frame on a running commander and print its answer
    async fn handle_enqueue_command(
        config: &NeuronConfig,
        target: &str,
        frame: &str,
        endpoint: Option<String>,
    ) -> Result<()> {
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => message_endpoint(config)?,
        };
        let answer = request_enqueue(&endpoint, target, frame).await?;
        if !answer.is_success() {
            warn!("Commander refused the frame: {}", answer.code);
        }
        println!("{}", serde_json::to_string_pretty(&answer)?);
        Ok(())
    }
}

async fn wait_for_interrupt() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    Ok(())
}
