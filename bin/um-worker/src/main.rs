//! User Management Worker
//!
//! Consumes deletion commands from the user topic and removes the user from
//! every downstream service, then from the identity provider.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use um_cleanup::{
    standard_pipeline, DeletionOrchestrator, DeletionRequester, DownstreamClient,
    UserCommandHandler,
};
use um_config::{AppConfig, ConfigLoader};
use um_identity::{
    CredentialCache, CredentialSettings, KeycloakAdminClient, TokenMinter, UserDirectory,
};
use um_queue::amqp::{AmqpConnector, AmqpPublisher, AmqpSettings};
use um_queue::{
    BrokerConnector, CommandPublisher, ConsumerSettings, RetryPolicy, RetryingPublisher,
    SupervisedConsumer,
};

#[derive(Parser, Debug)]
#[command(name = "um-worker")]
#[command(about = "Cascading user deletion worker")]
struct Args {
    /// Configuration file (defaults to the standard search paths)
    #[arg(long, env = "USER_MANAGEMENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume the user topic until interrupted (default)
    Run,
    /// Publish a deletion command for one user and exit
    EnqueueDelete {
        /// Identity provider id of the user
        user_id: String,
    },
    /// Print an example configuration file
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    if let Some(Command::PrintConfig) = args.command {
        print!("{}", AppConfig::example_toml());
        return Ok(());
    }

    um_common::logging::init_logging("um-worker");

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("Failed to load configuration")?;

    match args.command {
        Some(Command::EnqueueDelete { user_id }) => enqueue_delete(&config, &user_id).await,
        _ => run(config).await,
    }
}

fn amqp_settings(config: &AppConfig) -> AmqpSettings {
    AmqpSettings {
        uri: config.broker.uri.clone(),
        topic: config.broker.user_topic.clone(),
        consumer_group: config.broker.consumer_group.clone(),
        prefetch_count: config.broker.prefetch_count,
        init_topics: config.broker.init_topics,
        connection_name: "um-worker".to_string(),
    }
}

fn user_directory(config: &AppConfig, http: reqwest::Client) -> Arc<dyn UserDirectory> {
    let credentials = Arc::new(CredentialCache::new(
        CredentialSettings::from_config(&config.keycloak),
        http.clone(),
    ));
    Arc::new(KeycloakAdminClient::from_config(
        &config.keycloak,
        http,
        credentials,
    ))
}

fn http_client(config: &AppConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.cleanup.http_timeout())
        .build()
        .context("Failed to build HTTP client")
}

async fn run(config: AppConfig) -> Result<()> {
    info!(
        broker = %config.broker.broker_type,
        topic = %config.broker.user_topic,
        group = %config.broker.consumer_group,
        "Starting User Management Worker"
    );

    let directory = user_directory(&config, http_client(&config)?);
    let minter =
        TokenMinter::from_config(&config.cleanup).context("Failed to set up token signing")?;
    if !minter.is_signed() {
        warn!("No signing key configured, impersonation tokens are unsigned");
    }

    let client = DownstreamClient::from_config(&config.cleanup)?;
    let steps = standard_pipeline(&config, client, directory);
    let orchestrator = Arc::new(DeletionOrchestrator::new(Arc::new(minter), steps));
    info!(steps = ?orchestrator.step_names(), "Deletion pipeline ready");

    let handler = UserCommandHandler::new(orchestrator).with_debug_payloads(config.debug);

    let connector = broker_connector(&config)?;

    let consumer = Arc::new(SupervisedConsumer::new(
        connector,
        Arc::new(handler),
        ConsumerSettings {
            reconnect_interval: config.broker.reconnect_interval(),
            failure_backoff: config.broker.failure_backoff(),
        },
    ));

    let worker = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run().await })
    };

    shutdown_signal().await;
    info!("Shutdown signal received");

    consumer.shutdown();
    worker.await.context("Consumer task failed")?;

    info!(stats = ?consumer.stats(), "User Management Worker stopped");
    Ok(())
}

/// The consumer needs a broker shared with the publishers. The embedded
/// broker only lives inside one process, so it is refused here.
fn broker_connector(config: &AppConfig) -> Result<Arc<dyn BrokerConnector>> {
    match config.broker.broker_type.as_str() {
        "amqp" => Ok(Arc::new(AmqpConnector::new(amqp_settings(config)))),
        other => bail!("run needs a shared broker, configured type is '{}'", other),
    }
}

async fn enqueue_delete(config: &AppConfig, user_id: &str) -> Result<()> {
    if config.broker.broker_type != "amqp" {
        bail!(
            "enqueue-delete needs a shared broker, configured type is '{}'",
            config.broker.broker_type
        );
    }

    let policy = RetryPolicy {
        max_attempts: config.broker.publish_max_attempts,
        attempt_timeout: config.broker.publish_timeout(),
        ..RetryPolicy::default()
    };
    let publisher: Arc<dyn CommandPublisher> = Arc::new(RetryingPublisher::new(
        AmqpPublisher::new(amqp_settings(config)),
        policy,
    ));

    let requester = DeletionRequester::new(
        user_directory(config, http_client(config)?),
        publisher,
        config.broker.user_topic.clone(),
    );
    requester.request_deletion(user_id).await?;

    info!(user_id, "Deletion command published");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
