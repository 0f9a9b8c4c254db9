//! zulipgram — personal Zulip→Telegram DM bridge.
//!
//! Single binary that long-polls a Zulip event queue for private
//! messages, transcodes them to Telegram formatting, and forwards
//! them to the operator's chat. A side listener relays arbitrary
//! webhooks to the same chat.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use zulipgram::bridge::Bridge;
use zulipgram::config::ZulipgramConfig;
use zulipgram::logging;
use zulipgram::telegram::{TelegramConfig, TelegramSender};
use zulipgram::webhook::{HookHandler, WebhookConfig, WebhookServer};
use zulipgram::zulip::{HandlerErrorPolicy, QueueClient, ZulipConfig, ZulipTransport};

#[derive(Parser)]
#[command(name = "zulipgram", version, about = "Zulip→Telegram DM bridge")]
struct Cli {
    /// Path to the config file (default: ./zulipgram.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config =
        ZulipgramConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    if let Some(Command::CheckConfig) = cli.command {
        logging::init_cli();
        config.validate()?;
        println!("configuration OK: {config:#?}");
        return Ok(());
    }

    let _logging_guard = logging::init_production(Path::new(&config.paths.logs_dir))
        .context("failed to initialise logging")?;
    config.validate().context("invalid configuration")?;

    info!(version = env!("CARGO_PKG_VERSION"), "zulipgram starting");

    let telegram = Arc::new(TelegramSender::new(TelegramConfig {
        bot_token: config.telegram.bot_token.clone(),
        chat_id: config.telegram.chat_id,
    }));
    let bridge = Arc::new(Bridge::new(
        Arc::clone(&telegram),
        config.zulip.site.clone(),
    ));

    if let Err(error) = bridge.send_startup_notice().await {
        warn!(%error, "startup notice failed");
    }

    // Webhook listener, stopped through a watch channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let webhook_task = if config.webhooks.enabled {
        let server = WebhookServer::new(
            WebhookConfig {
                port: config.webhooks.port,
            },
            Arc::clone(&bridge) as Arc<dyn HookHandler>,
        );
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { server.serve(rx).await }))
    } else {
        info!("webhook listener disabled by config");
        None
    };

    // Zulip event queue client.
    let transport = ZulipTransport::new(ZulipConfig {
        site: config.zulip.site.clone(),
        email: config.zulip.email.clone(),
        api_key: config.zulip.api_key.clone(),
    });
    let ignore_self = config
        .bridge
        .ignore_self_messages
        .then(|| config.zulip.email.clone());
    let policy = if config.bridge.halt_on_handler_error {
        HandlerErrorPolicy::Halt
    } else {
        HandlerErrorPolicy::LogAndContinue
    };
    let queue_client = Arc::new(QueueClient::new(transport, ignore_self, policy));

    let queue_task = {
        let client = Arc::clone(&queue_client);
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            client
                .run(move |message| {
                    let bridge = Arc::clone(&bridge);
                    async move { bridge.forward_private_message(&message).await }
                })
                .await
        })
    };

    info!("zulipgram ready -- relaying Zulip DMs and webhooks");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal, stopping components");

    queue_client.stop();
    let _ = shutdown_tx.send(true);

    // Stop is cooperative and cannot interrupt an in-flight long
    // poll, so bound the wait instead of hanging for the full window.
    match tokio::time::timeout(std::time::Duration::from_secs(10), queue_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(error))) => warn!(%error, "queue client stopped with error"),
        Ok(Err(error)) => warn!(%error, "queue task panicked"),
        Err(_) => warn!("queue client still polling after 10s, abandoning"),
    }
    if let Some(task) = webhook_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, "webhook server stopped with error"),
            Err(error) => warn!(%error, "webhook task panicked"),
        }
    }

    info!("zulipgram shut down cleanly");
    Ok(())
}
