use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::Config;
use signal_courier::chat::{ChatSender, TelegramClient, resolve_bot_token};
use signal_courier::queue::{DeliveryWorker, Priority, Producer, QueuedMessage, WorkerConfig, WorkerStats};
use signal_courier::scheduler::{Job, Schedule, Scheduler, SchedulerConfig};
use signal_courier::store::{KeySpace, RedisStore, SharedStore};

fn setup_logging(level: &str) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("signal-courier")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("signal-courier.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Worker { workers } => handle_worker_command(*workers, config).await,
        Commands::Enqueue {
            chat_id,
            text,
            priority,
            keyboard,
        } => handle_enqueue_command(chat_id, text, *priority, keyboard.as_deref(), config).await,
        Commands::Depth => handle_depth_command(config).await,
    }
}

fn open_store(config: &Config) -> Result<RedisStore> {
    let keys = KeySpace::new(config.store.key_prefix.as_str());
    RedisStore::new(&config.store.redis_url, keys).context("Failed to configure Redis store")
}

async fn handle_worker_command(workers: Option<usize>, config: &Config) -> Result<()> {
    let count = workers.unwrap_or(config.delivery.workers).max(1);
    info!("Starting {} delivery workers", count);

    let token = resolve_bot_token(&config.telegram.bot_token).context("Telegram bot token")?;
    let sender: Arc<dyn ChatSender> = Arc::new(
        TelegramClient::new(
            token,
            config.telegram.api_base_url.as_str(),
            Duration::from_millis(config.telegram.timeout_ms),
        )
        .context("Failed to build Telegram client")?,
    );

    let control = Arc::new(open_store(config)?);
    control.ping().await.context("Redis is unreachable")?;

    let shutdown = CancellationToken::new();
    let worker_config = WorkerConfig::from(config);
    let mut running = Vec::with_capacity(count);
    for i in 0..count {
        // One store per worker: each parks its own BLPOP connection.
        let store: Arc<dyn SharedStore> = Arc::new(open_store(config)?);
        let worker = Arc::new(
            DeliveryWorker::new(format!("worker-{}", i), store, sender.clone(), worker_config.clone())
                .with_shutdown(shutdown.clone()),
        );
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        running.push((worker, handle));
    }

    let scheduler = Scheduler::new(SchedulerConfig::from(&config.scheduler));
    let producer = Producer::new(control.clone());
    scheduler
        .register(Job::new(
            "backlog-report",
            "Log the length of each delivery backlog",
            Schedule::every(config.backlog_report_interval())?,
            move |_cancel: CancellationToken| {
                let producer = producer.clone();
                async move {
                    let depth = producer.depth().await?;
                    tracing::info!(
                        high = depth.high,
                        normal = depth.normal,
                        low = depth.low,
                        "Backlog depth"
                    );
                    Ok::<(), eyre::Report>(())
                }
            },
        ))
        .await;
    scheduler.start().await;

    println!(
        "{} {} workers running against {}. Press Ctrl-C to stop.",
        "Started:".green(),
        count,
        config.store.redis_url
    );
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    println!("{}", "Shutting down...".yellow());

    shutdown.cancel();
    let mut total = WorkerStats::default();
    for (worker, handle) in running {
        if let Err(e) = handle.await {
            log::error!("{} panicked: {}", worker.name(), e);
        }
        total += worker.stats();
    }
    scheduler.stop().await;

    info!("Workers stopped: {:?}", total);
    println!(
        "{} sent={} requeued={} deferred={} dropped={}",
        "Stopped:".green(),
        total.sent,
        total.requeued,
        total.deferred,
        total.finished() - total.sent
    );
    Ok(())
}

async fn handle_enqueue_command(
    chat_id: &str,
    text: &str,
    priority: Priority,
    keyboard: Option<&str>,
    config: &Config,
) -> Result<()> {
    let mut message = QueuedMessage::new(chat_id, text, priority);
    if let Some(raw) = keyboard {
        let markup: serde_json::Value = serde_json::from_str(raw).context("Keyboard must be valid JSON")?;
        message = message.with_keyboard(markup);
    }

    let producer = Producer::new(Arc::new(open_store(config)?));
    producer.enqueue(&message).await.context("Failed to enqueue message")?;

    info!("Enqueued {} for {} ({})", message.id, chat_id, priority);
    println!("{} {} ({})", "Enqueued:".green(), message.id, priority.to_string().cyan());
    Ok(())
}

async fn handle_depth_command(config: &Config) -> Result<()> {
    let producer = Producer::new(Arc::new(open_store(config)?));
    let depth = producer.depth().await.context("Failed to read backlog depth")?;

    println!("{:>7} {}", "high".red().bold(), depth.high);
    println!("{:>7} {}", "normal".yellow().bold(), depth.normal);
    println!("{:>7} {}", "low".cyan().bold(), depth.low);
    println!("{:>7} {}", "total".bold(), depth.total());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging once the configured level is known
    let level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    setup_logging(&level).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
