//! CLI for PopMQ
//!
//! Runs the classic messaging scenarios against an in-process broker:
//! - `hello`: one producer, one auto-ack consumer
//! - `work-queue`: competing workers with acks and prefetch-based fair dispatch
//! - `fanout`: one message copied to every subscriber's queue
//! - `direct`: routing by exact severity key

use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use popmq::broker::{Broker, ExchangeKind};
use popmq::client::Channel;
use popmq::config::load_config;
use tokio::sync::mpsc;
use tracing::{error, info};

const TASK_QUEUE: &str = "task_queue";
const LOGS_EXCHANGE: &str = "logs";
const DIRECT_LOGS_EXCHANGE: &str = "direct_logs";

#[derive(Parser)]
#[command(name = "popmq")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one message to the "hello" queue and receive it
    Hello {
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Distribute tasks over competing workers; each '.' is one unit of work
    WorkQueue {
        #[arg(long, default_value_t = 2)]
        workers: usize,
        #[arg(long, default_value_t = 1)]
        prefetch: u16,
        /// Simulated work per '.' in a task, in milliseconds
        #[arg(long, default_value_t = 100)]
        ms_per_dot: u64,
        #[arg(required = true, num_args = 1..)]
        tasks: Vec<String>,
    },
    /// Broadcast one log line to every subscriber
    Fanout {
        #[arg(long, default_value_t = 2)]
        subscribers: usize,
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Publish with a severity routing key to a receiver bound to some severities
    Direct {
        /// Severities the receiver binds, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        bind: Vec<String>,
        severity: String,
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    popmq::utils::logging::init(&config.log.level);

    let broker = Broker::with_settings(config.broker.clone());

    let result = match cli.command {
        Command::Hello { message } => run_hello(&broker, message.join(" ")).await,
        Command::WorkQueue {
            workers,
            prefetch,
            ms_per_dot,
            tasks,
        } => run_work_queue(&broker, workers, prefetch, ms_per_dot, tasks).await,
        Command::Fanout {
            subscribers,
            message,
        } => run_fanout(&broker, subscribers, message.join(" ")).await,
        Command::Direct {
            bind,
            severity,
            message,
        } => run_direct(&broker, bind, &severity, message.join(" ")).await,
    };

    if let Err(e) = result {
        error!("Scenario failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_hello(broker: &Broker, message: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut channel = Channel::open(broker);
    channel.queue_declare("hello", false)?;
    let mut consumer = channel.basic_consume("hello", true)?;

    channel.basic_publish("", "hello", message.as_bytes(), false)?;
    info!("[x] Sent '{message}'");

    if let Some(delivery) = consumer.recv().await {
        info!("[x] Received '{}'", delivery.text());
    }
    Ok(())
}

async fn run_work_queue(
    broker: &Broker,
    workers: usize,
    prefetch: u16,
    ms_per_dot: u64,
    tasks: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    broker.declare_queue(TASK_QUEUE, true)?;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(usize, String)>();

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let mut channel = Channel::open(broker);
        channel.basic_qos(prefetch)?;
        let mut consumer = channel.basic_consume(TASK_QUEUE, false)?;
        let done_tx = done_tx.clone();

        handles.push(tokio::spawn(async move {
            while let Some(delivery) = consumer.recv().await {
                let task = delivery.text();
                info!(worker, "[x] Received '{task}'");
                let dots = task.chars().filter(|c| *c == '.').count() as u64;
                tokio::time::sleep(Duration::from_millis(dots * ms_per_dot)).await;
                if let Err(e) = channel.basic_ack(&delivery) {
                    error!(worker, error = %e, "ack failed");
                    break;
                }
                info!(worker, "[x] Done");
                if done_tx.send((worker, task)).is_err() {
                    break;
                }
            }
        }));
    }
    drop(done_tx);

    let mut producer = Channel::open(broker);
    for task in &tasks {
        producer.basic_publish("", TASK_QUEUE, task.as_bytes(), true)?;
        info!("[x] Sent '{task}'");
    }

    let mut per_worker = vec![0usize; workers];
    for _ in 0..tasks.len() {
        match done_rx.recv().await {
            Some((worker, _)) => per_worker[worker] += 1,
            None => break,
        }
    }

    for handle in handles {
        handle.abort();
    }

    for (worker, count) in per_worker.iter().enumerate() {
        info!(worker, processed = count, "worker summary");
    }
    let queue = broker.queue_info(TASK_QUEUE)?;
    info!("queue state: {}", serde_json::to_string(&queue)?);
    Ok(())
}

async fn run_fanout(
    broker: &Broker,
    subscribers: usize,
    message: String,
) -> Result<(), Box<dyn std::error::Error>> {
    broker.declare_exchange(LOGS_EXCHANGE, ExchangeKind::Fanout)?;

    let mut receivers = Vec::with_capacity(subscribers);
    for n in 0..subscribers {
        let mut channel = Channel::open(broker);
        let queue = channel.queue_declare_anonymous()?;
        channel.queue_bind(&queue, LOGS_EXCHANGE, "")?;
        let mut consumer = channel.basic_consume(&queue, true)?;

        receivers.push(tokio::spawn(async move {
            let delivery = consumer.recv().await;
            if let Some(delivery) = &delivery {
                info!(subscriber = n, queue = %delivery.queue, "[x] Received '{}'", delivery.text());
            }
            drop(channel);
            delivery.is_some()
        }));
    }

    let mut producer = Channel::open(broker);
    let published = producer.basic_publish(LOGS_EXCHANGE, "", message.as_bytes(), false)?;
    info!(routed = published.routed, "[x] Sent '{message}'");

    let received = join_all(receivers)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(true)))
        .count();
    info!(received, "fanout complete");
    Ok(())
}

async fn run_direct(
    broker: &Broker,
    bind: Vec<String>,
    severity: &str,
    message: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut channel = Channel::open(broker);
    channel.exchange_declare(DIRECT_LOGS_EXCHANGE, ExchangeKind::Direct)?;
    let queue = channel.queue_declare_anonymous()?;
    for key in &bind {
        channel.queue_bind(&queue, DIRECT_LOGS_EXCHANGE, key)?;
    }
    let mut consumer = channel.basic_consume(&queue, true)?;

    let published = channel.basic_publish(DIRECT_LOGS_EXCHANGE, severity, message.as_bytes(), false)?;
    info!(routed = published.routed, "[x] Sent '{severity}':'{message}'");

    match tokio::time::timeout(Duration::from_millis(200), consumer.recv()).await {
        Ok(Some(delivery)) => info!(
            "[x] Received '{}':'{}'",
            delivery.routing_key.as_deref().unwrap_or_default(),
            delivery.text()
        ),
        _ => info!(bound = ?bind, "no binding matched '{severity}', nothing received"),
    }
    Ok(())
}
