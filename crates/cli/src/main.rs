//! Vouchers CLI - Send sample requests, watch responses, RPC round trips

mod sample;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use std::time::Duration;
use tabled::{Table, Tabled};
use uuid::Uuid;
use vouchers_core::domain::{IncomingMessage, Outcome, ResponseMessage};
use vouchers_core::port::{Broker, Delivery, DeliveryStream, OutgoingMessage};
use vouchers_infra_amqp::{AmqpBroker, BrokerUrl};

const DEFAULT_AMQP_URL: &str = "amqp://localhost?connection_attempts=5&retry_delay=5";

#[derive(Parser)]
#[command(name = "vouchers")]
#[command(about = "Vouchers worker CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    broker: BrokerArgs,
}

#[derive(Args)]
struct BrokerArgs {
    /// Broker URL
    #[arg(long, global = true, env = "AMQP_URL", default_value = DEFAULT_AMQP_URL)]
    amqp_url: String,

    /// Queue the worker consumes
    #[arg(long, global = true, env = "QUEUE_NAME_REQUEST", default_value = "request_queue")]
    request_queue: String,

    /// Queue the worker answers on
    #[arg(long, global = true, env = "QUEUE_NAME_RESPONSE", default_value = "response_queue")]
    response_queue: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish sample release plan requests
    Send {
        /// Number of requests
        #[arg(short, long, default_value = "1")]
        count: u32,
    },

    /// Print responses as they arrive
    Listen {
        /// Queue to consume (default: the response queue)
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Send one request and wait for its reply
    Call {
        /// Attempts while the reply is an error
        #[arg(short, long, default_value = "3")]
        retries: u32,

        /// Seconds to wait for each reply
        #[arg(short, long, default_value = "30")]
        timeout_secs: u64,
    },
}

/// Result row as printed by `call`
#[derive(Deserialize, Tabled)]
struct ArrivalRow {
    arrival_number: u32,
    arrival_day_number: u32,
    arrival_date: String,
    departure_date: String,
    vouchers_count: u32,
    voucher_number_from: u64,
    voucher_number_to: u64,
}

async fn connect(args: &BrokerArgs) -> Result<AmqpBroker> {
    let url: BrokerUrl = args.amqp_url.parse().context("Invalid --amqp-url")?;
    let broker = AmqpBroker::new(url);
    broker
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", broker.url()))?;
    Ok(broker)
}

fn sample_request(correlation_id: &str) -> Result<OutgoingMessage> {
    let payload = sample::release_plan_request(&mut rand::thread_rng(), chrono::Local::now().date_naive());
    let body = serde_json::to_vec(&payload)?;
    Ok(OutgoingMessage::new(body).with_correlation_id(correlation_id))
}

async fn send(broker: &AmqpBroker, request_queue: &str, count: u32) -> Result<()> {
    broker.declare_queue(request_queue).await?;

    for _ in 0..count {
        let id = Uuid::new_v4().to_string();
        broker.publish(request_queue, sample_request(&id)?).await?;
        println!("{} {}", "→ sent".green(), id);
    }
    println!();
    println!(
        "{}",
        format!("✓ {} request(s) published to {}", count, request_queue).green().bold()
    );
    Ok(())
}

async fn listen(broker: &AmqpBroker, queue: &str) -> Result<()> {
    broker.declare_queue(queue).await?;
    let mut stream = broker.subscribe(queue, 1).await?;
    println!("{}", format!("Listening on {} (Ctrl+C to stop)", queue).cyan().bold());

    loop {
        let delivery = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = stream.next() => match next {
                Some(delivery) => delivery?,
                None => bail!("Subscription closed by the broker"),
            },
        };
        print_response(&delivery.message);
        delivery.acker.ack().await?;
    }
    Ok(())
}

fn print_response(message: &IncomingMessage) {
    match ResponseMessage::from_bytes(&message.body) {
        Ok(response) => match &response.outcome {
            Outcome::Ok { result } => {
                println!("{} {}", format!("✓ {}", response.id.as_str()).green(), result)
            }
            Outcome::Error { reason, detail } => println!(
                "{} {} {}",
                format!("✗ {}", response.id.as_str()).red(),
                reason.as_str().yellow(),
                detail.as_deref().unwrap_or("")
            ),
        },
        Err(_) => println!(
            "{} {}",
            "? unreadable".yellow(),
            String::from_utf8_lossy(&message.body)
        ),
    }
}

async fn call(broker: &AmqpBroker, request_queue: &str, retries: u32, timeout: Duration) -> Result<()> {
    broker.declare_queue(request_queue).await?;
    let reply_queue = broker.declare_reply_queue().await?;
    let mut replies = broker.subscribe(&reply_queue, 1).await?;

    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        let id = Uuid::new_v4().to_string();
        let request = sample_request(&id)?.with_reply_to(reply_queue.as_str());
        broker.publish(request_queue, request).await?;
        println!("{}", format!("→ request {} (attempt {}/{})", id, attempt, attempts).cyan());

        let response = tokio::time::timeout(timeout, wait_for_reply(replies.as_mut(), &id))
            .await
            .with_context(|| format!("No reply within {}s", timeout.as_secs()))??;

        match response.outcome {
            Outcome::Ok { result } => {
                let rows: Vec<ArrivalRow> =
                    serde_json::from_value(result).context("Unexpected result shape")?;
                println!("{}", format!("✓ {} arrival day(s)", rows.len()).green().bold());
                println!();
                println!("{}", Table::new(rows));
                return Ok(());
            }
            Outcome::Error { reason, detail } => {
                println!(
                    "{} {} {}",
                    "✗ error:".red(),
                    reason.as_str().yellow(),
                    detail.as_deref().unwrap_or("")
                );
            }
        }
    }
    bail!("Every attempt answered with an error")
}

/// Next reply carrying `id`; replies to earlier attempts are discarded
async fn wait_for_reply(replies: &mut dyn DeliveryStream, id: &str) -> Result<ResponseMessage> {
    loop {
        let Delivery { message, acker } = match replies.next().await {
            Some(delivery) => delivery?,
            None => bail!("Reply subscription closed"),
        };
        acker.ack().await?;

        let Ok(response) = ResponseMessage::from_bytes(&message.body) else {
            continue;
        };
        let reply_id = message.correlation_id.as_deref().unwrap_or(response.id.as_str());
        if reply_id == id {
            return Ok(response);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let broker = connect(&cli.broker).await?;

    let result = match cli.command {
        Commands::Send { count } => send(&broker, &cli.broker.request_queue, count).await,
        Commands::Listen { queue } => {
            let queue = queue.unwrap_or_else(|| cli.broker.response_queue.clone());
            listen(&broker, &queue).await
        }
        Commands::Call {
            retries,
            timeout_secs,
        } => {
            call(
                &broker,
                &cli.broker.request_queue,
                retries,
                Duration::from_secs(timeout_secs),
            )
            .await
        }
    };

    let _ = broker.close().await;
    result
}
