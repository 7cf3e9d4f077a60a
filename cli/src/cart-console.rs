//! # cart-console
//!
//! A command-line driver for the cart synchronization engine. Every command
//! loads the cart, applies one intent, waits for it to settle and prints the
//! resulting cart together with the badge count the engine reported.
//!
//! Configuration is layered: defaults, then the JSON file from
//! `--config-path`, then flags and `CART_*` environment variables (a `.env`
//! file in the working directory is honored). `--offline` swaps the REST
//! backend for an in-memory cart seeded with a small demo catalog.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use lib_cart::{
    setup_logging, CartConfig, CartEngine, CartService, CartSnapshot, ConfigOverrides, HttpCartService,
    InMemoryCartService, LineId, Money, MutationTicket, NotificationSink, ProductId, SinkError,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// CLI arguments for cart-console.
#[derive(Parser, Debug)]
#[clap(
    name = "cart-console",
    version,
    author = "ckir",
    about = "Drives the cart synchronization engine from a terminal."
)]
pub struct Cli {
    #[clap(long, env = "CART_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "CART_BASE_URL", help = "Base URL of the cart service.")]
    pub base_url: Option<String>,

    #[clap(long, env = "CART_AUTH_TOKEN", hide_env_values = true, help = "Bearer token for the cart service.")]
    pub auth_token: Option<String>,

    #[clap(long, env = "CART_MAX_RETRIES", help = "Retries for idempotent requests.")]
    pub max_retries: Option<u32>,

    #[clap(long, env = "CART_HTTP_TIMEOUT_MS", help = "Per-attempt HTTP timeout in milliseconds.")]
    pub http_timeout_ms: Option<u64>,

    #[clap(long, env = "CART_COALESCE_WINDOW_MS", help = "Coalescing window in milliseconds.")]
    pub coalesce_window_ms: Option<u64>,

    #[clap(long, env = "CART_REQUEST_TIMEOUT_MS", help = "Engine-side request timeout in milliseconds.")]
    pub request_timeout_ms: Option<u64>,

    #[clap(long, env = "CART_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "CART_LOG_DIR", help = "Directory for the rolling JSON log.")]
    pub log_dir: Option<PathBuf>,

    /// Use the in-memory demo cart instead of the REST service.
    #[clap(long, action = ArgAction::SetTrue)]
    pub offline: bool,

    /// Print the cart as JSON.
    #[clap(long, action = ArgAction::SetTrue)]
    pub json: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the cart.
    Show,
    /// Add a product.
    Add {
        product_id: ProductId,
        #[clap(default_value_t = 1)]
        quantity: u32,
    },
    /// Set the quantity of a line.
    Set { line_id: LineId, quantity: u32 },
    /// Increase a line by one.
    Inc { line_id: LineId },
    /// Decrease a line by one; removes it at quantity 1.
    Dec { line_id: LineId },
    /// Remove a line.
    Remove { line_id: LineId },
    /// Fire several "+" taps at once to watch them coalesce.
    Tap {
        line_id: LineId,
        #[clap(default_value_t = 3)]
        times: u32,
    },
    /// Place the order.
    Checkout,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            base_url: self.base_url.clone(),
            auth_token: self.auth_token.clone(),
            max_retries: self.max_retries,
            http_timeout_ms: self.http_timeout_ms,
            coalesce_window_ms: self.coalesce_window_ms,
            request_timeout_ms: self.request_timeout_ms,
            log_level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
        }
    }
}

/// Prints badge updates the way the launcher badge would show them.
struct ConsoleBadge;

impl NotificationSink for ConsoleBadge {
    fn notify_count(&self, total: u32) -> Result<(), SinkError> {
        if total > 0 {
            println!("[badge] {total}");
        } else {
            println!("[badge] cleared");
        }
        Ok(())
    }
}

fn demo_service() -> Result<InMemoryCartService> {
    let service = InMemoryCartService::with_catalog([
        (1, "Espresso beans 1kg", Money::from_cents(1250)),
        (2, "Ceramic mug", Money::from_cents(990)),
        (3, "Milk frother", Money::from_cents(2400)),
    ]);
    service.seed_line(1, 2)?;
    service.seed_line(2, 1)?;
    Ok(service)
}

async fn settle(ticket: MutationTicket) -> Result<()> {
    if let Some(reason) = ticket.rejection_reason() {
        warn!(%reason, "intent rejected");
    }
    ticket.outcome().await.context("cart mutation failed")
}

async fn run(engine: &CartEngine, command: Command) -> Result<()> {
    match command {
        Command::Show => Ok(()),
        Command::Add { product_id, quantity } => settle(engine.add_item(product_id, quantity)).await,
        Command::Set { line_id, quantity } => settle(engine.change_quantity(line_id, quantity)).await,
        Command::Inc { line_id } => settle(engine.increment(line_id)).await,
        Command::Dec { line_id } => settle(engine.decrement(line_id)).await,
        Command::Remove { line_id } => settle(engine.remove_item(line_id)).await,
        Command::Tap { line_id, times } => {
            let tickets: Vec<MutationTicket> = (0..times).map(|_| engine.increment(line_id)).collect();
            info!(times, pending = engine.pending_count(), "taps submitted");
            for ticket in tickets {
                settle(ticket).await?;
            }
            Ok(())
        }
        Command::Checkout => settle(engine.checkout()).await,
    }
}

fn print_snapshot(snapshot: &CartSnapshot, as_json: bool) -> Result<()> {
    if as_json {
        let doc = serde_json::json!({
            "version": snapshot.version(),
            "lines": snapshot.lines(),
            "subtotal": snapshot.subtotal(),
            "totalQuantity": snapshot.total_quantity(),
            "lastError": snapshot.last_error().map(|e| e.reason().code()),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    if snapshot.is_empty() {
        println!("cart is empty");
    }
    for line in snapshot.lines() {
        println!(
            "{:>6}  {:<24} {:>4} x {:>8} = {:>9}",
            line.line_id(),
            line.product_name(),
            line.quantity(),
            line.unit_price(),
            line.line_total()
        );
    }
    println!("subtotal: {}  items: {}", snapshot.subtotal(), snapshot.total_quantity());
    if let Some(error) = snapshot.last_error() {
        println!("last error [{}]: {}", error.reason(), error);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = CartConfig::load(cli.config_path.as_deref())?.merge(cli.overrides());
    config.validate()?;
    let _log_guard = setup_logging(&config.logging)?;

    let service: Arc<dyn CartService> = if cli.offline {
        info!("running against the in-memory demo cart");
        Arc::new(demo_service()?)
    } else {
        info!(base_url = %config.service.base_url, "running against the cart service");
        Arc::new(HttpCartService::new(&config.service)?)
    };
    let engine = CartEngine::new(service, Arc::new(ConsoleBadge), config.engine.clone());

    engine.load_cart().await.context("loading the cart")?;
    let outcome = run(&engine, cli.command.clone()).await;
    print_snapshot(&engine.snapshot(), cli.json)?;
    outcome
}
