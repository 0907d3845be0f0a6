mod app;
mod cli;
mod config;
mod keys;

use app::PeerNetApp;
use clap::Parser;
use cli::{Cli, Commands};
use config::AppConfig;
use peernet_crypto::KeyPair;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            init_tracing("info", "text");
            error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    init_tracing(&config.logging.level, &config.logging.format);
    info!("Configuration loaded successfully");

    match cli.command {
        Some(Commands::Run) | None => run_node(config).await?,
        Some(Commands::Info) => show_info(config).await?,
        Some(Commands::Keygen { show_secrets }) => keygen(show_secrets),
    }

    Ok(())
}

async fn run_node(config: AppConfig) -> anyhow::Result<()> {
    info!("Starting PeerNet node on {}", config.node.listen_addr);

    let app = PeerNetApp::new(config).await?;
    app.run().await?;

    Ok(())
}

async fn show_info(config: AppConfig) -> anyhow::Result<()> {
    let app = PeerNetApp::new(config.clone()).await?;
    let public_key = app.public_key();

    println!("\nNode Information");
    println!("─────────────────────────────────────");
    println!("  Listen:          {}", config.node.listen_addr);
    println!("  Data dir:        {}", config.node.data_dir);
    println!("  Key tag:         {}", config.node.key_id_tag);
    println!("  Key id:          {}", app.key_id());
    println!("  Signing key:     {}", hex::encode(public_key.signing_key));
    println!("  Encryption key:  {}", hex::encode(public_key.encryption_key));
    println!(
        "  Transports:      {:?}",
        app.node().registry().supported()
    );

    println!("\nNetwork");
    println!("─────────────────────────────────────");
    println!("  Connect timeout: {} ms", config.network.connect_timeout_ms);
    println!("  Load interval:   {} s", config.load.interval_secs);
    println!("  Exchange every:  {} s (timeout {} s)", config.load_exchange.interval_secs, config.load_exchange.timeout_secs);
    println!("  Bootstrap peers:");
    for peer in &config.network.bootstrap_peers {
        println!("    - {}", peer);
    }

    Ok(())
}

fn keygen(show_secrets: bool) {
    let key_pair = KeyPair::generate();
    let public_key = key_pair.public_key();

    println!("\nKey Bundle");
    println!("─────────────────────────────────────");
    println!("  Generated:       {}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Key id:          {}", key_pair.key_id());
    println!("  Signing key:     {}", hex::encode(public_key.signing_key));
    println!("  Encryption key:  {}", hex::encode(public_key.encryption_key));
    if show_secrets {
        println!("  Signing secret:  {}", hex::encode(key_pair.signing_secret()));
        println!("  Encrypt secret:  {}", hex::encode(key_pair.encryption_secret()));
    }
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
