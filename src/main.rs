//! siphon — intercepting HTTP/HTTPS forward proxy with request/response
//! capture and replay.
//!
//! Architecture:
//! 1. A CA mints short-lived leaf certificates for each `CONNECT`'d host
//! 2. The proxy listener bridges client and upstream TLS sessions,
//!    capturing raw bytes on both legs
//! 3. Every exchange is persisted to Postgres
//! 4. The replay listener exposes a small JSON API to list and resend
//!    captured requests

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use siphon::ca::CertificateAuthority;
use siphon::config::Config;
use siphon::db::{self, CaptureStore};
use siphon::proxy::ProxyServer;
use siphon::replay::ReplayServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// siphon — intercepting HTTP/HTTPS proxy with capture and replay
#[derive(Parser)]
#[command(name = "siphon")]
#[command(about = "Intercepting HTTP/HTTPS proxy with request/response capture and replay")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "./siphon.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy and replay listeners
    Serve,

    /// Generate a new CA certificate and key, overwriting any existing
    /// pair at the configured paths
    GenerateCa {
        /// Output directory for ca-cert.pem / ca-key.pem
        #[arg(short, long, default_value = "./certs")]
        output: PathBuf,
    },

    /// Print the effective configuration and exit
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();
    let mut config = Config::load_from(&cli.config).context("loading config")?;
    config.expand_paths();
    config.validate().context("validating config")?;
    config.ensure_directories().context("preparing directories")?;

    siphon::logging::init(&config.logger).context("initializing logging")?;
    siphon::config::log_summary(&config);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::GenerateCa { output } => generate_ca(&config, &output),
        Commands::ShowConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let ca = Arc::new(CertificateAuthority::load_or_create(
        &config.proxy.ca_crt,
        &config.proxy.ca_key,
        &config.proxy.common_name,
    )?);

    let pool = db::connect(&config.db).await?;
    let store = CaptureStore::new(pool);

    let proxy = Arc::new(ProxyServer::new(config.proxy.clone(), ca, store.clone()));
    let replay = Arc::new(ReplayServer::new(config.repeater.clone(), store));

    info!("siphon starting");

    let proxy_handle = tokio::spawn(async move { proxy.run().await });
    let replay_handle = tokio::spawn(async move { replay.run().await });

    tokio::select! {
        res = proxy_handle => res??,
        res = replay_handle => res??,
    }

    Ok(())
}

fn generate_ca(config: &Config, output: &PathBuf) -> Result<()> {
    let cert_path = output.join("ca-cert.pem");
    let key_path = output.join("ca-key.pem");
    std::fs::create_dir_all(output)?;

    let ca = CertificateAuthority::load_or_create(&cert_path, &key_path, &config.proxy.common_name)?;

    println!("CA certificate written to {:?}", cert_path);
    println!("Trust it system-wide, or point clients at it, to intercept their TLS traffic.");
    println!("\n{}", ca.root_cert_pem());
    Ok(())
}
