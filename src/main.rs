//! The stratus binary: serve the DNS control-plane bridge, or generate a
//! TLS key for it.

use std::io::stderr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::Engine;
use clap::{Args, Parser, Subcommand};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "stratus",
    version,
    about = "DNS control-plane bridge: UPDATE/AXFR/NOTIFY northbound, cloud DNS providers southbound"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the DNS and admin servers.
    Serve(ServeArgs),
    /// Generate an ed25519 private key (PKCS#8 PEM) on stdout.
    Genkey,
    /// Print the version.
    Version,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Path of the embedded database file.
    #[arg(long, default_value = "stratus.db")]
    db: PathBuf,

    /// UDP addresses serving dns notify and authoritative soa requests.
    #[arg(long = "dns-udp-addr", value_delimiter = ',', default_value = "localhost:1053")]
    dns_udp_addrs: Vec<String>,

    /// TCP addresses serving dns update and axfr requests.
    #[arg(long = "dns-upxfr-tcp-addr", value_delimiter = ',', default_value = "localhost:1053")]
    dns_upxfr_tcp_addrs: Vec<String>,

    /// TCP addresses accepting dns notify messages.
    #[arg(long = "dns-notify-tcp-addr", value_delimiter = ',')]
    dns_notify_tcp_addrs: Vec<String>,

    /// TLS addresses serving dns update and axfr requests.
    #[arg(long = "dns-upxfr-tls-addr", value_delimiter = ',', default_value = "localhost:1853")]
    dns_upxfr_tls_addrs: Vec<String>,

    /// TLS addresses accepting dns notify messages.
    #[arg(long = "dns-notify-tls-addr", value_delimiter = ',')]
    dns_notify_tls_addrs: Vec<String>,

    /// Admin interface address (API and metrics); empty to disable.
    #[arg(long = "admin-addr", default_value = "localhost:8053")]
    admin_addr: String,

    /// File with the admin password for http basic auth; a random
    /// password is generated and written when the file is absent.
    #[arg(long = "admin-password-path", default_value = "adminpassword")]
    admin_password_path: PathBuf,

    /// PEM file with a PKCS#8 private key for the dns tls server; an
    /// ephemeral key is generated when absent.
    #[arg(long = "tls-key-pem")]
    tls_key_pem: Option<PathBuf>,

    /// PEM file with one or more certificates; a minimal self-signed
    /// certificate is generated for the private key when absent.
    #[arg(long = "tls-cert-pem")]
    tls_cert_pem: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("{}", stratus_server::VERSION);
            Ok(())
        }
        Commands::Genkey => genkey(),
        Commands::Serve(args) => {
            init_logging(&cli.log_level);
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(serve(args))
        }
    }
}

fn init_logging(level: &str) {
    let directives = format!(
        "stratus={level},stratus_server={level},stratus_dns={level},tower=warn,hyper=warn,rustls=warn,reqwest=warn"
    );
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives));
    registry()
        .with(filter)
        .with(fmt::layer().with_writer(stderr))
        .init();
}

/// Generate an ed25519 key; the PEM goes to stdout, the public key hash
/// (what a tlspubkey credential stores) to stderr.
fn genkey() -> Result<()> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .context("generating ed25519 key")?;
    print!("{}", key_pair.serialize_pem());
    let hash = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(Sha256::digest(key_pair.public_key_der()));
    eprintln!("tls public key hash: {hash}");
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    info!(err = %e, "installing sigterm handler");
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let config = stratus_server::Config {
        db_path: args.db,
        dns_udp_addrs: args.dns_udp_addrs,
        dns_upxfr_tcp_addrs: args.dns_upxfr_tcp_addrs,
        dns_notify_tcp_addrs: args.dns_notify_tcp_addrs,
        dns_upxfr_tls_addrs: args.dns_upxfr_tls_addrs,
        dns_notify_tls_addrs: args.dns_notify_tls_addrs,
        admin_addr: args.admin_addr,
        admin_password_path: args.admin_password_path,
        tls_key_pem: args.tls_key_pem,
        tls_cert_pem: args.tls_cert_pem,
    };
    stratus_server::run(config, shutdown_rx).await
}
