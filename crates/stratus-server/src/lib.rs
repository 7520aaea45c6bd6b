//! Zone state engine and servers for stratus.
//!
//! The pieces fit together like this: the DNS listeners translate
//! northbound UPDATE/AXFR/NOTIFY into provider calls and store syncs; the
//! record store keeps the versioned mirror; the sync engine reconciles
//! provider listings with the mirror and manages serials; the refresher
//! drives periodic freshness checks; the admin API configures all of it.

pub mod dns;
pub mod hist;
pub mod metrics;
pub mod providers;
pub mod refresh;
pub mod store;
pub mod sync;
pub mod tls;
pub mod web;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tracing::{error, info};

use providers::Registry;
use store::Store;
use sync::ZoneLocks;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Serve configuration, filled in by the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the embedded database file.
    pub db_path: PathBuf,

    /// UDP addresses serving NOTIFY and authoritative SOA.
    pub dns_udp_addrs: Vec<String>,
    /// TCP addresses serving UPDATE, AXFR and authoritative SOA.
    pub dns_upxfr_tcp_addrs: Vec<String>,
    /// TCP addresses accepting NOTIFY.
    pub dns_notify_tcp_addrs: Vec<String>,
    /// TLS ("dot") addresses serving UPDATE, AXFR and authoritative SOA.
    pub dns_upxfr_tls_addrs: Vec<String>,
    /// TLS addresses accepting NOTIFY.
    pub dns_notify_tls_addrs: Vec<String>,

    /// Admin HTTP address (API + metrics); empty disables it.
    pub admin_addr: String,
    /// File holding the admin password; generated when missing.
    pub admin_password_path: PathBuf,

    /// PEM PKCS#8 private key for the TLS listeners; ephemeral when
    /// absent.
    pub tls_key_pem: Option<PathBuf>,
    /// PEM certificate chain; self-signed when absent.
    pub tls_cert_pem: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: PathBuf::from("stratus.db"),
            dns_udp_addrs: vec!["localhost:1053".to_string()],
            dns_upxfr_tcp_addrs: vec!["localhost:1053".to_string()],
            dns_notify_tcp_addrs: Vec::new(),
            dns_upxfr_tls_addrs: vec!["localhost:1853".to_string()],
            dns_notify_tls_addrs: Vec::new(),
            admin_addr: "localhost:8053".to_string(),
            admin_password_path: PathBuf::from("adminpassword"),
            tls_key_pem: None,
            tls_cert_pem: None,
        }
    }
}

/// Process-wide state, initialized at startup and shared by every
/// listener and background worker.
pub struct App {
    pub store: Store,
    pub registry: Registry,
    pub locks: ZoneLocks,
    /// Wakes the refresher to recompute its timers.
    pub refresh_kick: Notify,
    /// Closed on shutdown; every long-running loop watches it.
    pub shutdown: watch::Receiver<()>,
    /// First wait of the propagation back-off; lowered in tests.
    pub propagation_first_wait: Duration,
    pub version: &'static str,
    pub admin_password: String,
    /// Makes handlers run their background continuations inline. Test
    /// hook; never set in production.
    pub synchronous_background: bool,
}

impl App {
    pub fn new(
        store: Store,
        admin_password: String,
        shutdown: watch::Receiver<()>,
    ) -> Self {
        App {
            store,
            registry: Registry::builtin(),
            locks: ZoneLocks::default(),
            refresh_kick: Notify::new(),
            shutdown,
            propagation_first_wait: Duration::from_millis(100),
            version: VERSION,
            admin_password,
            synchronous_background: false,
        }
    }
}

/// Spawns a worker whose panics are caught, counted, and logged instead
/// of taking the process down.
pub fn spawn_guarded<F>(what: &'static str, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(payload) =
            std::panic::AssertUnwindSafe(fut).catch_unwind().await
        {
            metrics::PANICS.inc();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(action = what, err = %msg, "unhandled panic in worker");
        }
    });
}

fn generate_password() -> String {
    const CHARS: &[u8] =
        b"abcdefghijklmnopqrstuwvxyzABCDEFGHIJKLMNOPQRSTUWVXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

fn load_admin_password(path: &PathBuf) -> anyhow::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim_end_matches('\n').to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let password = generate_password();
            std::fs::write(path, format!("{password}\n"))
                .with_context(|| format!("writing {path:?}"))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(
                    path,
                    std::fs::Permissions::from_mode(0o600),
                )
                .with_context(|| format!("restricting {path:?}"))?;
            }
            info!(path = %path.display(), "generated new admin password");
            println!("generated admin password: {password}");
            Ok(password)
        }
        Err(e) => Err(e).with_context(|| format!("reading {path:?}")),
    }
}

/// Starts every listener and background worker, then waits for shutdown.
pub async fn run(config: Config, shutdown: watch::Receiver<()>) -> anyhow::Result<()> {
    let admin_password = load_admin_password(&config.admin_password_path)?;
    let store = Store::open(&config.db_path)
        .with_context(|| format!("opening database {:?}", config.db_path))?;
    let app = Arc::new(App::new(store, admin_password, shutdown.clone()));

    let server_tls = tls::server_tls(
        config.tls_key_pem.as_deref(),
        config.tls_cert_pem.as_deref(),
    )
    .context("preparing tls")?;

    info!(
        version = VERSION,
        udp = ?config.dns_udp_addrs,
        tcp_upxfr = ?config.dns_upxfr_tcp_addrs,
        tcp_notify = ?config.dns_notify_tcp_addrs,
        tls_upxfr = ?config.dns_upxfr_tls_addrs,
        tls_notify = ?config.dns_notify_tls_addrs,
        admin = %config.admin_addr,
        tls_pubkey_hash = %server_tls.spki_hash,
        "stratus starting"
    );

    // One listener per address; ops are merged when the same address is
    // named for several roles. Plain TCP and TLS cannot share an address.
    let mut stream_listeners: HashMap<String, (bool, dns::ListenerOps)> =
        HashMap::new();
    let mut add_addrs =
        |addrs: &[String], tls: bool, ops: dns::ListenerOps| -> anyhow::Result<()> {
            for addr in addrs {
                if addr.is_empty() {
                    continue;
                }
                let entry = stream_listeners
                    .entry(addr.clone())
                    .or_insert((tls, dns::ListenerOps::default()));
                if entry.0 != tls {
                    anyhow::bail!(
                        "cannot serve plain tcp and tls on the same address {addr}"
                    );
                }
                entry.1.notify |= ops.notify;
                entry.1.updates |= ops.updates;
                entry.1.xfr |= ops.xfr;
                entry.1.auth |= ops.auth;
            }
            Ok(())
        };
    add_addrs(
        &config.dns_upxfr_tcp_addrs,
        false,
        dns::ListenerOps {
            notify: false,
            updates: true,
            xfr: true,
            auth: true,
        },
    )?;
    add_addrs(
        &config.dns_notify_tcp_addrs,
        false,
        dns::ListenerOps {
            notify: true,
            ..Default::default()
        },
    )?;
    add_addrs(
        &config.dns_upxfr_tls_addrs,
        true,
        dns::ListenerOps {
            notify: false,
            updates: true,
            xfr: true,
            auth: true,
        },
    )?;
    add_addrs(
        &config.dns_notify_tls_addrs,
        true,
        dns::ListenerOps {
            notify: true,
            ..Default::default()
        },
    )?;

    for (addr, (is_tls, ops)) in stream_listeners {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("listening on tcp {addr}"))?;
        let app = app.clone();
        if is_tls {
            let acceptor =
                tokio_rustls::TlsAcceptor::from(server_tls.config.clone());
            spawn_guarded("dns tls listener", async move {
                dns::serve_tls(app, listener, acceptor, ops).await;
            });
        } else {
            spawn_guarded("dns tcp listener", async move {
                dns::serve_tcp(app, listener, ops).await;
            });
        }
    }

    // NOTIFY is commonly sent over UDP, and AXFR clients may check the
    // SOA over UDP before transferring.
    for addr in &config.dns_udp_addrs {
        if addr.is_empty() {
            continue;
        }
        let socket = tokio::net::UdpSocket::bind(addr)
            .await
            .with_context(|| format!("listening on udp {addr}"))?;
        let app = app.clone();
        let ops = dns::ListenerOps {
            notify: true,
            updates: false,
            xfr: false,
            auth: true,
        };
        spawn_guarded("dns udp listener", async move {
            dns::serve_udp(app, socket, ops).await;
        });
    }

    if !config.admin_addr.is_empty() {
        let listener = tokio::net::TcpListener::bind(&config.admin_addr)
            .await
            .with_context(|| format!("listening on {}", config.admin_addr))?;
        let app = app.clone();
        spawn_guarded("admin http server", async move {
            web::serve(app, listener).await;
        });
    }

    {
        let app = app.clone();
        spawn_guarded("zone refresher", async move {
            refresh::refresher(app).await;
        });
    }

    let mut shutdown = shutdown;
    let _ = shutdown.changed().await;
    info!("shutting down");
    // Give in-flight responses a moment to be written.
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}
