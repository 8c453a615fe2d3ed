use std::time::Duration;

use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use postgres_native_tls::MakeTlsConnector;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use crate::config::{ConnectionOptions, PoolOptions, SslMode};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Build the client pool for one connection. No client is opened here; the
/// registry warms the pool once it is built.
pub fn create_pool(options: &ConnectionOptions) -> Result<Pool> {
    let mut pg_config = options.pg_config()?;
    if pg_config.get_connect_timeout().is_none() {
        pg_config.connect_timeout(CONNECT_TIMEOUT);
    }
    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Verified,
    };

    let manager = match options.ssl_mode {
        SslMode::Disable => Manager::from_config(pg_config, NoTls, manager_config),
        mode => {
            let tls = build_tls_connector(options, mode.verifies_certificates())?;
            Manager::from_config(pg_config, tls, manager_config)
        }
    };

    let pool_options = &options.pool;
    Pool::builder(manager)
        .max_size(pool_options.max.max(1))
        .wait_timeout(Some(pool_options.acquire_timeout()))
        .create_timeout(Some(CONNECT_TIMEOUT))
        .recycle_timeout(Some(pool_options.ping_timeout()))
        .runtime(Runtime::Tokio1)
        .build()
        .with_context(|| format!("Failed to build connection pool for '{}'", options.identity))
}

/// Open `min` clients up front so the first queries do not pay for the
/// handshake, and so bad credentials fail registration.
pub async fn warm(pool: &Pool, pool_options: &PoolOptions) -> Result<()> {
    let wanted = pool_options.min.clamp(1, pool_options.max.max(1));
    let mut clients = Vec::with_capacity(wanted);
    for _ in 0..wanted {
        let client = pool
            .get()
            .await
            .context("Failed to connect to PostgreSQL")?;
        clients.push(client);
    }
    debug!(clients = clients.len(), "connection pool warmed");
    Ok(())
}

/// Periodically evict pooled clients that have been idle longer than the
/// configured idle timeout. Stops by itself once the pool is closed.
pub fn spawn_idle_sweep(identity: &str, pool: Pool, pool_options: &PoolOptions) -> JoinHandle<()> {
    let idle_timeout = pool_options.idle_timeout();
    let every = pool_options.sync_interval();
    let identity = identity.to_string();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if pool.is_closed() {
                break;
            }
            let before = pool.status().size;
            pool.retain(|_, metrics| metrics.last_used() < idle_timeout);
            let after = pool.status().size;
            if after < before {
                debug!(identity = %identity, evicted = before - after, "evicted idle clients");
            }
        }
    })
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// # Arguments
/// * `options` - Connection options
/// * `strict_verify` - If true, always verify certificates (verify-ca/verify-full)
fn build_tls_connector(options: &ConnectionOptions, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if options.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else {
        if options.accept_invalid_certs {
            warn!(identity = %options.identity, "accept_invalid_certs ignored for verifying ssl mode");
        }
        if let Some(ca_path) = &options.ca_cert_path {
            let pem = std::fs::read_to_string(ca_path)
                .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
            add_ca_certificates(&mut builder, &pem)?;
        }
    }

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

fn add_ca_certificates(builder: &mut native_tls::TlsConnectorBuilder, pem: &str) -> Result<()> {
    let blocks = pem_blocks(pem);
    if blocks.is_empty() {
        anyhow::bail!("No valid certificates found in PEM data");
    }
    for block in blocks {
        let cert = native_tls::Certificate::from_pem(block.as_bytes())
            .context("Failed to parse certificate")?;
        builder.add_root_certificate(cert);
    }
    Ok(())
}

/// Split a PEM bundle into individual certificate blocks.
fn pem_blocks(pem: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in pem.lines() {
        let line = line.trim();
        if line.contains("-----BEGIN CERTIFICATE-----") {
            current = Some(format!("{}\n", line));
        } else if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
            if line.contains("-----END CERTIFICATE-----") {
                blocks.extend(current.take());
            }
        }
    }
    blocks
}
