//! CHANPYON: prediction slip settlement engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the slip store and serves the HTTP API until Ctrl-C.

use anyhow::Result;
use chrono::Duration;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{info, warn};

use chanpyon::api::{self, ApiState};
use chanpyon::catalogue::MatchCatalogue;
use chanpyon::config::{self, GatewayConfig};
use chanpyon::gateway::ezipay::EziPayTokenSource;
use chanpyon::gateway::CredentialCache;
use chanpyon::settlement::Coordinator;
use chanpyon::storage::sqlite::SqliteStore;

const BANNER: &str = r#"
  ____ _   _    _    _   _ ______   _____  _   _
 / ___| | | |  / \  | \ | |  _ \ \ / / _ \| \ | |
| |   | |_| | / _ \ |  \| | |_) \ V / | | |  \| |
| |___|  _  |/ ___ \| |\  |  __/ | || |_| | |\  |
 \____|_| |_/_/   \_\_| \_|_|    |_| \___/|_| \_|

  Prediction slip settlement engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = config::AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    // Print startup banner
    println!("{BANNER}");
    info!(
        host = %cfg.server.host,
        port = cfg.server.port,
        database_url = %cfg.storage.database_url,
        matches_path = %cfg.catalogue.matches_path,
        "CHANPYON starting up"
    );

    // -- Initialise components -------------------------------------------

    let store = SqliteStore::connect(&cfg.storage.database_url, cfg.storage.max_connections).await?;
    let coordinator = Coordinator::new(Arc::new(store));
    let catalogue = MatchCatalogue::new(&cfg.catalogue.matches_path);
    let gateway = build_gateway(&cfg.gateway)?;

    let state = Arc::new(ApiState {
        coordinator,
        catalogue,
        gateway,
    });

    // -- Serve -----------------------------------------------------------

    api::serve(state, &cfg.server.host, cfg.server.port, shutdown_signal()).await?;

    info!("CHANPYON shut down cleanly");
    Ok(())
}

/// Build the gateway credential cache when enabled and credentials are
/// present. Missing credentials disable the gateway rather than abort.
fn build_gateway(cfg: &GatewayConfig) -> Result<Option<CredentialCache>> {
    if !cfg.enabled {
        info!("Payment gateway disabled");
        return Ok(None);
    }

    let (client_id, client_secret) = match (
        config::AppConfig::resolve_env(&cfg.client_id_env),
        config::AppConfig::resolve_env(&cfg.client_secret_env),
    ) {
        (Ok(id), Ok(secret)) => (id, SecretString::new(secret)),
        (id, secret) => {
            if let Err(e) = id.and(secret) {
                warn!(error = %e, "Payment gateway credentials missing, gateway disabled");
            }
            return Ok(None);
        }
    };

    let source = EziPayTokenSource::new(&cfg.base_url, client_id, client_secret)?;
    info!(base_url = %cfg.base_url, "Payment gateway configured");

    Ok(Some(CredentialCache::new(
        Box::new(source),
        Duration::seconds(cfg.token_ttl_secs),
        Duration::seconds(cfg.refresh_margin_secs),
    )))
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }
}

/// Initialise the tracing subscriber.
///
/// Uses `RUST_LOG` env var for filtering (default: `chanpyon=info`).
/// Set `CHANPYON_LOG_JSON=1` for JSON-formatted output.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chanpyon=info"));

    let json_logging = std::env::var("CHANPYON_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
