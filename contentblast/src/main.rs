/*
contentblast - single-binary main.rs
This binary loads configuration, wires the completion API and payment provider clients,
and starts the Rocket HTTP server.
*/

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use common::{init_db_pool, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use contentblast::entitlement::{EntitlementGate, EntitlementLedger};
use contentblast::llm::remote::RemoteLlmProvider;
use contentblast::llm::LlmProvider;
use contentblast::payments::stripe::StripeClient;
use contentblast::payments::PaymentProvider;
use contentblast::repurpose::Repurposer;
use contentblast::server::{launch_rocket, AppState};

#[derive(Parser, Debug)]
#[command(name = "contentblast", about = "ContentBlast repurposing gateway")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the HTTP port from the configuration
    #[arg(long)]
    port: Option<u16>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // OPENAI_API_KEY, OPENAI_API_BASE, STRIPE_SECRET_KEY may live in .env
    if let Ok(path) = dotenv::dotenv() {
        info!(path = ?path, "loaded environment file");
    }

    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    let mut config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load configuration: {:#}", e);
            return Err(e);
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let pool = init_db_pool(&config.database.path).await?;
    let ledger = EntitlementLedger::new(pool);
    ledger.ensure_schema().await?;
    info!(db_path = %config.database.path, "entitlement ledger ready");

    let repurposer = match create_llm_provider(&config) {
        Ok(provider) => {
            info!(model = %provider.model(), endpoint = %provider.endpoint(), "completion provider initialized");
            let provider: Arc<dyn LlmProvider> = Arc::new(provider);
            Some(Arc::new(Repurposer::from_config(provider, &config.llm, &config.limits)))
        }
        Err(e) => {
            warn!("completion provider unavailable, /api/repurpose will answer 503: {:#}", e);
            None
        }
    };

    let payments: Option<Arc<dyn PaymentProvider>> = match config.payments.secret_key() {
        Some(key) => {
            let client = StripeClient::new(&config.payments.api_url, key)
                .with_defaults(&config.payments.currency, config.payments.timeout_seconds);
            info!(api = %config.payments.api_url, "payment provider initialized");
            Some(Arc::new(client) as Arc<dyn PaymentProvider>)
        }
        None => {
            info!("{} not set, payments disabled", config.payments.secret_key_env);
            None
        }
    };

    // fail_open only covers an unreachable provider, not a missing one.
    if config.payments.required && payments.is_none() {
        warn!("payments.required is set without a payment provider; only ledger tokens will be accepted");
    }

    let gate = EntitlementGate::new(ledger, payments, config.plans.clone())
        .with_policy(config.payments.required, config.payments.fail_open);

    let state = AppState {
        started_at: Utc::now(),
        config: Arc::new(config),
        repurposer,
        gate: Arc::new(gate),
    };

    launch_rocket(state).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Build the completion provider from configuration and environment.
fn create_llm_provider(config: &Config) -> Result<RemoteLlmProvider> {
    let llm = &config.llm;
    let api_key = llm
        .api_key()
        .with_context(|| format!("LLM API key env var '{}' not set", llm.api_key_env))?;
    let api_url = llm.resolve_api_url();
    url::Url::parse(&api_url).with_context(|| format!("invalid completion API URL: {}", api_url))?;

    Ok(RemoteLlmProvider::new(api_url, api_key, llm.model.clone())
        .with_defaults(llm.timeout_seconds, llm.max_tokens, llm.temperature))
}
