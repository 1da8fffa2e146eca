/*!
common/src/lib.rs

Shared configuration types and DB helper functions for ContentBlast.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default and an override TOML file
- Environment lookups for the completion API and the payment provider secrets
- A helper to initialize the SQLite pool backing the entitlement ledger
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_LLM_API_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_LLM_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_PAYMENTS_API_URL: &str = "https://api.stripe.com";

/// HTTP server section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Externally reachable base URL, used to build checkout success/cancel links
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
            public_url: "http://localhost:8000".to_string(),
        }
    }
}

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/contentblast.db"), or ":memory:"
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/contentblast.db".to_string(),
        }
    }
}

/// Completion API (OpenAI-compatible) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL written in the config file; the `api_url_env` variable wins when set
    pub api_url: Option<String>,
    pub api_url_env: String,
    pub api_key_env: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_tokens: usize,
    pub temperature: f32,
    pub cost_per_1k_tokens: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_url_env: "OPENAI_API_BASE".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            timeout_seconds: 30,
            max_tokens: 2000,
            temperature: 0.7,
            cost_per_1k_tokens: 0.0,
        }
    }
}

impl LlmConfig {
    /// Resolve the completion API base URL: environment, then file, then the built-in default.
    pub fn resolve_api_url(&self) -> String {
        non_empty_env(&self.api_url_env)
            .or_else(|| self.api_url.clone())
            .unwrap_or_else(|| DEFAULT_LLM_API_URL.to_string())
    }

    /// API key from the configured environment variable, if present.
    pub fn api_key(&self) -> Option<String> {
        non_empty_env(&self.api_key_env)
    }
}

/// Payment provider (Stripe) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentsConfig {
    pub api_url: String,
    pub secret_key_env: String,
    pub webhook_secret_env: String,
    /// Reject repurpose requests that carry no valid entitlement
    pub required: bool,
    /// Treat the request as entitled when the provider cannot be reached
    pub fail_open: bool,
    pub currency: String,
    pub timeout_seconds: u64,
    pub webhook_tolerance_seconds: i64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_PAYMENTS_API_URL.to_string(),
            secret_key_env: "STRIPE_SECRET_KEY".to_string(),
            webhook_secret_env: "STRIPE_WEBHOOK_SECRET".to_string(),
            required: false,
            fail_open: false,
            currency: "usd".to_string(),
            timeout_seconds: 15,
            webhook_tolerance_seconds: 300,
        }
    }
}

impl PaymentsConfig {
    pub fn secret_key(&self) -> Option<String> {
        non_empty_env(&self.secret_key_env)
    }

    pub fn webhook_secret(&self) -> Option<String> {
        non_empty_env(&self.webhook_secret_env)
    }
}

/// Input size limits for articles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub min_article_chars: usize,
    pub max_article_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_article_chars: 1,
            max_article_chars: 10_000,
        }
    }
}

/// A purchasable subscription plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub id: String,
    pub name: String,
    /// Monthly price in the smallest currency unit (cents)
    pub price_cents: i64,
    /// Repurposes per month, -1 for unlimited
    pub repurposes: i64,
    #[serde(default)]
    pub features: Vec<String>,
}

impl PlanConfig {
    pub fn is_unlimited(&self) -> bool {
        self.repurposes < 0
    }
}

fn default_plans() -> Vec<PlanConfig> {
    fn plan(id: &str, name: &str, price_cents: i64, repurposes: i64, features: &[&str]) -> PlanConfig {
        PlanConfig {
            id: id.to_string(),
            name: name.to_string(),
            price_cents,
            repurposes,
            features: features.iter().map(|f| f.to_string()).collect(),
        }
    }

    vec![
        plan(
            "starter",
            "Starter",
            1900,
            50,
            &["50 repurposes/month", "All platforms", "Email support"],
        ),
        plan(
            "pro",
            "Pro",
            4900,
            200,
            &["200 repurposes/month", "All platforms", "Priority support", "API access"],
        ),
        plan(
            "unlimited",
            "Unlimited",
            9900,
            -1,
            &["Unlimited repurposes", "All platforms", "24/7 support", "Custom integrations"],
        ),
    ]
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default = "default_plans")]
    pub plans: Vec<PlanConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            llm: LlmConfig::default(),
            payments: PaymentsConfig::default(),
            limits: LimitsConfig::default(),
            plans: default_plans(),
        }
    }
}

impl Config {
    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would only fail later, at request time.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.server.public_url)
            .with_context(|| format!("server.public_url is not a valid URL: {}", self.server.public_url))?;
        url::Url::parse(&self.payments.api_url)
            .with_context(|| format!("payments.api_url is not a valid URL: {}", self.payments.api_url))?;
        if let Some(api_url) = &self.llm.api_url {
            url::Url::parse(api_url).with_context(|| format!("llm.api_url is not a valid URL: {}", api_url))?;
        }
        if self.limits.min_article_chars > self.limits.max_article_chars {
            anyhow::bail!(
                "limits.min_article_chars ({}) exceeds limits.max_article_chars ({})",
                self.limits.min_article_chars,
                self.limits.max_article_chars
            );
        }
        let mut seen = std::collections::HashSet::new();
        for plan in &self.plans {
            if !seen.insert(plan.id.as_str()) {
                anyhow::bail!("duplicate plan id in configuration: {}", plan.id);
            }
        }
        Ok(())
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary. The special path `":memory:"` yields a
/// single-connection in-memory database, which is what tests and throwaway runs use.
///
/// Example:
///   let pool = init_db_pool("data/contentblast.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if path == ":memory:" {
        return SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory sqlite database");
    }

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}
