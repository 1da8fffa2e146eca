//! Entitlement ledger (SQLite) and the payment gate in front of the repurpose endpoint.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use common::PlanConfig;

use crate::error::GatewayError;
use crate::payments::webhook::{WebhookEvent, WebhookOutcome};
use crate::payments::{CheckoutSession, PaymentProvider};

/// A paid token and its quota
#[derive(Debug, Clone, Serialize)]
pub struct Entitlement {
    pub token: String,
    pub plan_id: String,
    pub customer_email: Option<String>,
    pub subscription_id: Option<String>,
    /// -1 for unlimited
    pub repurposes_limit: i64,
    pub repurposes_used: i64,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl Entitlement {
    pub fn is_unlimited(&self) -> bool {
        self.repurposes_limit < 0
    }

    /// Remaining uses, `None` when unlimited.
    pub fn remaining(&self) -> Option<i64> {
        if self.is_unlimited() {
            None
        } else {
            Some((self.repurposes_limit - self.repurposes_used).max(0))
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.revoked && self.remaining().map_or(true, |r| r > 0)
    }
}

/// Persistent record of granted entitlements
#[derive(Clone)]
pub struct EntitlementLedger {
    pool: SqlitePool,
}

impl EntitlementLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the ledger table if missing. Idempotent.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entitlements (
                token TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                customer_email TEXT,
                subscription_id TEXT,
                repurposes_limit INTEGER NOT NULL,
                repurposes_used INTEGER NOT NULL DEFAULT 0,
                revoked BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create entitlements table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entitlements_subscription ON entitlements(subscription_id)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create entitlements index")?;

        Ok(())
    }

    /// Record a paid token. Granting the same token twice keeps the first record.
    pub async fn grant(
        &self,
        token: &str,
        plan: &PlanConfig,
        customer_email: Option<&str>,
        subscription_id: Option<&str>,
    ) -> Result<Entitlement> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO entitlements
                (token, plan_id, customer_email, subscription_id, repurposes_limit, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(token)
        .bind(&plan.id)
        .bind(customer_email)
        .bind(subscription_id)
        .bind(plan.repurposes)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert entitlement")?;

        self.lookup(token)
            .await?
            .context("Entitlement missing right after insert")
    }

    pub async fn lookup(&self, token: &str) -> Result<Option<Entitlement>> {
        let row = sqlx::query_as::<_, EntitlementRow>(
            r#"
            SELECT token, plan_id, customer_email, subscription_id,
                   repurposes_limit, repurposes_used, revoked, created_at
            FROM entitlements
            WHERE token = ?
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch entitlement")?;

        row.map(Entitlement::try_from).transpose()
    }

    /// Atomically take one unit of quota. Returns the updated entitlement, or `None` when
    /// the token is unknown, revoked or exhausted.
    pub async fn reserve(&self, token: &str) -> Result<Option<Entitlement>> {
        let result = sqlx::query(
            r#"
            UPDATE entitlements
            SET repurposes_used = repurposes_used + 1
            WHERE token = ?
              AND revoked = FALSE
              AND (repurposes_limit < 0 OR repurposes_used < repurposes_limit)
            "#,
        )
        .bind(token)
        .execute(&self.pool)
        .await
        .context("Failed to reserve entitlement use")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.lookup(token).await
    }

    /// Give back a unit taken by `reserve` when the work it paid for failed.
    pub async fn refund(&self, token: &str) -> Result<()> {
        sqlx::query(
            "UPDATE entitlements SET repurposes_used = repurposes_used - 1 WHERE token = ? AND repurposes_used > 0",
        )
        .bind(token)
        .execute(&self.pool)
        .await
        .context("Failed to refund entitlement use")?;
        Ok(())
    }

    /// Revoke every token bought through `subscription_id`. Returns how many were revoked.
    pub async fn revoke_subscription(&self, subscription_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE entitlements SET revoked = TRUE WHERE subscription_id = ? AND revoked = FALSE",
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await
        .context("Failed to revoke entitlements")?;
        Ok(result.rows_affected())
    }
}

// Internal row type for SQLx mapping
#[derive(sqlx::FromRow)]
struct EntitlementRow {
    token: String,
    plan_id: String,
    customer_email: Option<String>,
    subscription_id: Option<String>,
    repurposes_limit: i64,
    repurposes_used: i64,
    revoked: bool,
    created_at: String,
}

impl TryFrom<EntitlementRow> for Entitlement {
    type Error = anyhow::Error;

    fn try_from(row: EntitlementRow) -> Result<Self> {
        Ok(Entitlement {
            token: row.token,
            plan_id: row.plan_id,
            customer_email: row.customer_email,
            subscription_id: row.subscription_id,
            repurposes_limit: row.repurposes_limit,
            repurposes_used: row.repurposes_used,
            revoked: row.revoked,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .context("Failed to parse created_at")?
                .with_timezone(&Utc),
        })
    }
}

/// Outcome of an entitlement check
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementStatus {
    pub entitled: bool,
    pub plan_id: Option<String>,
    /// `None` when unlimited or unknown
    pub remaining: Option<i64>,
}

impl EntitlementStatus {
    fn denied() -> Self {
        Self {
            entitled: false,
            plan_id: None,
            remaining: None,
        }
    }

    fn from_entitlement(e: &Entitlement) -> Self {
        Self {
            entitled: e.is_usable(),
            plan_id: Some(e.plan_id.clone()),
            remaining: e.remaining(),
        }
    }
}

/// Decides whether a request may proceed, backed by the ledger and the payment provider.
pub struct EntitlementGate {
    ledger: EntitlementLedger,
    provider: Option<Arc<dyn PaymentProvider>>,
    plans: Vec<PlanConfig>,
    required: bool,
    fail_open: bool,
}

impl EntitlementGate {
    pub fn new(
        ledger: EntitlementLedger,
        provider: Option<Arc<dyn PaymentProvider>>,
        plans: Vec<PlanConfig>,
    ) -> Self {
        Self {
            ledger,
            provider,
            plans,
            required: false,
            fail_open: false,
        }
    }

    pub fn with_policy(mut self, required: bool, fail_open: bool) -> Self {
        self.required = required;
        self.fail_open = fail_open;
        self
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn provider(&self) -> Option<&Arc<dyn PaymentProvider>> {
        self.provider.as_ref()
    }

    pub fn plans(&self) -> &[PlanConfig] {
        &self.plans
    }

    pub fn plan(&self, id: &str) -> Option<&PlanConfig> {
        self.plans.iter().find(|p| p.id == id)
    }

    pub fn ledger(&self) -> &EntitlementLedger {
        &self.ledger
    }

    /// Whether `token` currently grants access.
    ///
    /// Unknown tokens are verified with the payment provider and recorded when paid. When
    /// the provider cannot be reached the configured `fail_open` policy decides.
    pub async fn check_entitlement(&self, token: &str) -> Result<EntitlementStatus, GatewayError> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(EntitlementStatus::denied());
        }

        if let Some(existing) = self.ledger.lookup(token).await.map_err(GatewayError::internal)? {
            return Ok(EntitlementStatus::from_entitlement(&existing));
        }

        let Some(provider) = &self.provider else {
            return Ok(EntitlementStatus::denied());
        };

        match provider.retrieve_checkout_session(token).await {
            Ok(session) => {
                if !session.is_paid() {
                    info!(status = ?session.status, payment = ?session.payment_status, "checkout session not paid");
                    return Ok(EntitlementStatus::denied());
                }
                let entitlement = self.grant_from_session(&session).await?;
                Ok(EntitlementStatus::from_entitlement(&entitlement))
            }
            Err(e) if self.fail_open => {
                warn!("entitlement verification failed, allowing (fail_open): {:#}", e);
                Ok(EntitlementStatus {
                    entitled: true,
                    plan_id: None,
                    remaining: None,
                })
            }
            Err(e) => {
                warn!("entitlement verification failed, denying: {:#}", e);
                Ok(EntitlementStatus::denied())
            }
        }
    }

    /// Take one use from `token` for a gated request.
    ///
    /// Returns `Ok(true)` when a ledger unit was taken (the caller must `release` it on
    /// failure), `Ok(false)` when access was granted without a ledger record (fail-open).
    pub async fn acquire(&self, token: Option<&str>) -> Result<bool, GatewayError> {
        let token = token.map(str::trim).unwrap_or_default();
        let status = self.check_entitlement(token).await?;
        if !status.entitled {
            return Err(GatewayError::PaymentRequired(if token.is_empty() {
                "an entitlement token is required".to_string()
            } else {
                "entitlement is not valid or its quota is used up".to_string()
            }));
        }

        match self.ledger.reserve(token).await.map_err(GatewayError::internal)? {
            Some(e) => {
                info!(plan = %e.plan_id, remaining = ?e.remaining(), "entitlement use reserved");
                Ok(true)
            }
            // Entitled without a ledger row only happens on fail-open.
            None if status.plan_id.is_none() => Ok(false),
            None => Err(GatewayError::PaymentRequired(
                "entitlement quota is used up".to_string(),
            )),
        }
    }

    pub async fn release(&self, token: &str) {
        if let Err(e) = self.ledger.refund(token.trim()).await {
            warn!("failed to refund entitlement use: {:#}", e);
        }
    }

    async fn grant_from_session(&self, session: &CheckoutSession) -> Result<Entitlement, GatewayError> {
        let plan_id = session.plan_id().ok_or_else(|| {
            GatewayError::Upstream("checkout session has no plan_id metadata".to_string())
        })?;
        let plan = self.plan(plan_id).ok_or_else(|| {
            GatewayError::Upstream(format!("checkout session references unknown plan '{}'", plan_id))
        })?;

        let entitlement = self
            .ledger
            .grant(
                &session.id,
                plan,
                session.customer_email.as_deref(),
                session.subscription.as_deref(),
            )
            .await
            .map_err(GatewayError::internal)?;
        info!(plan = %plan.id, "entitlement granted");
        Ok(entitlement)
    }

    /// Apply a verified webhook event to the ledger.
    pub async fn handle_webhook_event(&self, event: WebhookEvent) -> Result<WebhookOutcome, GatewayError> {
        match event.event_type.as_str() {
            "checkout.session.completed" => {
                let session: CheckoutSession = serde_json::from_value(event.data.object)
                    .map_err(|e| GatewayError::Validation(format!("invalid checkout session object: {}", e)))?;
                // Sessions from other checkouts (payment links, dashboard) carry no known plan.
                if session.plan_id().and_then(|id| self.plan(id)).is_none() {
                    warn!(
                        event = %event.id,
                        session = %session.id,
                        plan = ?session.plan_id(),
                        "completed checkout has no known plan, nothing granted"
                    );
                    return Ok(WebhookOutcome::Ignored {
                        event_type: "checkout.session.completed".to_string(),
                    });
                }
                self.grant_from_session(&session).await?;
                Ok(WebhookOutcome::SubscriptionCreated {
                    customer_email: session.customer_email.clone(),
                    plan_id: session.plan_id().map(str::to_string),
                })
            }
            "customer.subscription.deleted" => {
                let subscription_id = event
                    .data
                    .object
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| GatewayError::Validation("subscription object has no id".to_string()))?;
                let revoked = self
                    .ledger
                    .revoke_subscription(subscription_id)
                    .await
                    .map_err(GatewayError::internal)?;
                info!(subscription = %subscription_id, revoked, "subscription cancelled");
                Ok(WebhookOutcome::SubscriptionCancelled { revoked })
            }
            other => {
                info!(event = %event.id, kind = %other, "webhook event acknowledged");
                Ok(WebhookOutcome::Ignored {
                    event_type: other.to_string(),
                })
            }
        }
    }
}
