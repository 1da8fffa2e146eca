use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use common::PlanConfig;

pub mod stripe;
pub mod webhook;

/// Billing provider operations the gateway relies on
#[async_trait::async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Start a hosted checkout for a monthly subscription to `plan`.
    async fn create_checkout_session(&self, checkout: CheckoutRequest<'_>) -> Result<CheckoutSession>;

    /// Fetch a checkout session by id (the entitlement token).
    async fn retrieve_checkout_session(&self, session_id: &str) -> Result<CheckoutSession>;
}

/// Inputs for a new checkout session
#[derive(Debug, Clone)]
pub struct CheckoutRequest<'a> {
    pub plan: &'a PlanConfig,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<&'a str>,
}

/// Checkout session as reported by the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default, deserialize_with = "id_or_object")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    /// Completed and settled (or free) sessions entitle their holder.
    pub fn is_paid(&self) -> bool {
        self.status.as_deref() == Some("complete")
            && matches!(
                self.payment_status.as_deref(),
                Some("paid") | Some("no_payment_required")
            )
    }

    pub fn plan_id(&self) -> Option<&str> {
        self.metadata.get("plan_id").map(String::as_str)
    }
}

/// Expandable references arrive either as an id string or as the expanded object.
fn id_or_object<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(id)) => Some(id),
        Some(serde_json::Value::Object(obj)) => obj
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    })
}

/// Human-readable line shown on the checkout page.
pub fn plan_description(plan: &PlanConfig) -> String {
    if plan.is_unlimited() {
        "Unlimited repurposes".to_string()
    } else {
        format!("{} repurposes per month", plan.repurposes)
    }
}
