use anyhow::{Context, Result};
use std::time::Duration;

use super::{plan_description, CheckoutRequest, CheckoutSession, PaymentProvider};

/// Stripe REST client (form-encoded requests, bearer secret key)
pub struct StripeClient {
    api_url: String,
    secret_key: String,
    currency: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl StripeClient {
    pub fn new(api_url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            currency: "usd".to_string(),
            timeout: Duration::from_secs(15),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_defaults(mut self, currency: impl Into<String>, timeout_secs: u64) -> Self {
        self.currency = currency.into();
        self.timeout = Duration::from_secs(timeout_secs);
        self
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<CheckoutSession> {
        let response = tokio::time::timeout(self.timeout, request.bearer_auth(&self.secret_key).send())
            .await
            .with_context(|| format!("Stripe {} timed out", what))?
            .with_context(|| format!("Stripe {} request failed", what))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Stripe API error {}: {}", status, body);
        }

        response
            .json::<CheckoutSession>()
            .await
            .with_context(|| format!("Failed to parse Stripe {} response", what))
    }
}

/// Form fields for a subscription-mode checkout with inline monthly price data.
fn checkout_form(checkout: &CheckoutRequest<'_>, currency: &str) -> Vec<(String, String)> {
    let plan = checkout.plan;
    let mut form: Vec<(String, String)> = vec![
        ("payment_method_types[0]".into(), "card".into()),
        ("mode".into(), "subscription".into()),
        ("line_items[0][price_data][currency]".into(), currency.to_string()),
        (
            "line_items[0][price_data][product_data][name]".into(),
            format!("ContentBlast {}", plan.name),
        ),
        (
            "line_items[0][price_data][product_data][description]".into(),
            plan_description(plan),
        ),
        ("line_items[0][price_data][unit_amount]".into(), plan.price_cents.to_string()),
        ("line_items[0][price_data][recurring][interval]".into(), "month".into()),
        ("line_items[0][quantity]".into(), "1".into()),
        (
            "success_url".into(),
            format!("{}?session_id={{CHECKOUT_SESSION_ID}}", checkout.success_url),
        ),
        ("cancel_url".into(), checkout.cancel_url.clone()),
        ("metadata[plan_id]".into(), plan.id.clone()),
        ("metadata[repurposes]".into(), plan.repurposes.to_string()),
    ];
    if let Some(email) = checkout.customer_email {
        form.push(("customer_email".into(), email.to_string()));
    }
    form
}

#[async_trait::async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_session(&self, checkout: CheckoutRequest<'_>) -> Result<CheckoutSession> {
        let form = checkout_form(&checkout, &self.currency);
        let url = format!("{}/v1/checkout/sessions", self.api_url);
        tracing::debug!(plan = %checkout.plan.id, "creating Stripe checkout session");
        self.send(self.client.post(url).form(&form), "checkout").await
    }

    async fn retrieve_checkout_session(&self, session_id: &str) -> Result<CheckoutSession> {
        // Ids are opaque provider strings; refuse anything that could alter the path.
        if session_id.is_empty() || !session_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            anyhow::bail!("malformed checkout session id");
        }
        let url = format!("{}/v1/checkout/sessions/{}", self.api_url, session_id);
        self.send(self.client.get(url), "session lookup").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PlanConfig;

    #[test]
    fn checkout_form_carries_plan_and_metadata() {
        let plan = PlanConfig {
            id: "pro".into(),
            name: "Pro".into(),
            price_cents: 4900,
            repurposes: 200,
            features: vec![],
        };
        let form = checkout_form(
            &CheckoutRequest {
                plan: &plan,
                success_url: "http://localhost:8000/success".into(),
                cancel_url: "http://localhost:8000/pricing".into(),
                customer_email: Some("a@example.com"),
            },
            "usd",
        );
        let get = |k: &str| form.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("mode"), Some("subscription"));
        assert_eq!(get("line_items[0][price_data][unit_amount]"), Some("4900"));
        assert_eq!(
            get("line_items[0][price_data][product_data][description]"),
            Some("200 repurposes per month")
        );
        assert_eq!(
            get("success_url"),
            Some("http://localhost:8000/success?session_id={CHECKOUT_SESSION_ID}")
        );
        assert_eq!(get("metadata[plan_id]"), Some("pro"));
        assert_eq!(get("customer_email"), Some("a@example.com"));
    }
}
