use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rocket::data::{Limits, ToByteUnit};
use rocket::figment::Figment;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::{get, post, routes, Build, Rocket, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::{Config, PlanConfig};

use crate::entitlement::{EntitlementGate, EntitlementStatus};
use crate::error::GatewayError;
use crate::formats::{parse_formats, Format};
use crate::payments::webhook::{self, WebhookOutcome};
use crate::payments::{CheckoutRequest, CheckoutSession};
use crate::repurpose::{CostEstimate, Repurposer};

/// Application state stored inside Rocket managed state.
#[derive(Clone)]
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub config: Arc<Config>,
    /// `None` when no completion API key is configured
    pub repurposer: Option<Arc<Repurposer>>,
    pub gate: Arc<EntitlementGate>,
}

impl AppState {
    fn repurposer(&self) -> Result<&Repurposer, GatewayError> {
        self.repurposer
            .as_deref()
            .ok_or(GatewayError::NotConfigured("completion API key (OPENAI_API_KEY) is not set"))
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

/// Response structure for `/api/status`.
#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: i64,
    model: Option<String>,
    payments_enabled: bool,
    payments_required: bool,
}

/// Request body for `/api/repurpose` and `/api/estimate`.
#[derive(Deserialize)]
struct RepurposeBody {
    article: String,
    #[serde(default)]
    formats: Vec<String>,
    content_type: Option<String>,
    /// Checkout session id returned by `/api/checkout`
    entitlement_token: Option<String>,
}

#[derive(Serialize)]
struct RepurposeResponse {
    id: Uuid,
    formats: BTreeMap<Format, String>,
    hashtags: Vec<String>,
    tokens_used: usize,
    model: String,
    cost_estimate: CostEstimate,
}

#[derive(Deserialize)]
struct CheckoutBody {
    plan_id: String,
    email: Option<String>,
}

#[derive(Serialize)]
struct CheckoutResponse {
    session_id: String,
    checkout_url: Option<String>,
}

#[derive(Deserialize)]
struct EntitlementBody {
    token: String,
}

/// Raw `Stripe-Signature` header, if the request carried one.
pub struct StripeSignature(Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for StripeSignature {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(StripeSignature(
            req.headers().get_one("Stripe-Signature").map(str::to_string),
        ))
    }
}

#[get("/api/health")]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "ContentBlast",
    })
}

/// Status endpoint returning uptime and which dependencies are configured.
#[get("/api/status")]
async fn status(state: &State<AppState>) -> Json<StatusResponse> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(StatusResponse {
        status: "ok",
        uptime_seconds: uptime,
        model: state.repurposer.as_ref().map(|r| r.model().to_string()),
        payments_enabled: state.gate.provider().is_some(),
        payments_required: state.gate.required(),
    })
}

#[get("/api/formats")]
async fn list_formats() -> Json<Vec<&'static str>> {
    Json(Format::ALL.iter().map(|f| f.as_str()).collect())
}

/// Repurpose an article into the requested formats.
///
/// When payments are required the body must carry an `entitlement_token`; one unit of its
/// quota is held for the duration of the call and returned if the call fails.
#[post("/api/repurpose", data = "<body>")]
async fn repurpose(
    state: &State<AppState>,
    body: Json<RepurposeBody>,
) -> Result<Json<RepurposeResponse>, GatewayError> {
    let repurposer = state.repurposer()?;
    let formats = parse_formats(&body.formats).map_err(|e| GatewayError::Validation(e.to_string()))?;
    repurposer.validate(&body.article, &formats)?;

    let token = body.entitlement_token.as_deref();
    let reserved = if state.gate.required() {
        state.gate.acquire(token).await?
    } else {
        false
    };

    let content_type = body.content_type.as_deref().unwrap_or("article");
    let result = repurposer.repurpose(&body.article, &formats, content_type).await;

    let result = match result {
        Ok(r) => r,
        Err(e) => {
            if reserved {
                if let Some(token) = token {
                    state.gate.release(token).await;
                }
            }
            return Err(e);
        }
    };

    Ok(Json(RepurposeResponse {
        id: result.id,
        formats: result.formats,
        hashtags: result.hashtags,
        tokens_used: result.tokens_used,
        model: result.model,
        cost_estimate: repurposer.estimate_cost(&body.article),
    }))
}

#[post("/api/estimate", data = "<body>")]
async fn estimate(
    state: &State<AppState>,
    body: Json<RepurposeBody>,
) -> Result<Json<CostEstimate>, GatewayError> {
    let repurposer = state.repurposer()?;
    let formats = parse_formats(&body.formats).map_err(|e| GatewayError::Validation(e.to_string()))?;
    if !formats.is_empty() {
        repurposer.validate(&body.article, &formats)?;
    }
    Ok(Json(repurposer.estimate_cost(&body.article)))
}

#[get("/api/plans")]
async fn list_plans(state: &State<AppState>) -> Json<Vec<PlanConfig>> {
    Json(state.gate.plans().to_vec())
}

/// Start a hosted checkout for a plan.
#[post("/api/checkout", data = "<body>")]
async fn checkout(
    state: &State<AppState>,
    body: Json<CheckoutBody>,
) -> Result<Json<CheckoutResponse>, GatewayError> {
    let provider = state
        .gate
        .provider()
        .ok_or(GatewayError::NotConfigured("payment provider key (STRIPE_SECRET_KEY) is not set"))?;
    let plan = state
        .gate
        .plan(&body.plan_id)
        .ok_or_else(|| GatewayError::Validation(format!("invalid plan '{}'", body.plan_id)))?;

    let base_url = state.config.server.public_url.trim_end_matches('/');
    let email = body.email.as_deref().map(str::trim).filter(|e| !e.is_empty());

    let session: CheckoutSession = provider
        .create_checkout_session(CheckoutRequest {
            plan,
            success_url: format!("{}/success", base_url),
            cancel_url: format!("{}/pricing", base_url),
            customer_email: email,
        })
        .await
        .map_err(GatewayError::upstream)?;

    tracing::info!(plan = %plan.id, session = %session.id, "checkout session created");

    Ok(Json(CheckoutResponse {
        session_id: session.id,
        checkout_url: session.url,
    }))
}

#[post("/api/entitlement", data = "<body>")]
async fn check_entitlement(
    state: &State<AppState>,
    body: Json<EntitlementBody>,
) -> Result<Json<EntitlementStatus>, GatewayError> {
    state.gate.check_entitlement(&body.token).await.map(Json)
}

/// Payment provider webhook: verify the signature over the raw body, then apply the event.
#[post("/api/webhook", data = "<payload>")]
async fn stripe_webhook(
    state: &State<AppState>,
    signature: StripeSignature,
    payload: String,
) -> Result<Json<WebhookOutcome>, GatewayError> {
    let secret = state
        .config
        .payments
        .webhook_secret()
        .ok_or(GatewayError::NotConfigured("webhook secret (STRIPE_WEBHOOK_SECRET) is not set"))?;
    let header = signature
        .0
        .ok_or_else(|| GatewayError::InvalidSignature("missing Stripe-Signature header".to_string()))?;

    webhook::verify_signature(
        &payload,
        &header,
        &secret,
        state.config.payments.webhook_tolerance_seconds,
        Utc::now().timestamp(),
    )?;

    let event = webhook::parse_event(&payload)?;
    state.gate.handle_webhook_event(event).await.map(Json)
}

/// Assemble the Rocket instance with managed state and all routes mounted.
pub fn build_rocket(state: AppState, figment: Figment) -> Rocket<Build> {
    rocket::custom(figment).manage(state).mount(
        "/",
        routes![
            health,
            status,
            list_formats,
            repurpose,
            estimate,
            list_plans,
            checkout,
            check_entitlement,
            stripe_webhook,
        ],
    )
}

/// Launch the HTTP server and block until it shuts down.
pub async fn launch_rocket(state: AppState) -> Result<()> {
    // Provider webhook payloads routinely exceed the default 8 KiB string limit.
    let limits = Limits::default()
        .limit("string", 1.mebibytes())
        .limit("json", 1.mebibytes());
    let fig = rocket::Config::figment()
        .merge(("address", state.config.server.bind.clone()))
        .merge(("port", state.config.server.port))
        .merge(("limits", limits));

    tracing::info!(
        bind = %state.config.server.bind,
        port = state.config.server.port,
        "Starting Rocket HTTP server"
    );
    build_rocket(state, fig)
        .launch()
        .await
        .map_err(|e| anyhow!("Rocket failed: {}", e))?;

    tracing::info!("Rocket HTTP server has shut down");
    Ok(())
}
