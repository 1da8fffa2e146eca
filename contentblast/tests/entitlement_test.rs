use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{init_db_pool, Config, PlanConfig};
use contentblast::entitlement::{EntitlementGate, EntitlementLedger};
use contentblast::error::GatewayError;
use contentblast::payments::stripe::StripeClient;
use contentblast::payments::webhook::{parse_event, WebhookOutcome};
use contentblast::payments::{CheckoutRequest, CheckoutSession, PaymentProvider};
use mockito::Matcher;

async fn setup_ledger() -> EntitlementLedger {
    let pool = init_db_pool(":memory:").await.expect("Failed to create test pool");
    let ledger = EntitlementLedger::new(pool);
    ledger.ensure_schema().await.expect("schema");
    ledger
}

fn plans() -> Vec<PlanConfig> {
    Config::default().plans
}

fn plan(id: &str) -> PlanConfig {
    plans().into_iter().find(|p| p.id == id).expect("plan exists")
}

fn paid_session(id: &str, plan_id: &str) -> CheckoutSession {
    CheckoutSession {
        id: id.to_string(),
        status: Some("complete".to_string()),
        payment_status: Some("paid".to_string()),
        customer_email: Some("buyer@example.com".to_string()),
        subscription: Some(format!("sub_{}", id)),
        metadata: HashMap::from([("plan_id".to_string(), plan_id.to_string())]),
        ..Default::default()
    }
}

/// In-process payment provider with a fixed set of sessions.
struct FakeProvider {
    sessions: HashMap<String, CheckoutSession>,
    unreachable: bool,
    lookups: AtomicUsize,
}

impl FakeProvider {
    fn with_sessions(sessions: Vec<CheckoutSession>) -> Arc<Self> {
        Arc::new(Self {
            sessions: sessions.into_iter().map(|s| (s.id.clone(), s)).collect(),
            unreachable: false,
            lookups: AtomicUsize::new(0),
        })
    }

    fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            sessions: HashMap::new(),
            unreachable: true,
            lookups: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_checkout_session(&self, checkout: CheckoutRequest<'_>) -> anyhow::Result<CheckoutSession> {
        Ok(CheckoutSession {
            id: format!("cs_new_{}", checkout.plan.id),
            url: Some("https://checkout.example/pay".to_string()),
            ..Default::default()
        })
    }

    async fn retrieve_checkout_session(&self, session_id: &str) -> anyhow::Result<CheckoutSession> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            anyhow::bail!("Stripe session lookup request failed: connection refused");
        }
        self.sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Stripe API error 404 Not Found"))
    }
}

#[tokio::test]
async fn ledger_grant_is_idempotent_and_quota_is_enforced() {
    let ledger = setup_ledger().await;
    let mut tiny = plan("starter");
    tiny.repurposes = 2;

    let first = ledger
        .grant("cs_1", &tiny, Some("a@example.com"), Some("sub_1"))
        .await
        .expect("grant");
    assert_eq!(first.remaining(), Some(2));

    // Second grant for the same token keeps the original record
    let again = ledger.grant("cs_1", &plan("pro"), None, None).await.expect("grant again");
    assert_eq!(again.plan_id, "starter");
    assert_eq!(again.customer_email.as_deref(), Some("a@example.com"));

    assert_eq!(ledger.reserve("cs_1").await.unwrap().unwrap().remaining(), Some(1));
    assert_eq!(ledger.reserve("cs_1").await.unwrap().unwrap().remaining(), Some(0));
    assert!(ledger.reserve("cs_1").await.unwrap().is_none());

    ledger.refund("cs_1").await.expect("refund");
    let after = ledger.lookup("cs_1").await.unwrap().unwrap();
    assert_eq!(after.repurposes_used, 1);
    assert!(after.is_usable());

    assert!(ledger.reserve("cs_unknown").await.unwrap().is_none());
}

#[tokio::test]
async fn ledger_unlimited_and_revocation() {
    let ledger = setup_ledger().await;
    ledger
        .grant("cs_u", &plan("unlimited"), None, Some("sub_u"))
        .await
        .expect("grant");

    for _ in 0..5 {
        let e = ledger.reserve("cs_u").await.unwrap().expect("unlimited reserve");
        assert_eq!(e.remaining(), None);
    }

    assert_eq!(ledger.revoke_subscription("sub_u").await.unwrap(), 1);
    assert_eq!(ledger.revoke_subscription("sub_u").await.unwrap(), 0);
    assert!(ledger.reserve("cs_u").await.unwrap().is_none());
    assert!(!ledger.lookup("cs_u").await.unwrap().unwrap().is_usable());
}

#[tokio::test]
async fn gate_verifies_unknown_token_with_provider_once() {
    let provider = FakeProvider::with_sessions(vec![paid_session("cs_paid", "pro")]);
    let gate = EntitlementGate::new(setup_ledger().await, Some(provider.clone() as Arc<dyn PaymentProvider>), plans())
        .with_policy(true, false);

    let status = gate.check_entitlement("cs_paid").await.expect("check");
    assert!(status.entitled);
    assert_eq!(status.plan_id.as_deref(), Some("pro"));
    assert_eq!(status.remaining, Some(200));

    // Second check is answered by the ledger
    gate.check_entitlement("cs_paid").await.expect("check");
    assert_eq!(provider.lookups.load(Ordering::SeqCst), 1);

    assert!(gate.acquire(Some("cs_paid")).await.expect("acquire"));
    let status = gate.check_entitlement("cs_paid").await.expect("check");
    assert_eq!(status.remaining, Some(199));
}

#[tokio::test]
async fn gate_denies_empty_unknown_and_unpaid_tokens() {
    let mut unpaid = paid_session("cs_open", "pro");
    unpaid.status = Some("open".to_string());
    unpaid.payment_status = Some("unpaid".to_string());
    let provider = FakeProvider::with_sessions(vec![unpaid]);
    let gate = EntitlementGate::new(setup_ledger().await, Some(provider as Arc<dyn PaymentProvider>), plans()).with_policy(true, false);

    assert!(!gate.check_entitlement("").await.unwrap().entitled);
    assert!(!gate.check_entitlement("cs_open").await.unwrap().entitled);
    assert!(!gate.check_entitlement("cs_missing").await.unwrap().entitled);

    let err = gate.acquire(None).await.unwrap_err();
    assert!(matches!(err, GatewayError::PaymentRequired(_)));
    let err = gate.acquire(Some("cs_open")).await.unwrap_err();
    assert!(matches!(err, GatewayError::PaymentRequired(_)));
}

#[tokio::test]
async fn gate_fail_open_and_fail_closed() {
    let closed = EntitlementGate::new(setup_ledger().await, Some(FakeProvider::unreachable() as Arc<dyn PaymentProvider>), plans())
        .with_policy(true, false);
    assert!(!closed.check_entitlement("cs_any").await.unwrap().entitled);
    assert!(matches!(
        closed.acquire(Some("cs_any")).await,
        Err(GatewayError::PaymentRequired(_))
    ));

    let open = EntitlementGate::new(setup_ledger().await, Some(FakeProvider::unreachable() as Arc<dyn PaymentProvider>), plans())
        .with_policy(true, true);
    assert!(open.check_entitlement("cs_any").await.unwrap().entitled);
    // Allowed without a ledger record, so nothing to release later
    assert!(!open.acquire(Some("cs_any")).await.expect("fail-open acquire"));
}

#[tokio::test]
async fn gate_without_provider_only_trusts_ledger() {
    let ledger = setup_ledger().await;
    ledger.grant("cs_known", &plan("starter"), None, None).await.unwrap();
    let gate = EntitlementGate::new(ledger, None, plans()).with_policy(true, false);

    assert!(gate.check_entitlement("cs_known").await.unwrap().entitled);
    assert!(!gate.check_entitlement("cs_other").await.unwrap().entitled);

    // fail_open does not admit unknown tokens when there is no provider to ask
    let ledger = setup_ledger().await;
    let gate = EntitlementGate::new(ledger, None, plans()).with_policy(true, true);
    assert!(!gate.check_entitlement("cs_other").await.unwrap().entitled);
    assert!(matches!(
        gate.acquire(Some("cs_other")).await,
        Err(GatewayError::PaymentRequired(_))
    ));
}

#[tokio::test]
async fn webhook_events_grant_and_revoke() {
    let gate = EntitlementGate::new(setup_ledger().await, None, plans());

    let completed = parse_event(
        r#"{
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_hook",
                "object": "checkout.session",
                "status": "complete",
                "payment_status": "paid",
                "customer_email": "hook@example.com",
                "subscription": "sub_hook",
                "metadata": {"plan_id": "starter", "repurposes": "50"}
            }}
        }"#,
    )
    .unwrap();
    let outcome = gate.handle_webhook_event(completed).await.expect("handle");
    assert_eq!(
        outcome,
        WebhookOutcome::SubscriptionCreated {
            customer_email: Some("hook@example.com".to_string()),
            plan_id: Some("starter".to_string()),
        }
    );
    assert!(gate.check_entitlement("cs_hook").await.unwrap().entitled);

    let deleted = parse_event(
        r#"{"id": "evt_2", "type": "customer.subscription.deleted", "data": {"object": {"id": "sub_hook"}}}"#,
    )
    .unwrap();
    let outcome = gate.handle_webhook_event(deleted).await.expect("handle");
    assert_eq!(outcome, WebhookOutcome::SubscriptionCancelled { revoked: 1 });
    assert!(!gate.check_entitlement("cs_hook").await.unwrap().entitled);

    let other = parse_event(r#"{"id": "evt_3", "type": "invoice.paid", "data": {"object": {}}}"#).unwrap();
    let outcome = gate.handle_webhook_event(other).await.expect("handle");
    assert_eq!(
        outcome,
        WebhookOutcome::Ignored {
            event_type: "invoice.paid".to_string()
        }
    );
}

#[tokio::test]
async fn completed_checkout_without_known_plan_is_acknowledged() {
    let gate = EntitlementGate::new(setup_ledger().await, None, plans());

    let unknown_plan = parse_event(
        r#"{"id": "evt_4", "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_x", "metadata": {"plan_id": "platinum"}}}}"#,
    )
    .unwrap();
    let outcome = gate.handle_webhook_event(unknown_plan).await.expect("acknowledged");
    assert_eq!(
        outcome,
        WebhookOutcome::Ignored {
            event_type: "checkout.session.completed".to_string()
        }
    );
    assert!(gate.ledger().lookup("cs_x").await.unwrap().is_none());

    // Payment links carry no metadata at all
    let payment_link = parse_event(
        r#"{"id": "evt_5", "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_link", "status": "complete", "payment_status": "paid"}}}"#,
    )
    .unwrap();
    let outcome = gate.handle_webhook_event(payment_link).await.expect("acknowledged");
    assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
    assert!(gate.ledger().lookup("cs_link").await.unwrap().is_none());
}

#[tokio::test]
async fn stripe_client_creates_and_retrieves_sessions() {
    let mut server = mockito::Server::new_async().await;

    let create = server
        .mock("POST", "/v1/checkout/sessions")
        .match_header("authorization", "Bearer sk_test_123")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("mode".into(), "subscription".into()),
            Matcher::UrlEncoded("metadata[plan_id]".into(), "pro".into()),
            Matcher::UrlEncoded("line_items[0][price_data][unit_amount]".into(), "4900".into()),
            Matcher::UrlEncoded("customer_email".into(), "buyer@example.com".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "cs_test_abc", "object": "checkout.session", "url": "https://checkout.stripe.com/c/pay/cs_test_abc", "status": "open", "payment_status": "unpaid"}"#)
        .create_async()
        .await;

    let retrieve = server
        .mock("GET", "/v1/checkout/sessions/cs_test_abc")
        .match_header("authorization", "Bearer sk_test_123")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "cs_test_abc", "status": "complete", "payment_status": "paid", "subscription": "sub_1", "metadata": {"plan_id": "pro", "repurposes": "200"}}"#)
        .create_async()
        .await;

    let client = StripeClient::new(server.url(), "sk_test_123");
    let pro = plan("pro");

    let created = client
        .create_checkout_session(CheckoutRequest {
            plan: &pro,
            success_url: "http://localhost:8000/success".to_string(),
            cancel_url: "http://localhost:8000/pricing".to_string(),
            customer_email: Some("buyer@example.com"),
        })
        .await
        .expect("create session");
    assert_eq!(created.id, "cs_test_abc");
    assert!(created.url.is_some());
    assert!(!created.is_paid());

    let fetched = client.retrieve_checkout_session("cs_test_abc").await.expect("retrieve");
    assert!(fetched.is_paid());
    assert_eq!(fetched.plan_id(), Some("pro"));
    assert_eq!(fetched.subscription.as_deref(), Some("sub_1"));

    create.assert_async().await;
    retrieve.assert_async().await;
}

#[tokio::test]
async fn stripe_client_surfaces_api_errors() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/v1/checkout/sessions/cs_gone")
        .with_status(404)
        .with_body(r#"{"error": {"message": "No such checkout.session"}}"#)
        .create_async()
        .await;

    let client = StripeClient::new(server.url(), "sk_test_123");
    let err = client.retrieve_checkout_session("cs_gone").await.unwrap_err();
    assert!(err.to_string().contains("404"));

    // Path-altering ids never reach the network
    assert!(client.retrieve_checkout_session("../v1/charges").await.is_err());
}
