use std::sync::Arc;

use anyhow::{bail, Result};
use chatflow::{
    load_flows_from_dir, ActionRegistry, ExternalCallRequest, FlowEngine, InMemoryBusinessStore,
    InboundEvent, MemoryContactStore, MessageSpec, SandboxPaymentGateway,
};
use serde_json::{json, Map, Value};

const CONTACT: &str = "263772000111";

struct Bundle {
    engine: FlowEngine,
    records: Arc<InMemoryBusinessStore>,
    gateway: Arc<SandboxPaymentGateway>,
}

fn bundle() -> Result<Bundle> {
    let records = Arc::new(InMemoryBusinessStore::new());
    records.seed(
        "booking",
        vec![json!({
            "id": 7,
            "booking_reference": "BK-T001-20251225",
            "tour_name": "Victoria Falls Explorer",
            "total_amount": "500.00",
            "amount_paid": 150
        })],
    );
    let gateway = Arc::new(SandboxPaymentGateway::new("4321"));
    let actions = ActionRegistry::with_builtins(records.clone(), gateway.clone());
    let flows = load_flows_from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/flows"))?;
    let engine = FlowEngine::new(flows, actions, Arc::new(MemoryContactStore::new()))?;
    Ok(Bundle {
        engine,
        records,
        gateway,
    })
}

#[tokio::test]
async fn menu_to_payment_with_otp() -> Result<()> {
    let bundle = bundle()?;
    let engine = &bundle.engine;

    let outcome = engine
        .handle_event(InboundEvent::text(CONTACT, "Hi").with_contact_name("Farai"))
        .await?;
    match outcome.outbound.first().map(|intent| &intent.message) {
        Some(MessageSpec::List { body, sections, .. }) => {
            assert_eq!(body, "Hi Farai! How can we help you today?");
            assert_eq!(sections[0].rows.len(), 3);
        }
        other => bail!("expected the menu list, got {:?}", other),
    }

    let outcome = engine
        .handle_event(InboundEvent::reply(CONTACT, "make_payment"))
        .await?;
    assert_eq!(outcome.flow_name.as_deref(), Some("booking_payment"));
    assert_eq!(outcome.current_step.as_deref(), Some("ask_booking_reference"));

    let outcome = engine
        .handle_event(InboundEvent::text(CONTACT, "bk-t001-20251225"))
        .await?;
    assert_eq!(
        outcome.texts(),
        vec!["Booking BK-T001-20251225 (Victoria Falls Explorer).\nBalance due: $350.00\n\nHow much would you like to pay?"]
    );

    let outcome = engine
        .handle_event(InboundEvent::text(CONTACT, "100.5"))
        .await?;
    assert_eq!(outcome.current_step.as_deref(), Some("ask_phone_number"));

    let outcome = engine
        .handle_event(InboundEvent::text(CONTACT, "263771234567"))
        .await?;
    assert_eq!(outcome.current_step.as_deref(), Some("ask_otp"));
    assert_eq!(bundle.gateway.initiations(), 1);

    let outcome = engine
        .handle_event(InboundEvent::text(CONTACT, "9999"))
        .await?;
    assert_eq!(
        outcome.texts(),
        vec![
            "The OTP you entered is incorrect or has expired. You have 2 attempt(s) left.",
            "An OTP has been sent to 263771234567. Enter it to complete the payment, or type *cancel* to abort."
        ]
    );

    let outcome = engine
        .handle_event(InboundEvent::text(CONTACT, "4321"))
        .await?;
    assert_eq!(
        outcome.texts(),
        vec!["Payment received! Reference: PAY-OTP-0001-2. Thank you."]
    );
    assert!(outcome.is_terminated());
    match outcome.external_calls.as_slice() {
        [ExternalCallRequest::GroupNotification {
            group_names,
            template_name,
            template_context,
            ..
        }] => {
            assert_eq!(group_names, &vec!["finance".to_string()]);
            assert_eq!(template_name, "payment_received");
            assert_eq!(template_context["booking_reference"], json!("bk-t001-20251225"));
        }
        other => bail!("unexpected external calls {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn unknown_booking_reference_ends_politely() -> Result<()> {
    let bundle = bundle()?;
    bundle
        .engine
        .handle_event(InboundEvent::text(CONTACT, "pay"))
        .await?;

    let outcome = bundle
        .engine
        .handle_event(InboundEvent::text(CONTACT, "BK-NOPE"))
        .await?;
    assert_eq!(
        outcome.texts(),
        vec!["Sorry, I couldn't find a booking with reference BK-NOPE. Type *menu* to start again."]
    );
    assert!(outcome.is_terminated());
    Ok(())
}

#[tokio::test]
async fn cancelling_at_otp_prompt() -> Result<()> {
    let bundle = bundle()?;
    for text in ["pay", "BK-T001-20251225", "20", "263771234567"] {
        bundle
            .engine
            .handle_event(InboundEvent::text(CONTACT, text))
            .await?;
    }

    let outcome = bundle
        .engine
        .handle_event(InboundEvent::text(CONTACT, "Cancel"))
        .await?;
    assert_eq!(
        outcome.texts(),
        vec!["Your payment has been cancelled. No money was taken."]
    );
    assert_eq!(bundle.gateway.confirmations(), 0);
    Ok(())
}

fn form_token(outcome: &chatflow::EventOutcome) -> Result<String> {
    match outcome.outbound.first().map(|intent| &intent.message) {
        Some(MessageSpec::LaunchForm {
            correlation_token, ..
        }) => Ok(correlation_token.clone()),
        other => bail!("expected a form launch, got {:?}", other),
    }
}

#[tokio::test]
async fn tour_inquiry_records_form_answers() -> Result<()> {
    let bundle = bundle()?;
    bundle
        .engine
        .handle_event(InboundEvent::text(CONTACT, "menu"))
        .await?;
    let outcome = bundle
        .engine
        .handle_event(InboundEvent::reply(CONTACT, "tour_inquiry"))
        .await?;
    let token = form_token(&outcome)?;
    assert_eq!(outcome.flow_name.as_deref(), Some("tour_inquiry"));

    let outcome = bundle
        .engine
        .handle_event(InboundEvent::text(CONTACT, "hello?"))
        .await?;
    assert_eq!(
        outcome.texts(),
        vec!["Please complete the trip form above, or type *menu* to start over."]
    );

    let fields: Map<String, Value> = json!({
        "destinations": "Hwange",
        "travel_date": "2026-12-20",
        "adults": "12",
        "children": 0
    })
    .as_object()
    .cloned()
    .unwrap_or_default();
    let outcome = bundle.engine.complete_form(CONTACT, &token, fields).await?;

    let saved = bundle.records.all("tour_inquiry");
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0]["adults"], json!(12));
    assert_eq!(saved[0]["destinations"], json!("Hwange"));
    let id = saved[0]["id"].to_string();

    assert_eq!(
        outcome.texts(),
        vec![
            "Great, a group of 12! A group specialist will prepare a tailored quote.".to_string(),
            format!("Thanks! Your inquiry #{} for Hwange on 2026-12-20 has been received.", id),
        ]
    );
    assert!(outcome.is_terminated());
    assert_eq!(outcome.external_calls.len(), 1);
    Ok(())
}
