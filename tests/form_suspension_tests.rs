mod common;

use anyhow::{bail, Result};
use chatflow::runtime::PendingForm;
use chatflow::{
    EventDisposition, EventOutcome, FlowStatus, InboundEvent, MessageSpec, SuspensionDisposition,
};
use common::{Harness, CONTACT};
use serde_json::{json, Map, Value};

fn inquiry_flows() -> Value {
    json!([
        {
            "name": "inquiry",
            "trigger_keywords": ["inquiry"],
            "steps": [
                {
                    "name": "trip_details",
                    "is_entry_point": true,
                    "type": "send_external_form",
                    "config": {
                        "form_id": "tour_form",
                        "header": "Plan your trip",
                        "body": "Tell us about your trip, {{ contact.name or 'traveller' }}.",
                        "cta": "Open",
                        "response_namespace": "trip",
                        "reminder_message_text": "Please finish the trip form first.",
                        "fields": ["adults", "destination"]
                    },
                    "transitions": [
                        {"to_step": "summary", "condition_config": {"type": "form_response_received"}}
                    ]
                },
                {
                    "name": "summary",
                    "type": "end_flow",
                    "config": {"message_config": {"message_type": "text", "body": "Got {{ adults }} adults for {{ trip.destination }}."}}
                }
            ]
        },
        {
            "name": "callback",
            "trigger_keywords": ["callback"],
            "steps": [
                {
                    "name": "contact_form",
                    "is_entry_point": true,
                    "type": "send_external_form",
                    "config": {"form_id": "callback_form", "body": "When should we call?"},
                    "transitions": [
                        {"to_step": "confirm_time", "condition_config": {"type": "form_response_received"}}
                    ]
                },
                {
                    "name": "confirm_time",
                    "type": "question",
                    "config": {
                        "message_config": {"message_type": "text", "body": "We'll call at {{ form_data.time }}. Reply yes to confirm."},
                        "reply_config": {"save_to_variable": "confirmed"}
                    },
                    "transitions": [{"to_step": "bye"}]
                },
                {"name": "bye", "type": "end_flow"}
            ]
        }
    ])
}

fn launched_token(outcome: &EventOutcome) -> Result<String> {
    match outcome.outbound.first().map(|intent| &intent.message) {
        Some(MessageSpec::LaunchForm {
            correlation_token, ..
        }) => Ok(correlation_token.clone()),
        other => bail!("expected a form launch, got {:?}", other),
    }
}

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn form_step_issues_token_and_waits() -> Result<()> {
    let harness = Harness::new(inquiry_flows())?;
    let outcome = harness
        .engine
        .handle_event(InboundEvent::text(CONTACT, "inquiry").with_contact_name("Chipo"))
        .await?;

    let token = launched_token(&outcome)?;
    assert_eq!(outcome.texts(), vec!["Tell us about your trip, Chipo."]);
    assert_eq!(outcome.status, Some(FlowStatus::AwaitingInput));

    let state = harness.engine.contact_state(CONTACT).await?.expect("state saved");
    let pending = PendingForm::from_context(&state.context).expect("pending form");
    assert_eq!(pending.token, token);
    assert_eq!(pending.step, "trip_details");
    assert_eq!(pending.form_id, "tour_form");
    Ok(())
}

#[tokio::test]
async fn text_while_waiting_gets_reminder_only() -> Result<()> {
    let harness = Harness::new(inquiry_flows())?;
    harness
        .engine
        .handle_event(InboundEvent::text(CONTACT, "inquiry"))
        .await?;
    let before = harness.engine.contact_state(CONTACT).await?;

    let outcome = harness
        .engine
        .handle_event(InboundEvent::text(CONTACT, "are you there?"))
        .await?;
    assert_eq!(outcome.disposition, EventDisposition::AwaitingForm);
    assert_eq!(outcome.texts(), vec!["Please finish the trip form first."]);
    assert_eq!(harness.engine.contact_state(CONTACT).await?, before);
    Ok(())
}

#[tokio::test]
async fn matching_completion_resumes_flow() -> Result<()> {
    let harness = Harness::new(inquiry_flows())?;
    let outcome = harness
        .engine
        .handle_event(InboundEvent::text(CONTACT, "inquiry"))
        .await?;
    let token = launched_token(&outcome)?;

    let outcome = harness
        .engine
        .complete_form(CONTACT, &token, fields(json!({"adults": 2, "destination": "Kariba"})))
        .await?;
    assert_eq!(outcome.disposition, EventDisposition::Processed);
    assert_eq!(outcome.texts(), vec!["Got 2 adults for Kariba."]);
    assert!(outcome.is_terminated());

    let records = harness.engine.suspension_records(CONTACT).await?;
    assert_eq!(records.len(), 1);
    assert!(records[0].applied);
    assert_eq!(records[0].disposition, SuspensionDisposition::Applied);
    assert_eq!(records[0].correlation_token, token);
    Ok(())
}

#[tokio::test]
async fn mismatched_and_late_completions_are_audited_no_ops() -> Result<()> {
    let harness = Harness::new(inquiry_flows())?;
    let outcome = harness
        .engine
        .handle_event(InboundEvent::text(CONTACT, "inquiry"))
        .await?;
    let token = launched_token(&outcome)?;

    let outcome = harness
        .engine
        .complete_form(CONTACT, "forged-token", fields(json!({"adults": 99})))
        .await?;
    assert_eq!(outcome.disposition, EventDisposition::Discarded);
    assert!(outcome.outbound.is_empty());
    assert_eq!(outcome.current_step.as_deref(), Some("trip_details"));
    assert!(harness.context_value("adults").await?.is_none());

    harness
        .engine
        .complete_form(CONTACT, &token, fields(json!({"adults": 3, "destination": "Hwange"})))
        .await?;

    // 流程已结束后的重复投递
    let outcome = harness
        .engine
        .complete_form(CONTACT, &token, fields(json!({"adults": 3, "destination": "Hwange"})))
        .await?;
    assert_eq!(outcome.disposition, EventDisposition::Discarded);
    assert!(harness.engine.contact_state(CONTACT).await?.is_none());

    let dispositions: Vec<_> = harness
        .engine
        .suspension_records(CONTACT)
        .await?
        .into_iter()
        .map(|record| (record.disposition, record.applied))
        .collect();
    assert_eq!(
        dispositions,
        vec![
            (SuspensionDisposition::TokenMismatch, false),
            (SuspensionDisposition::Applied, true),
            (SuspensionDisposition::NoActiveFlow, false),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn completion_after_flow_moved_on_is_step_mismatch() -> Result<()> {
    let harness = Harness::new(inquiry_flows())?;
    let outcome = harness
        .engine
        .handle_event(InboundEvent::text(CONTACT, "callback"))
        .await?;
    let token = launched_token(&outcome)?;

    let outcome = harness
        .engine
        .complete_form(CONTACT, &token, fields(json!({"time": "14:00"})))
        .await?;
    assert_eq!(outcome.texts(), vec!["We'll call at 14:00. Reply yes to confirm."]);
    assert_eq!(harness.context_value("form_data.time").await?, Some(json!("14:00")));

    let outcome = harness
        .engine
        .complete_form(CONTACT, &token, fields(json!({"time": "09:00"})))
        .await?;
    assert_eq!(outcome.disposition, EventDisposition::Discarded);
    assert_eq!(outcome.current_step.as_deref(), Some("confirm_time"));
    assert_eq!(harness.context_value("time").await?, Some(json!("14:00")));

    let last = harness
        .engine
        .suspension_records(CONTACT)
        .await?
        .pop()
        .expect("audit record");
    assert_eq!(last.disposition, SuspensionDisposition::StepMismatch);
    Ok(())
}

#[tokio::test]
async fn reissued_form_invalidates_previous_token() -> Result<()> {
    let harness = Harness::new(inquiry_flows())?;
    let first = launched_token(
        &harness
            .engine
            .handle_event(InboundEvent::text(CONTACT, "inquiry"))
            .await?,
    )?;

    // 触发词在表单步骤重新开始流程
    let second = launched_token(
        &harness
            .engine
            .handle_event(InboundEvent::text(CONTACT, "inquiry"))
            .await?,
    )?;
    assert_ne!(first, second);

    let outcome = harness
        .engine
        .complete_form(CONTACT, &first, fields(json!({"adults": 1})))
        .await?;
    assert_eq!(outcome.disposition, EventDisposition::Discarded);

    let outcome = harness
        .engine
        .complete_form(CONTACT, &second, fields(json!({"adults": 1, "destination": "Nyanga"})))
        .await?;
    assert_eq!(outcome.texts(), vec!["Got 1 adults for Nyanga."]);
    Ok(())
}
