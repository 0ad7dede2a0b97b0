mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chatflow::actions::{ActionCall, ActionHandler};
use chatflow::{
    build_registry, load_flows_from_value, ActionRegistry, ActionResult, ChatFlowError,
    ContactFlowState, ContactStateStore, EngineSettings, EventDisposition, FlowEngine,
    FlowStatus, InboundEvent, MemoryContactStore,
};
use common::{Harness, CONTACT};
use serde_json::{json, Value};

/// 读取计数、等待片刻后写回；并发执行时会丢失更新
struct SlowCounter;

#[async_trait]
impl ActionHandler for SlowCounter {
    fn name(&self) -> &'static str {
        "slow_increment"
    }

    async fn execute(&self, call: ActionCall<'_>) -> chatflow::Result<ActionResult> {
        let current = call
            .context
            .get("visits")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(ActionResult::new().set("visits", json!(current + 1)))
    }

    fn declared_writes(&self, _params: &serde_json::Map<String, Value>) -> Vec<String> {
        vec!["visits".into()]
    }
}

fn counter_engine(store: Arc<MemoryContactStore>) -> Result<FlowEngine> {
    let flows = build_registry(load_flows_from_value(json!({
        "name": "counter",
        "trigger_keywords": ["count"],
        "steps": [
            {
                "name": "bump",
                "is_entry_point": true,
                "type": "action",
                "config": {"actions_to_run": [{"action_type": "slow_increment"}]},
                "transitions": [{"to_step": "wait"}]
            },
            {
                "name": "wait",
                "type": "question",
                "config": {"reply_config": {"expected_type": "any", "save_to_variable": "last_reply"}},
                "transitions": [{"to_step": "bump"}]
            }
        ]
    }))?)?;
    let mut actions = ActionRegistry::new();
    actions.register(Arc::new(SlowCounter));
    Ok(FlowEngine::new(flows, actions, store)?)
}

#[tokio::test]
async fn events_for_one_contact_are_serialized() -> Result<()> {
    let store = Arc::new(MemoryContactStore::new());
    let engine = counter_engine(store)?;
    engine
        .handle_event(InboundEvent::text(CONTACT, "count"))
        .await?;

    let events = (0..8)
        .map(|i| InboundEvent::text(CONTACT, format!("reply {}", i)))
        .collect();
    let results = engine.handle_batch(events, 8).await;
    assert_eq!(results.len(), 8);
    for result in results {
        assert_eq!(result?.status, Some(FlowStatus::AwaitingInput));
    }

    let state = engine.contact_state(CONTACT).await?.expect("state saved");
    assert_eq!(state.context.get("visits"), Some(&json!(9)));
    Ok(())
}

#[tokio::test]
async fn different_contacts_progress_independently() -> Result<()> {
    let store = Arc::new(MemoryContactStore::new());
    let engine = counter_engine(store)?;
    let events = (0..5)
        .map(|i| InboundEvent::text(format!("26377000000{}", i), "count"))
        .collect();

    for result in engine.handle_batch(events, 5).await {
        assert_eq!(result?.disposition, EventDisposition::Processed);
    }
    for i in 0..5 {
        let state = engine
            .contact_state(&format!("26377000000{}", i))
            .await?
            .expect("state saved");
        assert_eq!(state.context.get("visits"), Some(&json!(1)));
    }
    Ok(())
}

#[tokio::test]
async fn held_lock_surfaces_as_timeout() -> Result<()> {
    let store = Arc::new(MemoryContactStore::new());
    let flows = build_registry(load_flows_from_value(json!({
        "name": "noop",
        "trigger_keywords": ["go"],
        "steps": [{"name": "end", "is_entry_point": true, "type": "end_flow"}]
    }))?)?;
    let settings = EngineSettings {
        lock_timeout_ms: 20,
        ..EngineSettings::default()
    };
    let engine = FlowEngine::with_settings(flows, ActionRegistry::new(), store.clone(), settings)?;

    let held = store.lock(CONTACT, Duration::from_millis(50)).await?;
    let err = engine
        .handle_event(InboundEvent::text(CONTACT, "go"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatFlowError::LockTimeout(ref contact) if contact == CONTACT));

    store.release(held).await?;
    let outcome = engine
        .handle_event(InboundEvent::text(CONTACT, "go"))
        .await?;
    assert!(outcome.is_terminated());
    Ok(())
}

#[tokio::test]
async fn idle_contacts_are_abandoned() -> Result<()> {
    let harness = Harness::new(json!({
        "name": "survey",
        "trigger_keywords": ["survey"],
        "steps": [
            {
                "name": "q1",
                "is_entry_point": true,
                "type": "question",
                "config": {"reply_config": {"save_to_variable": "answer"}},
                "transitions": [{"to_step": "done"}]
            },
            {"name": "done", "type": "end_flow"}
        ]
    }))?;

    let mut stale = ContactFlowState::new("263779999999", "survey", 1, "q1");
    stale.status = FlowStatus::AwaitingInput;
    stale.updated_at = chrono::Utc::now() - chrono::Duration::hours(3);
    harness.store.seed(stale);

    harness
        .engine
        .handle_event(InboundEvent::text(CONTACT, "survey"))
        .await?;

    let abandoned = harness
        .engine
        .abandon_idle(Duration::from_secs(3600))
        .await?;
    assert_eq!(abandoned, vec!["263779999999".to_string()]);
    assert!(harness.engine.contact_state("263779999999").await?.is_none());
    assert!(harness.engine.contact_state(CONTACT).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn state_for_removed_flow_is_reset() -> Result<()> {
    let harness = Harness::new(json!({
        "name": "current",
        "trigger_keywords": ["start"],
        "steps": [{"name": "end", "is_entry_point": true, "type": "end_flow"}]
    }))?;
    harness
        .store
        .seed(ContactFlowState::new(CONTACT, "retired_flow", 1, "somewhere"));

    let outcome = harness
        .engine
        .handle_event(InboundEvent::text(CONTACT, "hello"))
        .await?;
    assert_eq!(outcome.disposition, EventDisposition::Idle);
    assert!(harness.engine.contact_state(CONTACT).await?.is_none());
    Ok(())
}
