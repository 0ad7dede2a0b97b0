use std::fs;
use std::sync::Arc;

use anyhow::Result;
use chatflow::{
    build_registry, lint_registry, load_flows_from_dir, load_flows_from_value, ActionRegistry,
    ChatFlowError, InMemoryBusinessStore, LintKind, SandboxPaymentGateway, StepKind,
};
use serde_json::json;

fn builtin_actions() -> ActionRegistry {
    ActionRegistry::with_builtins(
        Arc::new(InMemoryBusinessStore::new()),
        Arc::new(SandboxPaymentGateway::default()),
    )
}

#[test]
fn bundled_flows_load_and_lint_clean() -> Result<()> {
    let registry = load_flows_from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/flows"))?;
    assert_eq!(
        registry.names(),
        vec!["booking_payment", "main_menu", "tour_inquiry"]
    );

    let findings = lint_registry(&registry, &builtin_actions());
    assert!(findings.is_empty(), "unexpected findings: {:?}", findings);

    let payment = registry.get("booking_payment").expect("payment flow");
    assert_eq!(payment.entry, "start_payment");
    assert!(matches!(
        payment.step("ask_otp").map(|step| &step.kind),
        Some(StepKind::Question(question)) if question.otp.is_some()
    ));
    Ok(())
}

#[test]
fn directory_loading_skips_other_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(
        dir.path().join("a_welcome.json"),
        json!({
            "name": "welcome",
            "trigger_keywords": ["hello"],
            "steps": [{"name": "bye", "is_entry_point": true, "type": "end_flow"}]
        })
        .to_string(),
    )?;
    fs::write(
        dir.path().join("b_pair.json"),
        json!([
            {"name": "first", "steps": [{"name": "s", "is_entry_point": true, "type": "end_flow"}]},
            {"name": "second", "is_active": false, "trigger_keywords": ["two"],
             "steps": [{"name": "s", "is_entry_point": true, "type": "end_flow"}]}
        ])
        .to_string(),
    )?;
    fs::write(dir.path().join("notes.txt"), "not a flow")?;

    let registry = load_flows_from_dir(dir.path())?;
    assert_eq!(registry.len(), 3);
    assert!(registry.match_trigger("HELLO").is_some());
    // 未启用的流程不响应触发词
    assert!(registry.match_trigger("two").is_none());
    Ok(())
}

#[test]
fn duplicate_flow_names_across_files_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let flow = json!({"name": "same", "steps": [{"name": "s", "is_entry_point": true, "type": "end_flow"}]});
    fs::write(dir.path().join("one.json"), flow.to_string())?;
    fs::write(dir.path().join("two.json"), flow.to_string())?;

    let err = load_flows_from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, ChatFlowError::InvalidFlow { ref flow, .. } if flow == "same"));
    Ok(())
}

#[test]
fn malformed_file_error_names_the_path() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("broken.json"), "{\"name\": \"x\", \"steps\": [")?;

    let err = load_flows_from_dir(dir.path()).unwrap_err().to_string();
    assert!(err.contains("broken.json"), "{}", err);
    Ok(())
}

#[test]
fn unknown_condition_type_fails_loading() {
    let result = load_flows_from_value(json!({
        "name": "bad",
        "steps": [
            {
                "name": "start", "is_entry_point": true, "type": "send_message",
                "config": {"message_type": "text", "body": "hi"},
                "transitions": [{"to_step": "end", "condition_config": {"type": "moon_is_full"}}]
            },
            {"name": "end", "type": "end_flow"}
        ]
    }));
    assert!(result.is_err());
}

#[test]
fn switch_to_unknown_flow_is_rejected() -> Result<()> {
    let flows = load_flows_from_value(json!({
        "name": "menu",
        "steps": [{
            "name": "go", "is_entry_point": true, "type": "switch_flow",
            "config": {"target_flow_name": "missing"}
        }]
    }))?;
    let err = build_registry(flows).unwrap_err().to_string();
    assert!(err.contains("missing"), "{}", err);
    Ok(())
}

#[test]
fn lint_reports_reference_set_only_on_another_branch() -> Result<()> {
    let registry = build_registry(load_flows_from_value(json!({
        "name": "branchy",
        "trigger_keywords": ["go"],
        "steps": [
            {
                "name": "choose", "is_entry_point": true, "type": "question",
                "config": {
                    "message_config": {"message_type": "buttons", "body": "Pick", "buttons": [
                        {"id": "a", "title": "A"}, {"id": "b", "title": "B"}
                    ]},
                    "reply_config": {"expected_type": "interactive_id", "save_to_variable": "choice"}
                },
                "transitions": [
                    {"to_step": "set_a", "priority": 1, "condition_config": {"type": "interactive_reply_id_equals", "value": "a"}},
                    {"to_step": "show", "priority": 2}
                ]
            },
            {
                "name": "set_a", "type": "action",
                "config": {"actions_to_run": [
                    {"action_type": "set_context_variable", "variable_name": "picked_a", "value": true}
                ]},
                "transitions": [{"to_step": "done"}]
            },
            {
                "name": "show", "type": "send_message",
                "config": {"message_type": "text", "body": "You chose {{ choice }}; a={{ picked_a }}"},
                "transitions": [{"to_step": "done"}]
            },
            {"name": "done", "type": "end_flow"}
        ]
    }))?)?;

    let findings = lint_registry(&registry, &builtin_actions());
    assert_eq!(findings.len(), 1, "{:?}", findings);
    assert_eq!(findings[0].step, "show");
    assert_eq!(
        findings[0].kind,
        LintKind::UndefinedReference {
            path: "picked_a".into()
        }
    );
    Ok(())
}
