use std::collections::{HashMap, HashSet};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{FlowConfig, StepConfig, StepType};
use crate::error::{ChatFlowError, Result};
use crate::flow::conditions::Condition;
use crate::flow::registry::FlowRegistry;
use crate::flow::steps::{
    ActionInvocation, ActionStep, EndFlowStep, QuestionStep, StepKind, SwitchFlowStep,
};
use crate::flow::types::{Flow, Step, Transition};
use crate::template::Renderer;
use crate::utils::validation::ConfigValidator;

/// 仅用于加载期语法检查的渲染器
static SYNTAX: Lazy<Renderer> = Lazy::new(Renderer::new);

/// 将流程文档解析为类型化的流程图，并做单流程内的校验
pub fn build_flow(config: FlowConfig) -> Result<Flow> {
    let flow_name = config.name.clone();
    let invalid = |reason: String| ChatFlowError::invalid_flow(&flow_name, reason);

    ConfigValidator::validate_flow_name(&config.name).map_err(|e| invalid(e.to_string()))?;
    if config.steps.is_empty() {
        return Err(invalid("flow has no steps".into()));
    }
    for keyword in &config.trigger_keywords {
        ConfigValidator::validate_trigger_keyword(keyword).map_err(|e| invalid(e.to_string()))?;
    }

    let mut steps = HashMap::with_capacity(config.steps.len());
    let mut order = Vec::with_capacity(config.steps.len());
    let mut entries = Vec::new();
    for step_config in &config.steps {
        ConfigValidator::validate_step_name(&step_config.name)
            .map_err(|e| invalid(e.to_string()))?;
        if steps.contains_key(&step_config.name) {
            return Err(invalid(format!("duplicate step `{}`", step_config.name)));
        }
        if step_config.is_entry_point {
            entries.push(step_config.name.clone());
        }
        let step = build_step(step_config).map_err(|e| match e {
            ChatFlowError::InvalidFlow { .. } => e,
            other => invalid(other.to_string()),
        })?;
        order.push(step.name.clone());
        steps.insert(step.name.clone(), step);
    }

    let entry = match entries.as_slice() {
        [entry] => entry.clone(),
        [] if !config.is_active => order[0].clone(),
        [] => return Err(invalid("active flow has no entry point".into())),
        many => {
            return Err(invalid(format!(
                "flow has {} entry points ({}), expected exactly one",
                many.len(),
                many.join(", ")
            )))
        }
    };

    let flow = Flow {
        name: config.name,
        friendly_name: config.friendly_name,
        description: config.description,
        version: config.version,
        trigger_keywords: config
            .trigger_keywords
            .iter()
            .map(|keyword| keyword.trim().to_lowercase())
            .collect(),
        active: config.is_active,
        entry,
        context_inputs: config.context_inputs,
        steps,
        order,
    };
    validate_references(&flow)?;
    debug!(flow = %flow.name, steps = flow.steps.len(), "flow built");
    Ok(flow)
}

fn build_step(config: &StepConfig) -> Result<Step> {
    let kind = match config.step_type {
        StepType::Question => {
            let question = config.as_question()?;
            let pattern = question
                .reply_config
                .validation_regex
                .as_deref()
                .map(|raw| {
                    Regex::new(raw).map_err(|e| {
                        ChatFlowError::Other(anyhow::anyhow!(
                            "step `{}` has invalid validation_regex: {}",
                            config.name,
                            e
                        ))
                    })
                })
                .transpose()?;
            ConfigValidator::validate_variable_path(&question.reply_config.save_to_variable)?;
            StepKind::Question(QuestionStep {
                prompt: question.message_config,
                expected: question.reply_config.expected_type,
                save_to: question.reply_config.save_to_variable,
                pattern,
                fallback: question.fallback_config.unwrap_or_default(),
                otp: question.otp_config,
            })
        }
        StepType::Action => {
            let action = config.as_action()?;
            if action.actions_to_run.is_empty() {
                return Err(ChatFlowError::Other(anyhow::anyhow!(
                    "action step `{}` has no actions_to_run",
                    config.name
                )));
            }
            StepKind::Action(ActionStep {
                actions: action
                    .actions_to_run
                    .into_iter()
                    .map(|action| ActionInvocation {
                        action_type: action.action_type,
                        params: action.params,
                    })
                    .collect(),
            })
        }
        StepType::SendMessage => StepKind::SendMessage(config.as_send_message()?),
        StepType::SwitchFlow => {
            let switch = config.as_switch_flow()?;
            StepKind::SwitchFlow(SwitchFlowStep {
                target_flow: switch.target_flow_name,
                initial_context: switch.initial_context_template,
            })
        }
        StepType::SendExternalForm => StepKind::ExternalForm(config.as_external_form()?),
        StepType::EndFlow => StepKind::EndFlow(EndFlowStep {
            message: config.as_end_flow()?.message_config,
        }),
    };

    check_templates(&config.name, &kind)?;

    let mut transitions: Vec<Transition> = config
        .transitions
        .iter()
        .map(|transition| Transition {
            target: transition.to_step.clone(),
            condition: Condition::from(transition.condition_config.clone()),
            priority: transition.priority,
        })
        .collect();
    // 稳定排序：同优先级保持声明顺序
    transitions.sort_by_key(|transition| transition.priority);
    for transition in &transitions {
        for template in transition.condition.templates() {
            syntax(&config.name, template)?;
        }
    }

    Ok(Step {
        name: config.name.clone(),
        is_entry: config.is_entry_point,
        kind,
        transitions,
    })
}

/// 步骤中出现的全部模板字符串
pub fn step_templates(kind: &StepKind) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    match kind {
        StepKind::Question(question) => {
            if let Some(prompt) = &question.prompt {
                out.extend(prompt.templates());
            }
            out.extend(question.fallback.re_prompt_message_text.as_deref());
            out.extend(question.fallback.handover_message_text.as_deref());
        }
        StepKind::Action(action) => {
            for invocation in &action.actions {
                for value in invocation.params.values() {
                    collect_strings(value, &mut out);
                }
            }
        }
        StepKind::SendMessage(message) => out.extend(message.templates()),
        StepKind::SwitchFlow(switch) => {
            for value in switch.initial_context.values() {
                collect_strings(value, &mut out);
            }
        }
        StepKind::ExternalForm(form) => {
            out.push(&form.body);
            out.extend(form.header.as_deref());
            out.extend(form.footer.as_deref());
            out.push(&form.cta);
            out.extend(form.reminder_message_text.as_deref());
        }
        StepKind::EndFlow(end) => {
            if let Some(message) = &end.message {
                out.extend(message.templates());
            }
        }
    }
    out
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(raw) => out.push(raw),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}

fn check_templates(step: &str, kind: &StepKind) -> Result<()> {
    for template in step_templates(kind) {
        syntax(step, template)?;
    }
    Ok(())
}

fn syntax(step: &str, template: &str) -> Result<()> {
    SYNTAX.check(template).map_err(|e| {
        ChatFlowError::Other(anyhow::anyhow!(
            "step `{}` has a template syntax error: {}",
            step,
            e
        ))
    })
}

/// 转移目标、fallback_step、cancel_step 必须存在
fn validate_references(flow: &Flow) -> Result<()> {
    let missing = |step: &str, what: &str, target: &str| {
        ChatFlowError::invalid_flow(
            &flow.name,
            format!("step `{}` references unknown {} `{}`", step, what, target),
        )
    };
    for step in flow.steps_in_order() {
        for transition in &step.transitions {
            if !flow.steps.contains_key(&transition.target) {
                return Err(missing(&step.name, "transition target", &transition.target));
            }
        }
        if let StepKind::Question(question) = &step.kind {
            if let Some(target) = &question.fallback.fallback_step {
                if !flow.steps.contains_key(target) {
                    return Err(missing(&step.name, "fallback_step", target));
                }
            }
            if let Some(target) = question.otp.as_ref().and_then(|otp| otp.cancel_step.as_ref()) {
                if !flow.steps.contains_key(target) {
                    return Err(missing(&step.name, "cancel_step", target));
                }
            }
        }
    }
    Ok(())
}

/// 从 JSON 值加载：单个流程对象或流程数组
pub fn load_flows_from_value(value: Value) -> Result<Vec<Flow>> {
    let configs: Vec<FlowConfig> = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };
    configs.into_iter().map(build_flow).collect()
}

pub fn load_flows_from_str(raw: &str) -> Result<Vec<Flow>> {
    let value: Value = serde_json::from_str(raw)?;
    load_flows_from_value(value)
}

/// 由多个流程组装注册表，并校验跨流程引用
pub fn build_registry(flows: Vec<Flow>) -> Result<FlowRegistry> {
    let mut registry = FlowRegistry::new();
    let mut seen = HashSet::new();
    for flow in flows {
        if !seen.insert(flow.name.clone()) {
            return Err(ChatFlowError::invalid_flow(
                &flow.name,
                "flow defined more than once",
            ));
        }
        registry.register(flow);
    }
    registry.validate_links()?;
    Ok(registry)
}

/// 加载目录下全部 `*.json` 流程文件（按文件名排序）
pub fn load_flows_from_dir(dir: impl AsRef<Path>) -> Result<FlowRegistry> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ChatFlowError::Other(anyhow::anyhow!("无法读取流程目录 {}: {}", dir.display(), e))
    })?;
    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut flows = Vec::new();
    for path in &paths {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ChatFlowError::Other(anyhow::anyhow!("无法读取流程文件 {}: {}", path.display(), e))
        })?;
        let loaded = load_flows_from_str(&raw).map_err(|e| {
            ChatFlowError::Other(anyhow::anyhow!("{}: {}", path.display(), e))
        })?;
        flows.extend(loaded);
    }
    let registry = build_registry(flows)?;
    info!(dir = %dir.display(), files = paths.len(), flows = registry.len(), "flows loaded");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow(steps: Value) -> Value {
        json!({"name": "test_flow", "trigger_keywords": ["Test"], "steps": steps})
    }

    #[test]
    fn transitions_sorted_by_priority_stably() {
        let flows = load_flows_from_value(flow(json!([{
            "name": "start", "is_entry_point": true, "type": "send_message",
            "config": {"message_type": "text", "body": "hi"},
            "transitions": [
                {"to_step": "c", "priority": 2},
                {"to_step": "a", "priority": 1},
                {"to_step": "b", "priority": 1}
            ]
        },
        {"name": "a", "type": "end_flow"},
        {"name": "b", "type": "end_flow"},
        {"name": "c", "type": "end_flow"}])))
        .unwrap();

        let targets: Vec<_> = flows[0].steps["start"]
            .transitions
            .iter()
            .map(|t| t.target.as_str())
            .collect();
        assert_eq!(targets, vec!["a", "b", "c"]);
        assert_eq!(flows[0].trigger_keywords, vec!["test"]);
    }

    #[test]
    fn rejects_missing_or_multiple_entry_points() {
        let none = load_flows_from_value(flow(json!([{"name": "a", "type": "end_flow"}])));
        assert!(matches!(none, Err(ChatFlowError::InvalidFlow { .. })));

        let two = load_flows_from_value(flow(json!([
            {"name": "a", "is_entry_point": true, "type": "end_flow"},
            {"name": "b", "is_entry_point": true, "type": "end_flow"}
        ])));
        assert!(matches!(two, Err(ChatFlowError::InvalidFlow { .. })));
    }

    #[test]
    fn rejects_unknown_transition_target() {
        let result = load_flows_from_value(flow(json!([{
            "name": "a", "is_entry_point": true, "type": "send_message",
            "config": {"message_type": "text", "body": "hi"},
            "transitions": [{"to_step": "nowhere"}]
        }])));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("nowhere"), "{}", err);
    }

    #[test]
    fn rejects_bad_regex_and_template_syntax() {
        let bad_regex = load_flows_from_value(flow(json!([{
            "name": "a", "is_entry_point": true, "type": "question",
            "config": {"reply_config": {"save_to_variable": "x", "validation_regex": "(["}}
        }])));
        assert!(bad_regex.is_err());

        let bad_template = load_flows_from_value(flow(json!([{
            "name": "a", "is_entry_point": true, "type": "send_message",
            "config": {"message_type": "text", "body": "{% if x %}never closed"}
        }])));
        assert!(bad_template.is_err());
    }

    #[test]
    fn rejects_missing_required_fields() {
        let result = load_flows_from_value(flow(json!([{
            "name": "a", "is_entry_point": true, "type": "switch_flow", "config": {}
        }])));
        assert!(result.is_err());
    }
}
