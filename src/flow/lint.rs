//! 加载期静态检查
//!
//! 对每个流程做可达性与"可能已定义"数据流分析：模板或条件引用的根变量，
//! 若没有任何上游步骤、流程输入或切入该流程的 `switch_flow` 能写入，则报告。
//! 结果仅为警告，模板语法错误在加载时已作为错误拒绝。

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use super::constants::{context_keys, defaults, payment};
use super::loader::step_templates;
use super::registry::FlowRegistry;
use super::steps::StepKind;
use super::types::{Flow, Step};
use crate::actions::ActionRegistry;
use crate::template::{is_template, Renderer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LintKind {
    /// 引用的根变量在到达该步骤的任何路径上都不会被写入
    UndefinedReference { path: String },
    /// 从入口不可达
    UnreachableStep,
    /// 自动推进的步骤没有任何转移
    DeadEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintFinding {
    pub flow: String,
    pub step: String,
    #[serde(flatten)]
    pub kind: LintKind,
}

impl fmt::Display for LintFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LintKind::UndefinedReference { path } => write!(
                f,
                "{}.{}: `{}` is never set before this step",
                self.flow, self.step, path
            ),
            LintKind::UnreachableStep => {
                write!(f, "{}.{}: step is unreachable from the entry point", self.flow, self.step)
            }
            LintKind::DeadEnd => write!(
                f,
                "{}.{}: step advances automatically but has no transitions",
                self.flow, self.step
            ),
        }
    }
}

type Roots = BTreeSet<String>;

/// 引擎自身写入或注入渲染作用域的根变量
fn engine_roots() -> Roots {
    [
        context_keys::SCOPE_CONTACT,
        context_keys::SCOPE_MESSAGE,
        context_keys::RETRY,
        context_keys::FORM,
        context_keys::FORM_SEQ,
        context_keys::PAYMENT,
        context_keys::LAST_EVENT,
        context_keys::LAST_EVENT_ID,
    ]
    .iter()
    .map(|key| key.to_string())
    .collect()
}

fn root(path: &str) -> String {
    path.split('.').next().unwrap_or(path).trim().to_string()
}

pub fn lint_registry(flows: &FlowRegistry, actions: &ActionRegistry) -> Vec<LintFinding> {
    let renderer = Renderer::new();
    let mut ordered: Vec<_> = flows.list().cloned().collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));

    // 跨流程不动点：切入流程时携带的变量作为目标流程的种子
    let mut seeds: HashMap<String, Roots> = ordered
        .iter()
        .map(|flow| {
            let mut roots = engine_roots();
            roots.extend(flow.context_inputs.iter().map(|input| root(input)));
            (flow.name.clone(), roots)
        })
        .collect();
    let mut available: HashMap<String, HashMap<String, Roots>> = HashMap::new();
    loop {
        let mut changed = false;
        for flow in &ordered {
            let entry_seed = seeds.get(&flow.name).cloned().unwrap_or_default();
            let step_in = propagate(flow, &entry_seed, actions);
            for (target, carried) in outgoing_switches(flow, &step_in, actions) {
                if let Some(target_seed) = seeds.get_mut(&target) {
                    let before = target_seed.len();
                    target_seed.extend(carried);
                    changed |= target_seed.len() != before;
                }
            }
            available.insert(flow.name.clone(), step_in);
        }
        if !changed {
            break;
        }
    }

    let mut findings = Vec::new();
    for flow in &ordered {
        let step_in = available.get(&flow.name);
        let reachable = reachable_steps(flow);
        for step in flow.steps_in_order() {
            if !reachable.contains(step.name.as_str()) {
                findings.push(finding(flow, step, LintKind::UnreachableStep));
                continue;
            }
            if step.kind.auto_advances() && step.transitions.is_empty() {
                findings.push(finding(flow, step, LintKind::DeadEnd));
            }
            let Some(defined) = step_in.and_then(|map| map.get(&step.name)) else {
                continue;
            };
            for path in undefined_reads(&renderer, step, defined, actions) {
                findings.push(finding(flow, step, LintKind::UndefinedReference { path }));
            }
        }
    }
    findings
}

fn finding(flow: &Flow, step: &Step, kind: LintKind) -> LintFinding {
    LintFinding {
        flow: flow.name.clone(),
        step: step.name.clone(),
        kind,
    }
}

fn successors(step: &Step) -> Vec<&str> {
    let mut next: Vec<&str> = step.transitions.iter().map(|t| t.target.as_str()).collect();
    if let StepKind::Question(question) = &step.kind {
        next.extend(question.fallback.fallback_step.as_deref());
        next.extend(question.otp.as_ref().and_then(|otp| otp.cancel_step.as_deref()));
    }
    next
}

fn reachable_steps(flow: &Flow) -> HashSet<&str> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([flow.entry.as_str()]);
    while let Some(name) = queue.pop_front() {
        if !seen.insert(name) {
            continue;
        }
        if let Some(step) = flow.step(name) {
            queue.extend(successors(step));
        }
    }
    seen
}

/// 步骤执行后新增的根变量
fn step_writes(step: &Step, actions: &ActionRegistry) -> Roots {
    let mut writes = Roots::new();
    match &step.kind {
        StepKind::Question(question) => {
            writes.insert(root(&question.save_to));
            if question.otp.is_some() {
                writes.insert(context_keys::PAYMENT_CANCELLED.to_string());
                writes.insert(payment::OTP_REFERENCE.to_string());
            }
        }
        StepKind::Action(action) => {
            for invocation in &action.actions {
                if let Some(handler) = actions.get(&invocation.action_type) {
                    writes.extend(handler.declared_writes(&invocation.params));
                }
            }
        }
        StepKind::ExternalForm(form) => {
            writes.insert(context_keys::FORM_RESPONSE_RECEIVED.to_string());
            writes.insert(root(
                form.response_namespace
                    .as_deref()
                    .unwrap_or(defaults::FORM_RESPONSE_NAMESPACE),
            ));
            writes.extend(form.fields.iter().map(|field| root(field)));
        }
        StepKind::SendMessage(_) | StepKind::SwitchFlow(_) | StepKind::EndFlow(_) => {}
    }
    writes
}

/// 每个步骤入口处"可能已定义"的根变量集合
fn propagate(flow: &Flow, seed: &Roots, actions: &ActionRegistry) -> HashMap<String, Roots> {
    let mut step_in: HashMap<String, Roots> = HashMap::new();
    step_in.insert(flow.entry.clone(), seed.clone());
    let mut queue = VecDeque::from([flow.entry.clone()]);
    while let Some(name) = queue.pop_front() {
        let Some(step) = flow.step(&name) else {
            continue;
        };
        let mut out = step_in.get(&name).cloned().unwrap_or_default();
        out.extend(step_writes(step, actions));
        for next in successors(step) {
            let entry = step_in.entry(next.to_string()).or_default();
            let before = entry.len();
            entry.extend(out.iter().cloned());
            if entry.len() != before || before == 0 {
                queue.push_back(next.to_string());
            }
        }
    }
    step_in
}

/// 本流程中切入其他流程的步骤及其携带的变量
fn outgoing_switches(
    flow: &Flow,
    step_in: &HashMap<String, Roots>,
    actions: &ActionRegistry,
) -> Vec<(String, Roots)> {
    let mut out = Vec::new();
    for step in flow.steps_in_order() {
        let Some(defined) = step_in.get(&step.name) else {
            continue;
        };
        match &step.kind {
            StepKind::SwitchFlow(switch) => {
                let mut carried = defined.clone();
                carried.extend(switch.initial_context.keys().map(|key| root(key)));
                out.push((switch.target_flow.clone(), carried));
            }
            StepKind::Action(action) => {
                let mut carried = defined.clone();
                carried.extend(step_writes(step, actions));
                for invocation in &action.actions {
                    if invocation.action_type != "switch_flow" {
                        continue;
                    }
                    let Some(target) = invocation
                        .params
                        .get("target_flow_name")
                        .and_then(Value::as_str)
                        .filter(|target| !is_template(target))
                    else {
                        continue;
                    };
                    out.push((target.to_string(), carried.clone()));
                }
            }
            _ => {}
        }
    }
    out
}

fn undefined_reads(
    renderer: &Renderer,
    step: &Step,
    defined: &Roots,
    actions: &ActionRegistry,
) -> Vec<String> {
    let mut reads = Roots::new();
    for template in step_templates(&step.kind) {
        if let Ok(roots) = renderer.referenced_roots(template) {
            reads.extend(roots);
        }
    }
    // 同一 action 步骤内，前面的动作写入对后面的模板可见
    let mut local = defined.clone();
    if let StepKind::Action(action) = &step.kind {
        reads.clear();
        for invocation in &action.actions {
            for root_name in params_roots(renderer, &invocation.params) {
                if !local.contains(&root_name) {
                    reads.insert(root_name);
                }
            }
            if let Some(handler) = actions.get(&invocation.action_type) {
                local.extend(handler.declared_writes(&invocation.params));
            }
        }
    }

    let mut after = local.clone();
    after.extend(step_writes(step, actions));
    for transition in &step.transitions {
        let condition = &transition.condition;
        for template in condition.templates() {
            if let Ok(roots) = renderer.referenced_roots(template) {
                reads.extend(roots.into_iter().filter(|name| !after.contains(name)));
            }
        }
        if condition.is_existence_check() {
            continue;
        }
        if let Some(path) = condition.read_path() {
            if !after.contains(&root(path)) {
                reads.insert(root(path));
            }
        }
    }

    reads.into_iter().filter(|name| !local.contains(name)).collect()
}

fn params_roots(renderer: &Renderer, params: &Map<String, Value>) -> Roots {
    let mut out = Roots::new();
    let mut stack: Vec<&Value> = params.values().collect();
    while let Some(value) = stack.pop() {
        match value {
            Value::String(raw) => {
                if let Ok(roots) = renderer.referenced_roots(raw) {
                    out.extend(roots);
                }
            }
            Value::Array(items) => stack.extend(items),
            Value::Object(map) => stack.extend(map.values()),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{InMemoryBusinessStore, SandboxPaymentGateway};
    use crate::flow::{build_registry, load_flows_from_value};
    use serde_json::json;
    use std::sync::Arc;

    fn actions() -> ActionRegistry {
        ActionRegistry::with_builtins(
            Arc::new(InMemoryBusinessStore::new()),
            Arc::new(SandboxPaymentGateway::default()),
        )
    }

    #[test]
    fn reports_undefined_unreachable_and_dead_end() -> anyhow::Result<()> {
        let flows = load_flows_from_value(json!({
            "name": "booking",
            "trigger_keywords": ["book"],
            "steps": [
                {"name": "ask_name", "is_entry_point": true, "type": "question",
                 "config": {"message_config": {"message_type": "text", "body": "Name?"},
                            "reply_config": {"expected_type": "text", "save_to_variable": "full_name"}},
                 "transitions": [{"to_step": "greet"}]},
                {"name": "greet", "type": "send_message",
                 "config": {"message_type": "text", "body": "Hi {{ full_name }}, ref {{ booking_ref }}"},
                 "transitions": [{"to_step": "dangling"}]},
                {"name": "dangling", "type": "action",
                 "config": {"actions_to_run": [{"action_type": "set_context_variable",
                                                 "variable_name": "x", "value_template": 1}]},
                 "transitions": []},
                {"name": "orphan", "type": "end_flow", "config": {}, "transitions": []}
            ]
        }))?;
        let registry = build_registry(flows)?;
        let findings = lint_registry(&registry, &actions());

        assert!(findings.contains(&LintFinding {
            flow: "booking".into(),
            step: "greet".into(),
            kind: LintKind::UndefinedReference { path: "booking_ref".into() },
        }));
        assert!(!findings.iter().any(|f| matches!(
            &f.kind,
            LintKind::UndefinedReference { path } if path == "full_name"
        )));
        assert!(findings.iter().any(|f| f.step == "dangling" && f.kind == LintKind::DeadEnd));
        assert!(findings.iter().any(|f| f.step == "orphan" && f.kind == LintKind::UnreachableStep));
        Ok(())
    }

    #[test]
    fn switch_flow_context_seeds_target_flow() -> anyhow::Result<()> {
        let flows = load_flows_from_value(json!([
            {
                "name": "menu",
                "trigger_keywords": ["menu"],
                "steps": [
                    {"name": "pick", "is_entry_point": true, "type": "question",
                     "config": {"reply_config": {"expected_type": "text", "save_to_variable": "choice"}},
                     "transitions": [{"to_step": "go"}]},
                    {"name": "go", "type": "switch_flow",
                     "config": {"target_flow_name": "pay",
                                "initial_context_template": {"amount": "{{ choice }}"}}}
                ]
            },
            {
                "name": "pay",
                "steps": [
                    {"name": "confirm", "is_entry_point": true, "type": "end_flow",
                     "config": {"message_config": {"message_type": "text",
                                "body": "Paying {{ amount }} for {{ choice }}"}}}
                ]
            }
        ]))?;
        let registry = build_registry(flows)?;
        let findings = lint_registry(&registry, &actions());
        assert!(
            !findings.iter().any(|f| matches!(f.kind, LintKind::UndefinedReference { .. })),
            "unexpected findings: {:?}",
            findings
        );
        Ok(())
    }
}
