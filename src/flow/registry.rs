use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::error::{ChatFlowError, Result};
use crate::flow::steps::StepKind;
use crate::flow::types::Flow;
use crate::template::is_template;

/// 参数中携带目标流程名的动作
const SWITCH_ACTION: &str = "switch_flow";

/// Flow 注册表
#[derive(Debug, Default, Clone)]
pub struct FlowRegistry {
    flows: HashMap<String, Arc<Flow>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self {
            flows: HashMap::new(),
        }
    }

    /// 注册流程，同名流程被替换
    pub fn register(&mut self, flow: Flow) {
        if let Some(previous) = self.flows.get(&flow.name) {
            info!(
                flow = %flow.name,
                from = previous.version,
                to = flow.version,
                "replacing flow definition"
            );
        }
        self.flows.insert(flow.name.clone(), Arc::new(flow));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Flow>> {
        self.flows.get(name).cloned()
    }

    pub fn list(&self) -> impl Iterator<Item = &Arc<Flow>> {
        self.flows.values()
    }

    /// 按名称排序的流程名
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.flows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// 在启用的流程中查找触发关键字；多个命中时按流程名取第一个
    pub fn match_trigger(&self, text: &str) -> Option<Arc<Flow>> {
        self.names()
            .into_iter()
            .filter_map(|name| self.flows.get(name))
            .find(|flow| flow.active && flow.matches_trigger(text))
            .cloned()
    }

    /// 校验 switch_flow（步骤与动作）的目标流程存在
    pub fn validate_links(&self) -> Result<()> {
        for flow in self.flows.values() {
            for step in flow.steps_in_order() {
                let targets: Vec<&str> = match &step.kind {
                    StepKind::SwitchFlow(switch) => vec![switch.target_flow.as_str()],
                    StepKind::Action(action) => action
                        .actions
                        .iter()
                        .filter(|invocation| invocation.action_type == SWITCH_ACTION)
                        .filter_map(|invocation| {
                            invocation
                                .params
                                .get("target_flow_name")
                                .and_then(|value| value.as_str())
                        })
                        .filter(|target| !is_template(target))
                        .collect(),
                    _ => Vec::new(),
                };
                for target in targets {
                    if !self.flows.contains_key(target) {
                        return Err(ChatFlowError::invalid_flow(
                            &flow.name,
                            format!("step `{}` switches to unknown flow `{}`", step.name, target),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
