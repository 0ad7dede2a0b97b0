use super::conditions::ConditionConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 流程文档（一个 JSON 文件一个流程，或流程数组）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    pub name: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub trigger_keywords: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// 由外部（其他流程或调用方）预先提供的上下文键，供静态检查使用
    #[serde(default)]
    pub context_inputs: Vec<String>,
    pub steps: Vec<StepConfig>,
}

fn default_version() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

/// 步骤配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    #[serde(default)]
    pub is_entry_point: bool,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub transitions: Vec<TransitionConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Question,
    Action,
    SendMessage,
    SwitchFlow,
    SendExternalForm,
    EndFlow,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Question => "question",
            StepType::Action => "action",
            StepType::SendMessage => "send_message",
            StepType::SwitchFlow => "switch_flow",
            StepType::SendExternalForm => "send_external_form",
            StepType::EndFlow => "end_flow",
        }
    }
}

/// 转移配置；相同优先级按声明顺序
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionConfig {
    pub to_step: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub condition_config: ConditionConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flow_config_defaults() {
        let config: FlowConfig = serde_json::from_value(json!({
            "name": "faq",
            "steps": [{
                "name": "start",
                "is_entry_point": true,
                "type": "end_flow",
                "transitions": [{"to_step": "start"}]
            }]
        }))
        .unwrap();

        assert_eq!(config.version, 1);
        assert!(config.is_active);
        assert_eq!(config.steps[0].step_type, StepType::EndFlow);
        assert_eq!(config.steps[0].transitions[0].priority, 0);
        assert_eq!(
            config.steps[0].transitions[0].condition_config,
            ConditionConfig::AlwaysTrue
        );
    }

    #[test]
    fn unknown_step_type_is_rejected() {
        let parsed: Result<StepConfig, _> = serde_json::from_value(json!({
            "name": "x",
            "type": "carousel"
        }));
        assert!(parsed.is_err());
    }
}
