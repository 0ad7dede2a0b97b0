use super::flow_config::{StepConfig, StepType};
use crate::error::{ChatFlowError, Result};
use crate::flow::MessageSpec;
use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// question 步骤配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionConfig {
    #[serde(default)]
    pub message_config: Option<MessageSpec>,
    pub reply_config: ReplyConfig,
    #[serde(default)]
    pub fallback_config: Option<FallbackConfig>,
    #[serde(default)]
    pub otp_config: Option<OtpConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    #[serde(default)]
    pub expected_type: ExpectedInput,
    pub save_to_variable: String,
    #[serde(default)]
    pub validation_regex: Option<String>,
}

/// 期望的回复类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedInput {
    #[default]
    Text,
    #[serde(alias = "numeric", alias = "integer")]
    Number,
    Email,
    InteractiveId,
    #[serde(alias = "image", alias = "document")]
    Media,
    Any,
}

/// 校验失败后的重试策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// 目前只支持 re_prompt
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub re_prompt_message_text: Option<String>,
    #[serde(default)]
    pub fallback_step: Option<String>,
    #[serde(default)]
    pub handover_message_text: Option<String>,
}

fn default_max_retries() -> u32 {
    crate::flow::constants::defaults::MAX_RETRIES
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            action: None,
            max_retries: default_max_retries(),
            re_prompt_message_text: None,
            fallback_step: None,
            handover_message_text: None,
        }
    }
}

/// OTP 采集步骤：取消关键字命中时跳转的步骤
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtpConfig {
    #[serde(default)]
    pub cancel_step: Option<String>,
}

/// action 步骤配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStepConfig {
    pub actions_to_run: Vec<ActionConfig>,
}

/// 单个动作调用；除 `action_type` 外的字段都作为参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub action_type: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// switch_flow 步骤配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchFlowConfig {
    pub target_flow_name: String,
    #[serde(default)]
    pub initial_context_template: Map<String, Value>,
}

/// 托管表单步骤配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalFormConfig {
    #[serde(alias = "flow_id")]
    pub form_id: String,
    #[serde(default)]
    pub header: Option<String>,
    pub body: String,
    #[serde(default)]
    pub footer: Option<String>,
    #[serde(default = "default_cta")]
    pub cta: String,
    /// 表单字段在上下文中的命名空间，缺省使用引擎设置
    #[serde(default)]
    pub response_namespace: Option<String>,
    #[serde(default)]
    pub reminder_message_text: Option<String>,
    /// 表单会回传的字段，供静态检查使用
    #[serde(default)]
    pub fields: Vec<String>,
}

fn default_cta() -> String {
    "Open form".to_string()
}

/// end_flow 步骤配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndFlowConfig {
    #[serde(default)]
    pub message_config: Option<MessageSpec>,
}

impl StepConfig {
    fn parse_config<T: DeserializeOwned>(&self, expected: StepType) -> Result<T> {
        if self.step_type != expected {
            return Err(ChatFlowError::Other(anyhow!(
                "Step {} is not a {} step",
                self.name,
                expected.as_str()
            )));
        }
        serde_json::from_value(self.config.clone()).map_err(|e| {
            ChatFlowError::Other(anyhow!(
                "Failed to parse {} config of step {}: {}",
                expected.as_str(),
                self.name,
                e
            ))
        })
    }

    /// 尝试解析为 question 配置
    pub fn as_question(&self) -> Result<QuestionConfig> {
        self.parse_config(StepType::Question)
    }

    pub fn as_action(&self) -> Result<ActionStepConfig> {
        self.parse_config(StepType::Action)
    }

    pub fn as_send_message(&self) -> Result<MessageSpec> {
        self.parse_config(StepType::SendMessage)
    }

    pub fn as_switch_flow(&self) -> Result<SwitchFlowConfig> {
        self.parse_config(StepType::SwitchFlow)
    }

    pub fn as_external_form(&self) -> Result<ExternalFormConfig> {
        self.parse_config(StepType::SendExternalForm)
    }

    /// end_flow 允许省略 config
    pub fn as_end_flow(&self) -> Result<EndFlowConfig> {
        if self.step_type == StepType::EndFlow && self.config.is_null() {
            return Ok(EndFlowConfig::default());
        }
        self.parse_config(StepType::EndFlow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(value: Value) -> StepConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn question_config_parses_reply_and_fallback() {
        let config = step(json!({
            "name": "ask_amount",
            "type": "question",
            "config": {
                "message_config": {"message_type": "text", "body": "How much?"},
                "reply_config": {
                    "expected_type": "number",
                    "save_to_variable": "payment_amount",
                    "validation_regex": "^[0-9]+(\\.[0-9]{1,2})?$"
                },
                "fallback_config": {"action": "re_prompt", "max_retries": 2}
            }
        }))
        .as_question()
        .unwrap();

        assert_eq!(config.reply_config.expected_type, ExpectedInput::Number);
        assert_eq!(config.fallback_config.unwrap().max_retries, 2);
    }

    #[test]
    fn action_params_are_flattened() {
        let config = step(json!({
            "name": "save",
            "type": "action",
            "config": {"actions_to_run": [
                {"action_type": "set_context_variable", "variable_name": "x", "value_template": "1"}
            ]}
        }))
        .as_action()
        .unwrap();

        let action = &config.actions_to_run[0];
        assert_eq!(action.action_type, "set_context_variable");
        assert_eq!(action.params.get("variable_name"), Some(&json!("x")));
        assert!(!action.params.contains_key("action_type"));
    }

    #[test]
    fn end_flow_without_config() {
        let config = step(json!({"name": "done", "type": "end_flow"}));
        assert!(config.as_end_flow().unwrap().message_config.is_none());
    }

    #[test]
    fn wrong_kind_is_an_error() {
        let config = step(json!({"name": "done", "type": "end_flow"}));
        assert!(config.as_question().is_err());
    }
}
