// 动作模块 - 统一的动作分发约定与内置动作

pub mod builtin;
pub mod payment;
pub mod records;
mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use payment::{
    ConfirmOutcome, InitiateOutcome, PaymentGateway, PaymentPhase, PaymentRequest, PaymentState,
    SandboxPaymentGateway,
};
pub use records::{BusinessStore, InMemoryBusinessStore, RecordQuery};
pub use registry::ActionRegistry;

use crate::error::{ChatFlowError, Result};
use crate::flow::MessageSpec;
use crate::runtime::{InboundEvent, OutboundIntent};
use crate::state::FlowContext;

/// 动作处理器
///
/// 处理器只返回 [`ActionResult`]，不直接修改上下文也不直接发送消息。
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// 兼容旧配置的别名
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    async fn execute(&self, call: ActionCall<'_>) -> Result<ActionResult>;

    /// 静态分析用：按原始参数声明会写入的上下文根键
    fn declared_writes(&self, _params: &Map<String, Value>) -> Vec<String> {
        Vec::new()
    }
}

/// 一次动作调用；`params` 中的模板已按当前上下文解析
#[derive(Debug, Clone)]
pub struct ActionCall<'a> {
    pub action_type: &'a str,
    pub contact_id: &'a str,
    pub contact_name: Option<&'a str>,
    pub flow: &'a str,
    pub step: &'a str,
    pub context: &'a FlowContext,
    pub params: Map<String, Value>,
    pub event: Option<&'a InboundEvent>,
}

impl<'a> ActionCall<'a> {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key).filter(|value| !value.is_null())
    }

    /// 必填字符串参数，数字等标量会被转为字符串
    pub fn require_str(&self, key: &str) -> Result<String> {
        self.opt_str(key).ok_or_else(|| {
            ChatFlowError::action(self.action_type, format!("missing parameter `{}`", key))
        })
    }

    pub fn opt_str(&self, key: &str) -> Option<String> {
        match self.param(key)? {
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// 依次尝试多个键（新旧参数名）
    pub fn require_any_str(&self, keys: &[&str]) -> Result<String> {
        keys.iter()
            .find_map(|key| self.opt_str(key))
            .ok_or_else(|| {
                ChatFlowError::action(
                    self.action_type,
                    format!("missing parameter `{}`", keys.join("` or `")),
                )
            })
    }

    pub fn object(&self, keys: &[&str]) -> Map<String, Value> {
        keys.iter()
            .find_map(|key| self.param(key).and_then(Value::as_object).cloned())
            .unwrap_or_default()
    }

    /// 字符串列表；也接受逗号分隔的字符串
    pub fn strings(&self, key: &str) -> Vec<String> {
        match self.param(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.param(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "1"),
            Some(Value::Number(n)) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
            _ => false,
        }
    }

    pub fn opt_u32(&self, key: &str) -> Option<u32> {
        match self.param(key)? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// 动作执行结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// `null` 值表示删除该键
    pub context_patch: Map<String, Value>,
    pub outbound_intents: Vec<OutboundIntent>,
    pub external_calls: Vec<ExternalCallRequest>,
    /// 步骤结束后由引擎执行的跨流程切换
    pub flow_switch: Option<FlowSwitchRequest>,
}

impl ActionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_patch.insert(key.into(), value);
        self
    }

    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.context_patch.insert(key.into(), Value::Null);
        self
    }

    pub fn message(mut self, contact_id: &str, message: MessageSpec) -> Self {
        self.outbound_intents
            .push(OutboundIntent::new(contact_id, message));
        self
    }

    pub fn call(mut self, request: ExternalCallRequest) -> Self {
        self.external_calls.push(request);
        self
    }

    pub fn switch_to(mut self, request: FlowSwitchRequest) -> Self {
        self.flow_switch = Some(request);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.context_patch.is_empty()
            && self.outbound_intents.is_empty()
            && self.external_calls.is_empty()
            && self.flow_switch.is_none()
    }
}

/// 交给引擎调用方执行的外部调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum ExternalCallRequest {
    GroupNotification {
        contact_id: String,
        group_names: Vec<String>,
        template_name: String,
        #[serde(default)]
        template_context: Map<String, Value>,
    },
    HumanHandover {
        contact_id: String,
        flow: String,
        step: String,
        #[serde(default)]
        reason: Option<String>,
    },
    RecordWrite {
        entity: String,
        operation: RecordOperation,
        #[serde(default)]
        record_id: Option<String>,
        fields: Map<String, Value>,
    },
    PaymentCancellation {
        contact_id: String,
        #[serde(default)]
        otp_reference: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOperation {
    Create,
    Update,
}

/// 跨流程切换请求：初始上下文合并进现有上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSwitchRequest {
    pub target_flow: String,
    #[serde(default)]
    pub initial_context: Map<String, Value>,
}

/// 取点号路径的根键
pub(crate) fn root_of(path: &str) -> String {
    path.split('.').next().unwrap_or(path).to_string()
}
