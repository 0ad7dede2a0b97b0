use regex::Regex;
use serde_json::{Map, Value};

use crate::config::{ExpectedInput, ExternalFormConfig, FallbackConfig, OtpConfig};
use crate::flow::MessageSpec;

/// 步骤类型
#[derive(Debug, Clone)]
pub enum StepKind {
    Question(QuestionStep),
    Action(ActionStep),
    SendMessage(MessageSpec),
    SwitchFlow(SwitchFlowStep),
    ExternalForm(ExternalFormConfig),
    EndFlow(EndFlowStep),
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Question(_) => "question",
            StepKind::Action(_) => "action",
            StepKind::SendMessage(_) => "send_message",
            StepKind::SwitchFlow(_) => "switch_flow",
            StepKind::ExternalForm(_) => "send_external_form",
            StepKind::EndFlow(_) => "end_flow",
        }
    }

    /// 进入后停下等待外部输入
    pub fn is_waiting(&self) -> bool {
        matches!(self, StepKind::Question(_) | StepKind::ExternalForm(_))
    }

    /// 进入后在同一事件内继续推进
    pub fn auto_advances(&self) -> bool {
        matches!(self, StepKind::Action(_) | StepKind::SendMessage(_))
    }
}

/// question 步骤：发送提示并等待合法回复
#[derive(Debug, Clone)]
pub struct QuestionStep {
    pub prompt: Option<MessageSpec>,
    pub expected: ExpectedInput,
    pub save_to: String,
    pub pattern: Option<Regex>,
    pub fallback: FallbackConfig,
    pub otp: Option<OtpConfig>,
}

/// action 步骤：按顺序执行的动作列表
#[derive(Debug, Clone)]
pub struct ActionStep {
    pub actions: Vec<ActionInvocation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionInvocation {
    pub action_type: String,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct SwitchFlowStep {
    pub target_flow: String,
    pub initial_context: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct EndFlowStep {
    pub message: Option<MessageSpec>,
}
