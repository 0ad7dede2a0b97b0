use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::FlowContext;

/// 联系人在一次入站事件处理中的状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Running,
    /// 停在 question 或 send_external_form 步骤
    AwaitingInput,
    Terminated,
}

/// 持久化的联系人流程状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactFlowState {
    pub contact_id: String,
    pub flow_name: String,
    #[serde(default = "default_version")]
    pub flow_version: u32,
    pub current_step: String,
    pub status: FlowStatus,
    #[serde(default)]
    pub context: FlowContext,
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl ContactFlowState {
    pub fn new(
        contact_id: impl Into<String>,
        flow_name: impl Into<String>,
        flow_version: u32,
        entry_step: impl Into<String>,
    ) -> Self {
        Self {
            contact_id: contact_id.into(),
            flow_name: flow_name.into(),
            flow_version,
            current_step: entry_step.into(),
            status: FlowStatus::Running,
            context: FlowContext::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_awaiting(&self) -> bool {
        self.status == FlowStatus::AwaitingInput
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionKind {
    HostedForm,
    OtpPayment,
}

/// 异步完成事件的处置结果
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionDisposition {
    Applied,
    NoActiveFlow,
    StepMismatch,
    TokenMismatch,
}

impl SuspensionDisposition {
    pub fn applied(self) -> bool {
        matches!(self, SuspensionDisposition::Applied)
    }
}

/// 外部挂起完成的审计记录，无论是否生效都会保存
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuspensionRecord {
    pub contact_id: String,
    pub correlation_token: String,
    pub kind: SuspensionKind,
    pub raw_payload: Value,
    pub received_at: DateTime<Utc>,
    pub applied: bool,
    pub disposition: SuspensionDisposition,
}

impl SuspensionRecord {
    pub fn new(
        contact_id: impl Into<String>,
        correlation_token: impl Into<String>,
        kind: SuspensionKind,
        raw_payload: Value,
        disposition: SuspensionDisposition,
    ) -> Self {
        Self {
            contact_id: contact_id.into(),
            correlation_token: correlation_token.into(),
            kind,
            raw_payload,
            received_at: Utc::now(),
            applied: disposition.applied(),
            disposition,
        }
    }
}
