use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::actions::ExternalCallRequest;
use crate::flow::MessageSpec;
use crate::state::FlowStatus;

/// 运行时类型定义

/// 入站事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub contact_id: String,
    #[serde(default)]
    pub contact_name: Option<String>,
    /// 传输层消息 ID，用于识别重复投递
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    Text {
        body: String,
    },
    InteractiveReply {
        id: String,
        #[serde(default)]
        title: Option<String>,
    },
    Media {
        media_id: String,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        caption: Option<String>,
    },
    FormResponse(FormCompletion),
}

/// 托管表单完成回调
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormCompletion {
    pub correlation_token: String,
    #[serde(default)]
    pub field_values: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    InteractiveReply,
    Media,
    FormResponse,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Text => "text",
            EventKind::InteractiveReply => "interactive_reply",
            EventKind::Media => "media",
            EventKind::FormResponse => "form_response",
        }
    }
}

impl InboundEvent {
    pub fn new(contact_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            contact_id: contact_id.into(),
            contact_name: None,
            event_id: None,
            payload,
        }
    }

    pub fn text(contact_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(contact_id, EventPayload::Text { body: body.into() })
    }

    pub fn reply(contact_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(
            contact_id,
            EventPayload::InteractiveReply {
                id: id.into(),
                title: None,
            },
        )
    }

    pub fn media(
        contact_id: impl Into<String>,
        media_id: impl Into<String>,
        mime_type: Option<&str>,
    ) -> Self {
        Self::new(
            contact_id,
            EventPayload::Media {
                media_id: media_id.into(),
                mime_type: mime_type.map(str::to_string),
                caption: None,
            },
        )
    }

    pub fn form(
        contact_id: impl Into<String>,
        correlation_token: impl Into<String>,
        field_values: Map<String, Value>,
    ) -> Self {
        Self::new(
            contact_id,
            EventPayload::FormResponse(FormCompletion {
                correlation_token: correlation_token.into(),
                field_values,
            }),
        )
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_contact_name(mut self, name: impl Into<String>) -> Self {
        self.contact_name = Some(name.into());
        self
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::Text { .. } => EventKind::Text,
            EventPayload::InteractiveReply { .. } => EventKind::InteractiveReply,
            EventPayload::Media { .. } => EventKind::Media,
            EventPayload::FormResponse(_) => EventKind::FormResponse,
        }
    }

    /// 纯文本内容（仅 text 事件）
    pub fn text_body(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Text { body } => Some(body.as_str()),
            _ => None,
        }
    }

    pub fn reply_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::InteractiveReply { id, .. } => Some(id.as_str()),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Media { mime_type, .. } => mime_type.as_deref(),
            _ => None,
        }
    }

    /// 模板中 `message` 根变量的内容
    pub fn summary(&self) -> Value {
        let mut summary = json!({ "type": self.kind().as_str() });
        let extra = match &self.payload {
            EventPayload::Text { body } => json!({ "text": body }),
            EventPayload::InteractiveReply { id, title } => {
                json!({ "reply_id": id, "title": title })
            }
            EventPayload::Media {
                media_id,
                mime_type,
                caption,
            } => json!({ "media_id": media_id, "mime_type": mime_type, "caption": caption }),
            EventPayload::FormResponse(completion) => {
                json!({ "field_values": completion.field_values })
            }
        };
        if let (Value::Object(target), Value::Object(extra)) = (&mut summary, extra) {
            target.extend(extra);
        }
        summary
    }
}

/// 出站消息意图，由调用方交给传输层发送
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundIntent {
    pub contact_id: String,
    pub message: MessageSpec,
}

impl OutboundIntent {
    pub fn new(contact_id: impl Into<String>, message: MessageSpec) -> Self {
        Self {
            contact_id: contact_id.into(),
            message,
        }
    }
}

/// 本次事件如何被处理
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDisposition {
    /// 无活动流程且未命中触发词
    Idle,
    /// 与上次处理的 event_id 相同
    Duplicate,
    /// 输入校验失败，已重新提示
    Reprompted,
    /// 停留在托管表单步骤，普通消息仅收到提醒
    AwaitingForm,
    /// 表单回调未生效（过期或重复），仅记录审计
    Discarded,
    Processed,
}

/// 运行在某一步中止的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    NoMatchingTransition { step: String },
    ActionFailed { step: String, action: String, message: String },
    TemplateFailed { step: String, message: String },
    StepBudgetExceeded { step: String, budget: u32 },
    UnknownStep { step: String },
    FlowNotFound { flow: String },
}

/// 单个入站事件的处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventOutcome {
    pub contact_id: String,
    pub disposition: EventDisposition,
    pub flow_name: Option<String>,
    pub current_step: Option<String>,
    pub status: Option<FlowStatus>,
    pub outbound: Vec<OutboundIntent>,
    pub external_calls: Vec<ExternalCallRequest>,
    pub halt: Option<HaltReason>,
    pub steps_entered: u32,
}

impl EventOutcome {
    pub fn new(contact_id: impl Into<String>, disposition: EventDisposition) -> Self {
        Self {
            contact_id: contact_id.into(),
            disposition,
            flow_name: None,
            current_step: None,
            status: None,
            outbound: Vec::new(),
            external_calls: Vec::new(),
            halt: None,
            steps_entered: 0,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.status == Some(FlowStatus::Terminated)
    }

    /// 所有文本类消息正文，便于断言
    pub fn texts(&self) -> Vec<&str> {
        self.outbound
            .iter()
            .filter_map(|intent| match &intent.message {
                MessageSpec::Text { body, .. } => Some(body.as_str()),
                MessageSpec::Buttons { body, .. } | MessageSpec::List { body, .. } => {
                    Some(body.as_str())
                }
                MessageSpec::LaunchForm { body, .. } => Some(body.as_str()),
                _ => None,
            })
            .collect()
    }
}
