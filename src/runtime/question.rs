// question 步骤的输入校验与重试计数

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Number, Value};

use super::types::{EventPayload, InboundEvent};
use crate::config::ExpectedInput;
use crate::flow::constants::context_keys;
use crate::flow::QuestionStep;
use crate::state::FlowContext;

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$")
        .unwrap_or_else(|_| unreachable!())
});

/// 校验入站事件是否满足问题的期望类型；合法时返回要保存的值
pub(crate) fn accept(question: &QuestionStep, event: &InboundEvent) -> Option<Value> {
    let value = match question.expected {
        ExpectedInput::Text => textual(event).map(Value::from)?,
        ExpectedInput::Number => number(event.text_body()?.trim())?,
        ExpectedInput::Email => {
            let text = event.text_body()?.trim();
            if !EMAIL.is_match(text) {
                return None;
            }
            Value::from(text)
        }
        ExpectedInput::InteractiveId => Value::from(event.reply_id()?),
        ExpectedInput::Media => match &event.payload {
            EventPayload::Media {
                media_id,
                mime_type,
                caption,
            } => json!({ "media_id": media_id, "mime_type": mime_type, "caption": caption }),
            _ => return None,
        },
        ExpectedInput::Any => match &event.payload {
            EventPayload::Text { body } => Value::from(body.as_str()),
            _ => event.summary(),
        },
    };

    if let Some(pattern) = &question.pattern {
        let candidate = match &value {
            Value::String(text) => text.clone(),
            Value::Number(n) => n.to_string(),
            _ => return Some(value),
        };
        if !pattern.is_match(&candidate) {
            return None;
        }
    }
    Some(value)
}

/// 文本回复；按钮回复取标题，缺省取 id
fn textual(event: &InboundEvent) -> Option<String> {
    let text = match &event.payload {
        EventPayload::Text { body } => body.trim().to_string(),
        EventPayload::InteractiveReply { id, title } => {
            title.clone().unwrap_or_else(|| id.clone())
        }
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn number(raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Some(Value::from(int));
    }
    let float = raw.parse::<f64>().ok().filter(|n| n.is_finite())?;
    Number::from_f64(float).map(Value::Number)
}

/// 当前步骤的连续失败次数
pub(crate) fn retries(context: &FlowContext, step: &str) -> u32 {
    context
        .get(context_keys::RETRY)
        .filter(|retry| retry.get("step").and_then(Value::as_str) == Some(step))
        .and_then(|retry| retry.get("count"))
        .and_then(Value::as_u64)
        .map(|count| count as u32)
        .unwrap_or(0)
}

pub(crate) fn set_retries(context: &mut FlowContext, step: &str, count: u32) {
    context.insert(context_keys::RETRY, json!({ "step": step, "count": count }));
}

pub(crate) fn reset_retries(context: &mut FlowContext) {
    context.remove(context_keys::RETRY);
}
