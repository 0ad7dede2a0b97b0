//! 托管表单挂起适配器
//!
//! 进入 `send_external_form` 时签发关联令牌并记录在 `_form` 中；
//! 完成回调必须携带同一令牌且联系人仍停在该步骤才会生效，
//! 过期、重复或不匹配的回调只写审计记录。

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::flow::constants::context_keys;
use crate::flow::{Flow, StepKind};
use crate::state::{ContactFlowState, FlowContext, SuspensionDisposition};

/// 由联系人、流程、步骤、签发序号与签发时间派生的关联令牌
///
/// 重新开始的流程序号会归零，签发时间保证新旧令牌不同。
pub fn correlation_token(
    contact_id: &str,
    flow: &str,
    step: &str,
    seq: u64,
    issued_at: DateTime<Utc>,
) -> String {
    let nanos = issued_at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| issued_at.timestamp_micros());
    let digest =
        Sha256::digest(format!("{}:{}:{}:{}:{}", contact_id, flow, step, seq, nanos).as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..16])
}

/// 等待中的表单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingForm {
    pub token: String,
    pub step: String,
    pub form_id: String,
    pub seq: u64,
    pub issued_at: DateTime<Utc>,
}

impl PendingForm {
    pub fn from_context(context: &FlowContext) -> Option<Self> {
        serde_json::from_value(context.get(context_keys::FORM)?.clone()).ok()
    }

    /// 签发新令牌并写入上下文；旧的完成标记一并清除
    pub(crate) fn issue(
        context: &mut FlowContext,
        contact_id: &str,
        flow: &str,
        step: &str,
        form_id: &str,
    ) -> Self {
        let seq = context
            .get(context_keys::FORM_SEQ)
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        let issued_at = Utc::now();
        let pending = PendingForm {
            token: correlation_token(contact_id, flow, step, seq, issued_at),
            step: step.to_string(),
            form_id: form_id.to_string(),
            seq,
            issued_at,
        };
        context.insert(context_keys::FORM_SEQ, Value::from(seq));
        context.remove(context_keys::FORM_RESPONSE_RECEIVED);
        if let Ok(value) = serde_json::to_value(&pending) {
            context.insert(context_keys::FORM, value);
        }
        pending
    }
}

/// 判断一次完成回调能否应用到当前状态
pub(crate) fn disposition(
    state: Option<&ContactFlowState>,
    flow: Option<&Flow>,
    token: &str,
) -> SuspensionDisposition {
    let (Some(state), Some(flow)) = (state, flow) else {
        return SuspensionDisposition::NoActiveFlow;
    };
    let at_form_step = flow
        .step(&state.current_step)
        .map(|step| matches!(step.kind, StepKind::ExternalForm(_)))
        .unwrap_or(false);
    let pending = PendingForm::from_context(&state.context);
    match pending {
        Some(pending) if at_form_step && pending.step == state.current_step => {
            if pending.token == token {
                SuspensionDisposition::Applied
            } else {
                SuspensionDisposition::TokenMismatch
            }
        }
        _ => SuspensionDisposition::StepMismatch,
    }
}

/// 应用表单字段：同时写入平铺键与命名空间，并设置完成标记
pub(crate) fn apply_completion(
    context: &mut FlowContext,
    namespace: &str,
    field_values: &Map<String, Value>,
) {
    for (field, value) in field_values {
        if field.starts_with('_') {
            continue;
        }
        context.set_path(field, value.clone());
    }
    let mut scoped = context
        .get(namespace)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    scoped.extend(field_values.clone());
    context.insert(namespace, Value::Object(scoped));
    context.insert(context_keys::FORM_RESPONSE_RECEIVED, Value::Bool(true));
    context.remove(context_keys::FORM);
}
