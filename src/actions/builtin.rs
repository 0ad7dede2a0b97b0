// 内置动作：上下文赋值、业务实体查询/写入、群组通知、跨流程切换、人工接管

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::records::{BusinessStore, Record, RecordQuery};
use super::{
    root_of, ActionCall, ActionHandler, ActionResult, ExternalCallRequest, FlowSwitchRequest,
    RecordOperation,
};
use crate::error::{ChatFlowError, Result};

fn param_root(params: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .find_map(|key| params.get(*key).and_then(Value::as_str))
        .filter(|path| !path.trim().is_empty())
        .map(|path| vec![root_of(path.trim())])
        .unwrap_or_default()
}

/// `set_context_variable`
pub struct SetContextVariableAction;

#[async_trait]
impl ActionHandler for SetContextVariableAction {
    fn name(&self) -> &'static str {
        "set_context_variable"
    }

    async fn execute(&self, call: ActionCall<'_>) -> Result<ActionResult> {
        let variable = call.require_any_str(&["variable_name", "variable"])?;
        let value = call
            .params
            .get("value_template")
            .or_else(|| call.params.get("value"))
            .cloned()
            .unwrap_or(Value::Null);
        debug!(contact = call.contact_id, variable = %variable, "set context variable");
        Ok(ActionResult::new().set(variable, value))
    }

    fn declared_writes(&self, params: &Map<String, Value>) -> Vec<String> {
        param_root(params, &["variable_name", "variable"])
    }
}

/// `query_records`：按过滤条件查询业务实体，结果列表写入 `variable_name`
pub struct QueryRecordsAction {
    store: Arc<dyn BusinessStore>,
}

impl QueryRecordsAction {
    pub fn new(store: Arc<dyn BusinessStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionHandler for QueryRecordsAction {
    fn name(&self) -> &'static str {
        "query_records"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["query_model"]
    }

    async fn execute(&self, call: ActionCall<'_>) -> Result<ActionResult> {
        let entity = call.require_any_str(&["entity", "model_name"])?;
        let variable = call.require_any_str(&["variable_name", "save_to_variable"])?;

        let mut query = RecordQuery::new(entity);
        query.filters = call.object(&["filters_template", "filters"]);
        query.fields = call.strings("fields_to_return");
        query.limit = call.opt_u32("limit").map(|limit| limit as usize);
        query.order_by = call.strings("order_by");

        let rows = self.store.query(&query).await?;
        debug!(
            contact = call.contact_id,
            entity = %query.entity,
            rows = rows.len(),
            "records queried"
        );
        let rows = rows.into_iter().map(Value::Object).collect();
        Ok(ActionResult::new().set(variable, Value::Array(rows)))
    }

    fn declared_writes(&self, params: &Map<String, Value>) -> Vec<String> {
        param_root(params, &["variable_name", "save_to_variable"])
    }
}

/// `create_record`
///
/// `unique_on` 先按给定字段查重，已存在时直接返回现有记录；
/// `deferred: true` 不落库，而是交由调用方执行写入。
pub struct CreateRecordAction {
    store: Arc<dyn BusinessStore>,
}

impl CreateRecordAction {
    pub fn new(store: Arc<dyn BusinessStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionHandler for CreateRecordAction {
    fn name(&self) -> &'static str {
        "create_record"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["create_model_instance"]
    }

    async fn execute(&self, call: ActionCall<'_>) -> Result<ActionResult> {
        let entity = call.require_any_str(&["entity", "model_name"])?;
        let fields = call.object(&["fields_template", "fields"]);
        let save_to = call.opt_str("save_to_variable");

        if call.flag("deferred") {
            return Ok(ActionResult::new().call(ExternalCallRequest::RecordWrite {
                entity,
                operation: RecordOperation::Create,
                record_id: None,
                fields,
            }));
        }

        let unique_on = call.strings("unique_on");
        if !unique_on.is_empty() {
            let mut query = RecordQuery::new(entity.clone());
            for key in &unique_on {
                let value = fields.get(key).cloned().ok_or_else(|| {
                    ChatFlowError::action(
                        self.name(),
                        format!("unique_on field `{}` missing from fields", key),
                    )
                })?;
                query = query.filter(key.clone(), value);
            }
            query.limit = Some(1);
            if let Some(existing) = self.store.query(&query).await?.into_iter().next() {
                debug!(contact = call.contact_id, entity = %entity, "record already exists");
                return Ok(save_record(ActionResult::new(), save_to, existing));
            }
        }

        let record = self.store.create(&entity, fields).await?;
        info!(contact = call.contact_id, entity = %entity, "record created");
        Ok(save_record(ActionResult::new(), save_to, record))
    }

    fn declared_writes(&self, params: &Map<String, Value>) -> Vec<String> {
        param_root(params, &["save_to_variable"])
    }
}

fn save_record(result: ActionResult, save_to: Option<String>, record: Record) -> ActionResult {
    match save_to {
        Some(variable) => result.set(variable, Value::Object(record)),
        None => result,
    }
}

/// `update_record`
pub struct UpdateRecordAction {
    store: Arc<dyn BusinessStore>,
}

impl UpdateRecordAction {
    pub fn new(store: Arc<dyn BusinessStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionHandler for UpdateRecordAction {
    fn name(&self) -> &'static str {
        "update_record"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["update_model_instance"]
    }

    async fn execute(&self, call: ActionCall<'_>) -> Result<ActionResult> {
        let entity = call.require_any_str(&["entity", "model_name"])?;
        let record_id = call.require_any_str(&["record_id", "instance_id"])?;
        let fields = call.object(&["fields_template", "fields"]);
        let save_to = call.opt_str("save_to_variable");

        if call.flag("deferred") {
            return Ok(ActionResult::new().call(ExternalCallRequest::RecordWrite {
                entity,
                operation: RecordOperation::Update,
                record_id: Some(record_id),
                fields,
            }));
        }

        let record = self.store.update(&entity, &record_id, fields).await?;
        info!(contact = call.contact_id, entity = %entity, record = %record_id, "record updated");
        Ok(save_record(ActionResult::new(), save_to, record))
    }

    fn declared_writes(&self, params: &Map<String, Value>) -> Vec<String> {
        param_root(params, &["save_to_variable"])
    }
}

/// `send_group_notification`
pub struct SendGroupNotificationAction;

#[async_trait]
impl ActionHandler for SendGroupNotificationAction {
    fn name(&self) -> &'static str {
        "send_group_notification"
    }

    async fn execute(&self, call: ActionCall<'_>) -> Result<ActionResult> {
        let group_names = call.strings("group_names");
        if group_names.is_empty() {
            return Err(ChatFlowError::action(self.name(), "no group_names configured"));
        }
        let template_name = call.require_str("template_name")?;
        Ok(ActionResult::new().call(ExternalCallRequest::GroupNotification {
            contact_id: call.contact_id.to_string(),
            group_names,
            template_name,
            template_context: call.object(&["template_context"]),
        }))
    }
}

/// `switch_flow` 动作：步骤结束后由引擎切换流程
pub struct SwitchFlowAction;

#[async_trait]
impl ActionHandler for SwitchFlowAction {
    fn name(&self) -> &'static str {
        "switch_flow"
    }

    async fn execute(&self, call: ActionCall<'_>) -> Result<ActionResult> {
        let target_flow = call.require_any_str(&["target_flow_name", "flow_name"])?;
        Ok(ActionResult::new().switch_to(FlowSwitchRequest {
            target_flow,
            initial_context: call.object(&["initial_context_template", "initial_context"]),
        }))
    }

    fn declared_writes(&self, params: &Map<String, Value>) -> Vec<String> {
        ["initial_context_template", "initial_context"]
            .iter()
            .find_map(|key| params.get(*key).and_then(Value::as_object))
            .map(|map| map.keys().map(|key| root_of(key)).collect())
            .unwrap_or_default()
    }
}

/// `request_human_handover`
pub struct RequestHumanHandoverAction;

#[async_trait]
impl ActionHandler for RequestHumanHandoverAction {
    fn name(&self) -> &'static str {
        "request_human_handover"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["human_handover"]
    }

    async fn execute(&self, call: ActionCall<'_>) -> Result<ActionResult> {
        Ok(ActionResult::new().call(ExternalCallRequest::HumanHandover {
            contact_id: call.contact_id.to_string(),
            flow: call.flow.to_string(),
            step: call.step.to_string(),
            reason: call.opt_str("reason"),
        }))
    }
}
