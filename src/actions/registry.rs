use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::builtin::{
    CreateRecordAction, QueryRecordsAction, RequestHumanHandoverAction,
    SendGroupNotificationAction, SetContextVariableAction, SwitchFlowAction, UpdateRecordAction,
};
use super::payment::{
    CancelPaymentAction, ConfirmPaymentOtpAction, InitiatePaymentAction, PaymentGateway,
};
use super::records::BusinessStore;
use super::ActionHandler;
use crate::error::{ChatFlowError, Result};

/// 动作注册表
///
/// 启动时显式构建并注入引擎，不存在进程级的隐式注册。
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// 内置动作集合
    pub fn with_builtins(
        store: Arc<dyn BusinessStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SetContextVariableAction));
        registry.register(Arc::new(QueryRecordsAction::new(store.clone())));
        registry.register(Arc::new(CreateRecordAction::new(store.clone())));
        registry.register(Arc::new(UpdateRecordAction::new(store)));
        registry.register(Arc::new(SendGroupNotificationAction));
        registry.register(Arc::new(SwitchFlowAction));
        registry.register(Arc::new(RequestHumanHandoverAction));
        registry.register(Arc::new(InitiatePaymentAction::new(gateway.clone())));
        registry.register(Arc::new(ConfirmPaymentOtpAction::new(gateway)));
        registry.register(Arc::new(CancelPaymentAction));
        registry
    }

    /// 按名称与别名注册；同名处理器会被替换
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        debug!(action = handler.name(), "action registered");
        for alias in handler.aliases() {
            self.handlers
                .insert((*alias).to_string(), Arc::clone(&handler));
        }
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).map(Arc::clone)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ActionHandler>> {
        self.get(name)
            .ok_or_else(|| ChatFlowError::ActionNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// 已注册名称（含别名），排序后返回
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{InMemoryBusinessStore, SandboxPaymentGateway};

    #[test]
    fn builtins_resolve_by_alias() {
        let registry = ActionRegistry::with_builtins(
            Arc::new(InMemoryBusinessStore::new()),
            Arc::new(SandboxPaymentGateway::default()),
        );
        assert!(registry.contains("query_model"));
        assert_eq!(
            registry.get("create_model_instance").map(|h| h.name()),
            Some("create_record")
        );
        assert!(matches!(
            registry.resolve("send_email"),
            Err(ChatFlowError::ActionNotRegistered(_))
        ));
    }
}
