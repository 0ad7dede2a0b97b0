#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use chatflow::{
    build_registry, load_flows_from_value, ActionRegistry, EngineSettings, FlowEngine,
    InMemoryBusinessStore, MemoryContactStore, SandboxPaymentGateway,
};
use serde_json::Value;

pub const CONTACT: &str = "263771234567";

pub struct Harness {
    pub engine: FlowEngine,
    pub records: Arc<InMemoryBusinessStore>,
    pub gateway: Arc<SandboxPaymentGateway>,
    pub store: Arc<MemoryContactStore>,
}

impl Harness {
    pub fn new(flows: Value) -> Result<Self> {
        Self::with_settings(flows, EngineSettings::default())
    }

    pub fn with_settings(flows: Value, settings: EngineSettings) -> Result<Self> {
        Self::build(flows, settings, SandboxPaymentGateway::default())
    }

    pub fn build(
        flows: Value,
        settings: EngineSettings,
        gateway: SandboxPaymentGateway,
    ) -> Result<Self> {
        let records = Arc::new(InMemoryBusinessStore::new());
        let gateway = Arc::new(gateway);
        let store = Arc::new(MemoryContactStore::new());
        let actions = ActionRegistry::with_builtins(records.clone(), gateway.clone());
        let registry = build_registry(load_flows_from_value(flows)?)?;
        let engine = FlowEngine::with_settings(registry, actions, store.clone(), settings)?;
        Ok(Self {
            engine,
            records,
            gateway,
            store,
        })
    }

    pub async fn context_value(&self, path: &str) -> Result<Option<Value>> {
        Ok(self
            .engine
            .contact_state(CONTACT)
            .await?
            .and_then(|state| state.context.lookup(path).cloned()))
    }
}
