pub mod actions;
pub mod config;
pub mod error;
pub mod flow;
pub mod runtime;
pub mod state;
pub mod template;
pub mod utils;

pub use actions::{
    ActionCall, ActionHandler, ActionRegistry, ActionResult, BusinessStore, ExternalCallRequest,
    FlowSwitchRequest, InMemoryBusinessStore, PaymentGateway, RecordOperation, RecordQuery,
    SandboxPaymentGateway,
};
pub use config::{EngineSettings, EnvConfig, FlowConfig};
pub use error::{ChatFlowError, Result};
pub use flow::{
    build_registry, lint_registry, load_flows_from_dir, load_flows_from_str,
    load_flows_from_value, Condition, ConditionEvaluator, Flow, FlowRegistry, LintFinding,
    LintKind, MessageSpec, Step, StepKind, Transition,
};
pub use runtime::{
    EventDisposition, EventOutcome, EventPayload, FlowEngine, HaltReason, InboundEvent,
    OutboundIntent,
};
pub use state::{
    ContactFlowState, ContactStateStore, FlowContext, FlowStatus, MemoryContactStore,
    SuspensionDisposition, SuspensionRecord,
};
pub use template::{RenderScope, Renderer};
pub use utils::{logging, validation};
