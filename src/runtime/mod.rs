// 运行时模块 - 事件处理引擎

mod engine;
mod processor;
mod question;
pub mod suspension;
mod types;

pub use engine::FlowEngine;
pub use suspension::{correlation_token, PendingForm};
pub use types::{
    EventDisposition, EventKind, EventOutcome, EventPayload, FormCompletion, HaltReason,
    InboundEvent, OutboundIntent,
};
