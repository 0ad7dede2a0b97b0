// 联系人状态模块

mod context;
mod model;
mod store;

pub use context::FlowContext;
pub use model::{
    ContactFlowState, FlowStatus, SuspensionDisposition, SuspensionKind, SuspensionRecord,
};
#[cfg(feature = "redis-store")]
pub use store::redis::RedisContactStore;
pub use store::{ContactLock, ContactStateStore, MemoryContactStore};
