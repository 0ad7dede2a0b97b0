// Flow 模块 - 流程图定义、条件求值与加载

pub mod conditions;
pub mod constants;
pub mod lint;
pub mod loader;
pub mod message;
pub mod registry;
pub mod steps;
pub mod types;

// 重新导出核心类型
pub use conditions::{Comparison, Condition, ConditionEvaluator};
pub use lint::{lint_registry, LintFinding, LintKind};
pub use loader::{
    build_flow, build_registry, load_flows_from_dir, load_flows_from_str, load_flows_from_value,
};
pub use message::{ButtonSpec, ListRow, ListSection, MessageSpec};
pub use registry::FlowRegistry;
pub use steps::{ActionInvocation, ActionStep, EndFlowStep, QuestionStep, StepKind, SwitchFlowStep};
pub use types::{Flow, Step, Transition};
