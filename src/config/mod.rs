pub mod conditions;
pub mod env;
pub mod flow_config;
pub mod settings;
pub mod steps;

pub use conditions::{ConditionConfig, NumericComparisonConfig};
pub use env::EnvConfig;
pub use flow_config::{FlowConfig, StepConfig, StepType, TransitionConfig};
pub use settings::EngineSettings;
pub use steps::{
    ActionConfig, ActionStepConfig, EndFlowConfig, ExpectedInput, ExternalFormConfig,
    FallbackConfig, OtpConfig, QuestionConfig, ReplyConfig, SwitchFlowConfig,
};
