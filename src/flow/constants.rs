/// 流程相关的常量定义
///
/// 统一管理上下文簿记键、默认哨兵变量名与默认文案

/// 引擎写入上下文的簿记键（以 `_` 开头）
pub mod context_keys {
    /// question 步骤的重试计数
    pub const RETRY: &str = "_retry";
    /// 当前挂起的托管表单 `{token, step, form_id, seq}`
    pub const FORM: &str = "_form";
    /// 表单签发序号，参与关联令牌计算
    pub const FORM_SEQ: &str = "_form_seq";
    /// OTP 支付子状态机
    pub const PAYMENT: &str = "_payment";
    /// 最近一次入站事件的原始载荷
    pub const LAST_EVENT: &str = "_last_event";
    pub const LAST_EVENT_ID: &str = "_last_event_id";

    pub const FORM_RESPONSE_RECEIVED: &str = "form_response_received";
    pub const PAYMENT_CANCELLED: &str = "payment_cancelled";

    /// 渲染作用域中的引擎根变量
    pub const SCOPE_CONTACT: &str = "contact";
    pub const SCOPE_MESSAGE: &str = "message";
}

/// 支付适配器写入的哨兵变量
pub mod payment {
    pub const SUCCESS: &str = "payment_success";
    pub const FAILED: &str = "payment_failed";
    pub const ATTEMPTS_EXHAUSTED: &str = "payment_attempts_exhausted";
    pub const REFERENCE: &str = "payment_reference";
    pub const ERROR_MESSAGE: &str = "payment_error_message";
    pub const ATTEMPTS_REMAINING: &str = "payment_attempts_remaining";
    pub const OTP_REFERENCE: &str = "payment_otp_reference";

    pub const DEFAULT_CURRENCY: &str = "USD";
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
}

/// 引擎默认配置
pub mod defaults {
    pub const STEP_BUDGET: u32 = 25;
    pub const LOCK_TIMEOUT_MS: u64 = 5_000;
    pub const FORM_RESPONSE_NAMESPACE: &str = "form_data";
    pub const MAX_RETRIES: u32 = 2;
    pub const OTP_CANCEL_KEYWORDS: [&str; 4] = ["cancel", "stop", "quit", "abort"];

    pub const GENERIC_ERROR_TEXT: &str =
        "Sorry, something went wrong on our side. We've been notified and will look into it.";
    pub const HANDOVER_TEXT: &str =
        "I'm having trouble understanding. A member of our team will get back to you shortly.";
    pub const RE_PROMPT_TEXT: &str = "Sorry, that doesn't look right. Please try again.";
    pub const FORM_REMINDER_TEXT: &str =
        "Please complete the form we sent you, or send a keyword to start over.";
}
