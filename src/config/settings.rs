use super::env::EnvConfig;
use crate::error::{ChatFlowError, Result};
use crate::flow::constants::defaults;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 引擎运行参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 单个入站事件内最多进入的步骤数
    pub step_budget: u32,
    pub lock_timeout_ms: u64,
    pub otp_cancel_keywords: Vec<String>,
    pub form_response_namespace: String,
    pub generic_error_text: String,
    pub handover_text: String,
    pub form_reminder_text: Option<String>,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            step_budget: defaults::STEP_BUDGET,
            lock_timeout_ms: defaults::LOCK_TIMEOUT_MS,
            otp_cancel_keywords: defaults::OTP_CANCEL_KEYWORDS
                .iter()
                .map(|keyword| keyword.to_string())
                .collect(),
            form_response_namespace: defaults::FORM_RESPONSE_NAMESPACE.to_string(),
            generic_error_text: defaults::GENERIC_ERROR_TEXT.to_string(),
            handover_text: defaults::HANDOVER_TEXT.to_string(),
            form_reminder_text: Some(defaults::FORM_REMINDER_TEXT.to_string()),
            idle_timeout_secs: None,
        }
    }
}

impl EngineSettings {
    /// 从 JSON 文件加载，缺失字段使用默认值
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ChatFlowError::Other(anyhow!("无法读取配置文件 {}: {}", path.display(), e))
        })?;
        let settings: EngineSettings = serde_json::from_str(&raw)?;
        settings.validated()
    }

    /// 默认值叠加环境变量
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(budget) = EnvConfig::step_budget()? {
            self.step_budget = budget;
        }
        if let Some(timeout) = EnvConfig::lock_timeout_ms()? {
            self.lock_timeout_ms = timeout;
        }
        self.validated()
    }

    pub fn validated(self) -> Result<Self> {
        if self.step_budget == 0 {
            return Err(ChatFlowError::Other(anyhow!("step_budget 必须大于 0")));
        }
        if self.form_response_namespace.trim().is_empty() {
            return Err(ChatFlowError::Other(anyhow!(
                "form_response_namespace 不能为空"
            )));
        }
        Ok(self)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// 取消关键字匹配：按空白切分后任一词命中，忽略大小写
    pub fn is_cancel_keyword(&self, text: &str) -> bool {
        text.split_whitespace().any(|word| {
            self.otp_cancel_keywords
                .iter()
                .any(|keyword| keyword.eq_ignore_ascii_case(word))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: EngineSettings = serde_json::from_str(r#"{"step_budget": 5}"#).unwrap();
        assert_eq!(settings.step_budget, 5);
        assert_eq!(settings.lock_timeout_ms, defaults::LOCK_TIMEOUT_MS);
        assert_eq!(settings.form_response_namespace, "form_data");
    }

    #[test]
    fn zero_budget_is_rejected() {
        let settings = EngineSettings {
            step_budget: 0,
            ..EngineSettings::default()
        };
        assert!(settings.validated().is_err());
    }

    #[test]
    fn cancel_keywords_ignore_case() {
        let settings = EngineSettings::default();
        assert!(settings.is_cancel_keyword("CANCEL"));
        assert!(settings.is_cancel_keyword("  Stop "));
        assert!(settings.is_cancel_keyword("please abort"));
        assert!(!settings.is_cancel_keyword("123456"));
        assert!(!settings.is_cancel_keyword("stopwatch"));
    }
}
