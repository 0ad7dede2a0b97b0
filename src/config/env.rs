use crate::error::{ChatFlowError, Result};
use anyhow::anyhow;
use std::env;
use std::str::FromStr;

pub const ENV_DEBUG: &str = "CHATFLOW_DEBUG";
pub const ENV_STEP_BUDGET: &str = "CHATFLOW_STEP_BUDGET";
pub const ENV_LOCK_TIMEOUT_MS: &str = "CHATFLOW_LOCK_TIMEOUT_MS";
pub const ENV_FLOWS_DIR: &str = "CHATFLOW_FLOWS_DIR";
pub const ENV_REDIS_URL: &str = "CHATFLOW_REDIS_URL";

/// 环境变量配置管理
pub struct EnvConfig;

impl EnvConfig {
    /// 从环境变量获取值
    pub fn get_env(key: &str) -> Result<String> {
        env::var(key).map_err(|_| {
            ChatFlowError::Other(anyhow!(
                "环境变量 '{}' 未设置。请在 .env 文件中设置或通过环境变量传递。",
                key
            ))
        })
    }

    /// 获取可选的环境变量
    pub fn get_env_optional(key: &str) -> Option<String> {
        env::var(key).ok().filter(|value| !value.trim().is_empty())
    }

    /// 获取并解析可选的环境变量，格式错误时报错
    pub fn get_parsed<T>(key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match Self::get_env_optional(key) {
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                ChatFlowError::Other(anyhow!("环境变量 '{}' 的值 '{}' 无效: {}", key, raw, e))
            }),
            None => Ok(None),
        }
    }

    /// 检查是否启用调试模式
    pub fn is_debug_mode() -> bool {
        env::var(ENV_DEBUG).is_ok()
    }

    pub fn step_budget() -> Result<Option<u32>> {
        Self::get_parsed(ENV_STEP_BUDGET)
    }

    pub fn lock_timeout_ms() -> Result<Option<u64>> {
        Self::get_parsed(ENV_LOCK_TIMEOUT_MS)
    }

    pub fn flows_dir() -> Option<String> {
        Self::get_env_optional(ENV_FLOWS_DIR)
    }

    pub fn redis_url() -> Option<String> {
        Self::get_env_optional(ENV_REDIS_URL)
    }
}

/// 宏：简化环境变量获取
#[macro_export]
macro_rules! env_var {
    ($key:expr) => {
        $crate::config::EnvConfig::get_env($key)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_parsed_value() {
        env::set_var("CHATFLOW_TEST_BUDGET", "12");
        let parsed: Option<u32> = EnvConfig::get_parsed("CHATFLOW_TEST_BUDGET").unwrap();
        assert_eq!(parsed, Some(12));
        env::remove_var("CHATFLOW_TEST_BUDGET");
    }

    #[test]
    fn test_get_parsed_invalid() {
        env::set_var("CHATFLOW_TEST_TIMEOUT", "soon");
        let parsed: Result<Option<u64>> = EnvConfig::get_parsed("CHATFLOW_TEST_TIMEOUT");
        assert!(parsed.is_err());
        env::remove_var("CHATFLOW_TEST_TIMEOUT");
    }

    #[test]
    fn test_missing_env_is_none() {
        env::remove_var("CHATFLOW_TEST_MISSING");
        assert!(EnvConfig::get_env_optional("CHATFLOW_TEST_MISSING").is_none());
        assert!(EnvConfig::get_env("CHATFLOW_TEST_MISSING").is_err());
    }
}
