use crate::error::{ChatFlowError, Result};
use anyhow::anyhow;

/// 配置验证器
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证流程名称
    pub fn validate_flow_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(ChatFlowError::Other(anyhow!("流程名称不能为空")));
        }

        if name.len() > 100 {
            return Err(ChatFlowError::Other(anyhow!(
                "流程名称过长（最多 100 字符）"
            )));
        }

        Self::validate_identifier(name, "流程名称")
    }

    /// 验证步骤名称
    pub fn validate_step_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(ChatFlowError::Other(anyhow!("步骤名称不能为空")));
        }

        Self::validate_identifier(name, "步骤名称")
    }

    /// 验证上下文变量路径，例如 `found_booking.0.tour_name`
    pub fn validate_variable_path(path: &str) -> Result<()> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ChatFlowError::Other(anyhow!(
                "变量路径 '{}' 无效，不能为空或包含空段",
                path
            )));
        }

        if path.chars().any(char::is_whitespace) {
            return Err(ChatFlowError::Other(anyhow!(
                "变量路径 '{}' 不能包含空白字符",
                path
            )));
        }

        Ok(())
    }

    /// 验证触发关键字
    pub fn validate_trigger_keyword(keyword: &str) -> Result<()> {
        if keyword.trim().is_empty() {
            return Err(ChatFlowError::Other(anyhow!("触发关键字不能为空")));
        }

        if keyword.trim() != keyword {
            tracing::warn!(keyword = %keyword, "触发关键字包含首尾空白，匹配时会被去除");
        }

        Ok(())
    }

    fn validate_identifier(value: &str, label: &str) -> Result<()> {
        if !value
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ChatFlowError::Other(anyhow!(
                "{} '{}' 包含无效字符，应该只包含字母、数字、下划线和短横线",
                label,
                value
            )));
        }

        Ok(())
    }
}
