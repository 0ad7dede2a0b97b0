use std::env;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::env::ENV_DEBUG;

const DEFAULT_FILTER: &str = "chatflow=info,warn";
const DEBUG_FILTER: &str = "chatflow=debug,info";

/// 日志配置
///
/// 过滤规则优先级：显式 `filter` > `RUST_LOG` > 按 `verbose` 选择的默认值。
/// 日志统一输出到 stderr，stdout 留给 CLI 的 JSON 输出。
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub filter: Option<String>,
    /// 输出 target、文件行号与线程 id
    pub verbose: bool,
}

impl LoggingConfig {
    /// 从环境变量构建：`CHATFLOW_DEBUG` 打开 verbose
    pub fn from_env() -> Self {
        Self {
            filter: None,
            verbose: Self::is_debug(),
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = self.verbose || verbose;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        if let Some(filter) = &self.filter {
            return EnvFilter::new(filter);
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if self.verbose {
                DEBUG_FILTER
            } else {
                DEFAULT_FILTER
            })
        })
    }

    /// 安装全局 subscriber；已有 subscriber 时返回 `false`，不会 panic
    ///
    /// ```no_run
    /// use chatflow::utils::LoggingConfig;
    ///
    /// LoggingConfig::from_env().verbose(true).install();
    /// tracing::info!(contact = "263770000000", "engine started");
    /// ```
    pub fn install(&self) -> bool {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(self.verbose)
            .with_file(self.verbose)
            .with_line_number(self.verbose)
            .with_thread_ids(self.verbose);

        let installed = tracing_subscriber::registry()
            .with(self.env_filter())
            .with(fmt_layer)
            .try_init()
            .is_ok();

        if installed && self.verbose {
            tracing::debug!("调试模式已启用");
        }
        installed
    }

    /// 按环境变量初始化
    pub fn init() {
        Self::from_env().install();
    }

    /// 嵌入场景使用的固定过滤器
    pub fn init_with_filter(filter: &str) {
        Self::default().with_filter(filter).install();
    }

    /// 检查是否启用调试模式
    pub fn is_debug() -> bool {
        env::var(ENV_DEBUG).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_debug() {
        env::remove_var(ENV_DEBUG);
        assert!(!LoggingConfig::is_debug());
        assert!(!LoggingConfig::from_env().verbose);

        env::set_var(ENV_DEBUG, "1");
        assert!(LoggingConfig::is_debug());
        assert!(LoggingConfig::from_env().verbose);

        env::remove_var(ENV_DEBUG);
    }

    #[test]
    fn verbose_flag_only_turns_on() {
        let config = LoggingConfig::default().verbose(true).verbose(false);
        assert!(config.verbose);
    }

    #[test]
    fn second_install_is_refused() {
        LoggingConfig::init_with_filter("chatflow=warn");
        assert!(!LoggingConfig::default().with_filter("chatflow=warn").install());
    }
}
