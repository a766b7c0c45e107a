//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{AgentConfig, OrchestratorSettings, ValidationMode};
use crate::llm::ModelOptions;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub orchestrator: OrchestratorSection,
    pub validation: ValidationSection,
}

/// [app] 段
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择、模型与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；没有对应 API Key 时退回 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    /// 传输/限流错误的重试次数，0 表示不重试
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: crate::llm::DEEPSEEK_CHAT.to_string(),
            base_url: None,
            temperature: None,
            max_retries: 2,
            retry_base_delay_ms: 500,
        }
    }
}

/// [agent] 段：主智能体
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub name: String,
    pub instructions: String,
    pub max_steps: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
            instructions: String::new(),
            max_steps: 10,
        }
    }
}

/// [orchestrator] 段：等待超时（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub task_timeout_secs: u64,
    pub sub_agent_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            task_timeout_secs: 600,
            sub_agent_timeout_secs: 300,
        }
    }
}

/// [validation] 段：代码执行前的校验方式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub mode: ValidationMode,
    /// judge 模式使用的模型，未设置时沿用 [llm].model
    pub judge_model: Option<String>,
    /// judge 评分（0-10）达到该值才自动放行
    pub approve_threshold: u8,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            mode: ValidationMode::Auto,
            judge_model: None,
            approve_threshold: 7,
        }
    }
}

impl AppConfig {
    /// 由 [agent] + [llm] 组装主智能体配置（工具与子智能体由调用方追加）
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig::new(&self.agent.name)
            .instructions(&self.agent.instructions)
            .model(&self.llm.model)
            .max_steps(self.agent.max_steps)
            .options(ModelOptions {
                temperature: self.llm.temperature,
            })
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            task_timeout: Duration::from_secs(self.orchestrator.task_timeout_secs),
            sub_agent_timeout: Duration::from_secs(self.orchestrator.sub_agent_timeout_secs),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, ignored", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_steps, 10);
        assert_eq!(cfg.validation.mode, ValidationMode::Auto);
        assert_eq!(cfg.orchestrator_settings().task_timeout, Duration::from_secs(600));
        assert_eq!(cfg.agent_config().max_steps, 10);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nname = \"calc\"\nmax_steps = 3\n\n[validation]\nmode = \"judge\"\napprove_threshold = 9\n\n[llm]\nprovider = \"mock\""
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.name, "calc");
        assert_eq!(cfg.agent.max_steps, 3);
        assert_eq!(cfg.validation.mode, ValidationMode::Judge);
        assert_eq!(cfg.validation.approve_threshold, 9);
        assert_eq!(cfg.llm.provider, "mock");
        // 未出现的键保持默认
        assert_eq!(cfg.orchestrator.sub_agent_timeout_secs, 300);
    }
}
