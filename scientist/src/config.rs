//! Scientist configuration (TOML)
//!
//! Resolution order for the file: explicit path, `SCIENTIST_CONFIG_PATH`, then
//! `scientist/config/scientist.toml` searched from the working directory
//! upwards. A missing file falls back to the built-in example; a file that
//! does not parse is an error.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use shared_types::DesignSpace;

use crate::actors::analysis::AnalysisSettings;
use crate::actors::director::DirectorPolicy;
use crate::actors::event_bus::EventBusConfig;
use crate::actors::executor::ExecutorSettings;
use crate::actors::planner::PlannerSettings;
use crate::llm::OpenAiSettings;
use crate::world_model::NarrativeThresholds;

pub const DEFAULT_CONFIG_PATH: &str = "scientist/config/scientist.toml";
pub const CONFIG_PATH_ENV: &str = "SCIENTIST_CONFIG_PATH";
const API_KEY_ENV: &str = "OPENAI_API_KEY";
const BUILTIN_CONFIG_TOML: &str = include_str!("../config/scientist.example.toml");

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScientistConfig {
    pub experiment: ExperimentSection,
    pub database: DatabaseSection,
    pub llm: LlmSection,
    pub design_space: DesignSpace,
    pub director: DirectorSection,
    pub bus: BusSection,
    pub executor: ExecutorSection,
    pub planner: PlannerSection,
    pub reviewer: ReviewerSection,
    pub analysis: AnalysisSection,
    pub memory: NarrativeThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentSection {
    pub budget_max: usize,
    pub max_cycles: u32,
    pub mock_mode: bool,
}

impl Default for ExperimentSection {
    fn default() -> Self {
        Self {
            budget_max: 20,
            max_cycles: 5,
            mock_mode: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: "world_model_v3.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4-turbo-preview".to_string(),
            temperature: 0.3,
            max_tokens: 4096,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorSection {
    pub max_plan_retries: u32,
    pub per_cycle_cap: usize,
    pub cycle_timeout_secs: u64,
    pub analysis_timeout_secs: u64,
}

impl Default for DirectorSection {
    fn default() -> Self {
        Self {
            max_plan_retries: 2,
            per_cycle_cap: 3,
            cycle_timeout_secs: 1800,
            analysis_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub max_in_flight: usize,
    pub history_limit: Option<usize>,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            history_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Simulated,
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub max_parallel: usize,
    pub experiment_timeout_secs: u64,
    pub runner: RunnerKind,
    pub command: Vec<String>,
    pub simulated_delay_ms: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            experiment_timeout_secs: 3600,
            runner: RunnerKind::Simulated,
            command: Vec::new(),
            simulated_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub seed: Option<u64>,
    pub use_llm: bool,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            seed: None,
            use_llm: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewerSection {
    /// Route plans through the reviewer; when off the planner approves directly
    pub enabled: bool,
    pub use_llm: bool,
}

impl Default for ReviewerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            use_llm: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    pub min_experiments: usize,
    pub pareto_top_k: usize,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            min_experiments: 3,
            pareto_top_k: 5,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl ScientistConfig {
    /// Load from `path` (or the default search), expand `${VAR}` references
    /// from the process environment and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| {
                std::env::var(CONFIG_PATH_ENV)
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .map(PathBuf::from)
            })
            .or_else(|| find_default_config_path(DEFAULT_CONFIG_PATH));

        let mut config = match path {
            Some(path) if path.is_file() => {
                let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                let config = toml::from_str(&content)
                    .map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
                tracing::info!(path = %path.display(), "Loaded scientist config");
                config
            }
            Some(path) => {
                tracing::warn!(
                    path = %path.display(),
                    "Config file not found; using built-in defaults"
                );
                Self::built_in()
            }
            None => {
                tracing::info!("No config file found; using built-in defaults");
                Self::built_in()
            }
        };

        config.resolve_secrets(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn built_in() -> Self {
        toml::from_str(BUILTIN_CONFIG_TOML).unwrap_or_else(|err| {
            tracing::error!(error = %err, "Failed to parse built-in config");
            Self::default()
        })
    }

    /// Expand `${VAR}` in `llm.api_key`; fall back to `OPENAI_API_KEY`.
    pub fn resolve_secrets<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let configured = self
            .llm
            .api_key
            .as_deref()
            .map(|raw| expand_env(raw, &lookup))
            .filter(|key| !key.trim().is_empty());
        self.llm.api_key = configured.or_else(|| lookup(API_KEY_ENV).filter(|k| !k.trim().is_empty()));
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.experiment.budget_max == 0 {
            return invalid("experiment.budget_max must be positive");
        }
        if self.director.per_cycle_cap == 0 {
            return invalid("director.per_cycle_cap must be positive");
        }
        if self.director.cycle_timeout_secs == 0 || self.director.analysis_timeout_secs == 0 {
            return invalid("director timeouts must be positive");
        }
        if self.bus.max_in_flight == 0 {
            return invalid("bus.max_in_flight must be positive");
        }
        if self.executor.max_parallel == 0 {
            return invalid("executor.max_parallel must be positive");
        }
        if self.executor.experiment_timeout_secs == 0 {
            return invalid("executor.experiment_timeout_secs must be positive");
        }
        if self.executor.runner == RunnerKind::Command && self.executor.command.is_empty() {
            return invalid("executor.command is required when executor.runner = \"command\"");
        }
        if self.design_space.size() == 0 {
            return invalid("design_space has an empty axis");
        }
        if self.design_space.sensor_noise.min > self.design_space.sensor_noise.max {
            return invalid("design_space.sensor_noise.min exceeds max");
        }
        Ok(())
    }

    // ─── Component settings ──────────────────────────────────────────────────

    pub fn director_policy(&self) -> DirectorPolicy {
        DirectorPolicy {
            budget_max: self.experiment.budget_max,
            max_cycles: self.experiment.max_cycles,
            max_plan_retries: self.director.max_plan_retries,
            per_cycle_cap: self.director.per_cycle_cap,
        }
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.director.cycle_timeout_secs)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.director.analysis_timeout_secs)
    }

    pub fn bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            max_in_flight: self.bus.max_in_flight,
            history_limit: self.bus.history_limit,
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            max_parallel: self.executor.max_parallel,
            experiment_timeout: Duration::from_secs(self.executor.experiment_timeout_secs),
        }
    }

    pub fn planner_settings(&self) -> PlannerSettings {
        PlannerSettings {
            seed: self.planner.seed,
            use_llm: self.planner.use_llm,
        }
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            min_experiments: self.analysis.min_experiments,
            pareto_top_k: self.analysis.pareto_top_k,
        }
    }

    /// `None` in mock mode or without an API key.
    pub fn openai_settings(&self) -> Option<OpenAiSettings> {
        if self.experiment.mock_mode {
            return None;
        }
        let api_key = self.llm.api_key.clone()?;
        Some(OpenAiSettings {
            base_url: self.llm.base_url.clone(),
            api_key,
            model: self.llm.model.clone(),
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
            timeout: Duration::from_secs(self.llm.timeout_secs),
        })
    }
}

fn env_ref_re() -> Option<&'static Regex> {
    static ENV_REF: OnceLock<Option<Regex>> = OnceLock::new();
    ENV_REF
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
}

/// Replace each `${VAR}` with `lookup(VAR)`, or the empty string when unset.
pub fn expand_env<F>(raw: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match env_ref_re() {
        Some(re) => re
            .replace_all(raw, |caps: &regex::Captures<'_>| {
                lookup(&caps[1]).unwrap_or_default()
            })
            .into_owned(),
        None => raw.to_string(),
    }
}

fn find_default_config_path(relative_path: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;
    loop {
        let candidate = current.join(relative_path);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            break;
        }
    }
    None
}
