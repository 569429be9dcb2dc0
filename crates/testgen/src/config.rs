//! Runtime configuration for the generator.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (applied by `main`)
//! 2. Environment variables (`OPENAI_API_URL`, `OPENAI_API_KEY`, `TESTGEN_*`)
//! 3. Optional TOML file passed with `--config`
//! 4. Built-in defaults
//!
//! The credential and base address have no defaults: `validate()` fails
//! with `GenerationError::Configuration` when either is missing, before any
//! work is dispatched.

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::GenerationError;

/// Default model alias served by text-generation-inference.
const DEFAULT_MODEL: &str = "tgi";
/// Total tokens (prompt + completion) the endpoint accepts per request.
const DEFAULT_HARD_CAP: usize = 7_800;
/// In-flight completion requests.
const DEFAULT_MAX_PARALLEL_WORKERS: usize = 4;
const DEFAULT_EXAMPLES_DIR: &str = "pkg";
const DEFAULT_TOKENIZER_PATH: &str = "tokenizer.json";

const ENV_BASE_URL: &str = "OPENAI_API_URL";
const ENV_API_KEY: &str = "OPENAI_API_KEY";
const ENV_MODEL: &str = "TESTGEN_MODEL";
const ENV_TOKENIZER: &str = "TESTGEN_TOKENIZER";
const ENV_MAX_PARALLEL: &str = "TESTGEN_MAX_PARALLEL";
const ENV_HARD_CAP: &str = "TESTGEN_HARD_CAP";

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL including the `/v1` prefix, e.g. `http://tgi:8080/v1`.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Budget and concurrency limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub hard_cap: usize,
    pub max_parallel_workers: usize,
    /// Extra instruction appended to every user prompt.
    pub constraint: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            hard_cap: DEFAULT_HARD_CAP,
            max_parallel_workers: DEFAULT_MAX_PARALLEL_WORKERS,
            constraint: crate::prompts::DEFAULT_CONSTRAINT.to_string(),
        }
    }
}

/// Local artifacts the pipeline reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Holds `<category>/code.go` and `<category>/test.go`.
    pub examples_dir: PathBuf,
    /// HuggingFace `tokenizer.json` matching the served model.
    pub tokenizer: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            examples_dir: PathBuf::from(DEFAULT_EXAMPLES_DIR),
            tokenizer: PathBuf::from(DEFAULT_TOKENIZER_PATH),
        }
    }
}

/// Top-level generator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub endpoint: EndpointConfig,
    pub generation: GenerationConfig,
    pub paths: PathsConfig,
}

impl GeneratorConfig {
    /// Defaults, then the optional TOML file, then environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self, GenerationError> {
        let mut config = match file {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, GenerationError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GenerationError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
            .map_err(|e| GenerationError::Configuration(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    fn apply_env(&mut self) -> Result<(), GenerationError> {
        self.apply_overrides(|name| env::var(name).ok())
    }

    /// Apply `OPENAI_*` / `TESTGEN_*` overrides from `lookup`.
    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), GenerationError> {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.endpoint.base_url = Some(url);
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.endpoint.api_key = Some(key);
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.endpoint.model = model;
        }
        if let Some(path) = lookup(ENV_TOKENIZER) {
            self.paths.tokenizer = PathBuf::from(path);
        }
        if let Some(n) = parse_usize(ENV_MAX_PARALLEL, lookup(ENV_MAX_PARALLEL))? {
            self.generation.max_parallel_workers = n;
        }
        if let Some(n) = parse_usize(ENV_HARD_CAP, lookup(ENV_HARD_CAP))? {
            self.generation.hard_cap = n;
        }
        Ok(())
    }

    /// Check required fields and limits.
    pub fn validate(&self) -> Result<(), GenerationError> {
        match self.endpoint.base_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {}
            _ => {
                return Err(GenerationError::Configuration(format!(
                    "{ENV_BASE_URL} is not set"
                )))
            }
        }
        match self.endpoint.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => {}
            _ => {
                return Err(GenerationError::Configuration(format!(
                    "{ENV_API_KEY} is not set"
                )))
            }
        }
        if self.endpoint.model.trim().is_empty() {
            return Err(GenerationError::Configuration(
                "model name must not be empty".to_string(),
            ));
        }
        if self.generation.hard_cap == 0 {
            return Err(GenerationError::Configuration(
                "hard_cap must be > 0".to_string(),
            ));
        }
        if self.generation.max_parallel_workers == 0 {
            return Err(GenerationError::Configuration(
                "max_parallel_workers must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_usize(name: &str, value: Option<String>) -> Result<Option<usize>, GenerationError> {
    value
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| GenerationError::Configuration(format!("{name}={raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> GeneratorConfig {
        let mut cfg = GeneratorConfig::default();
        cfg.endpoint.base_url = Some("http://localhost:8080/v1".into());
        cfg.endpoint.api_key = Some("secret".into());
        cfg
    }

    #[test]
    fn defaults_match_endpoint_limits() {
        let cfg = GeneratorConfig::default();
        assert_eq!(cfg.generation.hard_cap, 7_800);
        assert_eq!(cfg.generation.max_parallel_workers, 4);
        assert_eq!(cfg.endpoint.model, "tgi");
        assert_eq!(cfg.paths.examples_dir, PathBuf::from("pkg"));
    }

    #[test]
    fn configured_validates() {
        configured().validate().expect("configured defaults should be valid");
    }

    #[test]
    fn missing_credential_rejected() {
        let mut cfg = configured();
        cfg.endpoint.api_key = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn missing_base_url_rejected() {
        let mut cfg = configured();
        cfg.endpoint.base_url = Some("  ".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_parallelism_rejected() {
        let mut cfg = configured();
        cfg.generation.max_parallel_workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let cfg = GeneratorConfig::from_toml_str(
            r#"
            [endpoint]
            base_url = "http://tgi:8080/v1"

            [generation]
            max_parallel_workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.endpoint.base_url.as_deref(), Some("http://tgi:8080/v1"));
        assert_eq!(cfg.endpoint.model, "tgi");
        assert_eq!(cfg.generation.max_parallel_workers, 8);
        assert_eq!(cfg.generation.hard_cap, 7_800);
        assert_eq!(cfg.paths.tokenizer, PathBuf::from("tokenizer.json"));
    }

    fn vars<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn env_overrides_toml() {
        let mut cfg = GeneratorConfig::from_toml_str(
            r#"
            [endpoint]
            base_url = "http://from-file:8080/v1"
            model = "file-model"

            [generation]
            max_parallel_workers = 8
            hard_cap = 4000
            "#,
        )
        .unwrap();

        cfg.apply_overrides(vars(&[
            (ENV_BASE_URL, "http://from-env:9090/v1"),
            (ENV_API_KEY, "env-key"),
            (ENV_MAX_PARALLEL, " 2 "),
            (ENV_TOKENIZER, "/models/deepseek/tokenizer.json"),
        ]))
        .unwrap();

        assert_eq!(cfg.endpoint.base_url.as_deref(), Some("http://from-env:9090/v1"));
        assert_eq!(cfg.endpoint.api_key.as_deref(), Some("env-key"));
        assert_eq!(cfg.generation.max_parallel_workers, 2);
        assert_eq!(
            cfg.paths.tokenizer,
            PathBuf::from("/models/deepseek/tokenizer.json")
        );
        // Unset variables leave file values alone.
        assert_eq!(cfg.endpoint.model, "file-model");
        assert_eq!(cfg.generation.hard_cap, 4_000);
        cfg.validate().unwrap();
    }

    #[test]
    fn non_numeric_parallelism_is_configuration_error() {
        let mut cfg = configured();
        let err = cfg
            .apply_overrides(vars(&[(ENV_MAX_PARALLEL, "four")]))
            .unwrap_err();
        assert!(matches!(err, GenerationError::Configuration(_)));
        assert!(err.to_string().contains(ENV_MAX_PARALLEL));
        assert_eq!(cfg.generation.max_parallel_workers, 4);
    }

    #[test]
    fn negative_hard_cap_is_configuration_error() {
        let mut cfg = configured();
        let err = cfg
            .apply_overrides(vars(&[(ENV_HARD_CAP, "-1")]))
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
