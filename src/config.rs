use crate::error::Error;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings that feed stage inputs not produced by other stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub num_demonstrations: u32,
    pub prompt_template: String,
    pub model: String,
    pub correction_model: String,
    pub rule_groups: Vec<u32>,
    /// Per-invocation deadline for every stage; unset means no deadline.
    pub stage_timeout_secs: Option<u64>,
    /// Directory holding `<db_id>/<db_id>.sqlite` files.
    pub database_root: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_demonstrations: 5,
            prompt_template: "option_1".to_string(),
            model: "gpt-4".to_string(),
            correction_model: "gpt-4".to_string(),
            rule_groups: vec![1, 3, 4],
            stage_timeout_secs: None,
            database_root: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| Error::Configuration(format!("invalid pipeline config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_demonstrations == 0 {
            return Err(Error::Configuration(
                "num_demonstrations must be at least 1".to_string(),
            ));
        }
        if self.prompt_template.trim().is_empty() {
            return Err(Error::Configuration(
                "prompt_template must not be empty".to_string(),
            ));
        }
        if self.model.trim().is_empty() || self.correction_model.trim().is_empty() {
            return Err(Error::Configuration("model names must not be empty".to_string()));
        }
        if self.rule_groups.is_empty() {
            return Err(Error::Configuration(
                "rule_groups must name at least one group".to_string(),
            ));
        }
        if self.stage_timeout_secs == Some(0) {
            return Err(Error::Configuration(
                "stage_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.num_demonstrations, 5);
        assert_eq!(config.prompt_template, "option_1");
        assert_eq!(config.rule_groups, vec![1, 3, 4]);
        assert_eq!(config.stage_timeout(), None);
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            PipelineConfig::from_json_str(r#"{"model": "gpt-4o", "stage_timeout_secs": 30}"#)
                .unwrap();
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.correction_model, "gpt-4");
        assert_eq!(config.stage_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn rejects_invalid_values() {
        for raw in [
            r#"{"num_demonstrations": 0}"#,
            r#"{"rule_groups": []}"#,
            r#"{"model": " "}"#,
            r#"{"stage_timeout_secs": 0}"#,
            r#"{"num_demonstrations": "five"}"#,
        ] {
            let err = PipelineConfig::from_json_str(raw).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{}", raw);
        }
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"database_root": "/data/spider", "num_demonstrations": 3}}"#).unwrap();
        let config = PipelineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.num_demonstrations, 3);
        assert_eq!(config.database_root, Some(PathBuf::from("/data/spider")));

        let err = PipelineConfig::from_json_file("/nonexistent/pipeline.json").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
