//! Pipeline YAML loading: `${VAR}` substitution, then `serde_yaml`.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::PipelineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing: Vec<String> = Vec::new();

    let result = ENV_VAR_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| {
            if !missing.iter().any(|m| m == var_name) {
                missing.push(var_name.to_string());
            }
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Parse a pipeline YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_pipeline_str(yaml_str: &str) -> Result<PipelineConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: PipelineConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline YAML")?;
    Ok(config)
}

/// Parse a pipeline YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("MDL_TEST_ROOT", "/mnt/lake");
        let input = "root: ${MDL_TEST_ROOT}\nbatch_size: 50";
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("/mnt/lake"));
        assert!(!result.contains("${MDL_TEST_ROOT}"));
        std::env::remove_var("MDL_TEST_ROOT");
    }

    #[test]
    fn test_multiple_env_vars() {
        std::env::set_var("MDL_TEST_A", "alpha");
        std::env::set_var("MDL_TEST_B", "beta");
        let input = "${MDL_TEST_A} and ${MDL_TEST_B}";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "alpha and beta");
        std::env::remove_var("MDL_TEST_A");
        std::env::remove_var("MDL_TEST_B");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "root: /data/lake\nbatch_size: 50";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, input);
    }

    #[test]
    fn test_missing_env_var_errors() {
        let input = "root: ${MDL_DEFINITELY_NOT_SET_12345}";
        let result = substitute_env_vars(input);
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("MDL_DEFINITELY_NOT_SET_12345"));
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let input = "${MDL_MISSING_X} and ${MDL_MISSING_Y}";
        let result = substitute_env_vars(input);
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("MDL_MISSING_X"));
        assert!(err_msg.contains("MDL_MISSING_Y"));
    }

    #[test]
    fn test_parse_pipeline_from_string() {
        std::env::set_var("MDL_TEST_LAKE_ROOT", "/srv/lake");
        std::env::set_var("MDL_TEST_STREAM", "/srv/stream.jsonl");
        let yaml = r#"
version: "1.0"
pipeline: test
source:
  path: ${MDL_TEST_STREAM}
entities:
  - name: orders
    primary_key: [OrderID]
storage:
  root: ${MDL_TEST_LAKE_ROOT}
"#;
        let config = parse_pipeline_str(yaml).unwrap();
        assert_eq!(config.storage.root, Path::new("/srv/lake"));
        assert_eq!(config.source.path, Path::new("/srv/stream.jsonl"));
        assert_eq!(config.pipeline, "test");
        std::env::remove_var("MDL_TEST_LAKE_ROOT");
        std::env::remove_var("MDL_TEST_STREAM");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        let yaml = "this is not: [valid: yaml: {{{}}}";
        let result = parse_pipeline_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_pipeline_file_not_found() {
        let result = parse_pipeline(Path::new("/nonexistent/pipeline.yaml"));
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Failed to read pipeline file"));
    }
}
