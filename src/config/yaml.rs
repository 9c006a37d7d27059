//! YAML configuration parsing.
//!
//! Parses pipeline definitions from YAML files and checks their structure.
//! Cycles are left to the graph builder, which rejects them when the
//! pipeline is loaded.

use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::{PipelineConfig, TaskKindConfig};
use crate::tasks::interpolate;

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load a pipeline definition from a file.
    pub fn load_pipeline(path: impl AsRef<Path>) -> Result<PipelineConfig, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        let config: PipelineConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_pipeline(&config)?;
        Ok(config)
    }

    /// Parse a pipeline definition from a YAML string.
    pub fn parse_pipeline(yaml: &str) -> Result<PipelineConfig, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        Self::validate_pipeline(&config)?;
        Ok(config)
    }

    /// Validate a pipeline definition.
    fn validate_pipeline(config: &PipelineConfig) -> Result<(), ConfigError> {
        if config.id.is_empty() {
            return Err(ConfigError::MissingField("id".into()));
        }

        if config.name.is_empty() {
            return Err(ConfigError::MissingField("name".into()));
        }

        if config.groups.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "pipeline must have at least one group".into(),
            ));
        }

        if config.max_concurrent_tasks == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max_concurrent_tasks cannot be zero".into(),
            ));
        }

        let group_ids = unique_ids(config.groups.iter().map(|g| g.id.as_str()), "group")?;
        for group in &config.groups {
            check_dependencies(&group.id, &group.id, &group.depends_on, &group_ids, "group")?;

            if group.tasks.is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "group '{}' must have at least one task",
                    group.id
                )));
            }

            let task_ids = unique_ids(group.tasks.iter().map(|t| t.id.as_str()), "task")?;
            for task in &group.tasks {
                let qualified = format!("{}.{}", group.id, task.id);
                check_dependencies(&task.id, &qualified, &task.depends_on, &task_ids, "task")?;

                if task.timeout == Some(0) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' timeout cannot be zero",
                        qualified
                    )));
                }

                if let TaskKindConfig::Sql { sql, file } = &task.kind {
                    if sql.is_some() == file.is_some() {
                        return Err(ConfigError::InvalidConfig(format!(
                            "sql task '{}' needs exactly one of 'sql' or 'file'",
                            qualified
                        )));
                    }
                }

                if task.kind.needs_warehouse() && config.warehouse.is_none() {
                    return Err(ConfigError::MissingField(format!(
                        "warehouse (required by {} task '{}')",
                        task.kind.name(),
                        qualified
                    )));
                }
            }
        }

        Ok(())
    }

    /// Expand `${VAR}` references in `value` from the process environment.
    ///
    /// `field` names the setting in error messages.
    pub fn expand_env(field: &str, value: &str) -> Result<String, ConfigError> {
        interpolate(value, |name| std::env::var(name).ok()).map_err(|reason| {
            ConfigError::Interpolation {
                field: field.to_string(),
                reason,
            }
        })
    }
}

/// Reject duplicate identifiers of one kind.
fn unique_ids<'a>(
    ids: impl Iterator<Item = &'a str>,
    what: &str,
) -> Result<HashSet<&'a str>, ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(ConfigError::MissingField(format!("{} id", what)));
        }
        if !seen.insert(id) {
            return Err(ConfigError::InvalidConfig(format!(
                "duplicate {} id: {}",
                what, id
            )));
        }
    }
    Ok(seen)
}

/// Check that dependencies reference valid ids, with no self-dependencies and no duplicates.
fn check_dependencies(
    own_id: &str,
    owner: &str,
    depends_on: &[String],
    known: &HashSet<&str>,
    what: &str,
) -> Result<(), ConfigError> {
    let mut seen_deps = HashSet::new();
    for dep in depends_on {
        if dep == own_id {
            return Err(ConfigError::InvalidConfig(format!(
                "{} '{}' cannot depend on itself",
                what, owner
            )));
        }
        if !known.contains(dep.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "{} '{}' depends on unknown {} '{}'",
                what, owner, what, dep
            )));
        }
        if !seen_deps.insert(dep) {
            return Err(ConfigError::InvalidConfig(format!(
                "{} '{}' has duplicate dependency '{}'",
                what, owner, dep
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ObjectStoreConfig, StorageConfig};
    use crate::core::retry::RetryCondition;

    const MINIMAL: &str = r#"
id: dvf
name: DVF monthly load
groups:
  - id: start
    tasks:
      - id: start
        kind: noop
"#;

    #[test]
    fn test_parse_minimal_pipeline_yaml() {
        let config = YamlLoader::parse_pipeline(MINIMAL).unwrap();

        assert_eq!(config.id, "dvf");
        assert_eq!(config.groups.len(), 1);
        assert!(matches!(config.groups[0].tasks[0].kind, TaskKindConfig::Noop));
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.object_store, ObjectStoreConfig::Memory);
        assert!(config.schedule.is_none());
    }

    #[test]
    fn test_parse_pipeline_with_all_fields() {
        let yaml = r#"
id: dvf
name: DVF monthly load
schedule: "0 2 5 * *"
timezone: Europe/Paris
max_concurrent_tasks: 2
environment:
  DATABASE: DVF
  WAREHOUSE: COMPUTE_WH
storage:
  type: sqlite
  path: history.db
object_store:
  type: local
  root: /tmp/landing
warehouse:
  sql_client: ["psql", "-v", "ON_ERROR_STOP=1"]
  env:
    PGHOST: localhost
defaults:
  retry:
    max_attempts: 2
    backoff: 300
groups:
  - id: ingestion
    tasks:
      - id: fetch_to_store
        kind: ingest
        catalog_url: https://source.test/datasets/dvf
        filter:
          suffix: .zip
          keyword: valeursfoncieres
        layout:
          prefix: raw/
        retry:
          max_attempts: 3
          backoff: 600
          retry_on: transient_only
      - id: validate
        kind: validate
        depends_on: [fetch_to_store]
        prefix: raw/
        summary_from: ingestion.fetch_to_store.summary
  - id: transformation
    depends_on: [ingestion]
    tasks:
      - id: silver
        kind: command
        command: dbt run --select silver
        timeout: 7200
      - id: create_objects
        kind: sql
        file: sql/01_create_objects.sql
"#;

        let config = YamlLoader::parse_pipeline(yaml).unwrap();

        assert_eq!(config.schedule.as_deref(), Some("0 2 5 * *"));
        assert_eq!(config.timezone.as_deref(), Some("Europe/Paris"));
        assert_eq!(config.max_concurrent_tasks, Some(2));
        assert_eq!(
            config.storage,
            StorageConfig::Sqlite {
                path: "history.db".into()
            }
        );
        assert_eq!(config.defaults.retry.as_ref().unwrap().backoff, 300);

        let fetch = &config.groups[0].tasks[0];
        match &fetch.kind {
            TaskKindConfig::Ingest { filter, layout, .. } => {
                assert_eq!(filter.keyword.as_deref(), Some("valeursfoncieres"));
                assert_eq!(layout.prefix, "raw/");
                assert_eq!(layout.container_suffix, ".zip");
            }
            other => panic!("unexpected kind {:?}", other),
        }
        let retry = fetch.retry.as_ref().unwrap();
        assert_eq!(retry.retry_on, RetryCondition::TransientOnly);
        assert_eq!(retry.to_policy().total_attempts(), 4);

        let validate = &config.groups[0].tasks[1];
        match &validate.kind {
            TaskKindConfig::Validate { suffix, .. } => assert_eq!(suffix, ".txt"),
            other => panic!("unexpected kind {:?}", other),
        }

        let silver = &config.groups[1].tasks[0];
        assert_eq!(silver.timeout().unwrap().as_secs(), 7200);
        assert_eq!(config.groups[1].depends_on, vec!["ingestion"]);
    }

    #[test]
    fn test_validation_error_missing_id() {
        let yaml = MINIMAL.replace("id: dvf", "id: \"\"");
        let result = YamlLoader::parse_pipeline(&yaml);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_validation_error_no_groups() {
        let yaml = "id: dvf\nname: DVF\ngroups: []\n";
        let result = YamlLoader::parse_pipeline(yaml);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_error_unknown_kind() {
        let yaml = MINIMAL.replace("kind: noop", "kind: python");
        assert!(matches!(
            YamlLoader::parse_pipeline(&yaml),
            Err(ConfigError::YamlError(_))
        ));
    }

    #[test]
    fn test_validation_error_duplicate_task_id() {
        let yaml = r#"
id: dvf
name: DVF
groups:
  - id: g
    tasks:
      - id: a
        kind: noop
      - id: a
        kind: noop
"#;
        let err = YamlLoader::parse_pipeline(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate task id: a"));
    }

    #[test]
    fn test_validation_error_unknown_group_dependency() {
        let yaml = r#"
id: dvf
name: DVF
groups:
  - id: loading
    depends_on: [ingestion]
    tasks:
      - id: a
        kind: noop
"#;
        let err = YamlLoader::parse_pipeline(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown group 'ingestion'"));
    }

    #[test]
    fn test_validation_error_task_self_dependency() {
        let yaml = r#"
id: dvf
name: DVF
groups:
  - id: g
    tasks:
      - id: a
        kind: noop
        depends_on: [a]
"#;
        let err = YamlLoader::parse_pipeline(yaml).unwrap_err();
        assert!(err.to_string().contains("cannot depend on itself"));
    }

    #[test]
    fn test_validation_error_sql_needs_one_source() {
        let yaml = r#"
id: dvf
name: DVF
warehouse:
  sql_client: [psql]
groups:
  - id: g
    tasks:
      - id: a
        kind: sql
"#;
        let err = YamlLoader::parse_pipeline(yaml).unwrap_err();
        assert!(err.to_string().contains("exactly one of"));
    }

    #[test]
    fn test_validation_error_command_without_warehouse() {
        let yaml = r#"
id: dvf
name: DVF
groups:
  - id: g
    tasks:
      - id: silver
        kind: command
        command: dbt run
"#;
        assert!(matches!(
            YamlLoader::parse_pipeline(yaml),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_validation_error_zero_concurrency() {
        let yaml = format!("{}max_concurrent_tasks: 0\n", MINIMAL);
        assert!(matches!(
            YamlLoader::parse_pipeline(&yaml),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_expand_env() {
        // PATH is set in any test environment.
        let expanded = YamlLoader::expand_env("storage.path", "${PATH}").unwrap();
        assert!(!expanded.is_empty());

        let err =
            YamlLoader::expand_env("storage.path", "${TRIBUTARY_SURELY_UNDEFINED_VAR}").unwrap_err();
        assert!(matches!(err, ConfigError::Interpolation { .. }));
        assert!(err.to_string().contains("storage.path"));
    }

    #[test]
    fn test_load_pipeline_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = YamlLoader::load_pipeline(&path).unwrap();
        assert_eq!(config.name, "DVF monthly load");

        let missing = YamlLoader::load_pipeline(dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(ConfigError::FileReadError { .. })));
    }
}
