//! 配置模块，负责从 JSON 文件加载引擎配置

use crate::catalog::FieldCatalog;
use crate::functions::FunctionRegistry;
use crate::mock::MockConfig;
use crate::provider::Schema;
use crate::sql::SqlConfig;
use crate::validator::{ValidatorOptions, DEFAULT_MAX_DEPTH};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file does not exist: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse config {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 引擎配置，所有键均可省略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 存在时替换内置的 OCSF 字段目录
    pub catalog: Option<FieldCatalog>,
    /// 追加到内置函数注册表之上
    pub functions: FunctionRegistry,
    pub max_depth: usize,
    pub mock: MockConfig,
    pub sql: SqlConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog: None,
            functions: FunctionRegistry::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            mock: MockConfig::default(),
            sql: SqlConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(ConfigError::NotFound {
                path: path_ref.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.to_path_buf(),
            source,
        })?;

        Self::parse(&content, &path_ref.display().to_string())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Self::parse(json, "<inline>")
    }

    fn parse(json: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })?;
        if config.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth must be at least 1".into()));
        }
        Ok(config)
    }

    /// 构建各执行后端共享的只读 Schema
    pub fn schema(&self) -> Schema {
        let catalog = self
            .catalog
            .clone()
            .unwrap_or_else(FieldCatalog::ocsf_default);
        let mut functions = FunctionRegistry::builtin();
        functions.extend(self.functions.clone());
        Schema::new(catalog, functions).with_options(ValidatorOptions {
            max_depth: self.max_depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FieldRef, FunctionCall, QueryAst, QueryParts, SelectField};
    use crate::catalog::FieldType;
    use std::io::Write;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("siem_query_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_load_valid_json_config() {
        let path = temp_path("engine.json");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"{{
                "catalog": {{"process.name": "string", "src_ip": "ip_address"}},
                "functions": {{"entropy": {{"params": ["string"], "returns": "float"}}}},
                "max_depth": 8,
                "mock": {{"max_scan_rows": 10}},
                "sql": {{"table": "events", "columns": {{"process.name": "proc"}}}}
            }}"#
        )
        .unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        let schema = config.schema();
        assert_eq!(schema.catalog.len(), 2);
        assert_eq!(schema.catalog.lookup("src_ip"), Some(FieldType::IpAddress));
        assert!(schema.functions.lookup("entropy").is_some());
        assert!(schema.functions.lookup("count").is_some());
        assert_eq!(schema.options.max_depth, 8);
        assert_eq!(config.mock.max_scan_rows, 10);
        assert_eq!(config.mock.time_field, "time");
        assert_eq!(config.sql.table, "events");
        assert_eq!(config.sql.column_for("process.name"), "proc");
        assert_eq!(config.sql.column_for("user.name"), "user_name");

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_configured_function_names_are_case_insensitive() {
        let config = EngineConfig::from_json_str(
            r#"{"functions": {"Entropy": {"params": ["string"], "returns": "float"}}}"#,
        )
        .unwrap();
        let schema = config.schema();
        assert!(schema.functions.lookup("Entropy").is_some());
        assert!(schema.functions.lookup("entropy").is_some());
        assert!(schema.functions.lookup("ENTROPY").is_some());

        let call = FunctionCall::new(
            "Entropy",
            vec![FieldRef::new("process.cmd_line", FieldType::String).unwrap().into()],
            FieldType::Float,
        )
        .unwrap();
        let ast = QueryAst::from_parts(QueryParts {
            select: vec![SelectField::new(call, Some("score".into())).unwrap()],
            tenant_id: "acme".into(),
            query_id: "q".into(),
            ..Default::default()
        })
        .unwrap();
        assert!(schema.validator().validate(&ast).is_empty());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        let schema = config.schema();
        assert!(schema.catalog.contains("device.ip"));
        assert_eq!(schema.options.max_depth, DEFAULT_MAX_DEPTH);
    }

    #[test]
    fn test_invalid_json_config() {
        let path = temp_path("invalid.json");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "invalid json").unwrap();

        let err = EngineConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::from_json_file("non_existent_engine.json").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_zero_depth_rejected() {
        let err = EngineConfig::from_json_str(r#"{"max_depth": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_type_token_in_catalog() {
        let err = EngineConfig::from_json_str(r#"{"catalog": {"x": "decimal"}}"#).unwrap_err();
        assert!(err.to_string().contains("<inline>"), "{}", err);
    }
}
