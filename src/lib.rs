//! 安全事件检索的查询 AST：构造、基于字段目录的校验，
//! 以及通过可插拔的执行后端运行查询

pub mod ast;
pub mod builder;
pub mod catalog;
pub mod config;
pub mod functions;
pub mod mock;
pub mod provider;
pub mod sql;
pub mod validator;

pub use ast::{ConstructionError, QueryAst};
pub use builder::QueryBuilder;
pub use catalog::{FieldCatalog, FieldType};
pub use config::{ConfigError, EngineConfig};
pub use functions::FunctionRegistry;
pub use mock::MockProvider;
pub use provider::{
    run_query, CancellationFlag, ExecutionError, QueryError, QueryProvider, ResultSet, Schema,
};
pub use sql::SqlProvider;
pub use validator::{FailureKind, ValidationFailure, Validator};
