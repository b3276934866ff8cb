//! 所有执行后端共用的接口
//!
//! 查询的状态流转：`Constructed -> Validated -> Executing -> Completed | Failed`。
//! 校验失败的查询进入 `Rejected`，不会到达执行后端的 `execute`。
//! [`run_query`] 负责驱动整个流程。

use crate::ast::QueryAst;
use crate::catalog::FieldCatalog;
use crate::functions::FunctionRegistry;
use crate::validator::{ValidationFailure, Validator, ValidatorOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// 一行输出：列名到值，按 select 顺序排列
pub type Row = Map<String, Value>;

/// 一次执行的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub query_id: String,
    pub rows: Vec<Row>,
    /// offset/limit 之前的匹配行数，仅非聚合查询提供
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
}

/// 执行后端归类后的执行错误
///
/// `Internal` 不携带细节，原因在发生处记录日志
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("query timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
    #[error("query was cancelled")]
    Cancelled,
    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),
    #[error("internal error")]
    Internal,
}

impl ExecutionError {
    /// 记录 `err` 及上下文，返回不含细节的 [`ExecutionError::Internal`]
    pub fn internal(context: &str, err: impl fmt::Display) -> Self {
        tracing::error!(context, error = %err, "internal execution failure");
        ExecutionError::Internal
    }

    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Unsupported(_) => "unsupported",
            ExecutionError::Timeout { .. } => "timeout",
            ExecutionError::Cancelled => "cancelled",
            ExecutionError::ResourceExceeded(_) => "resource_exceeded",
            ExecutionError::Internal => "internal",
        }
    }

    /// 调用方能否缩小范围后重新提交
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Timeout { .. } | ExecutionError::ResourceExceeded(_)
        )
    }
}

/// 调用方持有、与执行过程共享的取消标志
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ExecutionError> {
        if self.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// 显式传给执行后端的字段目录、函数注册表与校验限制
///
/// 构建一次，在并发查询之间只读共享
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub catalog: FieldCatalog,
    pub functions: FunctionRegistry,
    pub options: ValidatorOptions,
}

impl Schema {
    pub fn new(catalog: FieldCatalog, functions: FunctionRegistry) -> Self {
        Self {
            catalog,
            functions,
            options: ValidatorOptions::default(),
        }
    }

    /// 默认 OCSF 字段目录加内置函数
    pub fn ocsf() -> Self {
        Self::new(FieldCatalog::ocsf_default(), FunctionRegistry::builtin())
    }

    pub fn with_options(mut self, options: ValidatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validator(&self) -> Validator<'_> {
        Validator::new(&self.catalog, &self.functions).with_options(self.options)
    }
}

/// 执行后端
pub trait QueryProvider: Send + Sync {
    fn name(&self) -> &str;

    /// 后端特有的检查，追加在通用校验结果之后
    fn provider_checks(&self, _ast: &QueryAst, _schema: &Schema) -> Vec<ValidationFailure> {
        Vec::new()
    }

    /// 通用校验，然后是 [`QueryProvider::provider_checks`]
    fn validate(&self, ast: &QueryAst, schema: &Schema) -> Vec<ValidationFailure> {
        let mut failures = schema.validator().validate(ast);
        failures.extend(self.provider_checks(ast, schema));
        failures
    }

    /// 执行已通过 [`QueryProvider::validate`] 的查询
    ///
    /// 所有读取都必须限定在 `ast.tenant_id()` 内，
    /// 排序键相同的行必须以稳定的顺序返回
    fn execute(
        &self,
        ast: &QueryAst,
        schema: &Schema,
        cancel: &CancellationFlag,
    ) -> Result<ResultSet, ExecutionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Constructed,
    Validated,
    Rejected,
    Executing,
    Completed,
    Failed,
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryState::Constructed => "constructed",
            QueryState::Validated => "validated",
            QueryState::Rejected => "rejected",
            QueryState::Executing => "executing",
            QueryState::Completed => "completed",
            QueryState::Failed => "failed",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    #[error("query rejected with {} validation failure(s)", .0.len())]
    Rejected(Vec<ValidationFailure>),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl QueryError {
    pub fn final_state(&self) -> QueryState {
        match self {
            QueryError::Rejected(_) => QueryState::Rejected,
            QueryError::Execution(_) => QueryState::Failed,
        }
    }
}

/// 用 `provider` 校验 `ast`，没有失败项时才执行
pub fn run_query<P>(
    provider: &P,
    ast: &QueryAst,
    schema: &Schema,
    cancel: &CancellationFlag,
) -> Result<ResultSet, QueryError>
where
    P: QueryProvider + ?Sized,
{
    let span = tracing::info_span!(
        "query",
        query_id = ast.query_id(),
        tenant_id = ast.tenant_id(),
        provider = provider.name()
    );
    let _entered = span.enter();
    debug!(state = %QueryState::Constructed, "query received");

    let failures = provider.validate(ast, schema);
    if !failures.is_empty() {
        info!(state = %QueryState::Rejected, failures = failures.len(), "validation failed");
        return Err(QueryError::Rejected(failures));
    }
    debug!(state = %QueryState::Validated, "validation passed");

    debug!(state = %QueryState::Executing, "executing");
    match provider.execute(ast, schema, cancel) {
        Ok(result) => {
            info!(state = %QueryState::Completed, rows = result.rows.len(), "query completed");
            Ok(result)
        }
        Err(err) => {
            warn!(state = %QueryState::Failed, kind = err.code(), "query failed");
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::QueryParts;
    use crate::validator::FailureKind;
    use std::sync::atomic::AtomicUsize;

    /// 记录执行次数，拒绝所有带 limit 的查询
    struct CountingProvider {
        executions: AtomicUsize,
    }

    impl QueryProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        fn provider_checks(&self, ast: &QueryAst, _schema: &Schema) -> Vec<ValidationFailure> {
            match ast.limit() {
                Some(_) => vec![ValidationFailure::new(
                    "limit",
                    FailureKind::Unsupported,
                    "limit not supported",
                )],
                None => Vec::new(),
            }
        }

        fn execute(
            &self,
            ast: &QueryAst,
            _schema: &Schema,
            cancel: &CancellationFlag,
        ) -> Result<ResultSet, ExecutionError> {
            cancel.check()?;
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(ResultSet {
                query_id: ast.query_id().to_string(),
                rows: vec![],
                total_count: Some(0),
            })
        }
    }

    fn query(limit: Option<u64>) -> QueryAst {
        QueryAst::from_parts(QueryParts {
            limit,
            tenant_id: "acme".into(),
            query_id: "q-7".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_rejected_query_is_never_executed() {
        let provider = CountingProvider {
            executions: AtomicUsize::new(0),
        };
        let schema = Schema::ocsf();
        let err = run_query(&provider, &query(Some(50_000)), &schema, &CancellationFlag::new())
            .unwrap_err();
        match &err {
            QueryError::Rejected(failures) => {
                let kinds: Vec<_> = failures.iter().map(|f| f.kind).collect();
                assert_eq!(kinds, vec![FailureKind::BoundExceeded, FailureKind::Unsupported]);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(err.final_state(), QueryState::Rejected);
        assert_eq!(provider.executions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_valid_query_echoes_query_id() {
        let provider = CountingProvider {
            executions: AtomicUsize::new(0),
        };
        let result = run_query(&provider, &query(None), &Schema::ocsf(), &CancellationFlag::new())
            .unwrap();
        assert_eq!(result.query_id, "q-7");
        assert_eq!(provider.executions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_before_execution() {
        let provider = CountingProvider {
            executions: AtomicUsize::new(0),
        };
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let err = run_query(&provider, &query(None), &Schema::ocsf(), &cancel).unwrap_err();
        assert_eq!(err, QueryError::Execution(ExecutionError::Cancelled));
        assert_eq!(err.final_state(), QueryState::Failed);
    }

    #[test]
    fn test_internal_error_is_opaque() {
        let err = ExecutionError::internal("reading segment", "disk /dev/sda1 offset 0x7f failed");
        assert_eq!(err, ExecutionError::Internal);
        assert_eq!(err.to_string(), "internal error");
        assert!(!err.is_retryable());
        assert!(ExecutionError::Timeout { elapsed_ms: 10 }.is_retryable());
    }

    #[test]
    fn test_result_set_serialization() {
        let mut row = Row::new();
        row.insert("src_ip".into(), Value::from("10.0.0.1"));
        row.insert("count".into(), Value::from(2));
        let result = ResultSet {
            query_id: "q".into(),
            rows: vec![row],
            total_count: None,
        };
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"{"query_id":"q","rows":[{"src_ip":"10.0.0.1","count":2}]}"#
        );
    }
}
