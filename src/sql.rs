//! SQL 执行后端：用 sea-query 把查询编译为参数化的 PostgreSQL 语句，
//! 再交给可替换的 [`SqlBackend`] 执行

use crate::ast::{
    Condition, Direction, FieldRef, Literal, LiteralValue, LogicalOp, Operand, Operator, Predicate,
    QueryAst, RightOperand,
};
use crate::functions::FunctionRegistry;
use crate::provider::{CancellationFlag, ExecutionError, QueryProvider, ResultSet, Row, Schema};
use crate::validator::{FailureKind, ValidationFailure};
use sea_query::{
    Alias, Asterisk, Expr, Func, Iden, Keyword, LikeExpr, Order, PostgresQueryBuilder, Query,
    SelectStatement, SimpleExpr, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;
use thiserror::Error;
use tracing::debug;

/// 编译目标的表结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    pub table: String,
    pub tenant_column: String,
    pub time_column: String,
    /// 单调递增的写入序号列，排序键相同时用于确定顺序
    pub row_order_column: String,
    /// 字段名到列名的映射，未映射的字段把 `.` 替换为 `_`
    pub columns: HashMap<String, String>,
    pub supports_regex: bool,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            table: "ocsf_events".to_string(),
            tenant_column: "tenant_id".to_string(),
            time_column: "time".to_string(),
            row_order_column: "event_seq".to_string(),
            columns: HashMap::new(),
            supports_regex: true,
        }
    }
}

impl SqlConfig {
    pub fn column_for(&self, field: &str) -> String {
        self.columns
            .get(field)
            .cloned()
            .unwrap_or_else(|| field.replace('.', "_"))
    }
}

/// sea-query 使用的表名
#[derive(Debug, Clone)]
pub struct TableName(pub String);

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

/// 列名包装
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("function '{0}' has no SQL translation")]
    UnsupportedFunction(String),
    #[error("function '{0}' requires an argument")]
    MissingArgument(String),
    #[error("operator '{0}' requires a string literal pattern")]
    NonLiteralPattern(Operator),
    #[error("regular expressions are not supported by this backend")]
    RegexUnsupported,
    #[error("operator '{0}' has a malformed right operand")]
    MalformedRight(Operator),
}

impl From<CompileError> for ExecutionError {
    fn from(err: CompileError) -> Self {
        ExecutionError::Unsupported(err.to_string())
    }
}

/// 可交给驱动执行的语句：带 `$n` 占位符的 SQL 及参数值
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub values: Vec<Value>,
}

impl CompiledQuery {
    fn build(select: &SelectStatement) -> Self {
        let (sql, values) = select.build(PostgresQueryBuilder);
        Self {
            sql,
            values: values.0,
        }
    }
}

/// `having` 与 `order_by` 可见的输出列别名及其表达式
type AliasScope = HashMap<String, SimpleExpr>;

/// 把 [`QueryAst`] 翻译为 SQL
#[derive(Debug, Clone, Default)]
pub struct SqlCompiler {
    config: SqlConfig,
}

impl SqlCompiler {
    pub fn new(config: SqlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SqlConfig {
        &self.config
    }

    /// 查询是否产生分组输出（显式分组或含聚合函数）
    pub fn is_aggregating(ast: &QueryAst, functions: &FunctionRegistry) -> bool {
        ast.group_by().is_some()
            || ast
                .select()
                .iter()
                .any(|item| contains_aggregate(item.expr(), functions))
    }

    /// 编译取行查询
    pub fn compile(
        &self,
        ast: &QueryAst,
        functions: &FunctionRegistry,
    ) -> Result<CompiledQuery, CompileError> {
        let grouped = Self::is_aggregating(ast, functions);
        let group_fields: Vec<&str> = ast
            .group_by()
            .map(|g| g.fields().iter().map(FieldRef::name).collect())
            .unwrap_or_default();

        let mut select = Query::select();
        select.from(TableName(self.config.table.clone()));
        self.apply_filters(&mut select, ast)?;

        let mut aliases = AliasScope::new();
        if ast.select().is_empty() {
            select.column(Asterisk);
        }
        for item in ast.select() {
            let mut expr = self.compile_operand(item.expr(), &AliasScope::new())?;
            if let Operand::Field(field) = item.expr() {
                if grouped && !group_fields.contains(&field.name()) {
                    expr = Func::min(expr).into();
                }
            }
            if let Some(alias) = item.output_alias() {
                aliases.insert(alias.to_string(), expr.clone());
            }
            select.expr_as(expr, Alias::new(item.output_name()));
        }

        if let Some(group_by) = ast.group_by() {
            for field in group_by.fields() {
                select.group_by_col(ColumnName(self.config.column_for(field.name())));
            }
            if let Some(having) = group_by.having() {
                select.and_having(self.compile_predicate(having, &aliases)?);
            }
        }

        for order in ast.order_by() {
            let mut expr = self.compile_field(&order.field, &aliases);
            if grouped
                && !aliases.contains_key(order.field.name())
                && !group_fields.contains(&order.field.name())
            {
                expr = Func::min(expr).into();
            }
            select.order_by_expr(expr, direction(order.direction));
        }
        // 稳定的次序：普通行按写入序号，分组按分组键
        if grouped {
            for field in &group_fields {
                select.order_by(ColumnName(self.config.column_for(field)), Order::Asc);
            }
        } else {
            select.order_by(ColumnName(self.config.row_order_column.clone()), Order::Asc);
        }

        if let Some(limit) = ast.limit() {
            select.limit(limit);
        }
        if ast.offset() > 0 {
            select.offset(ast.offset());
        }

        Ok(CompiledQuery::build(&select))
    }

    /// 在相同过滤条件下编译 `SELECT COUNT(*) AS total`，忽略分页
    pub fn compile_count(&self, ast: &QueryAst) -> Result<CompiledQuery, CompileError> {
        let mut select = Query::select();
        select
            .from(TableName(self.config.table.clone()))
            .expr_as(Func::count(Expr::col(Asterisk)), Alias::new("total"));
        self.apply_filters(&mut select, ast)?;
        Ok(CompiledQuery::build(&select))
    }

    /// 依次加入租户过滤、时间窗口和 `where` 条件
    fn apply_filters(&self, select: &mut SelectStatement, ast: &QueryAst) -> Result<(), CompileError> {
        select.and_where(
            Expr::col(ColumnName(self.config.tenant_column.clone())).eq(ast.tenant_id()),
        );
        if let Some(range) = ast.time_range() {
            let time = || Expr::col(ColumnName(self.config.time_column.clone()));
            if let Some(last) = range.last {
                select.and_where(time().gte(Expr::cust(format!(
                    "NOW() - INTERVAL '{} seconds'",
                    last.as_seconds()
                ))));
            } else {
                if let Some(start) = range.start {
                    select.and_where(time().gte(start.to_string()));
                }
                if let Some(end) = range.end {
                    select.and_where(time().lte(end.to_string()));
                }
            }
        }
        if let Some(predicate) = ast.where_clause() {
            select.and_where(self.compile_predicate(predicate, &AliasScope::new())?);
        }
        Ok(())
    }

    fn compile_field(&self, field: &FieldRef, aliases: &AliasScope) -> SimpleExpr {
        match aliases.get(field.name()) {
            Some(expr) => expr.clone(),
            None => Expr::col(ColumnName(self.config.column_for(field.name()))).into(),
        }
    }

    fn compile_operand(&self, operand: &Operand, aliases: &AliasScope) -> Result<SimpleExpr, CompileError> {
        match operand {
            Operand::Field(field) => Ok(self.compile_field(field, aliases)),
            Operand::Literal(literal) => Ok(literal_expr(literal)),
            Operand::Function(call) => {
                let mut args = Vec::with_capacity(call.args().len());
                for arg in call.args() {
                    args.push(self.compile_operand(arg, aliases)?);
                }
                let name = call.name().to_lowercase();
                if name == "count" && args.is_empty() {
                    return Ok(Func::count(Expr::col(Asterisk)).into());
                }
                let Some(first) = args.into_iter().next() else {
                    return Err(CompileError::MissingArgument(call.name().to_string()));
                };
                Ok(match name.as_str() {
                    "count" => Func::count(first).into(),
                    "count_distinct" => Expr::cust_with_exprs("COUNT(DISTINCT $1)", [first]),
                    "sum" => Func::sum(first).into(),
                    "avg" => Func::avg(first).into(),
                    "min" => Func::min(first).into(),
                    "max" => Func::max(first).into(),
                    "lower" => Func::lower(first).into(),
                    "upper" => Func::upper(first).into(),
                    "length" => Expr::cust_with_exprs("CHAR_LENGTH($1)", [first]),
                    "abs" => Expr::cust_with_exprs("ABS($1)", [first]),
                    _ => return Err(CompileError::UnsupportedFunction(call.name().to_string())),
                })
            }
        }
    }

    fn compile_predicate(&self, predicate: &Predicate, aliases: &AliasScope) -> Result<SimpleExpr, CompileError> {
        match predicate {
            Predicate::Condition(condition) => self.compile_condition(condition, aliases),
            Predicate::Logical(expr) => {
                let mut children = Vec::with_capacity(expr.children().len());
                for child in expr.children() {
                    children.push(self.compile_predicate(child, aliases)?);
                }
                let mut children = children.into_iter();
                let Some(first) = children.next() else {
                    return Ok(Expr::val(true).into());
                };
                Ok(match expr.operator() {
                    LogicalOp::And => children.fold(first, |acc, e| acc.and(e)),
                    LogicalOp::Or => children.fold(first, |acc, e| acc.or(e)),
                    LogicalOp::Not => first.not(),
                })
            }
        }
    }

    fn compile_condition(&self, condition: &Condition, aliases: &AliasScope) -> Result<SimpleExpr, CompileError> {
        let left = self.compile_operand(condition.left(), aliases)?;
        let col = || Expr::expr(left.clone());
        let operator = condition.operator();

        let right = match condition.right() {
            None => {
                return match operator {
                    Operator::IsNull => Ok(col().is_null()),
                    Operator::IsNotNull => Ok(col().is_not_null()),
                    other => Err(CompileError::MalformedRight(other)),
                }
            }
            Some(RightOperand::List(items)) => {
                let values: Vec<SimpleExpr> = items.iter().map(literal_expr).collect();
                return match (operator, values.as_slice()) {
                    (Operator::In, _) => Ok(col().is_in(values)),
                    (Operator::NotIn, _) => Ok(col().is_not_in(values)),
                    (Operator::Between, [low, high]) => Ok(col().between(low.clone(), high.clone())),
                    (other, _) => Err(CompileError::MalformedRight(other)),
                };
            }
            Some(RightOperand::Single(right)) => right,
        };

        if let Some(pattern) = like_pattern(operator, right)? {
            return Ok(col().like(LikeExpr::new(pattern).escape('\\')));
        }
        let value = self.compile_operand(right, aliases)?;
        Ok(match operator {
            Operator::Eq => col().eq(value),
            Operator::Ne => col().ne(value),
            Operator::Gt => col().gt(value),
            Operator::Gte => col().gte(value),
            Operator::Lt => col().lt(value),
            Operator::Lte => col().lte(value),
            Operator::Regex => {
                if !self.config.supports_regex {
                    return Err(CompileError::RegexUnsupported);
                }
                Expr::cust_with_exprs("$1 ~ $2", [left, value])
            }
            Operator::InSubnet => {
                Expr::cust_with_exprs("CAST($1 AS INET) <<= CAST($2 AS INET)", [left, value])
            }
            other => return Err(CompileError::MalformedRight(other)),
        })
    }
}

fn direction(direction: Direction) -> Order {
    match direction {
        Direction::Asc => Order::Asc,
        Direction::Desc => Order::Desc,
    }
}

fn literal_expr(literal: &Literal) -> SimpleExpr {
    match literal.value() {
        LiteralValue::Null => SimpleExpr::Keyword(Keyword::Null),
        LiteralValue::Boolean(b) => SimpleExpr::Value(Value::Bool(Some(*b))),
        LiteralValue::Integer(i) => SimpleExpr::Value(Value::BigInt(Some(*i))),
        LiteralValue::Float(f) => SimpleExpr::Value(Value::Double(Some(*f))),
        LiteralValue::String(s) => SimpleExpr::Value(Value::String(Some(Box::new(s.clone())))),
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// 子串类运算符对应的 LIKE 模式，其他运算符返回 `None`
fn like_pattern(operator: Operator, right: &Operand) -> Result<Option<String>, CompileError> {
    if !matches!(
        operator,
        Operator::Contains | Operator::StartsWith | Operator::EndsWith
    ) {
        return Ok(None);
    }
    let needle = match right {
        Operand::Literal(lit) => match lit.value() {
            LiteralValue::String(s) => escape_like(s),
            _ => return Err(CompileError::NonLiteralPattern(operator)),
        },
        _ => return Err(CompileError::NonLiteralPattern(operator)),
    };
    Ok(Some(match operator {
        Operator::Contains => format!("%{}%", needle),
        Operator::StartsWith => format!("{}%", needle),
        _ => format!("%{}", needle),
    }))
}

fn contains_aggregate(operand: &Operand, functions: &FunctionRegistry) -> bool {
    match operand {
        Operand::Function(call) => {
            functions.is_aggregate(call.name())
                || call.args().iter().any(|arg| contains_aggregate(arg, functions))
        }
        _ => false,
    }
}

/// 驱动报告的错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("statement timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
    #[error("statement cancelled")]
    Cancelled,
    #[error("resource limit reached: {0}")]
    ResourceExhausted(String),
    #[error("{0}")]
    Other(String),
}

impl From<BackendError> for ExecutionError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout { elapsed_ms } => ExecutionError::Timeout { elapsed_ms },
            BackendError::Cancelled => ExecutionError::Cancelled,
            BackendError::ResourceExhausted(what) => ExecutionError::ResourceExceeded(what),
            BackendError::Other(detail) => ExecutionError::internal("sql backend", detail),
        }
    }
}

/// 驱动接口：执行一条编译好的语句并返回结果行
pub trait SqlBackend: Send + Sync {
    fn query(&self, statement: &CompiledQuery, cancel: &CancellationFlag) -> Result<Vec<Row>, BackendError>;
}

pub struct SqlProvider<B> {
    compiler: SqlCompiler,
    backend: B,
}

impl<B: SqlBackend> SqlProvider<B> {
    pub fn new(config: SqlConfig, backend: B) -> Self {
        Self {
            compiler: SqlCompiler::new(config),
            backend,
        }
    }

    pub fn compiler(&self) -> &SqlCompiler {
        &self.compiler
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn check_operand(&self, path: &str, operand: &Operand, failures: &mut Vec<ValidationFailure>) {
        let Operand::Function(call) = operand else {
            return;
        };
        const TRANSLATED: &[&str] = &[
            "count", "count_distinct", "sum", "avg", "min", "max", "lower", "upper", "length", "abs",
        ];
        if !TRANSLATED.contains(&call.name().to_lowercase().as_str()) {
            failures.push(ValidationFailure::new(
                path,
                FailureKind::Unsupported,
                format!("function '{}' has no SQL translation", call.name()),
            ));
        }
        for (i, arg) in call.args().iter().enumerate() {
            self.check_operand(&format!("{}.args[{}]", path, i), arg, failures);
        }
    }

    fn check_predicate(&self, root: &str, predicate: &Predicate, failures: &mut Vec<ValidationFailure>) {
        predicate.for_each_condition(root, &mut |path, condition| {
            self.check_operand(&format!("{}.left", path), condition.left(), failures);
            let Some(RightOperand::Single(right)) = condition.right() else {
                return;
            };
            self.check_operand(&format!("{}.right", path), right, failures);
            let operator = condition.operator();
            if operator == Operator::Regex && !self.compiler.config().supports_regex {
                failures.push(ValidationFailure::new(
                    format!("{}.operator", path),
                    FailureKind::Unsupported,
                    "regex is not supported by this SQL backend",
                ));
            }
            if like_pattern(operator, right).is_err() {
                failures.push(ValidationFailure::new(
                    format!("{}.right", path),
                    FailureKind::Unsupported,
                    format!("'{}' requires a string literal on the right", operator),
                ));
            }
        });
    }
}

impl<B: SqlBackend> QueryProvider for SqlProvider<B> {
    fn name(&self) -> &str {
        "sql"
    }

    fn provider_checks(&self, ast: &QueryAst, schema: &Schema) -> Vec<ValidationFailure> {
        let max_depth = schema.options.max_depth;
        let mut failures = Vec::new();
        for (i, item) in ast.select().iter().enumerate() {
            if item.expr().depth() <= max_depth {
                self.check_operand(&format!("select[{}].expr", i), item.expr(), &mut failures);
            }
        }
        if let Some(predicate) = ast.where_clause().filter(|p| p.depth() <= max_depth) {
            self.check_predicate("where", predicate, &mut failures);
        }
        if let Some(having) = ast
            .group_by()
            .and_then(|g| g.having())
            .filter(|p| p.depth() <= max_depth)
        {
            self.check_predicate("group_by.having", having, &mut failures);
        }
        failures
    }

    fn execute(
        &self,
        ast: &QueryAst,
        schema: &Schema,
        cancel: &CancellationFlag,
    ) -> Result<ResultSet, ExecutionError> {
        cancel.check()?;
        let statement = self.compiler.compile(ast, &schema.functions)?;
        debug!(sql = %statement.sql, params = statement.values.len(), "compiled statement");
        let rows = self.backend.query(&statement, cancel)?;

        let total_count = if SqlCompiler::is_aggregating(ast, &schema.functions) {
            None
        } else if ast.limit().is_none() && ast.offset() == 0 {
            Some(rows.len() as u64)
        } else {
            cancel.check()?;
            let count = self.compiler.compile_count(ast)?;
            let counted = self.backend.query(&count, cancel)?;
            counted
                .first()
                .and_then(|row| row.get("total"))
                .and_then(serde_json::Value::as_u64)
        };

        Ok(ResultSet {
            query_id: ast.query_id().to_string(),
            rows,
            total_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionCall, GroupBy, OrderBy, QueryParts, SelectField, TimeRange, RelativeDuration};
    use crate::catalog::FieldType;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        statements: Mutex<Vec<CompiledQuery>>,
        rows: Vec<Row>,
        failure: Option<BackendError>,
    }

    impl SqlBackend for RecordingBackend {
        fn query(&self, statement: &CompiledQuery, _cancel: &CancellationFlag) -> Result<Vec<Row>, BackendError> {
            self.statements.lock().unwrap().push(statement.clone());
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            if statement.sql.contains(r#"AS "total""#) {
                let mut row = Row::new();
                row.insert("total".into(), json!(42));
                return Ok(vec![row]);
            }
            Ok(self.rows.clone())
        }
    }

    fn field(name: &str, t: FieldType) -> FieldRef {
        FieldRef::new(name, t).unwrap()
    }

    fn query(parts: QueryParts) -> QueryAst {
        QueryAst::from_parts(QueryParts {
            tenant_id: "acme".into(),
            query_id: "q-sql".into(),
            ..parts
        })
        .unwrap()
    }

    fn compile(ast: &QueryAst) -> CompiledQuery {
        SqlCompiler::default()
            .compile(ast, &FunctionRegistry::builtin())
            .unwrap()
    }

    fn string_value(s: &str) -> Value {
        Value::String(Some(Box::new(s.to_string())))
    }

    #[test]
    fn test_tenant_filter_is_always_first() {
        let ast = query(QueryParts {
            select: vec![SelectField::field(field("src_ip", FieldType::IpAddress))],
            where_clause: Some(
                Condition::compare(
                    field("activity_name", FieldType::String),
                    Operator::Eq,
                    Literal::string("failed_login"),
                )
                .unwrap()
                .into(),
            ),
            ..Default::default()
        });
        let compiled = compile(&ast);
        assert!(compiled.sql.contains(r#"FROM "ocsf_events" WHERE "tenant_id" = $1 AND "activity_name" = $2"#), "{}", compiled.sql);
        assert_eq!(compiled.values[0], string_value("acme"));
        assert_eq!(compiled.values[1], string_value("failed_login"));
        assert!(compiled.sql.ends_with(r#"ORDER BY "event_seq" ASC"#), "{}", compiled.sql);
    }

    #[test]
    fn test_dotted_fields_map_to_columns() {
        let mut config = SqlConfig::default();
        config.columns.insert("device.ip".into(), "dvc_ip".into());
        let compiler = SqlCompiler::new(config);
        let ast = query(QueryParts {
            select: vec![
                SelectField::field(field("user.name", FieldType::String)),
                SelectField::field(field("device.ip", FieldType::IpAddress)),
            ],
            ..Default::default()
        });
        let compiled = compiler.compile(&ast, &FunctionRegistry::builtin()).unwrap();
        assert!(compiled.sql.contains(r#""user_name" AS "user.name""#), "{}", compiled.sql);
        assert!(compiled.sql.contains(r#""dvc_ip" AS "device.ip""#), "{}", compiled.sql);
    }

    #[test]
    fn test_grouped_query_compilation() {
        let count = FunctionCall::new("count", vec![], FieldType::Integer).unwrap();
        let having: Predicate =
            Condition::compare(field("count", FieldType::Integer), Operator::Gt, Literal::integer(5))
                .unwrap()
                .into();
        let ast = query(QueryParts {
            select: vec![
                SelectField::field(field("src_ip", FieldType::IpAddress)),
                SelectField::field(field("activity_name", FieldType::String)),
                SelectField::new(count, Some("count".into())).unwrap(),
            ],
            group_by: Some(GroupBy::new(vec![field("src_ip", FieldType::IpAddress)], Some(having)).unwrap()),
            order_by: vec![OrderBy::desc(field("count", FieldType::Integer))],
            limit: Some(10),
            ..Default::default()
        });
        let sql = compile(&ast).sql;
        assert!(sql.contains(r#"MIN("activity_name") AS "activity_name""#), "{}", sql);
        assert!(sql.contains(r#"GROUP BY "src_ip""#), "{}", sql);
        assert!(sql.contains("HAVING COUNT(*) > $2"), "{}", sql);
        assert!(sql.contains(r#"ORDER BY COUNT(*) DESC, "src_ip" ASC"#), "{}", sql);
        assert!(sql.contains("LIMIT"), "{}", sql);
        assert!(!sql.contains("event_seq"), "{}", sql);
    }

    #[test]
    fn test_paged_groups_order_by_group_key() {
        let count = FunctionCall::new("count", vec![], FieldType::Integer).unwrap();
        let ast = query(QueryParts {
            select: vec![
                SelectField::field(field("src_ip", FieldType::IpAddress)),
                SelectField::new(count.clone(), None).unwrap(),
            ],
            group_by: Some(GroupBy::new(vec![field("src_ip", FieldType::IpAddress)], None).unwrap()),
            limit: Some(10),
            offset: 20,
            ..Default::default()
        });
        let sql = compile(&ast).sql;
        assert!(sql.contains(r#"GROUP BY "src_ip" ORDER BY "src_ip" ASC LIMIT"#), "{}", sql);

        let by_count = query(QueryParts {
            order_by: vec![OrderBy::desc(field("count", FieldType::Integer))],
            ..ast.to_parts()
        });
        let sql = compile(&by_count).sql;
        assert!(sql.contains(r#"ORDER BY COUNT(*) DESC, "src_ip" ASC"#), "{}", sql);

        let single_row = query(QueryParts {
            select: vec![SelectField::new(count, None).unwrap()],
            ..Default::default()
        });
        assert!(!compile(&single_row).sql.contains("ORDER BY"));
    }

    #[test]
    fn test_like_patterns_are_escaped() {
        let ast = query(QueryParts {
            where_clause: Some(
                Condition::compare(
                    field("file.name", FieldType::String),
                    Operator::Contains,
                    Literal::string("50%_off"),
                )
                .unwrap()
                .into(),
            ),
            ..Default::default()
        });
        let compiled = compile(&ast);
        assert!(compiled.sql.contains(r#""file_name" LIKE $2 ESCAPE"#), "{}", compiled.sql);
        assert_eq!(compiled.values[1], string_value(r"%50\%\_off%"));
    }

    #[test]
    fn test_subnet_and_list_operators() {
        let ast = query(QueryParts {
            where_clause: Some(
                Predicate::or(vec![
                    Condition::compare(
                        field("src_ip", FieldType::IpAddress),
                        Operator::InSubnet,
                        Literal::ip("10.0.0.0/8").unwrap(),
                    )
                    .unwrap()
                    .into(),
                    Condition::list(
                        field("severity_id", FieldType::Integer),
                        Operator::Between,
                        vec![Literal::integer(3), Literal::integer(5)],
                    )
                    .unwrap()
                    .into(),
                ])
                .unwrap(),
            ),
            ..Default::default()
        });
        let sql = compile(&ast).sql;
        assert!(sql.contains(r#"CAST("src_ip" AS INET) <<= CAST($2 AS INET)"#), "{}", sql);
        assert!(sql.contains(r#""severity_id" BETWEEN $3 AND $4"#), "{}", sql);
    }

    #[test]
    fn test_relative_time_range() {
        let ast = query(QueryParts {
            time_range: Some(TimeRange::last(RelativeDuration::parse("15m").unwrap())),
            ..Default::default()
        });
        let sql = compile(&ast).sql;
        assert!(sql.contains("NOW() - INTERVAL '900 seconds'"), "{}", sql);
    }

    #[test]
    fn test_regex_disabled_is_provider_failure() {
        let provider = SqlProvider::new(
            SqlConfig {
                supports_regex: false,
                ..Default::default()
            },
            RecordingBackend::default(),
        );
        let ast = query(QueryParts {
            where_clause: Some(
                Condition::compare(
                    field("process.cmd_line", FieldType::String),
                    Operator::Regex,
                    Literal::string("powershell.*-enc"),
                )
                .unwrap()
                .into(),
            ),
            ..Default::default()
        });
        let failures = provider.validate(&ast, &Schema::ocsf());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Unsupported);
        assert_eq!(failures[0].path, "where.operator");
    }

    #[test]
    fn test_execute_reports_total_count_for_paged_rows() {
        let mut row = Row::new();
        row.insert("user.name".into(), json!("alice"));
        let provider = SqlProvider::new(
            SqlConfig::default(),
            RecordingBackend {
                rows: vec![row],
                ..Default::default()
            },
        );
        let ast = query(QueryParts {
            select: vec![SelectField::field(field("user.name", FieldType::String))],
            limit: Some(1),
            ..Default::default()
        });
        let result = provider
            .execute(&ast, &Schema::ocsf(), &CancellationFlag::new())
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.total_count, Some(42));
        assert_eq!(provider.backend().statements.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_backend_errors_are_classified() {
        let provider = SqlProvider::new(
            SqlConfig::default(),
            RecordingBackend {
                failure: Some(BackendError::Other("connection reset by 10.1.2.3".into())),
                ..Default::default()
            },
        );
        let ast = query(QueryParts::default());
        let err = provider
            .execute(&ast, &Schema::ocsf(), &CancellationFlag::new())
            .unwrap_err();
        assert_eq!(err, ExecutionError::Internal);

        let timeout: ExecutionError = BackendError::Timeout { elapsed_ms: 30 }.into();
        assert_eq!(timeout, ExecutionError::Timeout { elapsed_ms: 30 });
    }
}
