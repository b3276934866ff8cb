//! 基于内存 JSON 安全事件的执行引擎
//!
//! 事件按插入顺序保存，排序键相同时以此顺序为准：
//! 行（或按首次出现顺序排列的分组）保持原有顺序。

use crate::ast::{
    parse_ip_or_cidr, Condition, Direction, LiteralValue, LogicalOp, Operand, Operator, Predicate,
    QueryAst, RightOperand, Timestamp,
};
use crate::catalog::FieldType;
use crate::provider::{CancellationFlag, ExecutionError, QueryProvider, ResultSet, Row, Schema};
use crate::validator::{FailureKind, ValidationFailure};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, warn};

/// 本引擎能求值的函数
const SUPPORTED_FUNCTIONS: &[&str] = &[
    "count",
    "count_distinct",
    "sum",
    "avg",
    "min",
    "max",
    "lower",
    "upper",
    "length",
    "abs",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// 单次执行最多扫描的租户行数
    pub max_scan_rows: usize,
    /// 执行超时，`None` 表示不限
    pub timeout_ms: Option<u64>,
    /// 存放事件时间的字段
    pub time_field: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            max_scan_rows: 1_000_000,
            timeout_ms: Some(5_000),
            time_field: "time".to_string(),
        }
    }
}

/// 带租户标识的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub tenant_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(tenant_id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            fields,
        }
    }

    /// 先按扁平键（`"device.ip"`）查找，再逐层查找嵌套对象
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.fields.get(name) {
            return Some(value);
        }
        let mut parts = name.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }
}

/// 基于内存事件列表的执行后端
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    config: MockConfig,
    events: Vec<Event>,
}

impl MockProvider {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            events: Vec::new(),
        }
    }

    pub fn with_events(config: MockConfig, events: Vec<Event>) -> Self {
        Self { config, events }
    }

    pub fn insert(&mut self, event: Event) {
        self.events.push(event);
    }

    /// 从 JSON 数组追加事件，每个对象须带 `tenant_id`
    pub fn load_json(&mut self, json: &str) -> serde_json::Result<usize> {
        let events: Vec<Event> = serde_json::from_str(json)?;
        let count = events.len();
        self.events.extend(events);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn in_time_range(
        &self,
        event: &Event,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> bool {
        if from.is_none() && to.is_none() {
            return true;
        }
        let Some(at) = event.get(&self.config.time_field).and_then(value_timestamp) else {
            return false;
        };
        from.map_or(true, |f| at >= f) && to.map_or(true, |t| at <= t)
    }

    fn check_operand(
        &self,
        path: &str,
        operand: &Operand,
        schema: &Schema,
        allow_aggregate: bool,
        in_aggregate: bool,
        failures: &mut Vec<ValidationFailure>,
    ) {
        let Operand::Function(call) = operand else {
            return;
        };
        let name = call.name().to_lowercase();
        if !SUPPORTED_FUNCTIONS.contains(&name.as_str()) {
            failures.push(ValidationFailure::new(
                path,
                FailureKind::Unsupported,
                format!("function '{}' cannot be evaluated by the mock engine", call.name()),
            ));
            return;
        }
        let aggregate = schema.functions.is_aggregate(&name);
        if aggregate && !allow_aggregate {
            failures.push(ValidationFailure::new(
                path,
                FailureKind::Unsupported,
                format!("aggregate '{}' is not allowed here", call.name()),
            ));
            return;
        }
        if aggregate && in_aggregate {
            failures.push(ValidationFailure::new(
                path,
                FailureKind::Unsupported,
                format!("nested aggregate '{}' is not supported", call.name()),
            ));
            return;
        }
        for (i, arg) in call.args().iter().enumerate() {
            self.check_operand(
                &format!("{}.args[{}]", path, i),
                arg,
                schema,
                allow_aggregate,
                in_aggregate || aggregate,
                failures,
            );
        }
    }

    fn check_predicate(
        &self,
        root: &str,
        predicate: &Predicate,
        schema: &Schema,
        allow_aggregate: bool,
        failures: &mut Vec<ValidationFailure>,
    ) {
        predicate.for_each_condition(root, &mut |path, condition| {
            self.check_operand(
                &format!("{}.left", path),
                condition.left(),
                schema,
                allow_aggregate,
                false,
                failures,
            );
            if let Some(RightOperand::Single(right)) = condition.right() {
                self.check_operand(
                    &format!("{}.right", path),
                    right,
                    schema,
                    allow_aggregate,
                    false,
                    failures,
                );
                if condition.operator() == Operator::Regex {
                    if let Operand::Literal(lit) = right {
                        if let LiteralValue::String(pattern) = lit.value() {
                            if let Err(err) = Regex::new(pattern) {
                                failures.push(ValidationFailure::new(
                                    format!("{}.right", path),
                                    FailureKind::Unsupported,
                                    format!("invalid regex pattern: {}", err),
                                ));
                            }
                        }
                    }
                }
            }
        });
    }

    fn project(&self, ast: &QueryAst, ctx: &EvalContext<'_>, event: &Event) -> Result<Row, ExecutionError> {
        if ast.select().is_empty() {
            return Ok(event.fields.clone());
        }
        let scope = Scope::single(&event);
        let mut row = Row::new();
        for item in ast.select() {
            row.insert(item.output_name().to_string(), ctx.eval(item.expr(), &scope)?);
        }
        Ok(row)
    }

    fn aggregate(
        &self,
        ast: &QueryAst,
        ctx: &EvalContext<'_>,
        matched: &[&Event],
        cancel: &CancellationFlag,
    ) -> Result<Vec<(Row, Vec<Value>)>, ExecutionError> {
        // 分组按首次出现的顺序排列
        let mut groups: Vec<Vec<&Event>> = Vec::new();
        match ast.group_by() {
            Some(group_by) => {
                let mut index: HashMap<String, usize> = HashMap::new();
                for event in matched {
                    let scope = Scope::single(event);
                    let mut key = Vec::with_capacity(group_by.fields().len());
                    for field in group_by.fields() {
                        key.push(ctx.eval(&Operand::Field(field.clone()), &scope)?);
                    }
                    let key = Value::Array(key).to_string();
                    match index.get(&key) {
                        Some(&slot) => groups[slot].push(*event),
                        None => {
                            index.insert(key, groups.len());
                            groups.push(vec![*event]);
                        }
                    }
                }
            }
            // 无分组的聚合把所有行合成一行，没有匹配行时也是如此
            None => groups.push(matched.to_vec()),
        }

        let having = ast.group_by().and_then(|g| g.having());
        let mut rows = Vec::with_capacity(groups.len());
        for members in &groups {
            cancel.check()?;
            let mut row = Row::new();
            let scope = Scope::group(members, None);
            for item in ast.select() {
                row.insert(item.output_name().to_string(), ctx.eval(item.expr(), &scope)?);
            }
            let scope = Scope::group(members, Some(&row));
            if let Some(predicate) = having {
                if !ctx.matches(predicate, &scope)? {
                    continue;
                }
            }
            let keys = ctx.sort_keys(ast, &scope)?;
            rows.push((row, keys));
        }
        Ok(rows)
    }
}

impl QueryProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn provider_checks(&self, ast: &QueryAst, schema: &Schema) -> Vec<ValidationFailure> {
        let max_depth = schema.options.max_depth;
        let mut failures = Vec::new();
        for (i, item) in ast.select().iter().enumerate() {
            if item.expr().depth() <= max_depth {
                self.check_operand(
                    &format!("select[{}].expr", i),
                    item.expr(),
                    schema,
                    true,
                    false,
                    &mut failures,
                );
            }
        }
        if let Some(predicate) = ast.where_clause().filter(|p| p.depth() <= max_depth) {
            self.check_predicate("where", predicate, schema, false, &mut failures);
        }
        if let Some(having) = ast
            .group_by()
            .and_then(|g| g.having())
            .filter(|p| p.depth() <= max_depth)
        {
            self.check_predicate("group_by.having", having, schema, true, &mut failures);
        }
        failures
    }

    fn execute(
        &self,
        ast: &QueryAst,
        schema: &Schema,
        cancel: &CancellationFlag,
    ) -> Result<ResultSet, ExecutionError> {
        let started = Instant::now();
        let deadline = self.config.timeout_ms.map(Duration::from_millis);
        let ctx = EvalContext::new(ast, schema)?;
        let (from, to) = ast
            .time_range()
            .map(|range| range.resolve(OffsetDateTime::now_utc()))
            .unwrap_or((None, None));

        let mut scanned = 0usize;
        let mut matched: Vec<&Event> = Vec::new();
        // 先按租户过滤，其他租户的行不会被求值
        for event in self.events.iter().filter(|e| e.tenant_id == ast.tenant_id()) {
            cancel.check()?;
            if let Some(limit) = deadline {
                let elapsed = started.elapsed();
                if elapsed > limit {
                    return Err(ExecutionError::Timeout {
                        elapsed_ms: elapsed.as_millis() as u64,
                    });
                }
            }
            scanned += 1;
            if scanned > self.config.max_scan_rows {
                return Err(ExecutionError::ResourceExceeded(format!(
                    "scan exceeds {} rows",
                    self.config.max_scan_rows
                )));
            }
            if !self.in_time_range(event, from, to) {
                continue;
            }
            if let Some(predicate) = ast.where_clause() {
                if !ctx.matches(predicate, &Scope::single(&event))? {
                    continue;
                }
            }
            matched.push(event);
        }
        debug!(scanned, matched = matched.len(), "scan finished");

        let aggregating = ast.group_by().is_some()
            || ast.select().iter().any(|item| ctx.contains_aggregate(item.expr()));
        let (mut rows, total_count) = if aggregating {
            (self.aggregate(ast, &ctx, &matched, cancel)?, None)
        } else {
            let mut rows = Vec::with_capacity(matched.len());
            for event in &matched {
                let row = self.project(ast, &ctx, event)?;
                let keys = ctx.sort_keys(ast, &Scope::row(event, &row))?;
                rows.push((row, keys));
            }
            (rows, Some(matched.len() as u64))
        };

        if !ast.order_by().is_empty() {
            if !ast.select().is_empty() {
                for order in ast.order_by() {
                    let name = order.field.name();
                    if !ast.select().iter().any(|s| s.output_name() == name) {
                        warn!(field = name, "order_by field is not part of the output");
                    }
                }
            }
            // 稳定排序
            rows.sort_by(|a, b| compare_keys(ast, &a.1, &b.1));
        }

        let offset = usize::try_from(ast.offset()).unwrap_or(usize::MAX);
        let limit = ast
            .limit()
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        let rows = rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(row, _)| row)
            .collect();

        Ok(ResultSet {
            query_id: ast.query_id().to_string(),
            rows,
            total_count,
        })
    }
}

/// 表达式求值所针对的行
///
/// 普通行只有一个成员；分组包含全部成员，投影之后还带有输出行，
/// 以便解析别名
struct Scope<'a> {
    members: &'a [&'a Event],
    output: Option<&'a Row>,
    grouped: bool,
}

impl<'a> Scope<'a> {
    fn single(event: &'a &'a Event) -> Self {
        Self {
            members: std::slice::from_ref(event),
            output: None,
            grouped: false,
        }
    }

    fn row(event: &'a &'a Event, output: &'a Row) -> Self {
        Self {
            members: std::slice::from_ref(event),
            output: Some(output),
            grouped: false,
        }
    }

    fn group(members: &'a [&'a Event], output: Option<&'a Row>) -> Self {
        Self {
            members,
            output,
            grouped: true,
        }
    }
}

struct EvalContext<'a> {
    schema: &'a Schema,
    aliases: HashSet<String>,
    regexes: HashMap<String, Regex>,
}

impl<'a> EvalContext<'a> {
    fn new(ast: &QueryAst, schema: &'a Schema) -> Result<Self, ExecutionError> {
        let aliases = ast
            .select()
            .iter()
            .filter_map(|item| item.output_alias())
            .map(str::to_string)
            .collect();

        let mut regexes = HashMap::new();
        let predicates = ast
            .where_clause()
            .into_iter()
            .chain(ast.group_by().and_then(|g| g.having()));
        let mut patterns = Vec::new();
        for predicate in predicates {
            predicate.for_each_condition("", &mut |_, condition: &Condition| {
                if condition.operator() != Operator::Regex {
                    return;
                }
                if let Some(RightOperand::Single(Operand::Literal(lit))) = condition.right() {
                    if let LiteralValue::String(pattern) = lit.value() {
                        patterns.push(pattern.clone());
                    }
                }
            });
        }
        for pattern in patterns {
            let regex = compile_regex(&pattern)?;
            regexes.insert(pattern, regex);
        }

        Ok(Self {
            schema,
            aliases,
            regexes,
        })
    }

    fn is_aggregate(&self, name: &str) -> bool {
        self.schema.functions.is_aggregate(name)
    }

    fn contains_aggregate(&self, operand: &Operand) -> bool {
        match operand {
            Operand::Function(call) => {
                self.is_aggregate(call.name())
                    || call.args().iter().any(|arg| self.contains_aggregate(arg))
            }
            _ => false,
        }
    }

    fn resolve_type(&self, operand: &Operand) -> FieldType {
        match operand {
            Operand::Field(f) if self.aliases.contains(f.name()) => f.field_type(),
            Operand::Field(f) => self.schema.catalog.lookup(f.name()).unwrap_or(f.field_type()),
            Operand::Literal(l) => l.literal_type(),
            Operand::Function(call) => call.return_type(),
        }
    }

    fn eval(&self, operand: &Operand, scope: &Scope<'_>) -> Result<Value, ExecutionError> {
        match operand {
            Operand::Field(field) => {
                if let Some(output) = scope.output {
                    if self.aliases.contains(field.name()) {
                        return Ok(output.get(field.name()).cloned().unwrap_or(Value::Null));
                    }
                }
                Ok(scope
                    .members
                    .first()
                    .and_then(|event| event.get(field.name()))
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            Operand::Literal(literal) => Ok(literal_to_json(literal.value())),
            Operand::Function(call) => {
                let name = call.name().to_lowercase();
                if self.is_aggregate(&name) {
                    if !scope.grouped {
                        return Err(ExecutionError::Unsupported(format!(
                            "aggregate '{}' outside of a grouping",
                            call.name()
                        )));
                    }
                    return self.eval_aggregate(&name, call.args(), scope.members);
                }
                let mut args = Vec::with_capacity(call.args().len());
                for arg in call.args() {
                    args.push(self.eval(arg, scope)?);
                }
                eval_scalar(&name, &args)
            }
        }
    }

    fn eval_aggregate(
        &self,
        name: &str,
        args: &[Operand],
        members: &[&Event],
    ) -> Result<Value, ExecutionError> {
        let Some(arg) = args.first() else {
            return match name {
                "count" => Ok(Value::from(members.len() as u64)),
                other => Err(ExecutionError::Unsupported(format!(
                    "aggregate '{}' requires an argument",
                    other
                ))),
            };
        };
        let mut values = Vec::with_capacity(members.len());
        for event in members {
            let value = self.eval(arg, &Scope::single(event))?;
            if !value.is_null() {
                values.push(value);
            }
        }
        match name {
            "count" => Ok(Value::from(values.len() as u64)),
            "count_distinct" => {
                let distinct: HashSet<String> = values.iter().map(Value::to_string).collect();
                Ok(Value::from(distinct.len() as u64))
            }
            "sum" => Ok(sum_values(&values)),
            "avg" => {
                if values.is_empty() {
                    return Ok(Value::Null);
                }
                let total: f64 = values.iter().filter_map(Value::as_f64).sum();
                Ok(float_value(total / values.len() as f64))
            }
            "min" => Ok(values
                .into_iter()
                .min_by(compare_values)
                .unwrap_or(Value::Null)),
            "max" => Ok(values
                .into_iter()
                .reduce(|best, v| if compare_values(&v, &best) == Ordering::Greater { v } else { best })
                .unwrap_or(Value::Null)),
            other => Err(ExecutionError::Unsupported(format!(
                "aggregate '{}' is not implemented",
                other
            ))),
        }
    }

    fn matches(&self, predicate: &Predicate, scope: &Scope<'_>) -> Result<bool, ExecutionError> {
        match predicate {
            Predicate::Condition(condition) => self.eval_condition(condition, scope),
            Predicate::Logical(expr) => {
                match expr.operator() {
                    LogicalOp::And => {
                        for child in expr.children() {
                            if !self.matches(child, scope)? {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                    LogicalOp::Or => {
                        for child in expr.children() {
                            if self.matches(child, scope)? {
                                return Ok(true);
                            }
                        }
                        Ok(false)
                    }
                    LogicalOp::Not => match expr.children().first() {
                        Some(child) => Ok(!self.matches(child, scope)?),
                        None => Ok(true),
                    },
                }
            }
        }
    }

    fn eval_condition(&self, condition: &Condition, scope: &Scope<'_>) -> Result<bool, ExecutionError> {
        let left = self.eval(condition.left(), scope)?;
        let left_type = self.resolve_type(condition.left());
        let operator = condition.operator();
        match operator {
            Operator::IsNull => return Ok(left.is_null()),
            Operator::IsNotNull => return Ok(!left.is_null()),
            _ if left.is_null() => return Ok(false),
            _ => {}
        }
        match condition.right() {
            Some(RightOperand::Single(right)) => {
                let right = self.eval(right, scope)?;
                if right.is_null() {
                    return Ok(false);
                }
                self.compare_single(operator, left_type, &left, &right)
            }
            Some(RightOperand::List(items)) => {
                let values: Vec<Value> = items.iter().map(|l| literal_to_json(l.value())).collect();
                let equal = |v: &Value| typed_cmp(left_type, &left, v) == Some(Ordering::Equal);
                Ok(match operator {
                    Operator::In => values.iter().any(equal),
                    Operator::NotIn => !values.iter().any(equal),
                    Operator::Between => match (values.first(), values.get(1)) {
                        (Some(lo), Some(hi)) => {
                            matches!(
                                typed_cmp(left_type, &left, lo),
                                Some(Ordering::Greater | Ordering::Equal)
                            ) && matches!(
                                typed_cmp(left_type, &left, hi),
                                Some(Ordering::Less | Ordering::Equal)
                            )
                        }
                        _ => false,
                    },
                    _ => false,
                })
            }
            None => Ok(false),
        }
    }

    fn compare_single(
        &self,
        operator: Operator,
        left_type: FieldType,
        left: &Value,
        right: &Value,
    ) -> Result<bool, ExecutionError> {
        let strings = || left.as_str().zip(right.as_str());
        let ordering = || typed_cmp(left_type, left, right);
        Ok(match operator {
            Operator::Eq => ordering() == Some(Ordering::Equal),
            Operator::Ne => matches!(ordering(), Some(o) if o != Ordering::Equal),
            Operator::Gt => ordering() == Some(Ordering::Greater),
            Operator::Gte => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
            Operator::Lt => ordering() == Some(Ordering::Less),
            Operator::Lte => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
            Operator::Contains => strings().is_some_and(|(l, r)| l.contains(r)),
            Operator::StartsWith => strings().is_some_and(|(l, r)| l.starts_with(r)),
            Operator::EndsWith => strings().is_some_and(|(l, r)| l.ends_with(r)),
            Operator::Regex => match strings() {
                Some((l, pattern)) => match self.regexes.get(pattern) {
                    Some(regex) => regex.is_match(l),
                    None => compile_regex(pattern)?.is_match(l),
                },
                None => false,
            },
            Operator::InSubnet => match strings() {
                Some((ip, network)) => match (ip.parse::<IpAddr>(), parse_ip_or_cidr(network)) {
                    (Ok(ip), Some((net, prefix))) => subnet_contains(net, prefix, ip),
                    _ => false,
                },
                None => false,
            },
            Operator::In | Operator::NotIn | Operator::Between => false,
            Operator::IsNull | Operator::IsNotNull => false,
        })
    }

    fn sort_keys(&self, ast: &QueryAst, scope: &Scope<'_>) -> Result<Vec<Value>, ExecutionError> {
        let mut keys = Vec::with_capacity(ast.order_by().len());
        for order in ast.order_by() {
            let name = order.field.name();
            let value = match scope.output.and_then(|row| row.get(name)) {
                Some(value) => value.clone(),
                None => self.eval(&Operand::Field(order.field.clone()), scope)?,
            };
            keys.push(value);
        }
        Ok(keys)
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, ExecutionError> {
    Regex::new(pattern)
        .map_err(|err| ExecutionError::Unsupported(format!("invalid regex pattern: {}", err)))
}

fn compare_keys(ast: &QueryAst, a: &[Value], b: &[Value]) -> Ordering {
    for (order, (x, y)) in ast.order_by().iter().zip(a.iter().zip(b)) {
        let ordering = compare_values(x, y);
        let ordering = match order.direction {
            Direction::Asc => ordering,
            Direction::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn literal_to_json(value: &LiteralValue) -> Value {
    match value {
        LiteralValue::Null => Value::Null,
        LiteralValue::Boolean(b) => Value::Bool(*b),
        LiteralValue::Integer(i) => Value::from(*i),
        LiteralValue::Float(f) => float_value(*f),
        LiteralValue::String(s) => Value::String(s.clone()),
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn value_timestamp(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(s) => Timestamp::parse(s).ok().map(|t| t.datetime()),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok()),
        _ => None,
    }
}

/// 按左操作数类型的语义比较
fn typed_cmp(left_type: FieldType, a: &Value, b: &Value) -> Option<Ordering> {
    match left_type {
        FieldType::Timestamp => match (value_timestamp(a), value_timestamp(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => None,
        },
        FieldType::IpAddress => {
            let x: IpAddr = a.as_str()?.parse().ok()?;
            let y: IpAddr = b.as_str()?.parse().ok()?;
            Some(x.cmp(&y))
        }
        FieldType::Integer | FieldType::Float => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        FieldType::String => Some(a.as_str()?.cmp(b.as_str()?)),
        FieldType::Boolean => Some(a.as_bool()?.cmp(&b.as_bool()?)),
        FieldType::Json | FieldType::Array => (a == b).then_some(Ordering::Equal),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// JSON 值的全序，用于排序与 min/max
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn sum_values(values: &[Value]) -> Value {
    if values.is_empty() {
        return Value::Null;
    }
    let integers: Option<Vec<i64>> = values.iter().map(Value::as_i64).collect();
    if let Some(integers) = integers {
        if let Some(total) = integers.iter().try_fold(0i64, |acc, v| acc.checked_add(*v)) {
            return Value::from(total);
        }
    }
    float_value(values.iter().filter_map(Value::as_f64).sum())
}

fn eval_scalar(name: &str, args: &[Value]) -> Result<Value, ExecutionError> {
    let first = args.first().unwrap_or(&Value::Null);
    if first.is_null() {
        return Ok(Value::Null);
    }
    match name {
        "lower" => Ok(first.as_str().map_or(Value::Null, |s| Value::from(s.to_lowercase()))),
        "upper" => Ok(first.as_str().map_or(Value::Null, |s| Value::from(s.to_uppercase()))),
        "length" => Ok(first
            .as_str()
            .map_or(Value::Null, |s| Value::from(s.chars().count() as u64))),
        "abs" => Ok(match first.as_i64() {
            Some(i) => i.checked_abs().map_or_else(|| float_value((i as f64).abs()), Value::from),
            None => first.as_f64().map_or(Value::Null, |f| float_value(f.abs())),
        }),
        other => Err(ExecutionError::Unsupported(format!(
            "function '{}' is not implemented",
            other
        ))),
    }
}

fn subnet_contains(network: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) };
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}
