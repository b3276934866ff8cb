//! 基于字段目录对 [`QueryAst`] 进行校验
//!
//! 校验器不会在第一个问题处停止。各项检查按固定顺序遍历整棵树并收集所有问题，
//! 因此同一组 `(ast, catalog, registry)` 总是得到顺序相同的同一列表：
//!
//! ```text
//! 1. 未知字段          6. having 聚合安全
//! 2. 字段类型不符      7. 时间范围
//! 3. 函数签名          8. limit 上下界
//! 4. 运算符适用性      9. 嵌套深度
//! 5. 列表操作数
//! ```
//!
//! 超过最大深度的子树只在第 9 项中报告一次，其余检查不再深入

use crate::ast::{
    Condition, FieldRef, FunctionCall, Operand, Operator, Predicate, QueryAst, RightOperand,
    SelectField, MAX_LIMIT,
};
use crate::catalog::{FieldCatalog, FieldType};
use crate::functions::FunctionRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// 函数调用与逻辑表达式的默认最大嵌套深度
pub const DEFAULT_MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorOptions {
    pub max_depth: usize,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// 校验失败的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownField,
    FieldTypeMismatch,
    UnknownFunction,
    ArgumentCountMismatch,
    ArgumentTypeMismatch,
    ReturnTypeMismatch,
    OperatorTypeMismatch,
    OperandTypeMismatch,
    EmptyList,
    MixedListTypes,
    NonAggregateReference,
    InvalidTimeRange,
    BoundExceeded,
    DepthExceeded,
    /// 执行后端无法求值的结构
    Unsupported,
}

impl FailureKind {
    /// 机器可读的错误码
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::UnknownField => "unknown_field",
            FailureKind::FieldTypeMismatch => "field_type_mismatch",
            FailureKind::UnknownFunction => "unknown_function",
            FailureKind::ArgumentCountMismatch => "argument_count_mismatch",
            FailureKind::ArgumentTypeMismatch => "argument_type_mismatch",
            FailureKind::ReturnTypeMismatch => "return_type_mismatch",
            FailureKind::OperatorTypeMismatch => "operator_type_mismatch",
            FailureKind::OperandTypeMismatch => "operand_type_mismatch",
            FailureKind::EmptyList => "empty_list",
            FailureKind::MixedListTypes => "mixed_list_types",
            FailureKind::NonAggregateReference => "non_aggregate_reference",
            FailureKind::InvalidTimeRange => "invalid_time_range",
            FailureKind::BoundExceeded => "bound_exceeded",
            FailureKind::DepthExceeded => "depth_exceeded",
            FailureKind::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 查询中的一个问题，以文档路径定位
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub path: String,
    pub kind: FailureKind,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(path: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.path, self.message)
    }
}

/// 字段引用所在的位置，决定别名如何解析
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefSite {
    Plain,
    /// `order_by` 或 `having`：可以使用输出列别名
    OutputScope,
}

/// 各项检查所需节点的扁平视图，按文档顺序
#[derive(Default)]
struct Collected<'a> {
    fields: Vec<(String, &'a FieldRef, RefSite)>,
    calls: Vec<(String, &'a FunctionCall)>,
    conditions: Vec<(String, &'a Condition)>,
    /// `having` 中未被聚合的字段引用
    having_refs: Vec<(String, &'a FieldRef)>,
    too_deep: Vec<(String, usize)>,
}

/// 依据显式传入的字段目录和函数注册表校验查询
#[derive(Debug, Clone, Copy)]
pub struct Validator<'a> {
    catalog: &'a FieldCatalog,
    functions: &'a FunctionRegistry,
    options: ValidatorOptions,
}

impl<'a> Validator<'a> {
    pub fn new(catalog: &'a FieldCatalog, functions: &'a FunctionRegistry) -> Self {
        Self {
            catalog,
            functions,
            options: ValidatorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ValidatorOptions) -> Self {
        self.options = options;
        self
    }

    /// 返回所有问题，空列表表示查询合法
    pub fn validate(&self, ast: &QueryAst) -> Vec<ValidationFailure> {
        let aliases = output_aliases(ast);
        let mut collected = Collected::default();
        self.collect(ast, &mut collected);

        let mut failures = Vec::new();
        self.check_known_fields(&collected, &aliases, &mut failures);
        self.check_field_types(&collected, &aliases, &mut failures);
        self.check_functions(&collected, &aliases, &mut failures);
        self.check_operators(&collected, &aliases, &mut failures);
        self.check_lists(&collected, &aliases, &mut failures);
        self.check_having(ast, &collected, &aliases, &mut failures);
        check_time_range(ast, &mut failures);
        check_bounds(ast, &mut failures);
        for (path, depth) in &collected.too_deep {
            failures.push(ValidationFailure::new(
                path.clone(),
                FailureKind::DepthExceeded,
                format!(
                    "nesting depth {} exceeds maximum of {}",
                    depth, self.options.max_depth
                ),
            ));
        }
        failures
    }

    fn collect<'b>(&self, ast: &'b QueryAst, out: &mut Collected<'b>) {
        for (i, item) in ast.select().iter().enumerate() {
            let path = format!("select[{}].expr", i);
            if self.guard_depth(&path, item.expr().depth(), out) {
                self.collect_operand(&path, item.expr(), RefSite::Plain, false, out);
            }
        }
        if let Some(predicate) = ast.where_clause() {
            if self.guard_depth("where", predicate.depth(), out) {
                self.collect_predicate("where".to_string(), predicate, RefSite::Plain, false, out);
            }
        }
        if let Some(group_by) = ast.group_by() {
            for (i, field) in group_by.fields().iter().enumerate() {
                out.fields
                    .push((format!("group_by.fields[{}]", i), field, RefSite::Plain));
            }
            if let Some(having) = group_by.having() {
                if self.guard_depth("group_by.having", having.depth(), out) {
                    self.collect_predicate(
                        "group_by.having".to_string(),
                        having,
                        RefSite::OutputScope,
                        true,
                        out,
                    );
                }
            }
        }
        for (i, order) in ast.order_by().iter().enumerate() {
            out.fields
                .push((format!("order_by[{}].field", i), &order.field, RefSite::OutputScope));
        }
    }

    fn guard_depth(&self, path: &str, depth: usize, out: &mut Collected<'_>) -> bool {
        if depth > self.options.max_depth {
            out.too_deep.push((path.to_string(), depth));
            false
        } else {
            true
        }
    }

    fn collect_predicate<'b>(
        &self,
        path: String,
        predicate: &'b Predicate,
        site: RefSite,
        in_having: bool,
        out: &mut Collected<'b>,
    ) {
        match predicate {
            Predicate::Condition(condition) => {
                self.collect_operand(&format!("{}.left", path), condition.left(), site, in_having, out);
                if let Some(RightOperand::Single(right)) = condition.right() {
                    self.collect_operand(&format!("{}.right", path), right, site, in_having, out);
                }
                out.conditions.push((path, condition));
            }
            Predicate::Logical(expr) => {
                for (i, child) in expr.children().iter().enumerate() {
                    self.collect_predicate(
                        format!("{}.children[{}]", path, i),
                        child,
                        site,
                        in_having,
                        out,
                    );
                }
            }
        }
    }

    fn collect_operand<'b>(
        &self,
        path: &str,
        operand: &'b Operand,
        site: RefSite,
        in_having: bool,
        out: &mut Collected<'b>,
    ) {
        match operand {
            Operand::Field(field) => {
                out.fields.push((path.to_string(), field, site));
                if in_having {
                    out.having_refs.push((path.to_string(), field));
                }
            }
            Operand::Literal(_) => {}
            Operand::Function(call) => {
                out.calls.push((path.to_string(), call));
                // 聚合函数的参数按输入行求值，而不是按分组
                let nested_in_having = in_having && !self.functions.is_aggregate(call.name());
                for (i, arg) in call.args().iter().enumerate() {
                    self.collect_operand(
                        &format!("{}.args[{}]", path, i),
                        arg,
                        site,
                        nested_in_having,
                        out,
                    );
                }
            }
        }
    }

    /// 在可解析别名的位置上，`field` 是否为输出列别名
    fn is_alias_ref(field: &FieldRef, site: RefSite, aliases: &HashSet<&str>) -> bool {
        site == RefSite::OutputScope && aliases.contains(field.name())
    }

    fn check_known_fields(
        &self,
        collected: &Collected<'_>,
        aliases: &HashSet<&str>,
        failures: &mut Vec<ValidationFailure>,
    ) {
        for (path, field, site) in &collected.fields {
            if Self::is_alias_ref(field, *site, aliases) {
                continue;
            }
            if !self.catalog.contains(field.name()) {
                failures.push(ValidationFailure::new(
                    path.clone(),
                    FailureKind::UnknownField,
                    format!("field '{}' is not in the catalog", field.name()),
                ));
            }
        }
    }

    fn check_field_types(
        &self,
        collected: &Collected<'_>,
        aliases: &HashSet<&str>,
        failures: &mut Vec<ValidationFailure>,
    ) {
        for (path, field, site) in &collected.fields {
            if Self::is_alias_ref(field, *site, aliases) {
                continue;
            }
            if let Some(authoritative) = self.catalog.lookup(field.name()) {
                if authoritative != field.field_type() {
                    failures.push(ValidationFailure::new(
                        path.clone(),
                        FailureKind::FieldTypeMismatch,
                        format!(
                            "field '{}' declared as {} but catalog type is {}",
                            field.name(),
                            field.field_type(),
                            authoritative
                        ),
                    ));
                }
            }
        }
    }

    fn check_functions(
        &self,
        collected: &Collected<'_>,
        aliases: &HashSet<&str>,
        failures: &mut Vec<ValidationFailure>,
    ) {
        for (path, call) in &collected.calls {
            let Some(signature) = self.functions.lookup(call.name()) else {
                failures.push(ValidationFailure::new(
                    path.clone(),
                    FailureKind::UnknownFunction,
                    format!("function '{}' is not registered", call.name()),
                ));
                continue;
            };
            let arg_count = call.args().len();
            if !signature.accepts_arity(arg_count) {
                failures.push(ValidationFailure::new(
                    path.clone(),
                    FailureKind::ArgumentCountMismatch,
                    format!(
                        "function '{}' takes {}..={} arguments (got {})",
                        call.name(),
                        signature.min_args(),
                        signature.max_args(),
                        arg_count
                    ),
                ));
                continue;
            }
            let arg_types: Vec<FieldType> = call
                .args()
                .iter()
                .map(|arg| self.resolve_type(arg, RefSite::Plain, aliases))
                .collect();
            let mut args_ok = true;
            for (i, (param, actual)) in signature.params.iter().zip(&arg_types).enumerate() {
                if !param.accepts(*actual) {
                    args_ok = false;
                    failures.push(ValidationFailure::new(
                        format!("{}.args[{}]", path, i),
                        FailureKind::ArgumentTypeMismatch,
                        format!(
                            "argument {} of '{}' must be {} (got {})",
                            i,
                            call.name(),
                            param,
                            actual
                        ),
                    ));
                }
            }
            if !args_ok {
                continue;
            }
            if let Some(expected) = signature.resolve_return(&arg_types) {
                if expected != call.return_type() {
                    failures.push(ValidationFailure::new(
                        path.clone(),
                        FailureKind::ReturnTypeMismatch,
                        format!(
                            "function '{}' returns {} but call declares {}",
                            call.name(),
                            expected,
                            call.return_type()
                        ),
                    ));
                }
            }
        }
    }

    fn check_operators(
        &self,
        collected: &Collected<'_>,
        aliases: &HashSet<&str>,
        failures: &mut Vec<ValidationFailure>,
    ) {
        for (path, condition) in &collected.conditions {
            let site = if path.starts_with("group_by.having") {
                RefSite::OutputScope
            } else {
                RefSite::Plain
            };
            let left_type = self.resolve_type(condition.left(), site, aliases);
            let operator = condition.operator();
            if !operator.is_legal_for(left_type) {
                failures.push(ValidationFailure::new(
                    path.clone(),
                    FailureKind::OperatorTypeMismatch,
                    format!("operator '{}' is not applicable to {}", operator, left_type),
                ));
                continue;
            }
            if let Some(RightOperand::Single(right)) = condition.right() {
                if matches!(right, Operand::Literal(l) if l.is_null()) {
                    continue;
                }
                let right_type = self.resolve_type(right, site, aliases);
                let compatible = match operator {
                    Operator::InSubnet => right_type == FieldType::IpAddress,
                    Operator::Regex => right_type == FieldType::String,
                    _ => left_type.is_comparable_with(right_type),
                };
                if !compatible {
                    failures.push(ValidationFailure::new(
                        format!("{}.right", path),
                        FailureKind::OperandTypeMismatch,
                        format!(
                            "right operand of type {} cannot be compared with {} using '{}'",
                            right_type, left_type, operator
                        ),
                    ));
                }
            }
        }
    }

    fn check_lists(
        &self,
        collected: &Collected<'_>,
        aliases: &HashSet<&str>,
        failures: &mut Vec<ValidationFailure>,
    ) {
        for (path, condition) in &collected.conditions {
            let Some(RightOperand::List(items)) = condition.right() else {
                continue;
            };
            if items.is_empty() {
                failures.push(ValidationFailure::new(
                    format!("{}.right", path),
                    FailureKind::EmptyList,
                    format!("operator '{}' requires a non-empty list", condition.operator()),
                ));
                continue;
            }
            let first = items[0].literal_type();
            if let Some((i, odd)) = items
                .iter()
                .enumerate()
                .find(|(_, item)| item.literal_type() != first)
            {
                failures.push(ValidationFailure::new(
                    format!("{}.right[{}]", path, i),
                    FailureKind::MixedListTypes,
                    format!(
                        "list elements must share one type ({} vs {})",
                        first,
                        odd.literal_type()
                    ),
                ));
                continue;
            }
            let site = if path.starts_with("group_by.having") {
                RefSite::OutputScope
            } else {
                RefSite::Plain
            };
            let left_type = self.resolve_type(condition.left(), site, aliases);
            // 运算符本身不适用时已由运算符检查报告
            if !condition.operator().is_legal_for(left_type) {
                continue;
            }
            if let Some((i, item)) = items
                .iter()
                .enumerate()
                .find(|(_, item)| !item.is_null() && !left_type.is_comparable_with(item.literal_type()))
            {
                failures.push(ValidationFailure::new(
                    format!("{}.right[{}]", path, i),
                    FailureKind::OperandTypeMismatch,
                    format!(
                        "list element of type {} cannot be compared with {} using '{}'",
                        item.literal_type(),
                        left_type,
                        condition.operator()
                    ),
                ));
            }
        }
    }

    fn check_having(
        &self,
        ast: &QueryAst,
        collected: &Collected<'_>,
        aliases: &HashSet<&str>,
        failures: &mut Vec<ValidationFailure>,
    ) {
        let Some(group_by) = ast.group_by() else {
            return;
        };
        let mut allowed: HashSet<&str> = aliases.clone();
        for field in group_by.fields() {
            allowed.insert(field.name());
        }
        for item in ast.select() {
            if let Operand::Field(field) = item.expr() {
                allowed.insert(field.name());
            }
        }
        for (path, field) in &collected.having_refs {
            if !allowed.contains(field.name()) {
                failures.push(ValidationFailure::new(
                    path.clone(),
                    FailureKind::NonAggregateReference,
                    format!(
                        "having references '{}' which is neither selected nor grouped",
                        field.name()
                    ),
                ));
            }
        }
    }

    /// 操作数类型，字段目录中的类型优先于声明类型
    fn resolve_type(&self, operand: &Operand, site: RefSite, aliases: &HashSet<&str>) -> FieldType {
        match operand {
            Operand::Field(field) if Self::is_alias_ref(field, site, aliases) => field.field_type(),
            Operand::Field(field) => self
                .catalog
                .lookup(field.name())
                .unwrap_or(field.field_type()),
            Operand::Literal(literal) => literal.literal_type(),
            Operand::Function(call) => call.return_type(),
        }
    }
}

fn output_aliases(ast: &QueryAst) -> HashSet<&str> {
    ast.select().iter().filter_map(SelectField::output_alias).collect()
}

fn check_time_range(ast: &QueryAst, failures: &mut Vec<ValidationFailure>) {
    let Some(range) = ast.time_range() else {
        return;
    };
    if range.last.is_some() && (range.start.is_some() || range.end.is_some()) {
        failures.push(ValidationFailure::new(
            "time_range",
            FailureKind::InvalidTimeRange,
            "absolute bounds and 'last' are mutually exclusive",
        ));
        return;
    }
    if range.last.is_none() && range.start.is_none() && range.end.is_none() {
        failures.push(ValidationFailure::new(
            "time_range",
            FailureKind::InvalidTimeRange,
            "time range needs start/end bounds or 'last'",
        ));
        return;
    }
    if let (Some(start), Some(end)) = (range.start, range.end) {
        if start > end {
            failures.push(ValidationFailure::new(
                "time_range",
                FailureKind::InvalidTimeRange,
                format!("start {} is after end {}", start, end),
            ));
        }
    }
}

fn check_bounds(ast: &QueryAst, failures: &mut Vec<ValidationFailure>) {
    if let Some(limit) = ast.limit() {
        if limit == 0 || limit > MAX_LIMIT {
            failures.push(ValidationFailure::new(
                "limit",
                FailureKind::BoundExceeded,
                format!("limit must be within 1..={} (got {})", MAX_LIMIT, limit),
            ));
        }
    }
    // offset 无符号，只需检查上界
    if ast.offset() > i64::MAX as u64 {
        failures.push(ValidationFailure::new(
            "offset",
            FailureKind::BoundExceeded,
            format!("offset {} is out of range", ast.offset()),
        ));
    }
}
