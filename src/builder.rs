//! 链式查询构建器
//!
//! 字段类型取自 Schema 的字段目录，函数返回类型取自函数注册表，
//! 调用方只需给出名称。目录中不存在的字段按 `string` 声明，留给校验器报告。

use crate::ast::{
    ConstructResult, ConstructionError, Condition, Direction, FieldRef, FunctionCall, GroupBy,
    Literal, LogicalOp, Operand, Operator, OrderBy, Predicate, QueryAst, QueryParts, RelativeDuration,
    SelectField, TimeRange, Timestamp,
};
use crate::catalog::FieldType;
use crate::provider::Schema;
use ulid::Ulid;

pub struct QueryBuilder<'a> {
    schema: &'a Schema,
    parts: QueryParts,
    group_fields: Vec<FieldRef>,
    having: Option<Predicate>,
    error: Option<ConstructionError>,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(schema: &'a Schema, tenant_id: impl Into<String>) -> Self {
        Self {
            schema,
            parts: QueryParts {
                tenant_id: tenant_id.into(),
                ..Default::default()
            },
            group_fields: Vec::new(),
            having: None,
            error: None,
        }
    }

    /// 指定 query_id，替代自动生成的 ULID
    pub fn query_id(mut self, id: impl Into<String>) -> Self {
        self.parts.query_id = id.into();
        self
    }

    pub fn source_query(mut self, text: impl Into<String>) -> Self {
        self.parts.source_query = Some(text.into());
        self
    }

    /// 名称对应的类型：先查输出列，再查字段目录
    fn resolve_type(&self, name: &str) -> FieldType {
        self.parts
            .select
            .iter()
            .find(|item| item.output_name() == name)
            .map(|item| item.expr().declared_type())
            .or_else(|| self.schema.catalog.lookup(name))
            .unwrap_or(FieldType::String)
    }

    /// 按构建器的规则为 `name` 生成字段引用
    pub fn field(&self, name: &str) -> ConstructResult<FieldRef> {
        FieldRef::new(name, self.resolve_type(name))
    }

    /// 函数调用，返回类型取自注册表
    pub fn call(&self, name: &str, args: &[&str]) -> ConstructResult<FunctionCall> {
        let mut operands = Vec::with_capacity(args.len());
        for arg in args {
            operands.push(Operand::Field(self.field(arg)?));
        }
        let arg_types: Vec<FieldType> = operands.iter().map(Operand::declared_type).collect();
        let return_type = self
            .schema
            .functions
            .lookup(name)
            .and_then(|sig| sig.resolve_return(&arg_types))
            .unwrap_or(FieldType::String);
        FunctionCall::new(name, operands, return_type)
    }

    fn record<T>(&mut self, result: ConstructResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                if self.error.is_none() {
                    self.error = Some(err);
                }
                None
            }
        }
    }

    pub fn select(mut self, name: &str) -> Self {
        if let Some(field) = self.record(self.field(name)) {
            self.parts.select.push(SelectField::field(field));
        }
        self
    }

    pub fn select_as(mut self, name: &str, alias: &str) -> Self {
        let field = self.field(name);
        if let Some(item) = self.record(field.and_then(|f| SelectField::new(f, Some(alias.into())))) {
            self.parts.select.push(item);
        }
        self
    }

    /// 输出 `function(args...)`，可带别名
    pub fn select_fn(mut self, function: &str, args: &[&str], alias: Option<&str>) -> Self {
        let call = self.call(function, args);
        let item = call.and_then(|c| SelectField::new(c, alias.map(str::to_string)));
        if let Some(item) = self.record(item) {
            self.parts.select.push(item);
        }
        self
    }

    /// 以 AND 方式追加到当前 `where` 条件
    pub fn filter(mut self, predicate: Predicate) -> Self {
        let combined = match self.parts.where_clause.take() {
            None => Ok(predicate),
            Some(Predicate::Logical(existing)) if existing.operator() == LogicalOp::And => {
                let mut children = existing.children().to_vec();
                children.push(predicate);
                Predicate::and(children)
            }
            Some(existing) => Predicate::and(vec![existing, predicate]),
        };
        self.parts.where_clause = self.record(combined);
        self
    }

    pub fn where_field(self, name: &str, operator: Operator, value: Literal) -> Self {
        let condition = self
            .field(name)
            .and_then(|f| Condition::compare(f, operator, value));
        self.filter_condition(condition)
    }

    pub fn where_list(self, name: &str, operator: Operator, values: Vec<Literal>) -> Self {
        let condition = self
            .field(name)
            .and_then(|f| Condition::list(f, operator, values));
        self.filter_condition(condition)
    }

    pub fn where_null(self, name: &str, is_null: bool) -> Self {
        let operator = if is_null {
            Operator::IsNull
        } else {
            Operator::IsNotNull
        };
        let condition = self.field(name).and_then(|f| Condition::unary(f, operator));
        self.filter_condition(condition)
    }

    fn filter_condition(mut self, condition: ConstructResult<Condition>) -> Self {
        match self.record(condition) {
            Some(condition) => self.filter(condition.into()),
            None => self,
        }
    }

    pub fn group_by(mut self, names: &[&str]) -> Self {
        for name in names {
            if let Some(field) = self.record(self.field(name)) {
                self.group_fields.push(field);
            }
        }
        self
    }

    /// having 中的 `name <operator> value`，`name` 可以是输出列别名
    pub fn having(mut self, name: &str, operator: Operator, value: Literal) -> Self {
        let condition = self
            .field(name)
            .and_then(|f| Condition::compare(f, operator, value));
        let Some(condition) = self.record(condition) else {
            return self;
        };
        let having = match self.having.take() {
            None => Ok(condition.into()),
            Some(existing) => Predicate::and(vec![existing, condition.into()]),
        };
        self.having = self.record(having);
        self
    }

    pub fn order_by(mut self, name: &str, direction: Direction) -> Self {
        if let Some(field) = self.record(self.field(name)) {
            self.parts.order_by.push(OrderBy { field, direction });
        }
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.parts.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.parts.offset = offset;
        self
    }

    /// 相对时间窗口，例如 `"24h"`
    pub fn last(mut self, token: &str) -> Self {
        if let Some(duration) = self.record(RelativeDuration::parse(token)) {
            self.parts.time_range = Some(TimeRange::last(duration));
        }
        self
    }

    pub fn between(mut self, start: &str, end: &str) -> Self {
        let range = Timestamp::parse(start)
            .and_then(|s| Timestamp::parse(end).map(|e| TimeRange::between(s, e)));
        if let Some(range) = self.record(range) {
            self.parts.time_range = Some(range);
        }
        self
    }

    /// 返回构建过程中遇到的第一个错误，或构建好的查询
    pub fn build(mut self) -> ConstructResult<QueryAst> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if !self.group_fields.is_empty() || self.having.is_some() {
            self.parts.group_by = Some(GroupBy::new(self.group_fields, self.having)?);
        }
        if self.parts.query_id.is_empty() {
            self.parts.query_id = Ulid::new().to_string();
        }
        QueryAst::from_parts(self.parts)
    }
}
