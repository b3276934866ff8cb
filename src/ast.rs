//! 安全事件查询的 AST，与具体执行后端无关
//!
//! 节点构造后不可变。结构性约束（操作数形状、字面量类型、逻辑节点子项数、
//! 时间戳格式）在构造函数中检查；反序列化也经过同一组构造函数。
//! 依赖字段目录的检查交给 [`crate::validator`]。
//!
//! JSON 文档格式：
//!
//! ```text
//! {
//!   "select":   [{"expr": {"type": "field", "name": "src_ip", "field_type": "ip_address"}}],
//!   "where":    {"type": "condition", "left": {...}, "operator": "eq", "right": {...}},
//!   "group_by": {"fields": [...], "having": {...}},
//!   "order_by": [{"field": {...}, "direction": "desc"}],
//!   "limit": 100, "offset": 0,
//!   "time_range": {"last": "24h"},
//!   "tenant_id": "acme", "query_id": "01J...", "source_query": "..."
//! }
//! ```

use crate::catalog::FieldType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

/// `limit` 允许的最大值
pub const MAX_LIMIT: u64 = 10_000;

/// 构造节点时立即报告的结构错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("{node} name cannot be empty")]
    EmptyName { node: &'static str },
    #[error("alias cannot be empty")]
    EmptyAlias,
    #[error("literal declared as {declared} cannot hold a {found} value")]
    LiteralKindMismatch { declared: FieldType, found: &'static str },
    #[error("float literal must be finite")]
    NonFiniteFloat,
    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("invalid IP address or CIDR '{value}'")]
    InvalidIpAddress { value: String },
    #[error("invalid relative duration '{value}', expected <n><s|m|h|d|w>")]
    InvalidDuration { value: String },
    #[error("{context} cannot be a literal")]
    LiteralNotAllowed { context: &'static str },
    #[error("operator '{operator}' takes no right operand")]
    UnexpectedRightOperand { operator: Operator },
    #[error("operator '{operator}' requires a right operand")]
    MissingRightOperand { operator: Operator },
    #[error("operator '{operator}' requires a list of literals")]
    ExpectedList { operator: Operator },
    #[error("operator '{operator}' requires a non-empty list")]
    EmptyList { operator: Operator },
    #[error("between requires exactly two bounds (got {found})")]
    BetweenArity { found: usize },
    #[error("operator '{operator}' takes a single operand, not a list")]
    ExpectedScalar { operator: Operator },
    #[error("'{operator}' requires {expected} (got {found})")]
    LogicalArity {
        operator: LogicalOp,
        expected: &'static str,
        found: usize,
    },
    #[error("group_by requires at least one field")]
    EmptyGroupBy,
    #[error("tenant_id is required")]
    MissingTenant,
    #[error("query_id is required")]
    MissingQueryId,
}

pub type ConstructResult<T> = Result<T, ConstructionError>;

fn require_name(name: String, node: &'static str) -> ConstructResult<String> {
    if name.trim().is_empty() {
        Err(ConstructionError::EmptyName { node })
    } else {
        Ok(name)
    }
}

fn require_alias(alias: Option<String>) -> ConstructResult<Option<String>> {
    match alias {
        Some(a) if a.trim().is_empty() => Err(ConstructionError::EmptyAlias),
        other => Ok(other),
    }
}

/// 解析 RFC 3339 时间戳并以 UTC 形式（`...Z`）重新输出
pub fn normalize_timestamp(raw: &str) -> ConstructResult<String> {
    let invalid = |reason: String| ConstructionError::InvalidTimestamp {
        value: raw.to_string(),
        reason,
    };
    let parsed = OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| invalid(e.to_string()))?;
    parsed
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|e| invalid(e.to_string()))
}

/// 将 `10.0.0.1` 或 `10.0.0.0/8` 解析为地址和前缀长度
///
/// 不带前缀的地址使用完整前缀长度
pub fn parse_ip_or_cidr(raw: &str) -> Option<(IpAddr, u8)> {
    let (addr, prefix) = match raw.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (raw, None),
    };
    let ip: IpAddr = addr.trim().parse().ok()?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(p) => p.trim().parse::<u8>().ok().filter(|p| *p <= max)?,
        None => max,
    };
    Some((ip, prefix))
}

/// 时间点，内部统一为 UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(OffsetDateTime);

impl Timestamp {
    pub fn parse(raw: &str) -> ConstructResult<Self> {
        let invalid = |reason: String| ConstructionError::InvalidTimestamp {
            value: raw.to_string(),
            reason,
        };
        let parsed = OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| invalid(e.to_string()))?;
        Self::from_datetime(parsed).map_err(|_| invalid("outside the RFC 3339 year range in UTC".into()))
    }

    /// 转为 UTC；转换后无法按 RFC 3339 输出的时间点（年份越出 0..=9999）被拒绝。
    pub fn from_datetime(dt: OffsetDateTime) -> ConstructResult<Self> {
        let utc = dt.to_offset(UtcOffset::UTC);
        match utc.format(&Rfc3339) {
            Ok(_) => Ok(Self(utc)),
            Err(e) => Err(ConstructionError::InvalidTimestamp {
                value: dt.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    pub fn datetime(&self) -> OffsetDateTime {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.format(&Rfc3339) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl TryFrom<String> for Timestamp {
    type Error = ConstructionError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Timestamp::parse(&raw)
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        ts.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurationUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl DurationUnit {
    fn suffix(&self) -> char {
        match self {
            DurationUnit::Seconds => 's',
            DurationUnit::Minutes => 'm',
            DurationUnit::Hours => 'h',
            DurationUnit::Days => 'd',
            DurationUnit::Weeks => 'w',
        }
    }

    fn seconds(&self) -> u64 {
        match self {
            DurationUnit::Seconds => 1,
            DurationUnit::Minutes => 60,
            DurationUnit::Hours => 3_600,
            DurationUnit::Days => 86_400,
            DurationUnit::Weeks => 604_800,
        }
    }
}

/// “最近 N 个单位”的相对窗口，例如 `15m`、`7d`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativeDuration {
    amount: u64,
    unit: DurationUnit,
}

impl RelativeDuration {
    pub fn new(amount: u64, unit: DurationUnit) -> ConstructResult<Self> {
        if amount == 0 || amount.checked_mul(unit.seconds()).is_none() {
            return Err(ConstructionError::InvalidDuration {
                value: format!("{}{}", amount, unit.suffix()),
            });
        }
        Ok(Self { amount, unit })
    }

    pub fn parse(raw: &str) -> ConstructResult<Self> {
        let invalid = || ConstructionError::InvalidDuration {
            value: raw.to_string(),
        };
        let raw_trimmed = raw.trim();
        let unit = match raw_trimmed.chars().last() {
            Some('s') => DurationUnit::Seconds,
            Some('m') => DurationUnit::Minutes,
            Some('h') => DurationUnit::Hours,
            Some('d') => DurationUnit::Days,
            Some('w') => DurationUnit::Weeks,
            _ => return Err(invalid()),
        };
        let amount: u64 = raw_trimmed[..raw_trimmed.len() - 1]
            .parse()
            .map_err(|_| invalid())?;
        Self::new(amount, unit).map_err(|_| invalid())
    }

    pub fn as_seconds(&self) -> u64 {
        self.amount * self.unit.seconds()
    }

    pub fn as_duration(&self) -> time::Duration {
        time::Duration::seconds(self.as_seconds().min(i64::MAX as u64) as i64)
    }
}

impl fmt::Display for RelativeDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}

impl TryFrom<String> for RelativeDuration {
    type Error = ConstructionError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        RelativeDuration::parse(&raw)
    }
}

impl From<RelativeDuration> for String {
    fn from(d: RelativeDuration) -> Self {
        d.to_string()
    }
}

/// 对目录字段的引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FieldRefDoc")]
pub struct FieldRef {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    alias: Option<String>,
    field_type: FieldType,
}

#[derive(Deserialize)]
struct FieldRefDoc {
    name: String,
    #[serde(default)]
    alias: Option<String>,
    field_type: FieldType,
}

impl TryFrom<FieldRefDoc> for FieldRef {
    type Error = ConstructionError;

    fn try_from(doc: FieldRefDoc) -> Result<Self, Self::Error> {
        FieldRef::new(doc.name, doc.field_type)?.with_alias_opt(doc.alias)
    }
}

impl FieldRef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> ConstructResult<Self> {
        Ok(Self {
            name: require_name(name.into(), "field")?,
            alias: None,
            field_type,
        })
    }

    pub fn with_alias(self, alias: impl Into<String>) -> ConstructResult<Self> {
        self.with_alias_opt(Some(alias.into()))
    }

    fn with_alias_opt(mut self, alias: Option<String>) -> ConstructResult<Self> {
        self.alias = require_alias(alias)?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }
}

/// 字面量的值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiteralValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl LiteralValue {
    pub fn kind(&self) -> &'static str {
        match self {
            LiteralValue::Null => "null",
            LiteralValue::Boolean(_) => "boolean",
            LiteralValue::Integer(_) => "integer",
            LiteralValue::Float(_) => "float",
            LiteralValue::String(_) => "string",
        }
    }
}

/// 带声明类型的常量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LiteralDoc")]
pub struct Literal {
    value: LiteralValue,
    literal_type: FieldType,
}

#[derive(Deserialize)]
struct LiteralDoc {
    value: LiteralValue,
    literal_type: FieldType,
}

impl TryFrom<LiteralDoc> for Literal {
    type Error = ConstructionError;

    fn try_from(doc: LiteralDoc) -> Result<Self, Self::Error> {
        Literal::new(doc.value, doc.literal_type)
    }
}

impl Literal {
    /// 构造字面量，并检查 `value` 与 `literal_type` 是否相符
    ///
    /// 声明为 `float` 的整数会被放宽为浮点数，时间戳统一为 UTC。
    /// IP 字面量必须是地址或 CIDR 网段。`null` 适用于任何类型。
    pub fn new(value: LiteralValue, literal_type: FieldType) -> ConstructResult<Self> {
        let mismatch = |value: &LiteralValue| ConstructionError::LiteralKindMismatch {
            declared: literal_type,
            found: value.kind(),
        };
        let value = match (value, literal_type) {
            (LiteralValue::Null, _) => LiteralValue::Null,
            (LiteralValue::Boolean(b), FieldType::Boolean) => LiteralValue::Boolean(b),
            (LiteralValue::Integer(i), FieldType::Integer) => LiteralValue::Integer(i),
            (LiteralValue::Integer(i), FieldType::Float) => LiteralValue::Float(i as f64),
            (LiteralValue::Float(f), FieldType::Float) => {
                if !f.is_finite() {
                    return Err(ConstructionError::NonFiniteFloat);
                }
                LiteralValue::Float(f)
            }
            (LiteralValue::String(s), FieldType::Timestamp) => {
                LiteralValue::String(normalize_timestamp(&s)?)
            }
            (LiteralValue::String(s), FieldType::IpAddress) => {
                if parse_ip_or_cidr(&s).is_none() {
                    return Err(ConstructionError::InvalidIpAddress { value: s });
                }
                LiteralValue::String(s)
            }
            (LiteralValue::String(s), FieldType::String | FieldType::Json | FieldType::Array) => {
                LiteralValue::String(s)
            }
            (other, _) => return Err(mismatch(&other)),
        };
        Ok(Self {
            value,
            literal_type,
        })
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self {
            value: LiteralValue::String(value.into()),
            literal_type: FieldType::String,
        }
    }

    pub fn integer(value: i64) -> Self {
        Self {
            value: LiteralValue::Integer(value),
            literal_type: FieldType::Integer,
        }
    }

    pub fn float(value: f64) -> ConstructResult<Self> {
        Self::new(LiteralValue::Float(value), FieldType::Float)
    }

    pub fn boolean(value: bool) -> Self {
        Self {
            value: LiteralValue::Boolean(value),
            literal_type: FieldType::Boolean,
        }
    }

    pub fn null(literal_type: FieldType) -> Self {
        Self {
            value: LiteralValue::Null,
            literal_type,
        }
    }

    pub fn timestamp(raw: &str) -> ConstructResult<Self> {
        Self::new(LiteralValue::String(raw.to_string()), FieldType::Timestamp)
    }

    pub fn ip(raw: &str) -> ConstructResult<Self> {
        Self::new(LiteralValue::String(raw.to_string()), FieldType::IpAddress)
    }

    pub fn value(&self) -> &LiteralValue {
        &self.value
    }

    pub fn literal_type(&self) -> FieldType {
        self.literal_type
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, LiteralValue::Null)
    }
}

/// 聚合函数或标量函数调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FunctionCallDoc")]
pub struct FunctionCall {
    name: String,
    args: Vec<Operand>,
    return_type: FieldType,
    /// 嵌套深度，构造时计算一次
    #[serde(skip)]
    depth: usize,
}

#[derive(Deserialize)]
struct FunctionCallDoc {
    name: String,
    #[serde(default)]
    args: Vec<Operand>,
    return_type: FieldType,
}

impl TryFrom<FunctionCallDoc> for FunctionCall {
    type Error = ConstructionError;

    fn try_from(doc: FunctionCallDoc) -> Result<Self, Self::Error> {
        FunctionCall::new(doc.name, doc.args, doc.return_type)
    }
}

impl FunctionCall {
    pub fn new(
        name: impl Into<String>,
        args: Vec<Operand>,
        return_type: FieldType,
    ) -> ConstructResult<Self> {
        let depth = 1 + args.iter().map(Operand::depth).max().unwrap_or(0);
        Ok(Self {
            name: require_name(name.into(), "function")?,
            args,
            return_type,
            depth,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Operand] {
        &self.args
    }

    pub fn return_type(&self) -> FieldType {
        self.return_type
    }

    /// 参数中不再含函数调用时为 `1`
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// 操作数：字段、常量或函数调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operand {
    Field(FieldRef),
    Literal(Literal),
    Function(FunctionCall),
}

impl Operand {
    pub fn depth(&self) -> usize {
        match self {
            Operand::Field(_) | Operand::Literal(_) => 0,
            Operand::Function(call) => call.depth(),
        }
    }

    /// 操作数自身声明的类型
    pub fn declared_type(&self) -> FieldType {
        match self {
            Operand::Field(f) => f.field_type(),
            Operand::Literal(l) => l.literal_type(),
            Operand::Function(call) => call.return_type(),
        }
    }
}

impl From<FieldRef> for Operand {
    fn from(field: FieldRef) -> Self {
        Operand::Field(field)
    }
}

impl From<Literal> for Operand {
    fn from(literal: Literal) -> Self {
        Operand::Literal(literal)
    }
}

impl From<FunctionCall> for Operand {
    fn from(call: FunctionCall) -> Self {
        Operand::Function(call)
    }
}

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    In,
    NotIn,
    Between,
    IsNull,
    IsNotNull,
    InSubnet,
}

/// 运算符要求的右操作数形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RightShape {
    None,
    Single,
    List,
    Pair,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::Regex => "regex",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Between => "between",
            Operator::IsNull => "is_null",
            Operator::IsNotNull => "is_not_null",
            Operator::InSubnet => "in_subnet",
        }
    }

    pub fn right_shape(&self) -> RightShape {
        match self {
            Operator::IsNull | Operator::IsNotNull => RightShape::None,
            Operator::In | Operator::NotIn => RightShape::List,
            Operator::Between => RightShape::Pair,
            _ => RightShape::Single,
        }
    }

    /// 固定的合法性表：每个运算符可作用于哪些类型
    pub fn is_legal_for(&self, left: FieldType) -> bool {
        use FieldType::*;
        match self {
            Operator::Eq | Operator::Ne | Operator::IsNull | Operator::IsNotNull => true,
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte | Operator::Between => {
                matches!(left, Integer | Float | Timestamp | String)
            }
            Operator::Contains | Operator::StartsWith | Operator::EndsWith | Operator::Regex => {
                left == String
            }
            Operator::In | Operator::NotIn => {
                matches!(left, String | Integer | Float | Timestamp | IpAddress | Boolean)
            }
            Operator::InSubnet => left == IpAddress,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 条件的右侧：单个操作数或字面量列表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RightOperand {
    List(Vec<Literal>),
    Single(Operand),
}

impl RightOperand {
    pub fn depth(&self) -> usize {
        match self {
            RightOperand::List(_) => 0,
            RightOperand::Single(op) => op.depth(),
        }
    }
}

/// 单个比较条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConditionDoc")]
pub struct Condition {
    left: Operand,
    operator: Operator,
    #[serde(skip_serializing_if = "Option::is_none")]
    right: Option<RightOperand>,
}

#[derive(Deserialize)]
struct ConditionDoc {
    left: Operand,
    operator: Operator,
    #[serde(default)]
    right: Option<RightOperand>,
}

impl TryFrom<ConditionDoc> for Condition {
    type Error = ConstructionError;

    fn try_from(doc: ConditionDoc) -> Result<Self, Self::Error> {
        Condition::new(doc.left, doc.operator, doc.right)
    }
}

impl Condition {
    /// 构造条件，右操作数形状与 `operator` 不符时报错
    pub fn new(
        left: Operand,
        operator: Operator,
        right: Option<RightOperand>,
    ) -> ConstructResult<Self> {
        if let Operand::Literal(_) = left {
            return Err(ConstructionError::LiteralNotAllowed {
                context: "condition left operand",
            });
        }
        match (operator.right_shape(), &right) {
            (RightShape::None, None) => {}
            (RightShape::None, Some(_)) => {
                return Err(ConstructionError::UnexpectedRightOperand { operator })
            }
            (_, None) => return Err(ConstructionError::MissingRightOperand { operator }),
            (RightShape::List, Some(RightOperand::List(items))) => {
                if items.is_empty() {
                    return Err(ConstructionError::EmptyList { operator });
                }
            }
            (RightShape::Pair, Some(RightOperand::List(items))) => {
                if items.is_empty() {
                    return Err(ConstructionError::EmptyList { operator });
                }
                if items.len() != 2 {
                    return Err(ConstructionError::BetweenArity { found: items.len() });
                }
            }
            (RightShape::List | RightShape::Pair, Some(RightOperand::Single(_))) => {
                return Err(ConstructionError::ExpectedList { operator })
            }
            (RightShape::Single, Some(RightOperand::List(_))) => {
                return Err(ConstructionError::ExpectedScalar { operator })
            }
            (RightShape::Single, Some(RightOperand::Single(_))) => {}
        }
        Ok(Self {
            left,
            operator,
            right,
        })
    }

    /// `left <op> right` 的简写
    pub fn compare(
        left: impl Into<Operand>,
        operator: Operator,
        right: impl Into<Operand>,
    ) -> ConstructResult<Self> {
        Self::new(
            left.into(),
            operator,
            Some(RightOperand::Single(right.into())),
        )
    }

    /// 列表运算符（`in`、`not_in`、`between`）的简写
    pub fn list(
        left: impl Into<Operand>,
        operator: Operator,
        items: Vec<Literal>,
    ) -> ConstructResult<Self> {
        Self::new(left.into(), operator, Some(RightOperand::List(items)))
    }

    /// `is_null` / `is_not_null` 的简写
    pub fn unary(left: impl Into<Operand>, operator: Operator) -> ConstructResult<Self> {
        Self::new(left.into(), operator, None)
    }

    pub fn left(&self) -> &Operand {
        &self.left
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn right(&self) -> Option<&RightOperand> {
        self.right.as_ref()
    }

    pub fn depth(&self) -> usize {
        let right = self.right.as_ref().map(RightOperand::depth).unwrap_or(0);
        self.left.depth().max(right)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogicalOp::And => "and",
            LogicalOp::Or => "or",
            LogicalOp::Not => "not",
        })
    }
}

/// 布尔过滤树，条件与逻辑表达式属于同一个封闭类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    Condition(Condition),
    Logical(LogicalExpr),
}

impl Predicate {
    pub fn depth(&self) -> usize {
        match self {
            Predicate::Condition(c) => c.depth(),
            Predicate::Logical(l) => l.depth(),
        }
    }

    pub fn and(children: Vec<Predicate>) -> ConstructResult<Self> {
        LogicalExpr::new(LogicalOp::And, children).map(Predicate::Logical)
    }

    pub fn or(children: Vec<Predicate>) -> ConstructResult<Self> {
        LogicalExpr::new(LogicalOp::Or, children).map(Predicate::Logical)
    }

    pub fn not(child: Predicate) -> ConstructResult<Self> {
        LogicalExpr::new(LogicalOp::Not, vec![child]).map(Predicate::Logical)
    }

    /// 按文档顺序对每个条件调用 `visit`，并传入其文档路径
    pub fn for_each_condition<'a, F>(&'a self, path: &str, visit: &mut F)
    where
        F: FnMut(String, &'a Condition),
    {
        match self {
            Predicate::Condition(c) => visit(path.to_string(), c),
            Predicate::Logical(expr) => {
                for (i, child) in expr.children().iter().enumerate() {
                    child.for_each_condition(&format!("{}.children[{}]", path, i), visit);
                }
            }
        }
    }
}

impl From<Condition> for Predicate {
    fn from(condition: Condition) -> Self {
        Predicate::Condition(condition)
    }
}

impl From<LogicalExpr> for Predicate {
    fn from(expr: LogicalExpr) -> Self {
        Predicate::Logical(expr)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LogicalExprDoc")]
pub struct LogicalExpr {
    operator: LogicalOp,
    children: Vec<Predicate>,
    #[serde(skip)]
    depth: usize,
}

#[derive(Deserialize)]
struct LogicalExprDoc {
    operator: LogicalOp,
    children: Vec<Predicate>,
}

impl TryFrom<LogicalExprDoc> for LogicalExpr {
    type Error = ConstructionError;

    fn try_from(doc: LogicalExprDoc) -> Result<Self, Self::Error> {
        LogicalExpr::new(doc.operator, doc.children)
    }
}

impl LogicalExpr {
    pub fn new(operator: LogicalOp, children: Vec<Predicate>) -> ConstructResult<Self> {
        match operator {
            LogicalOp::Not if children.len() != 1 => {
                return Err(ConstructionError::LogicalArity {
                    operator,
                    expected: "exactly one child",
                    found: children.len(),
                })
            }
            LogicalOp::And | LogicalOp::Or if children.is_empty() => {
                return Err(ConstructionError::LogicalArity {
                    operator,
                    expected: "at least one child",
                    found: 0,
                })
            }
            _ => {}
        }
        let depth = 1 + children.iter().map(Predicate::depth).max().unwrap_or(0);
        Ok(Self {
            operator,
            children,
            depth,
        })
    }

    pub fn operator(&self) -> LogicalOp {
        self.operator
    }

    pub fn children(&self) -> &[Predicate] {
        &self.children
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// 一个输出列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SelectFieldDoc")]
pub struct SelectField {
    expr: Operand,
    #[serde(skip_serializing_if = "Option::is_none")]
    alias: Option<String>,
}

#[derive(Deserialize)]
struct SelectFieldDoc {
    expr: Operand,
    #[serde(default)]
    alias: Option<String>,
}

impl TryFrom<SelectFieldDoc> for SelectField {
    type Error = ConstructionError;

    fn try_from(doc: SelectFieldDoc) -> Result<Self, Self::Error> {
        SelectField::new(doc.expr, doc.alias)
    }
}

impl SelectField {
    pub fn new(expr: impl Into<Operand>, alias: Option<String>) -> ConstructResult<Self> {
        let expr = expr.into();
        if let Operand::Literal(_) = expr {
            return Err(ConstructionError::LiteralNotAllowed {
                context: "select expression",
            });
        }
        Ok(Self {
            expr,
            alias: require_alias(alias)?,
        })
    }

    pub fn field(field: FieldRef) -> Self {
        Self {
            expr: Operand::Field(field),
            alias: None,
        }
    }

    pub fn expr(&self) -> &Operand {
        &self.expr
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// 输出列名：显式别名，其次字段别名，最后是名称本身
    pub fn output_name(&self) -> &str {
        if let Some(alias) = &self.alias {
            return alias;
        }
        match &self.expr {
            Operand::Field(f) => f.alias().unwrap_or(f.name()),
            Operand::Function(call) => call.name(),
            Operand::Literal(_) => "literal",
        }
    }

    /// 可在 `order_by` / `having` 中按名引用的输出列名；未起别名的普通字段没有。
    pub fn output_alias(&self) -> Option<&str> {
        match (&self.alias, &self.expr) {
            (Some(alias), _) => Some(alias),
            (None, Operand::Field(f)) => f.alias(),
            (None, _) => Some(self.output_name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GroupByDoc")]
pub struct GroupBy {
    fields: Vec<FieldRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    having: Option<Predicate>,
}

#[derive(Deserialize)]
struct GroupByDoc {
    fields: Vec<FieldRef>,
    #[serde(default)]
    having: Option<Predicate>,
}

impl TryFrom<GroupByDoc> for GroupBy {
    type Error = ConstructionError;

    fn try_from(doc: GroupByDoc) -> Result<Self, Self::Error> {
        GroupBy::new(doc.fields, doc.having)
    }
}

impl GroupBy {
    pub fn new(fields: Vec<FieldRef>, having: Option<Predicate>) -> ConstructResult<Self> {
        if fields.is_empty() {
            return Err(ConstructionError::EmptyGroupBy);
        }
        Ok(Self { fields, having })
    }

    pub fn fields(&self) -> &[FieldRef] {
        &self.fields
    }

    pub fn having(&self) -> Option<&Predicate> {
        self.having.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldRef,
    #[serde(default)]
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: FieldRef) -> Self {
        Self {
            field,
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: FieldRef) -> Self {
        Self {
            field,
            direction: Direction::Desc,
        }
    }
}

/// 绝对区间或相对窗口，二者互斥及先后顺序由校验器检查
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<RelativeDuration>,
}

impl TimeRange {
    pub fn between(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            last: None,
        }
    }

    pub fn last(duration: RelativeDuration) -> Self {
        Self {
            start: None,
            end: None,
            last: Some(duration),
        }
    }

    /// 相对于 `now` 的具体 `[start, end]` 区间
    pub fn resolve(&self, now: OffsetDateTime) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        if let Some(last) = self.last {
            return (now.checked_sub(last.as_duration()), Some(now));
        }
        (
            self.start.map(|t| t.datetime()),
            self.end.map(|t| t.datetime()),
        )
    }
}

/// 查询的纯字段形式，供构建器和反序列化使用
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryParts {
    #[serde(default)]
    pub select: Vec<SelectField>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<Predicate>,
    #[serde(default)]
    pub group_by: Option<GroupBy>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub query_id: String,
    #[serde(default)]
    pub source_query: Option<String>,
}

/// 查询的根节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "QueryParts")]
pub struct QueryAst {
    select: Vec<SelectField>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    where_clause: Option<Predicate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_by: Option<GroupBy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    order_by: Vec<OrderBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_range: Option<TimeRange>,
    tenant_id: String,
    query_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_query: Option<String>,
}

impl TryFrom<QueryParts> for QueryAst {
    type Error = ConstructionError;

    fn try_from(parts: QueryParts) -> Result<Self, Self::Error> {
        if parts.tenant_id.trim().is_empty() {
            return Err(ConstructionError::MissingTenant);
        }
        if parts.query_id.trim().is_empty() {
            return Err(ConstructionError::MissingQueryId);
        }
        Ok(Self {
            select: parts.select,
            where_clause: parts.where_clause,
            group_by: parts.group_by,
            order_by: parts.order_by,
            limit: parts.limit,
            offset: parts.offset,
            time_range: parts.time_range,
            tenant_id: parts.tenant_id,
            query_id: parts.query_id,
            source_query: parts.source_query,
        })
    }
}

impl QueryAst {
    pub fn from_parts(parts: QueryParts) -> ConstructResult<Self> {
        Self::try_from(parts)
    }

    /// 复制回纯字段形式
    pub fn to_parts(&self) -> QueryParts {
        QueryParts {
            select: self.select.clone(),
            where_clause: self.where_clause.clone(),
            group_by: self.group_by.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
            time_range: self.time_range.clone(),
            tenant_id: self.tenant_id.clone(),
            query_id: self.query_id.clone(),
            source_query: self.source_query.clone(),
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn select(&self) -> &[SelectField] {
        &self.select
    }

    pub fn where_clause(&self) -> Option<&Predicate> {
        self.where_clause.as_ref()
    }

    pub fn group_by(&self) -> Option<&GroupBy> {
        self.group_by.as_ref()
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn time_range(&self) -> Option<&TimeRange> {
        self.time_range.as_ref()
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn source_query(&self) -> Option<&str> {
        self.source_query.as_deref()
    }
}
