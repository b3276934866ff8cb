//! 聚合函数与标量函数的签名注册表

use crate::catalog::FieldType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 单个参数接受的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ParamType {
    Any,
    Numeric,
    Exact(FieldType),
}

impl ParamType {
    pub fn accepts(&self, actual: FieldType) -> bool {
        match self {
            ParamType::Any => true,
            ParamType::Numeric => actual.is_numeric(),
            ParamType::Exact(expected) => *expected == actual,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Any => f.write_str("any"),
            ParamType::Numeric => f.write_str("numeric"),
            ParamType::Exact(t) => f.write_str(t.as_str()),
        }
    }
}

impl TryFrom<String> for ParamType {
    type Error = String;

    fn try_from(token: String) -> Result<Self, Self::Error> {
        match token.as_str() {
            "any" => Ok(ParamType::Any),
            "numeric" => Ok(ParamType::Numeric),
            other => parse_field_type(other).map(ParamType::Exact),
        }
    }
}

impl From<ParamType> for String {
    fn from(param: ParamType) -> Self {
        param.to_string()
    }
}

/// 函数的返回类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReturnType {
    Fixed(FieldType),
    /// 返回类型与第一个参数相同（`min`、`sum` 等）
    SameAsArg,
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnType::Fixed(t) => f.write_str(t.as_str()),
            ReturnType::SameAsArg => f.write_str("same_as_arg"),
        }
    }
}

impl TryFrom<String> for ReturnType {
    type Error = String;

    fn try_from(token: String) -> Result<Self, Self::Error> {
        match token.as_str() {
            "same_as_arg" => Ok(ReturnType::SameAsArg),
            other => parse_field_type(other).map(ReturnType::Fixed),
        }
    }
}

impl From<ReturnType> for String {
    fn from(ret: ReturnType) -> Self {
        ret.to_string()
    }
}

fn parse_field_type(token: &str) -> Result<FieldType, String> {
    serde_json::from_value(serde_json::Value::String(token.to_string()))
        .map_err(|_| format!("unknown type token '{}'", token))
}

/// 单个函数的签名
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub params: Vec<ParamType>,
    /// 最少参数个数，默认为 `params.len()`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_args: Option<usize>,
    pub returns: ReturnType,
    #[serde(default)]
    pub aggregate: bool,
}

impl FunctionSignature {
    pub fn scalar(params: Vec<ParamType>, returns: ReturnType) -> Self {
        Self {
            params,
            min_args: None,
            returns,
            aggregate: false,
        }
    }

    pub fn aggregate(params: Vec<ParamType>, returns: ReturnType) -> Self {
        Self {
            params,
            min_args: None,
            returns,
            aggregate: true,
        }
    }

    pub fn with_min_args(mut self, min_args: usize) -> Self {
        self.min_args = Some(min_args);
        self
    }

    pub fn min_args(&self) -> usize {
        self.min_args.unwrap_or(self.params.len())
    }

    pub fn max_args(&self) -> usize {
        self.params.len()
    }

    pub fn accepts_arity(&self, count: usize) -> bool {
        count >= self.min_args() && count <= self.max_args()
    }

    /// 根据实参类型确定具体返回类型
    ///
    /// `SameAsArg` 在没有实参时（如空参数的 `min()`）没有结果
    pub fn resolve_return(&self, arg_types: &[FieldType]) -> Option<FieldType> {
        match self.returns {
            ReturnType::Fixed(t) => Some(t),
            ReturnType::SameAsArg => arg_types.first().copied(),
        }
    }
}

/// 已知函数的只读注册表，键为小写函数名
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "HashMap<String, FunctionSignature>",
    into = "HashMap<String, FunctionSignature>"
)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionSignature>,
}

impl From<HashMap<String, FunctionSignature>> for FunctionRegistry {
    fn from(raw: HashMap<String, FunctionSignature>) -> Self {
        let mut registry = Self::new();
        for (name, signature) in raw {
            registry.register(name, signature);
        }
        registry
    }
}

impl From<FunctionRegistry> for HashMap<String, FunctionSignature> {
    fn from(registry: FunctionRegistry) -> Self {
        registry.functions
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, signature: FunctionSignature) {
        self.functions.insert(name.into().to_lowercase(), signature);
    }

    pub fn lookup(&self, name: &str) -> Option<&FunctionSignature> {
        self.functions.get(&name.to_lowercase())
    }

    pub fn is_aggregate(&self, name: &str) -> bool {
        self.lookup(name).is_some_and(|sig| sig.aggregate)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// 合并 `other` 中的全部函数，同名者被覆盖
    pub fn extend(&mut self, other: FunctionRegistry) {
        for (name, signature) in other.functions {
            self.register(name, signature);
        }
    }

    /// 聚合函数（`count`、`count_distinct`、`sum`、`avg`、`min`、`max`）
    /// 以及标量函数（`lower`、`upper`、`length`、`abs`）
    pub fn builtin() -> Self {
        use ParamType::{Any, Exact, Numeric};

        let mut registry = Self::new();
        registry.register(
            "count",
            FunctionSignature::aggregate(vec![Any], ReturnType::Fixed(FieldType::Integer))
                .with_min_args(0),
        );
        registry.register(
            "count_distinct",
            FunctionSignature::aggregate(vec![Any], ReturnType::Fixed(FieldType::Integer)),
        );
        registry.register(
            "sum",
            FunctionSignature::aggregate(vec![Numeric], ReturnType::SameAsArg),
        );
        registry.register(
            "avg",
            FunctionSignature::aggregate(vec![Numeric], ReturnType::Fixed(FieldType::Float)),
        );
        registry.register("min", FunctionSignature::aggregate(vec![Any], ReturnType::SameAsArg));
        registry.register("max", FunctionSignature::aggregate(vec![Any], ReturnType::SameAsArg));
        registry.register(
            "lower",
            FunctionSignature::scalar(vec![Exact(FieldType::String)], ReturnType::Fixed(FieldType::String)),
        );
        registry.register(
            "upper",
            FunctionSignature::scalar(vec![Exact(FieldType::String)], ReturnType::Fixed(FieldType::String)),
        );
        registry.register(
            "length",
            FunctionSignature::scalar(vec![Exact(FieldType::String)], ReturnType::Fixed(FieldType::Integer)),
        );
        registry.register("abs", FunctionSignature::scalar(vec![Numeric], ReturnType::SameAsArg));
        registry
    }
}
