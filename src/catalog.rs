//! 字段目录：校验时使用的字段名到类型的权威映射

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 事件字段、字面量或函数结果的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Timestamp,
    IpAddress,
    Json,
    Array,
    Boolean,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Timestamp => "timestamp",
            FieldType::IpAddress => "ip_address",
            FieldType::Json => "json",
            FieldType::Array => "array",
            FieldType::Boolean => "boolean",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float)
    }

    /// `other` 类型的值能否与本类型比较
    ///
    /// 整数与浮点数可互相比较，其余类型必须完全一致
    pub fn is_comparable_with(&self, other: FieldType) -> bool {
        *self == other || (self.is_numeric() && other.is_numeric())
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 字段名（如 `process.name`）到类型的只读映射
///
/// 由宿主程序构建一次，在并发校验之间以引用共享；
/// 构建后本 crate 不会再修改它
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldCatalog {
    fields: HashMap<String, FieldType>,
}

impl FieldCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, field_type: FieldType) {
        self.fields.insert(name.into(), field_type);
    }

    /// 已知字段的类型
    pub fn lookup(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// 按字母排序的字段名
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// 常用 OCSF 事件字段目录，宿主未提供目录时使用
    pub fn ocsf_default() -> Self {
        let entries = [
            ("time", FieldType::Timestamp),
            ("activity_name", FieldType::String),
            ("activity_id", FieldType::Integer),
            ("category_name", FieldType::String),
            ("class_name", FieldType::String),
            ("class_uid", FieldType::Integer),
            ("severity", FieldType::String),
            ("severity_id", FieldType::Integer),
            ("status", FieldType::String),
            ("message", FieldType::String),
            ("src_ip", FieldType::IpAddress),
            ("dst_ip", FieldType::IpAddress),
            ("src_endpoint.ip", FieldType::IpAddress),
            ("src_endpoint.port", FieldType::Integer),
            ("dst_endpoint.ip", FieldType::IpAddress),
            ("dst_endpoint.port", FieldType::Integer),
            ("device.ip", FieldType::IpAddress),
            ("device.hostname", FieldType::String),
            ("user.name", FieldType::String),
            ("user.uid", FieldType::String),
            ("process.name", FieldType::String),
            ("process.pid", FieldType::Integer),
            ("process.cmd_line", FieldType::String),
            ("file.name", FieldType::String),
            ("file.size", FieldType::Integer),
            ("traffic.bytes", FieldType::Integer),
            ("risk_score", FieldType::Float),
            ("is_alert", FieldType::Boolean),
            ("observables", FieldType::Array),
            ("unmapped", FieldType::Json),
        ];
        let mut catalog = Self::new();
        for (name, field_type) in entries {
            catalog.insert(name, field_type);
        }
        catalog
    }
}
