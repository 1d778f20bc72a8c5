//! 期望值比较
//!
//! 按字段策略比较期望值与实际值, 产出字段级差异。比较是纯函数, 无状态且结果确定。
//!
//! 期望值示例 (YAML):
//!
//! ```yaml
//! policy: object
//! fields:
//!   result: { policy: exact, value: ok }
//!   voltage: { policy: numeric_tolerance, value: 12.0, epsilon: 0.5 }
//!   vin: { policy: regex, pattern: "^LSV[A-Z0-9]{14}$" }
//!   session: { policy: exists_only }
//!   timestamp: { policy: ignore }
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 期望值规格
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ExpectSpec {
    /// 结构相等 (数值按数值比较)
    Exact { value: Value },

    /// 只要求字段存在
    #[default]
    Ignore,

    /// 数值容差: |actual - value| <= epsilon
    NumericTolerance { value: Value, epsilon: f64 },

    /// 标量的文本形式匹配正则
    Regex { pattern: String },

    /// 字段存在且不为 null
    ExistsOnly,

    /// 嵌套对象, 未列出的字段忽略
    Object { fields: BTreeMap<String, ExpectSpec> },
}

impl ExpectSpec {
    /// 由一个 JSON 值构造全部为 exact 的期望树
    ///
    /// 对象逐字段展开, 其余值整体按 exact 比较。
    pub fn exact_from(value: &Value) -> Self {
        match value {
            Value::Object(map) => ExpectSpec::Object {
                fields: map
                    .iter()
                    .map(|(k, v)| (k.clone(), ExpectSpec::exact_from(v)))
                    .collect(),
            },
            other => ExpectSpec::Exact {
                value: other.clone(),
            },
        }
    }

    pub fn exact(value: Value) -> Self {
        ExpectSpec::Exact { value }
    }

    pub fn tolerance(value: impl Into<Value>, epsilon: f64) -> Self {
        ExpectSpec::NumericTolerance {
            value: value.into(),
            epsilon,
        }
    }

    pub fn regex(pattern: &str) -> Self {
        ExpectSpec::Regex {
            pattern: pattern.to_string(),
        }
    }

    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, ExpectSpec)>,
        K: Into<String>,
    {
        ExpectSpec::Object {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// 策略名称
    pub fn policy(&self) -> &'static str {
        match self {
            ExpectSpec::Exact { .. } => "exact",
            ExpectSpec::Ignore => "ignore",
            ExpectSpec::NumericTolerance { .. } => "numeric_tolerance",
            ExpectSpec::Regex { .. } => "regex",
            ExpectSpec::ExistsOnly => "exists_only",
            ExpectSpec::Object { .. } => "object",
        }
    }
}

/// 差异类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// 实际值缺少该字段
    Missing,
    /// 值不相等
    NotEqual,
    /// 超出数值容差
    OutOfTolerance,
    /// 无法转换为数值
    NotNumeric,
    /// 正则不匹配
    PatternMismatch,
    /// 值为 null
    NullValue,
    /// 类型不符 (例如期望对象)
    TypeMismatch,
    /// 期望规格本身无效 (非法正则、非法容差)
    InvalidSpec,
}

/// 单个字段的差异
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    /// 字段路径, 根为 `$`
    pub path: String,
    pub kind: MismatchKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    pub message: String,
}

/// 比较结果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Diff {
    pub passed: bool,
    #[serde(default)]
    pub mismatches: Vec<Mismatch>,
}

impl Diff {
    fn from_mismatches(mismatches: Vec<Mismatch>) -> Self {
        Self {
            passed: mismatches.is_empty(),
            mismatches,
        }
    }

    /// 一行摘要
    pub fn summary(&self) -> String {
        if self.passed {
            return "match".to_string();
        }
        self.mismatches
            .iter()
            .map(|m| format!("{}: {}", m.path, m.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// 比较期望值与实际值
pub fn compare(expected: &ExpectSpec, actual: &Value) -> Diff {
    let mut mismatches = Vec::new();
    compare_at("$", expected, actual, &mut mismatches);
    Diff::from_mismatches(mismatches)
}

fn compare_at(path: &str, spec: &ExpectSpec, actual: &Value, out: &mut Vec<Mismatch>) {
    match spec {
        ExpectSpec::Ignore => {}

        ExpectSpec::ExistsOnly => {
            if actual.is_null() {
                out.push(Mismatch {
                    path: path.to_string(),
                    kind: MismatchKind::NullValue,
                    expected: None,
                    actual: Some(Value::Null),
                    message: "expected a non-null value".to_string(),
                });
            }
        }

        ExpectSpec::Exact { value } => {
            if !json_equal(value, actual) {
                out.push(Mismatch {
                    path: path.to_string(),
                    kind: MismatchKind::NotEqual,
                    expected: Some(value.clone()),
                    actual: Some(actual.clone()),
                    message: format!("expected {}, got {}", value, actual),
                });
            }
        }

        ExpectSpec::NumericTolerance { value, epsilon } => {
            compare_numeric(path, value, *epsilon, actual, out);
        }

        ExpectSpec::Regex { pattern } => {
            compare_regex(path, pattern, actual, out);
        }

        ExpectSpec::Object { fields } => {
            let Some(map) = actual.as_object() else {
                out.push(Mismatch {
                    path: path.to_string(),
                    kind: MismatchKind::TypeMismatch,
                    expected: None,
                    actual: Some(actual.clone()),
                    message: format!("expected an object, got {}", type_name(actual)),
                });
                return;
            };

            for (name, field_spec) in fields {
                let field_path = format!("{}.{}", path, name);
                match map.get(name) {
                    Some(field_value) => compare_at(&field_path, field_spec, field_value, out),
                    None => out.push(Mismatch {
                        path: field_path,
                        kind: MismatchKind::Missing,
                        expected: expected_value(field_spec),
                        actual: None,
                        message: format!("missing field ({})", field_spec.policy()),
                    }),
                }
            }
        }
    }
}

fn compare_numeric(
    path: &str,
    expected: &Value,
    epsilon: f64,
    actual: &Value,
    out: &mut Vec<Mismatch>,
) {
    if !epsilon.is_finite() || epsilon < 0.0 {
        out.push(Mismatch {
            path: path.to_string(),
            kind: MismatchKind::InvalidSpec,
            expected: Some(expected.clone()),
            actual: Some(actual.clone()),
            message: format!("invalid epsilon {}", epsilon),
        });
        return;
    }

    let (Some(e), Some(a)) = (coerce_f64(expected), coerce_f64(actual)) else {
        out.push(Mismatch {
            path: path.to_string(),
            kind: MismatchKind::NotNumeric,
            expected: Some(expected.clone()),
            actual: Some(actual.clone()),
            message: format!("cannot compare {} and {} numerically", expected, actual),
        });
        return;
    };

    let delta = (a - e).abs();
    if delta > epsilon {
        out.push(Mismatch {
            path: path.to_string(),
            kind: MismatchKind::OutOfTolerance,
            expected: Some(expected.clone()),
            actual: Some(actual.clone()),
            message: format!("|{} - {}| = {} exceeds {}", a, e, delta, epsilon),
        });
    }
}

fn compare_regex(path: &str, pattern: &str, actual: &Value, out: &mut Vec<Mismatch>) {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            out.push(Mismatch {
                path: path.to_string(),
                kind: MismatchKind::InvalidSpec,
                expected: Some(Value::String(pattern.to_string())),
                actual: Some(actual.clone()),
                message: format!("invalid pattern: {}", e),
            });
            return;
        }
    };

    let Some(text) = scalar_text(actual) else {
        out.push(Mismatch {
            path: path.to_string(),
            kind: MismatchKind::TypeMismatch,
            expected: Some(Value::String(pattern.to_string())),
            actual: Some(actual.clone()),
            message: format!("regex needs a scalar, got {}", type_name(actual)),
        });
        return;
    };

    if !re.is_match(&text) {
        out.push(Mismatch {
            path: path.to_string(),
            kind: MismatchKind::PatternMismatch,
            expected: Some(Value::String(pattern.to_string())),
            actual: Some(actual.clone()),
            message: format!("'{}' does not match /{}/", text, pattern),
        });
    }
}

/// 数值强制转换: JSON 数值、十进制字符串、`0x` 十六进制字符串
///
/// 转换失败或结果非有限值时返回 None。
pub fn coerce_f64(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => parse_numeric_str(s.trim())?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn parse_numeric_str(s: &str) -> Option<f64> {
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let n = u64::from_str_radix(hex, 16).ok()? as f64;
        return Some(if negative { -n } else { n });
    }

    // 拒绝 "inf"/"nan" 这类文本
    if !body.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
        return None;
    }

    s.parse::<f64>().ok()
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// 结构相等, 数值按数值比较 (`1 == 1.0`)
fn json_equal(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(e), Value::Number(a)) => {
            // 两侧都是整数时按整数比较, 避免 2^53 以上的精度丢失
            if let (Some(e), Some(a)) = (e.as_i64(), a.as_i64()) {
                return e == a;
            }
            if let (Some(e), Some(a)) = (e.as_u64(), a.as_u64()) {
                return e == a;
            }
            if !e.is_f64() && !a.is_f64() {
                // 一侧为负整数, 另一侧超出 i64
                return false;
            }
            match (e.as_f64(), a.as_f64()) {
                (Some(e), Some(a)) => e == a,
                _ => e == a,
            }
        }
        (Value::Array(e), Value::Array(a)) => {
            e.len() == a.len() && e.iter().zip(a).all(|(e, a)| json_equal(e, a))
        }
        (Value::Object(e), Value::Object(a)) => {
            e.len() == a.len()
                && e.iter()
                    .all(|(k, ev)| a.get(k).map(|av| json_equal(ev, av)).unwrap_or(false))
        }
        (e, a) => e == a,
    }
}

fn expected_value(spec: &ExpectSpec) -> Option<Value> {
    match spec {
        ExpectSpec::Exact { value } | ExpectSpec::NumericTolerance { value, .. } => {
            Some(value.clone())
        }
        ExpectSpec::Regex { pattern } => Some(Value::String(pattern.clone())),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
