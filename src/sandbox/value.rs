//! 运行时值：直接使用 serde_json::Value，工具参数与返回值无需再转换
//!
//! 整数运算保持整数（溢出时报错），`/` 只有整除时才得到整数。
//! 拼接与字面量构造出的值不能超过 MAX_VALUE_LEN（字符串按字符、容器按元素计）。

use std::cmp::Ordering;

use serde_json::{Number, Value};

/// 把值渲染为给人/模型看的文本：字符串原样输出，其余按 JSON
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// 单个值的规模上限
pub(crate) const MAX_VALUE_LEN: usize = 1_000_000;

/// 值的规模：字符串字符数 + 所有容器元素数（递归），超过上限即停止计数
fn value_len(value: &Value) -> usize {
    let mut total = 0usize;
    let mut stack = vec![value];
    while let Some(v) = stack.pop() {
        match v {
            Value::String(s) => total += s.chars().count(),
            Value::Array(items) => {
                total += items.len();
                stack.extend(items.iter());
            }
            Value::Object(map) => {
                total += map.len();
                stack.extend(map.values());
            }
            _ => {}
        }
        if total > MAX_VALUE_LEN {
            break;
        }
    }
    total
}

pub(crate) fn check_len(value: Value) -> Result<Value, String> {
    if value_len(&value) > MAX_VALUE_LEN {
        return Err(format!(
            "value too large: {} exceeds {MAX_VALUE_LEN} characters/elements",
            type_name(&value)
        ));
    }
    Ok(value)
}

/// 数值的两种表示
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub(crate) fn of(value: &Value) -> Option<Num> {
        let Value::Number(n) = value else {
            return None;
        };
        if let Some(i) = n.as_i64() {
            Some(Num::Int(i))
        } else {
            n.as_f64().map(Num::Float)
        }
    }

    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    pub(crate) fn into_value(self) -> Result<Value, String> {
        match self {
            Num::Int(i) => Ok(Value::from(i)),
            Num::Float(f) => float_value(f),
        }
    }
}

pub(crate) fn float_value(f: f64) -> Result<Value, String> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| format!("non-finite number: {f}"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl ArithOp {
    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Rem => "%",
        }
    }
}

/// 二元算术；`+` 额外支持字符串拼接与数组拼接
pub(crate) fn arith(op: ArithOp, lhs: &Value, rhs: &Value) -> Result<Value, String> {
    if op == ArithOp::Add {
        match (lhs, rhs) {
            (Value::String(a), b) => {
                return check_len(Value::String(format!("{a}{}", render_value(b))))
            }
            (a, Value::String(b)) => {
                return check_len(Value::String(format!("{}{b}", render_value(a))))
            }
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                return check_len(Value::Array(out));
            }
            _ => {}
        }
    }
    let (Some(a), Some(b)) = (Num::of(lhs), Num::of(rhs)) else {
        return Err(format!(
            "unsupported operand types for {}: {} and {}",
            op.symbol(),
            type_name(lhs),
            type_name(rhs)
        ));
    };
    let result = match (a, b) {
        (Num::Int(x), Num::Int(y)) => int_arith(op, x, y)?,
        _ => float_arith(op, a.as_f64(), b.as_f64())?,
    };
    result.into_value()
}

fn int_arith(op: ArithOp, x: i64, y: i64) -> Result<Num, String> {
    let overflow = || format!("integer overflow in {x} {} {y}", op.symbol());
    match op {
        ArithOp::Add => x.checked_add(y).map(Num::Int).ok_or_else(overflow),
        ArithOp::Sub => x.checked_sub(y).map(Num::Int).ok_or_else(overflow),
        ArithOp::Mul => x.checked_mul(y).map(Num::Int).ok_or_else(overflow),
        ArithOp::Div => {
            if y == 0 {
                return Err("division by zero".to_string());
            }
            if x % y == 0 {
                x.checked_div(y).map(Num::Int).ok_or_else(overflow)
            } else {
                Ok(Num::Float(x as f64 / y as f64))
            }
        }
        ArithOp::Rem => {
            if y == 0 {
                return Err("modulo by zero".to_string());
            }
            x.checked_rem(y).map(Num::Int).ok_or_else(overflow)
        }
    }
}

fn float_arith(op: ArithOp, x: f64, y: f64) -> Result<Num, String> {
    let r = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div | ArithOp::Rem if y == 0.0 => return Err("division by zero".to_string()),
        ArithOp::Div => x / y,
        ArithOp::Rem => x % y,
    };
    Ok(Num::Float(r))
}

/// 相等：数值按大小比较（1 == 1.0），其余按结构比较
pub(crate) fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (Num::of(lhs), Num::of(rhs)) {
        (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

/// 有序比较只对数值与字符串定义
pub(crate) fn compare(lhs: &Value, rhs: &Value) -> Result<Ordering, String> {
    if let (Some(a), Some(b)) = (Num::of(lhs), Num::of(rhs)) {
        return a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .ok_or_else(|| "cannot compare NaN".to_string());
    }
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(format!(
            "cannot compare {} with {}",
            type_name(lhs),
            type_name(rhs)
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_arithmetic_stays_integral() {
        assert_eq!(arith(ArithOp::Mul, &json!(25), &json!(4)).unwrap(), json!(100));
        assert_eq!(arith(ArithOp::Div, &json!(10), &json!(2)).unwrap(), json!(5));
        assert_eq!(arith(ArithOp::Div, &json!(7), &json!(2)).unwrap(), json!(3.5));
    }

    #[test]
    fn test_division_by_zero_is_error() {
        assert!(arith(ArithOp::Div, &json!(1), &json!(0)).is_err());
        assert!(arith(ArithOp::Rem, &json!(1.5), &json!(0)).is_err());
    }

    #[test]
    fn test_string_concat_renders_other_side() {
        assert_eq!(
            arith(ArithOp::Add, &json!("n="), &json!(3)).unwrap(),
            json!("n=3")
        );
    }

    #[test]
    fn test_concat_is_size_limited() {
        let half = json!("a".repeat(MAX_VALUE_LEN / 2));
        assert!(arith(ArithOp::Add, &half, &half).is_ok());
        let err = arith(ArithOp::Add, &half, &json!("a".repeat(MAX_VALUE_LEN / 2 + 1))).unwrap_err();
        assert!(err.contains("too large"));

        let items = Value::Array(vec![json!(0); MAX_VALUE_LEN / 2 + 1]);
        assert!(arith(ArithOp::Add, &items, &items).is_err());
    }

    #[test]
    fn test_nested_size_counts_children() {
        let inner = Value::Array(vec![json!(1); 10]);
        assert_eq!(value_len(&json!({"a": inner.clone(), "b": [inner, "xyz"]})), 2 + 10 + 2 + 10 + 3);
    }

    #[test]
    fn test_overflow_reported() {
        assert!(arith(ArithOp::Add, &json!(i64::MAX), &json!(1)).is_err());
    }

    #[test]
    fn test_render_and_equality() {
        assert_eq!(render_value(&json!("110")), "110");
        assert_eq!(render_value(&json!(110)), "110");
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(!truthy(&json!("")));
        assert_eq!(compare(&json!("a"), &json!("b")).unwrap(), Ordering::Less);
    }
}
