//! Normalization of written values to controller integers.
//!
//! Every value stored on a controller or sent to a subscriber is an `i64`.
//! Requests may carry booleans, numbers or numeric strings; anything else is
//! rejected.

use serde_json::Value;
use thiserror::Error;

/// Rejection of a value that cannot be turned into an integer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("value must be int-like")]
    NotIntLike,

    #[error("value out of range")]
    OutOfRange,
}

/// The value shapes accepted in a write request.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// `true` / `false`, stored as 1 / 0.
    Bool(bool),
    /// A JSON integer.
    Integer(i64),
    /// A JSON number with a fractional part or exponent, truncated.
    Float(f64),
    /// A string holding an optional sign followed by ASCII digits.
    Text(String),
}

impl InputValue {
    /// Classify a JSON value. Null, arrays, objects and integers beyond the
    /// `i64` range have no accepted shape.
    pub fn from_json(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Integer(i))
                } else if n.is_u64() {
                    Err(ValueError::OutOfRange)
                } else {
                    n.as_f64().map(Self::Float).ok_or(ValueError::NotIntLike)
                }
            }
            Value::String(s) => Ok(Self::Text(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => Err(ValueError::NotIntLike),
        }
    }

    /// Convert to the integer written to the controller.
    pub fn to_int(&self) -> Result<i64, ValueError> {
        match self {
            Self::Bool(b) => Ok(i64::from(*b)),
            Self::Integer(i) => Ok(*i),
            Self::Float(f) => truncate(*f),
            Self::Text(s) => parse_int_text(s),
        }
    }
}

/// Normalize a JSON value in one step.
///
/// # Example
/// ```
/// use plcbridge_common::value::{normalize, ValueError};
/// use serde_json::json;
///
/// assert_eq!(normalize(&json!(true)), Ok(1));
/// assert_eq!(normalize(&json!("-12")), Ok(-12));
/// assert_eq!(normalize(&json!(3.9)), Ok(3));
/// assert_eq!(normalize(&json!("abc")), Err(ValueError::NotIntLike));
/// ```
pub fn normalize(value: &Value) -> Result<i64, ValueError> {
    InputValue::from_json(value)?.to_int()
}

fn truncate(f: f64) -> Result<i64, ValueError> {
    if !f.is_finite() {
        return Err(ValueError::NotIntLike);
    }

    let truncated = f.trunc();
    // i64::MAX is not representable as f64; 2^63 is the first value past it.
    if truncated < i64::MIN as f64 || truncated >= 9_223_372_036_854_775_808.0 {
        return Err(ValueError::OutOfRange);
    }

    Ok(truncated as i64)
}

fn parse_int_text(s: &str) -> Result<i64, ValueError> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix('-')
        .or_else(|| trimmed.strip_prefix('+'))
        .unwrap_or(trimmed);

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValueError::NotIntLike);
    }

    trimmed.parse::<i64>().map_err(|_| ValueError::OutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_one_in_every_shape() {
        assert_eq!(normalize(&json!("1")), Ok(1));
        assert_eq!(normalize(&json!(1)), Ok(1));
        assert_eq!(normalize(&json!(true)), Ok(1));
        assert_eq!(normalize(&json!(1.0)), Ok(1));
    }

    #[test]
    fn test_booleans() {
        assert_eq!(normalize(&json!(false)), Ok(0));
        assert_eq!(InputValue::from_json(&json!(true)), Ok(InputValue::Bool(true)));
    }

    #[test]
    fn test_floats_truncate_toward_zero() {
        assert_eq!(normalize(&json!(2.7)), Ok(2));
        assert_eq!(normalize(&json!(-2.7)), Ok(-2));
        assert_eq!(normalize(&json!(1e3)), Ok(1000));
        assert_eq!(normalize(&json!(1e30)), Err(ValueError::OutOfRange));
    }

    #[test]
    fn test_signed_strings() {
        assert_eq!(normalize(&json!("+42")), Ok(42));
        assert_eq!(normalize(&json!("-7")), Ok(-7));
        assert_eq!(normalize(&json!(" 15 ")), Ok(15));
    }

    #[test]
    fn test_rejected_strings() {
        for bad in ["abc", "", "-", "+", "--5", "1.5", "0x10", "1e3", "12a"] {
            assert_eq!(normalize(&json!(bad)), Err(ValueError::NotIntLike), "{bad:?}");
        }
        assert_eq!(
            normalize(&json!("99999999999999999999")),
            Err(ValueError::OutOfRange)
        );
    }

    #[test]
    fn test_rejected_shapes() {
        assert_eq!(normalize(&Value::Null), Err(ValueError::NotIntLike));
        assert_eq!(normalize(&json!([1])), Err(ValueError::NotIntLike));
        assert_eq!(normalize(&json!({"v": 1})), Err(ValueError::NotIntLike));
        assert_eq!(normalize(&json!(u64::MAX)), Err(ValueError::OutOfRange));
    }
}
