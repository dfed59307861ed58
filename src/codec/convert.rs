//! Lossless numeric coercion between wire value variants.
//!
//! A peer may have been built against an older revision of a packet where,
//! say, a counter was an `i32` and is now an `i64`. Decoding keeps the wire
//! variant and the typed accessor widens or narrows here, refusing any
//! conversion that would change the number.

use crate::codec::unit::Unit;
use crate::codec::value::Value;

fn as_integer(value: &Value) -> Option<i128> {
    Some(match value {
        Value::Byte(v) => *v as i128,
        Value::Bool(v) => *v as i128,
        Value::Short(v) => *v as i128,
        Value::UShort(v) => *v as i128,
        Value::Int(v) => *v as i128,
        Value::UInt(v) => *v as i128,
        Value::Long(v) => *v as i128,
        Value::ULong(v) => *v as i128,
        _ => return None,
    })
}

fn as_float(value: &Value) -> Option<f64> {
    Some(match value {
        Value::Float(v) => *v as f64,
        Value::Double(v) => *v,
        _ => as_integer(value)? as f64,
    })
}

/// Convert `value` to the requested base type, or `None` when the value is
/// not numeric, is out of range, or the target is not a numeric type the
/// source can reach.
pub fn cast(value: &Value, target: Unit) -> Option<Value> {
    if value.unit() == Some(target) && !matches!(value, Value::Array(_, _)) {
        return Some(value.clone());
    }

    match target {
        Unit::Byte => as_integer(value)?.try_into().ok().map(Value::Byte),
        Unit::Bool => as_integer(value).map(|v| Value::Bool(v != 0)),
        Unit::Short => as_integer(value)?.try_into().ok().map(Value::Short),
        Unit::UShort => as_integer(value)?.try_into().ok().map(Value::UShort),
        Unit::Int => as_integer(value)?.try_into().ok().map(Value::Int),
        Unit::UInt => as_integer(value)?.try_into().ok().map(Value::UInt),
        Unit::Long => as_integer(value)?.try_into().ok().map(Value::Long),
        Unit::ULong => as_integer(value)?.try_into().ok().map(Value::ULong),
        Unit::Float => as_float(value).map(|v| Value::Float(v as f32)),
        Unit::Double => as_float(value).map(Value::Double),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widening_integers() {
        assert_eq!(cast(&Value::Byte(200), Unit::Int), Some(Value::Int(200)));
        assert_eq!(cast(&Value::Int(-5), Unit::Long), Some(Value::Long(-5)));
        assert_eq!(
            cast(&Value::UInt(u32::MAX), Unit::Long),
            Some(Value::Long(u32::MAX as i64))
        );
    }

    #[test]
    fn test_narrowing_checks_range() {
        assert_eq!(cast(&Value::Long(255), Unit::Byte), Some(Value::Byte(255)));
        assert_eq!(cast(&Value::Long(256), Unit::Byte), None);
        assert_eq!(cast(&Value::Int(-1), Unit::ULong), None);
    }

    #[test]
    fn test_integer_to_float() {
        assert_eq!(cast(&Value::Int(3), Unit::Double), Some(Value::Double(3.0)));
        assert_eq!(
            cast(&Value::Double(2.5), Unit::Float),
            Some(Value::Float(2.5))
        );
    }

    #[test]
    fn test_non_numeric_refuses() {
        assert_eq!(cast(&Value::String("1".into()), Unit::Int), None);
        assert_eq!(cast(&Value::Null, Unit::Int), None);
        assert_eq!(cast(&Value::Int(1), Unit::String), None);
    }
}
