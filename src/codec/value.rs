//! Dynamic value model the codec encodes and decodes.
//!
//! A [`Value`] is the self-describing intermediate form between typed
//! application structs and the wire. Objects are held behind `Arc` so a
//! graph that shares one instance in several places encodes it once and
//! decodes back to a shared instance.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use uuid::Uuid;

use crate::codec::convert;
use crate::codec::unit::Unit;

/// A decoded or to-be-encoded wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Byte(u8),
    Bool(bool),
    Char(char),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    Object(Arc<ObjectValue>),
    DateTime(NaiveDateTime),
    String(String),
    BiasedDateTime(DateTime<FixedOffset>),
    Guid(Uuid),
    /// Homogeneous array of the given base type.
    Array(Unit, Vec<Value>),
}

impl Value {
    /// Base type of this value, if it has one (`Null` does not).
    pub fn unit(&self) -> Option<Unit> {
        Some(match self {
            Value::Null => return None,
            Value::Byte(_) => Unit::Byte,
            Value::Bool(_) => Unit::Bool,
            Value::Char(_) => Unit::Char,
            Value::Short(_) => Unit::Short,
            Value::UShort(_) => Unit::UShort,
            Value::Int(_) => Unit::Int,
            Value::UInt(_) => Unit::UInt,
            Value::Long(_) => Unit::Long,
            Value::ULong(_) => Unit::ULong,
            Value::Float(_) => Unit::Float,
            Value::Double(_) => Unit::Double,
            Value::Object(_) => Unit::Object,
            Value::DateTime(_) => Unit::DateTime,
            Value::String(_) => Unit::String,
            Value::BiasedDateTime(_) => Unit::BiasedDateTime,
            Value::Guid(_) => Unit::Guid,
            Value::Array(unit, _) => *unit,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Named bag of properties with a type name, kept sorted so that encoding
/// order is deterministic. Property lookup ignores ASCII case.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectValue {
    type_name: String,
    props: Vec<(String, Value)>,
}

fn name_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.bytes().map(|b| b.to_ascii_lowercase());
    let mut bi = b.bytes().map(|b| b.to_ascii_lowercase());
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(&y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

impl ObjectValue {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            props: Vec::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Set a property, replacing an existing one with the same
    /// (case-insensitive) name.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.props.binary_search_by(|(n, _)| name_cmp(n, &name)) {
            Ok(index) => self.props[index].1 = value,
            Err(index) => self.props.insert(index, (name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.props
            .binary_search_by(|(n, _)| name_cmp(n, name))
            .ok()
            .map(|index| &self.props[index].1)
    }

    /// Properties in encoding order.
    pub fn props(&self) -> &[(String, Value)] {
        &self.props
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }
}

/// Conversion into the dynamic value model.
pub trait ToValue {
    /// Wire type this Rust type maps to.
    fn unit() -> Unit
    where
        Self: Sized;

    fn to_value(&self) -> Value;
}

/// Conversion out of the dynamic value model. Returns `None` when the value
/// cannot represent `Self`, which callers usually treat as "keep the
/// default".
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! scalar_value {
    ($ty:ty, $unit:ident, $variant:ident) => {
        impl ToValue for $ty {
            fn unit() -> Unit {
                Unit::$unit
            }

            fn to_value(&self) -> Value {
                Value::$variant(self.clone())
            }
        }

        impl FromValue for $ty {
            fn from_value(value: &Value) -> Option<Self> {
                match convert::cast(value, Unit::$unit)? {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

scalar_value!(u8, Byte, Byte);
scalar_value!(bool, Bool, Bool);
scalar_value!(char, Char, Char);
scalar_value!(i16, Short, Short);
scalar_value!(u16, UShort, UShort);
scalar_value!(i32, Int, Int);
scalar_value!(u32, UInt, UInt);
scalar_value!(i64, Long, Long);
scalar_value!(u64, ULong, ULong);
scalar_value!(f32, Float, Float);
scalar_value!(f64, Double, Double);
scalar_value!(NaiveDateTime, DateTime, DateTime);
scalar_value!(Uuid, Guid, Guid);

impl ToValue for DateTime<FixedOffset> {
    fn unit() -> Unit {
        Unit::BiasedDateTime
    }

    fn to_value(&self) -> Value {
        Value::BiasedDateTime(*self)
    }
}

impl FromValue for DateTime<FixedOffset> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::BiasedDateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

impl ToValue for String {
    fn unit() -> Unit {
        Unit::String
    }

    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn unit() -> Unit {
        T::unit()
    }

    fn to_value(&self) -> Value {
        match self {
            Some(inner) => inner.to_value(),
            None => Value::Null,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Option<Self> {
        if value.is_null() {
            Some(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl<T: ToValue> ToValue for Vec<T> {
    fn unit() -> Unit {
        T::unit()
    }

    fn to_value(&self) -> Value {
        Value::Array(T::unit(), self.iter().map(ToValue::to_value).collect())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(_, items) => items.iter().map(T::from_value).collect(),
            _ => None,
        }
    }
}

impl ToValue for Arc<ObjectValue> {
    fn unit() -> Unit {
        Unit::Object
    }

    fn to_value(&self) -> Value {
        Value::Object(Arc::clone(self))
    }
}

impl FromValue for Arc<ObjectValue> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(obj) => Some(Arc::clone(obj)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_props_stay_sorted() {
        let mut obj = ObjectValue::new("Thing");
        obj.set("zeta", Value::Int(1));
        obj.set("Alpha", Value::Int(2));
        obj.set("mid", Value::Int(3));

        let names: Vec<&str> = obj.props().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["Alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_get_ignores_case_and_set_replaces() {
        let mut obj = ObjectValue::new("Thing");
        obj.set("Name", Value::String("a".into()));
        obj.set("NAME", Value::String("b".into()));

        assert_eq!(obj.len(), 1);
        assert_eq!(obj.get("name"), Some(&Value::String("b".into())));
        assert_eq!(obj.get("missing"), None);
    }

    #[test]
    fn test_numeric_from_value_coerces() {
        assert_eq!(i64::from_value(&Value::Int(42)), Some(42));
        assert_eq!(i32::from_value(&Value::Byte(7)), Some(7));
        assert_eq!(f64::from_value(&Value::Float(1.5)), Some(1.5));
        // Out of range values refuse to convert.
        assert_eq!(u8::from_value(&Value::Int(300)), None);
        assert_eq!(u32::from_value(&Value::Int(-1)), None);
    }

    #[test]
    fn test_option_and_vec_conversions() {
        let none: Option<i32> = None;
        assert_eq!(none.to_value(), Value::Null);
        assert_eq!(Option::<i32>::from_value(&Value::Null), Some(None));
        assert_eq!(Option::<i32>::from_value(&Value::Int(9)), Some(Some(9)));

        let values = vec![1i32, 2, 3].to_value();
        assert_eq!(
            values,
            Value::Array(Unit::Int, vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(Vec::<i32>::from_value(&values), Some(vec![1, 2, 3]));
    }
}
