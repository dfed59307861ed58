//! Typed packet support.
//!
//! A [`Packet`] is a struct that maps to one wire object type. The
//! [`wire_packet!`] macro declares the struct together with its value
//! conversions, so a packet definition stays a single block:
//!
//! ```
//! use wirepeer::wire_packet;
//!
//! wire_packet! {
//!     /// Reading reported by a sensor.
//!     pub struct SensorReading {
//!         pub sensor: String,
//!         pub celsius: f64,
//!         pub sampled: Vec<i64>,
//!     }
//! }
//! ```
//!
//! Decoding is tolerant: properties missing from the wire object (an older
//! peer, say) fall back to `Default`, and unknown wire properties are
//! ignored.

use crate::codec::value::{FromValue, ToValue};
use crate::codec::wire::wire_hash;

/// A typed message with a stable wire identity.
pub trait Packet: ToValue + FromValue + Send + 'static {
    /// Wire type name, also the name of the encoded object.
    const TYPE_NAME: &'static str;

    /// Numeric id used in the message header to route to a handler.
    fn message_id() -> i32 {
        wire_hash(Self::TYPE_NAME)
    }
}

/// Declare a packet struct plus its [`Packet`], [`ToValue`] and
/// [`FromValue`] implementations. An optional string after the struct name
/// overrides the wire type name.
#[macro_export]
macro_rules! wire_packet {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident $(: $alias:literal)? {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: $ty,
            )*
        }

        impl $crate::codec::ToValue for $name {
            fn unit() -> $crate::codec::Unit {
                $crate::codec::Unit::Object
            }

            fn to_value(&self) -> $crate::codec::Value {
                let mut obj = $crate::codec::ObjectValue::new(
                    <Self as $crate::codec::Packet>::TYPE_NAME,
                );
                $(
                    obj.set(
                        stringify!($field),
                        $crate::codec::ToValue::to_value(&self.$field),
                    );
                )*
                $crate::codec::Value::Object(::std::sync::Arc::new(obj))
            }
        }

        impl $crate::codec::FromValue for $name {
            fn from_value(value: &$crate::codec::Value) -> ::std::option::Option<Self> {
                let $crate::codec::Value::Object(obj) = value else {
                    return ::std::option::Option::None;
                };
                ::std::option::Option::Some(Self {
                    $(
                        $field: obj
                            .get(stringify!($field))
                            .and_then($crate::codec::FromValue::from_value)
                            .unwrap_or_default(),
                    )*
                })
            }
        }

        impl $crate::codec::Packet for $name {
            const TYPE_NAME: &'static str = $crate::wire_packet!(@name $name $(, $alias)?);
        }
    };

    (@name $name:ident) => {
        stringify!($name)
    };
    (@name $name:ident, $alias:literal) => {
        $alias
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::codec::value::{FromValue, ObjectValue, ToValue, Value};
    use crate::codec::wire::wire_hash;
    use crate::codec::Packet;

    wire_packet! {
        pub struct Ping {
            pub count: i32,
            pub label: String,
        }
    }

    wire_packet! {
        pub struct Telemetry: "Sensors.Telemetry" {
            pub readings: Vec<f64>,
            pub source: Option<String>,
        }
    }

    #[test]
    fn test_value_roundtrip() {
        let ping = Ping {
            count: 3,
            label: "hey".into(),
        };
        let value = ping.to_value();
        assert_eq!(Ping::from_value(&value), Some(ping));
    }

    #[test]
    fn test_type_name_and_id() {
        assert_eq!(Ping::TYPE_NAME, "Ping");
        assert_eq!(Telemetry::TYPE_NAME, "Sensors.Telemetry");
        assert_eq!(Ping::message_id(), wire_hash("Ping"));
    }

    #[test]
    fn test_missing_property_defaults() {
        // An object written by an older revision that lacks `label`.
        let mut obj = ObjectValue::new("Ping");
        obj.set("count", Value::Int(5));
        // And carries a property this revision does not know.
        obj.set("retired", Value::Bool(true));

        let ping = Ping::from_value(&Value::Object(Arc::new(obj))).unwrap();
        assert_eq!(ping.count, 5);
        assert_eq!(ping.label, "");
    }

    #[test]
    fn test_non_object_refuses() {
        assert_eq!(Ping::from_value(&Value::Int(1)), None);
    }
}
