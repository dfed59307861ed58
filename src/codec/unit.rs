//! Wire type tags.
//!
//! Every encoded value starts with a tag byte: the low six bits select the
//! data type, bit 6 marks an array of that type.

/// Keeps the type code out of the array bit.
pub const DATA_TYPE_MASK: u8 = 0x3f;

/// Set when the tagged value is an array of the base type.
pub const ARRAY_MASK: u8 = 0x40;

/// Base data types carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Unit {
    Byte = 1,
    Bool = 2,
    Char = 3,
    Short = 4,
    UShort = 5,
    Int = 6,
    UInt = 7,
    Long = 8,
    ULong = 9,
    Float = 10,
    Double = 11,
    Object = 12,
    DateTime = 13,
    String = 14,
    /// Timestamp with an explicit UTC offset, bit-packed.
    BiasedDateTime = 15,
    Guid = 16,
}

impl Unit {
    /// Decode a base type from a tag byte (array bit already masked off).
    pub fn from_code(code: u8) -> Option<Unit> {
        Some(match code {
            1 => Unit::Byte,
            2 => Unit::Bool,
            3 => Unit::Char,
            4 => Unit::Short,
            5 => Unit::UShort,
            6 => Unit::Int,
            7 => Unit::UInt,
            8 => Unit::Long,
            9 => Unit::ULong,
            10 => Unit::Float,
            11 => Unit::Double,
            12 => Unit::Object,
            13 => Unit::DateTime,
            14 => Unit::String,
            15 => Unit::BiasedDateTime,
            16 => Unit::Guid,
            _ => return None,
        })
    }

    /// Tag byte for a scalar of this type.
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Tag byte for an array of this type.
    #[inline]
    pub fn array_tag(self) -> u8 {
        self as u8 | ARRAY_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_roundtrip() {
        for code in 1..=16u8 {
            let unit = Unit::from_code(code).unwrap();
            assert_eq!(unit.tag(), code);
            assert_eq!(unit.array_tag(), code | ARRAY_MASK);
        }
        assert!(Unit::from_code(0).is_none());
        assert!(Unit::from_code(17).is_none());
    }

    #[test]
    fn test_array_tag_masks() {
        let tag = Unit::Int.array_tag();
        assert_ne!(tag & ARRAY_MASK, 0);
        assert_eq!(Unit::from_code(tag & DATA_TYPE_MASK), Some(Unit::Int));
    }
}
