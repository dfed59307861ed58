//! Bytes-to-value decoder, the inverse of [`crate::codec::encoder`].

use std::sync::Arc;

use tracing::warn;

use crate::codec::typeinfo::{TypeTable, INFO_ID_MASK, NEW_OBJECT_MASK};
use crate::codec::unit::{Unit, ARRAY_MASK, DATA_TYPE_MASK};
use crate::codec::value::{ObjectValue, Value};
use crate::codec::wire::{unpack_biased_datetime, unpack_datetime, WireReader};
use crate::error::{Result, WireError};

pub struct Decoder<'a, 'b> {
    table: &'a mut TypeTable,
    /// Slot per decoded object, reserved before its properties are read so
    /// back-reference indexes line up with the encoder's emission order.
    refs: Vec<Option<Arc<ObjectValue>>>,
    reader: WireReader<'b>,
}

impl<'a, 'b> Decoder<'a, 'b> {
    pub fn new(table: &'a mut TypeTable, payload: &'b [u8]) -> Self {
        Self {
            table,
            refs: Vec::new(),
            reader: WireReader::new(payload),
        }
    }

    /// Decode one payload.
    pub fn decode(mut self) -> Result<Value> {
        self.reader.check_preamble();
        self.read_value()
    }

    fn read_value(&mut self) -> Result<Value> {
        let tag = self.reader.read_u8()?;

        if tag == 0 {
            return Ok(Value::Null);
        }

        let unit = Unit::from_code(tag & DATA_TYPE_MASK)
            .ok_or_else(|| WireError::Decode(format!("unknown type tag 0x{tag:02x}")))?;

        if tag & ARRAY_MASK != 0 {
            return self.read_array(unit);
        }

        if unit == Unit::Object {
            return self.read_object();
        }

        self.read_scalar(unit)
    }

    /// Truncation is fatal, but a value whose bytes were fully consumed and
    /// only failed validation (unpaired char, bad UTF-8, impossible packed
    /// timestamp) leaves the cursor aligned: it decodes as null with a
    /// warning so the rest of the payload still comes through.
    fn read_scalar(&mut self, unit: Unit) -> Result<Value> {
        Ok(match unit {
            Unit::Byte => Value::Byte(self.reader.read_u8()?),
            Unit::Bool => Value::Bool(self.reader.read_bool()?),
            Unit::Char => {
                let raw = self.reader.read_u32()?;
                match char::from_u32(raw) {
                    Some(c) => Value::Char(c),
                    None => {
                        warn!(raw, "invalid char scalar decoded as null");
                        Value::Null
                    }
                }
            }
            Unit::Short => Value::Short(self.reader.read_i16()?),
            Unit::UShort => Value::UShort(self.reader.read_u16()?),
            Unit::Int => Value::Int(self.reader.read_i32()?),
            Unit::UInt => Value::UInt(self.reader.read_u32()?),
            Unit::Long => Value::Long(self.reader.read_i64()?),
            Unit::ULong => Value::ULong(self.reader.read_u64()?),
            Unit::Float => Value::Float(self.reader.read_f32()?),
            Unit::Double => Value::Double(self.reader.read_f64()?),
            Unit::DateTime => match unpack_datetime(self.reader.read_i64()?) {
                Ok(dt) => Value::DateTime(dt),
                Err(e) => {
                    warn!(error = %e, "invalid timestamp decoded as null");
                    Value::Null
                }
            },
            Unit::String => match self.read_lenient_str()? {
                Some(s) => Value::String(s),
                None => Value::String(String::new()),
            },
            Unit::BiasedDateTime => {
                let packed = self.reader.read_i64()?;
                let bias = self.reader.read_i16()?;
                match unpack_biased_datetime(packed, bias) {
                    Ok(dt) => Value::BiasedDateTime(dt),
                    Err(e) => {
                        warn!(error = %e, "invalid timestamp decoded as null");
                        Value::Null
                    }
                }
            }
            Unit::Guid => Value::Guid(self.reader.read_guid()?),
            Unit::Object => unreachable!("objects are handled by read_object"),
        })
    }

    /// Length-prefixed string where invalid UTF-8 reads as `None` (the bytes
    /// are consumed either way).
    fn read_lenient_str(&mut self) -> Result<Option<String>> {
        let size = self.reader.read_size()?;
        if size == 0 {
            return Ok(None);
        }
        let bytes = self.reader.read_bytes(size)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(Some(s.to_owned())),
            Err(e) => {
                warn!(error = %e, "invalid UTF-8 string dropped");
                Ok(None)
            }
        }
    }

    fn read_array(&mut self, unit: Unit) -> Result<Value> {
        let count = self.reader.read_size()?;
        let mut items = Vec::with_capacity(count.min(4096));

        match unit {
            Unit::Object => {
                for _ in 0..count {
                    items.push(self.read_value()?);
                }
            }
            Unit::String => {
                for _ in 0..count {
                    items.push(match self.read_lenient_str()? {
                        Some(s) => Value::String(s),
                        None => Value::Null,
                    });
                }
            }
            _ => {
                for _ in 0..count {
                    items.push(self.read_scalar(unit)?);
                }
            }
        }

        Ok(Value::Array(unit, items))
    }

    fn read_object(&mut self) -> Result<Value> {
        let leading = self.reader.read_u16()?;
        let isnew = leading & NEW_OBJECT_MASK != 0;

        let index;
        if isnew {
            let name = self.reader.read_str()?;
            let remote_id = leading & INFO_ID_MASK;

            let name = match name {
                // An absent name after the new-descriptor bit marks a
                // back-reference to an already decoded instance.
                None => {
                    let back = self.reader.read_i16()?;
                    return match self.refs.get(back as usize) {
                        Some(Some(obj)) => Ok(Value::Object(Arc::clone(obj))),
                        Some(None) => Err(WireError::Decode(format!(
                            "back-reference {back} points into an object still being decoded"
                        ))),
                        None => Err(WireError::Decode(format!(
                            "back-reference {back} out of range"
                        ))),
                    };
                }
                Some(name) => name,
            };

            index = self.table.store_remote(&name, remote_id);
            let count = self.reader.read_size()?;
            self.table.get_mut(index).remote_prop_count = count;
        } else {
            index = self.table.find_remote(leading).ok_or_else(|| {
                WireError::Decode(format!("unknown descriptor id {leading}"))
            })?;
        }

        let slot = self.refs.len();
        self.refs.push(None);

        let type_name = self.table.get(index).name.clone();
        let prop_count = self.table.get(index).remote_prop_count;
        let mut obj = ObjectValue::new(type_name);

        for _ in 0..prop_count {
            let prop_name = if isnew { self.reader.read_str()? } else { None };
            let prop_index = self.reader.read_i16()?;

            let name = match prop_name {
                Some(name) => {
                    self.table
                        .get_mut(index)
                        .remote_props
                        .insert(prop_index, name.clone());
                    Some(name)
                }
                None => self.table.get(index).remote_props.get(&prop_index).cloned(),
            };

            let value = self.read_value()?;

            match name {
                Some(name) => obj.set(name, value),
                None => {
                    warn!(
                        type_name = %self.table.get(index).name,
                        prop_index,
                        "unknown property index, value dropped"
                    );
                }
            }
        }

        let obj = Arc::new(obj);
        self.refs[slot] = Some(Arc::clone(&obj));
        Ok(Value::Object(obj))
    }
}
