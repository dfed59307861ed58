//! Value-to-bytes encoder.
//!
//! Every encoded value is a tag byte followed by the payload. Objects go
//! through the session [`TypeTable`]: the first object of a type carries its
//! full descriptor, later ones reference the descriptor id. Repeated
//! `Arc`-shared instances are emitted once and back-referenced by index.

use std::sync::Arc;

use tracing::warn;

use crate::codec::convert;
use crate::codec::typeinfo::{TypeTable, NEW_OBJECT_MASK};
use crate::codec::unit::Unit;
use crate::codec::value::{ObjectValue, Value};
use crate::codec::wire::WireWriter;
use crate::error::{Result, WireError};

pub struct Encoder<'a> {
    table: &'a mut TypeTable,
    refs: Vec<Arc<ObjectValue>>,
    writer: WireWriter,
}

impl<'a> Encoder<'a> {
    pub fn new(table: &'a mut TypeTable) -> Self {
        Self {
            table,
            refs: Vec::new(),
            writer: WireWriter::new(),
        }
    }

    /// Encode one payload: preamble plus the tagged value.
    pub fn encode(mut self, value: &Value) -> Result<Vec<u8>> {
        self.writer.write_preamble();
        self.write_value(value)?;
        Ok(self.writer.into_bytes())
    }

    fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => {
                self.writer.write_u8(0);
                Ok(())
            }
            Value::Array(unit, items) => {
                self.writer.write_u8(unit.array_tag());
                self.write_array(*unit, items)
            }
            Value::Object(obj) => {
                self.writer.write_u8(Unit::Object.tag());
                self.write_object(obj)
            }
            scalar => {
                // unit() is Some for everything but Null, handled above.
                let unit = scalar.unit().expect("scalar has a unit");
                self.writer.write_u8(unit.tag());
                self.write_scalar(scalar)
            }
        }
    }

    fn write_scalar(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Byte(v) => self.writer.write_u8(*v),
            Value::Bool(v) => self.writer.write_bool(*v),
            Value::Char(v) => self.writer.write_char(*v),
            Value::Short(v) => self.writer.write_i16(*v),
            Value::UShort(v) => self.writer.write_u16(*v),
            Value::Int(v) => self.writer.write_i32(*v),
            Value::UInt(v) => self.writer.write_u32(*v),
            Value::Long(v) => self.writer.write_i64(*v),
            Value::ULong(v) => self.writer.write_u64(*v),
            Value::Float(v) => self.writer.write_f32(*v),
            Value::Double(v) => self.writer.write_f64(*v),
            Value::DateTime(v) => self.writer.write_datetime(v),
            Value::String(v) => self.writer.write_str(Some(v)),
            Value::BiasedDateTime(v) => self.writer.write_biased_datetime(v),
            Value::Guid(v) => self.writer.write_guid(v),
            other => {
                return Err(WireError::Encode(format!(
                    "not a scalar value: {other:?}"
                )))
            }
        }
        Ok(())
    }

    /// Arrays are a count followed by untagged elements, except object
    /// arrays whose elements are full tagged values (they may be null or
    /// back-references).
    fn write_array(&mut self, unit: Unit, items: &[Value]) -> Result<()> {
        self.writer.write_size(items.len());

        match unit {
            Unit::Object => {
                for item in items {
                    self.write_value(item)?;
                }
            }
            Unit::String => {
                for item in items {
                    match item {
                        Value::String(s) => self.writer.write_str(Some(s)),
                        Value::Null => self.writer.write_str(None),
                        other => {
                            return Err(WireError::Encode(format!(
                                "string array holds {other:?}"
                            )))
                        }
                    }
                }
            }
            _ => {
                for item in items {
                    let item = convert::cast(item, unit).ok_or_else(|| {
                        WireError::Encode(format!("array of {unit:?} holds {item:?}"))
                    })?;
                    self.write_scalar(&item)?;
                }
            }
        }
        Ok(())
    }

    fn write_object(&mut self, obj: &Arc<ObjectValue>) -> Result<()> {
        let index = self.table.store_local(obj.type_name(), || {
            obj.props().iter().map(|(name, _)| name.clone()).collect()
        });
        let isnew = self.table.get(index).local_id == 0;

        if isnew {
            let local_id = self.table.assign_local_id(index);
            self.writer.write_u16(local_id | NEW_OBJECT_MASK);
            self.writer.write_str(Some(obj.type_name()));
            self.writer.write_size(self.table.get(index).props.len());
        } else {
            if let Some(seen) = self.refs.iter().position(|r| Arc::ptr_eq(r, obj)) {
                let local_id = self.table.get(index).local_id;
                self.writer.write_u16(local_id | NEW_OBJECT_MASK);
                self.writer.write_str(None);
                self.writer.write_i16(seen as i16);
                return Ok(());
            }
            self.writer.write_u16(self.table.get(index).local_id);
        }

        self.refs.push(Arc::clone(obj));

        // The descriptor fixes the property list for the whole session, so
        // every instance emits exactly those properties in that order.
        let props = self.table.get(index).props.clone();

        for (prop_index, name) in props.iter().enumerate() {
            if isnew {
                self.writer.write_str(Some(name));
            }
            self.writer.write_i16(prop_index as i16);

            match obj.get(name) {
                Some(value) => self.write_value(value)?,
                None => {
                    warn!(type_name = %obj.type_name(), prop = %name, "missing property encoded as null");
                    self.write_value(&Value::Null)?;
                }
            }
        }

        Ok(())
    }
}
