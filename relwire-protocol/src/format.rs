//! Row message formats.
//!
//! A message is a fixed-size buffer laid out from a [`MessageFormat`]: each
//! field at its aligned offset, followed by one big-endian `i16` null
//! indicator per field. Both peers derive the same layout from the format,
//! so rows travel as opaque byte strings.

use crate::error::ProtocolError;
use crate::wire::{WireReader, WireWrite};
use bytes::{BufMut, Bytes, BytesMut};

/// Alignment used for ring buffers holding whole messages.
pub const MESSAGE_ALIGNMENT: usize = 8;

/// Maximum declared varchar length.
pub const MAX_VARCHAR: u32 = 32_765;

/// Column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    BigInt,
    Double,
    Varchar(u32),
    Blob,
}

impl FieldType {
    fn size(self) -> usize {
        match self {
            FieldType::Integer => 4,
            FieldType::BigInt | FieldType::Double | FieldType::Blob => 8,
            FieldType::Varchar(n) => 2 + n as usize,
        }
    }

    fn alignment(self) -> usize {
        match self {
            FieldType::Integer => 4,
            FieldType::BigInt | FieldType::Double | FieldType::Blob => 8,
            FieldType::Varchar(_) => 2,
        }
    }

    fn code(self) -> u32 {
        match self {
            FieldType::Integer => 496,
            FieldType::BigInt => 580,
            FieldType::Double => 480,
            FieldType::Varchar(_) => 448,
            FieldType::Blob => 520,
        }
    }
}

/// One column of a format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    /// Blob id as returned by blob creation.
    Blob(u64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Ordered fields describing a message layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFormat {
    fields: Vec<Field>,
}

fn align(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

impl MessageFormat {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Offsets of each field's data, then the offset of the null indicators.
    fn layout(&self) -> (Vec<usize>, usize) {
        let mut offsets = Vec::with_capacity(self.fields.len());
        let mut offset = 0usize;
        for field in &self.fields {
            offset = align(offset, field.field_type.alignment());
            offsets.push(offset);
            offset += field.field_type.size();
        }
        (offsets, align(offset, 2))
    }

    /// Message length in bytes.
    pub fn length(&self) -> usize {
        let (_, nulls) = self.layout();
        nulls + 2 * self.fields.len()
    }

    /// Message length rounded up to [`MESSAGE_ALIGNMENT`].
    pub fn aligned_length(&self) -> usize {
        align(self.length(), MESSAGE_ALIGNMENT)
    }

    /// Index of the first blob column, if any.
    pub fn blob_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.field_type == FieldType::Blob)
            .map(|(i, _)| i)
    }

    /// Rejects varchar columns wider than [`MAX_VARCHAR`]; their length
    /// prefix cannot describe them.
    fn check_widths(&self) -> Result<(), ProtocolError> {
        for field in &self.fields {
            if let FieldType::Varchar(n) = field.field_type {
                if n > MAX_VARCHAR {
                    return Err(ProtocolError::FormatMismatch(format!(
                        "column {} declares VARCHAR({}), limit is {}",
                        field.name, n, MAX_VARCHAR
                    )));
                }
            }
        }
        Ok(())
    }

    /// Marshals a row into a message buffer.
    pub fn encode_row(&self, values: &[Value]) -> Result<Bytes, ProtocolError> {
        self.check_widths()?;
        if values.len() != self.fields.len() {
            return Err(ProtocolError::FormatMismatch(format!(
                "expected {} values, got {}",
                self.fields.len(),
                values.len()
            )));
        }
        let (offsets, nulls) = self.layout();
        let mut msg = vec![0u8; self.length()];

        for (i, (field, value)) in self.fields.iter().zip(values).enumerate() {
            let at = offsets[i];
            let null_at = nulls + 2 * i;
            if value.is_null() {
                if !field.nullable {
                    return Err(ProtocolError::FormatMismatch(format!(
                        "column {} is not nullable",
                        field.name
                    )));
                }
                msg[null_at..null_at + 2].copy_from_slice(&(-1i16).to_be_bytes());
                continue;
            }
            match (field.field_type, value) {
                (FieldType::Integer, Value::Integer(v)) => {
                    msg[at..at + 4].copy_from_slice(&v.to_be_bytes());
                }
                (FieldType::BigInt, Value::BigInt(v)) => {
                    msg[at..at + 8].copy_from_slice(&v.to_be_bytes());
                }
                (FieldType::BigInt, Value::Integer(v)) => {
                    msg[at..at + 8].copy_from_slice(&i64::from(*v).to_be_bytes());
                }
                (FieldType::Double, Value::Double(v)) => {
                    msg[at..at + 8].copy_from_slice(&v.to_bits().to_be_bytes());
                }
                (FieldType::Blob, Value::Blob(id)) => {
                    msg[at..at + 8].copy_from_slice(&id.to_be_bytes());
                }
                (FieldType::Varchar(max), Value::Text(s)) => {
                    let raw = s.as_bytes();
                    if raw.len() > max as usize {
                        return Err(ProtocolError::FormatMismatch(format!(
                            "value for {} is {} bytes, column holds {}",
                            field.name,
                            raw.len(),
                            max
                        )));
                    }
                    msg[at..at + 2].copy_from_slice(&(raw.len() as u16).to_be_bytes());
                    msg[at + 2..at + 2 + raw.len()].copy_from_slice(raw);
                }
                (ty, v) => {
                    return Err(ProtocolError::FormatMismatch(format!(
                        "column {} of type {:?} cannot hold {:?}",
                        field.name, ty, v
                    )))
                }
            }
        }
        Ok(Bytes::from(msg))
    }

    /// Unmarshals a message buffer into values.
    pub fn decode_row(&self, msg: &[u8]) -> Result<Vec<Value>, ProtocolError> {
        if msg.len() < self.length() {
            return Err(ProtocolError::FormatMismatch(format!(
                "message is {} bytes, format needs {}",
                msg.len(),
                self.length()
            )));
        }
        let (offsets, nulls) = self.layout();
        let mut values = Vec::with_capacity(self.fields.len());
        for (i, field) in self.fields.iter().enumerate() {
            let null_at = nulls + 2 * i;
            let indicator = i16::from_be_bytes([msg[null_at], msg[null_at + 1]]);
            if indicator != 0 {
                values.push(Value::Null);
                continue;
            }
            let at = offsets[i];
            let value = match field.field_type {
                FieldType::Integer => Value::Integer(i32::from_be_bytes(fixed(&msg[at..])?)),
                FieldType::BigInt => Value::BigInt(i64::from_be_bytes(fixed(&msg[at..])?)),
                FieldType::Double => {
                    Value::Double(f64::from_bits(u64::from_be_bytes(fixed(&msg[at..])?)))
                }
                FieldType::Blob => Value::Blob(u64::from_be_bytes(fixed(&msg[at..])?)),
                FieldType::Varchar(max) => {
                    let len = u16::from_be_bytes([msg[at], msg[at + 1]]) as usize;
                    if len > max as usize {
                        return Err(ProtocolError::FormatMismatch(format!(
                            "varchar length {} exceeds {}",
                            len, max
                        )));
                    }
                    let raw = &msg[at + 2..at + 2 + len];
                    Value::Text(
                        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?,
                    )
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Serializes the format for the wire.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        self.check_widths()?;
        let mut buf = BytesMut::new();
        buf.put_u32(self.fields.len() as u32);
        for field in &self.fields {
            buf.put_u32(field.field_type.code());
            let len = match field.field_type {
                FieldType::Varchar(n) => n,
                _ => 0,
            };
            buf.put_u32(len);
            buf.put_wire_bool(field.nullable);
            buf.put_wire_str(&field.name)?;
        }
        Ok(buf.freeze())
    }

    /// Parses a wire format. Empty input is the empty format.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        let mut reader = WireReader::new(data);
        let count = reader.u32()?;
        if count > 1024 {
            return Err(ProtocolError::FormatMismatch(format!(
                "{} fields declared",
                count
            )));
        }
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let code = reader.u32()?;
            let len = reader.u32()?;
            let field_type = match code {
                496 => FieldType::Integer,
                580 => FieldType::BigInt,
                480 => FieldType::Double,
                520 => FieldType::Blob,
                448 if len <= MAX_VARCHAR => FieldType::Varchar(len),
                other => {
                    return Err(ProtocolError::InvalidEnum {
                        field: "field type",
                        value: other,
                    })
                }
            };
            let nullable = reader.bool()?;
            let name = reader.string()?;
            fields.push(Field {
                name,
                field_type,
                nullable,
            });
        }
        if reader.remaining() != 0 {
            return Err(ProtocolError::TrailingBytes {
                count: reader.remaining(),
            });
        }
        Ok(Self { fields })
    }
}

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N], ProtocolError> {
    data.get(..N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ProtocolError::FormatMismatch("short field".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_format() -> MessageFormat {
        MessageFormat::new(vec![
            Field::new("ID", FieldType::Integer).not_null(),
            Field::new("NAME", FieldType::Varchar(10)),
            Field::new("TOTAL", FieldType::BigInt),
            Field::new("RATE", FieldType::Double),
            Field::new("NOTES", FieldType::Blob),
        ])
    }

    #[test]
    fn test_layout_lengths() {
        let format = sample_format();
        // ID 0..4, NAME 4..16, TOTAL 16..24, RATE 24..32, NOTES 32..40, nulls 40..50
        assert_eq!(format.length(), 50);
        assert_eq!(format.aligned_length(), 56);
        assert_eq!(format.blob_fields().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn test_row_roundtrip() {
        let format = sample_format();
        let row = vec![
            Value::Integer(7),
            Value::Text("widget".to_string()),
            Value::Null,
            Value::Double(1.5),
            Value::Blob(99),
        ];
        let msg = format.encode_row(&row).unwrap();
        assert_eq!(msg.len(), format.length());
        assert_eq!(format.decode_row(&msg).unwrap(), row);
    }

    #[test]
    fn test_not_null_violation() {
        let format = sample_format();
        let row = vec![
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
        ];
        assert!(matches!(
            format.encode_row(&row),
            Err(ProtocolError::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_varchar_overflow() {
        let format = MessageFormat::new(vec![Field::new("S", FieldType::Varchar(3))]);
        let result = format.encode_row(&[Value::Text("abcd".to_string())]);
        assert!(result.is_err());
    }

    #[test]
    fn test_varchar_wider_than_limit_is_rejected() {
        let format = MessageFormat::new(vec![Field::new("S", FieldType::Varchar(70_000))]);
        let long = "x".repeat(65_537);
        assert!(matches!(
            format.encode_row(&[Value::Text(long)]),
            Err(ProtocolError::FormatMismatch(_))
        ));
        assert!(format.to_bytes().is_err());

        let widest = MessageFormat::new(vec![Field::new("S", FieldType::Varchar(MAX_VARCHAR))]);
        let row = widest
            .encode_row(&[Value::Text("x".repeat(MAX_VARCHAR as usize))])
            .unwrap();
        assert_eq!(&row[..2], &(MAX_VARCHAR as u16).to_be_bytes());
    }

    #[test]
    fn test_type_mismatch() {
        let format = MessageFormat::new(vec![Field::new("N", FieldType::Integer)]);
        assert!(format.encode_row(&[Value::Text("x".into())]).is_err());
        assert!(format.encode_row(&[]).is_err());
    }

    #[test]
    fn test_format_wire_roundtrip() {
        let format = sample_format();
        let bytes = format.to_bytes().unwrap();
        assert_eq!(MessageFormat::from_bytes(&bytes).unwrap(), format);
        assert!(MessageFormat::from_bytes(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_short_message() {
        let format = sample_format();
        assert!(format.decode_row(&[0u8; 4]).is_err());
    }
}
