//! Format-string grammar for the data section of a wire message.
//!
//! A format string is a sequence of type characters, each optionally
//! preceded by a decimal repeat count (`"3H"` is three `u16` fields). All
//! values are little-endian. Strings (`s`) are NUL-terminated and their
//! width is only known from the data being packed or the bytes being read,
//! so a format string is turned into a concrete [`Layout`] before use.
//!
//! | Char  | Type                  | Width |
//! |-------|-----------------------|-------|
//! | `x`   | padding (no value)    | 1     |
//! | `c`   | single character      | 1     |
//! | `?`   | boolean               | 1     |
//! | `b`/`B` | i8 / u8             | 1     |
//! | `h`/`H` | i16 / u16           | 2     |
//! | `i`/`I`, `l`/`L` | i32 / u32  | 4     |
//! | `q`/`Q` | i64 / u64           | 8     |
//! | `f`/`d` | f32 / f64           | 4 / 8 |
//! | `s`   | NUL-terminated string | len+1 |

use crate::constants::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, ProtocolResult};
use crate::types::DataValue;

/// Type of one field in a format string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Pad,
    Char,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Str,
}

impl FieldType {
    /// Parse a format character.
    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'x' => FieldType::Pad,
            'c' => FieldType::Char,
            '?' => FieldType::Bool,
            'b' => FieldType::I8,
            'B' => FieldType::U8,
            'h' => FieldType::I16,
            'H' => FieldType::U16,
            'i' | 'l' => FieldType::I32,
            'I' | 'L' => FieldType::U32,
            'q' => FieldType::I64,
            'Q' => FieldType::U64,
            'f' => FieldType::F32,
            'd' => FieldType::F64,
            's' => FieldType::Str,
            _ => return None,
        })
    }

    /// Canonical format character.
    pub const fn code(self) -> char {
        match self {
            FieldType::Pad => 'x',
            FieldType::Char => 'c',
            FieldType::Bool => '?',
            FieldType::I8 => 'b',
            FieldType::U8 => 'B',
            FieldType::I16 => 'h',
            FieldType::U16 => 'H',
            FieldType::I32 => 'i',
            FieldType::U32 => 'I',
            FieldType::I64 => 'q',
            FieldType::U64 => 'Q',
            FieldType::F32 => 'f',
            FieldType::F64 => 'd',
            FieldType::Str => 's',
        }
    }

    /// Fixed width in bytes; `None` for strings.
    pub const fn width(self) -> Option<usize> {
        match self {
            FieldType::Pad | FieldType::Char | FieldType::Bool | FieldType::I8 | FieldType::U8 => {
                Some(1)
            }
            FieldType::I16 | FieldType::U16 => Some(2),
            FieldType::I32 | FieldType::U32 | FieldType::F32 => Some(4),
            FieldType::I64 | FieldType::U64 | FieldType::F64 => Some(8),
            FieldType::Str => None,
        }
    }

    /// Whether the field carries a value (everything but padding).
    pub const fn carries_value(self) -> bool {
        !matches!(self, FieldType::Pad)
    }

    fn int_range(self) -> Option<(i128, i128)> {
        Some(match self {
            FieldType::I8 => (i8::MIN as i128, i8::MAX as i128),
            FieldType::U8 | FieldType::Char => (0, u8::MAX as i128),
            FieldType::I16 => (i16::MIN as i128, i16::MAX as i128),
            FieldType::U16 => (0, u16::MAX as i128),
            FieldType::I32 => (i32::MIN as i128, i32::MAX as i128),
            FieldType::U32 => (0, u32::MAX as i128),
            FieldType::I64 => (i64::MIN as i128, i64::MAX as i128),
            FieldType::U64 => (0, u64::MAX as i128),
            _ => return None,
        })
    }
}

/// One field with its concrete width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Field type.
    pub ty: FieldType,
    /// Width in bytes, including a string's terminator.
    pub width: usize,
}

/// A format string resolved against concrete data or bytes.
///
/// Displays in struct-module notation, e.g. `<B3s` for a `u8` followed by a
/// two-character string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    fields: Vec<Field>,
}

impl Layout {
    /// The resolved fields, in order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Total size in bytes.
    pub fn size(&self) -> usize {
        self.fields.iter().map(|f| f.width).sum()
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<")?;
        for field in &self.fields {
            if field.ty == FieldType::Str {
                write!(f, "{}s", field.width)?;
            } else {
                write!(f, "{}", field.ty.code())?;
            }
        }
        Ok(())
    }
}

fn invalid(format: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidFormat {
        format: format.to_string(),
        reason: reason.into(),
    }
}

/// Most fields a format string may expand to. Every field but a zero-count
/// one takes at least a byte, so anything longer cannot fit in a frame.
pub const MAX_FIELDS: usize = MAX_PAYLOAD_SIZE;

/// Expand repeat counts: `"3H"` becomes `"HHH"`, `"2Bs"` becomes `"BBs"`.
///
/// Whitespace and a leading `<` are ignored. Formats that expand past
/// [`MAX_FIELDS`] are rejected before anything is allocated.
pub fn expand(format: &str) -> ProtocolResult<String> {
    let body = format.strip_prefix('<').unwrap_or(format);
    let mut out = String::with_capacity(body.len());
    let mut count: Option<usize> = None;

    for c in body.chars() {
        if c.is_whitespace() {
            continue;
        }
        if let Some(digit) = c.to_digit(10) {
            let next = count.unwrap_or(0) * 10 + digit as usize;
            if next > MAX_FIELDS {
                return Err(invalid(format, "repeat count too large"));
            }
            count = Some(next);
            continue;
        }
        if FieldType::from_code(c).is_none() {
            return Err(invalid(format, format!("unknown format character {:?}", c)));
        }
        let repeat = count.take().unwrap_or(1);
        if out.len() + repeat > MAX_FIELDS {
            return Err(invalid(format, format!("expands past {} fields", MAX_FIELDS)));
        }
        out.extend(std::iter::repeat(c).take(repeat));
    }

    if count.is_some() {
        return Err(invalid(format, "repeat count without a type character"));
    }
    Ok(out)
}

/// Expand and parse a format string into field types.
pub fn parse(format: &str) -> ProtocolResult<Vec<FieldType>> {
    Ok(expand(format)?
        .chars()
        .filter_map(FieldType::from_code)
        .collect())
}

/// Number of values a format string describes (padding excluded).
pub fn value_count(format: &str) -> ProtocolResult<usize> {
    Ok(parse(format)?.iter().filter(|t| t.carries_value()).count())
}

/// Resolve a format string against the values about to be packed.
pub fn layout_for_data(format: &str, data: &[DataValue]) -> ProtocolResult<Layout> {
    let types = parse(format)?;
    let expected = types.iter().filter(|t| t.carries_value()).count();
    if expected != data.len() {
        return Err(ProtocolError::LengthMismatch {
            format: format.to_string(),
            expected,
            actual: data.len(),
        });
    }

    let mut values = data.iter();
    let mut fields = Vec::with_capacity(types.len());
    for ty in types {
        let width = match ty.width() {
            Some(width) => {
                if ty.carries_value() {
                    values.next();
                }
                width
            }
            None => match values.next() {
                Some(DataValue::Str(s)) => s.len() + 1,
                Some(other) => {
                    return Err(ProtocolError::ValueOutOfRange {
                        field: 's',
                        value: other.to_string(),
                    })
                }
                None => 1,
            },
        };
        fields.push(Field { ty, width });
    }
    Ok(Layout { fields })
}

/// Resolve a format string against received bytes.
///
/// Fields are consumed left to right; a string's width runs to and includes
/// the next NUL byte.
pub fn layout_for_bytes(format: &str, bytes: &[u8]) -> ProtocolResult<Layout> {
    let types = parse(format)?;
    let mut fields = Vec::with_capacity(types.len());
    let mut offset = 0usize;

    for ty in types {
        let width = match ty.width() {
            Some(width) => width,
            None => {
                let nul = bytes
                    .get(offset..)
                    .and_then(|rest| rest.iter().position(|&b| b == 0))
                    .ok_or(ProtocolError::UnterminatedString { offset })?;
                nul + 1
            }
        };
        if offset + width > bytes.len() {
            return Err(ProtocolError::LengthMismatch {
                format: format.to_string(),
                expected: offset + width,
                actual: bytes.len(),
            });
        }
        offset += width;
        fields.push(Field { ty, width });
    }

    if offset != bytes.len() {
        return Err(ProtocolError::LengthMismatch {
            format: format.to_string(),
            expected: offset,
            actual: bytes.len(),
        });
    }
    Ok(Layout { fields })
}

/// Pack values according to a format string.
pub fn pack(format: &str, data: &[DataValue]) -> ProtocolResult<Vec<u8>> {
    let layout = layout_for_data(format, data)?;
    let mut buf = Vec::with_capacity(layout.size());
    let mut values = data.iter();

    for field in layout.fields() {
        if !field.ty.carries_value() {
            buf.push(0);
            continue;
        }
        // layout_for_data checked the value count
        let Some(value) = values.next() else {
            break;
        };
        write_field(&mut buf, field.ty, value)?;
    }
    Ok(buf)
}

/// Unpack bytes according to a format string.
///
/// Strings lose their terminator, booleans become integers and empty strings
/// are dropped.
pub fn unpack(format: &str, bytes: &[u8]) -> ProtocolResult<Vec<DataValue>> {
    let layout = layout_for_bytes(format, bytes)?;
    let mut values = Vec::with_capacity(layout.fields().len());
    let mut offset = 0usize;

    for field in layout.fields() {
        let raw = &bytes[offset..offset + field.width];
        offset += field.width;
        if let Some(value) = read_field(field.ty, raw)? {
            values.push(value);
        }
    }

    values.retain(|v| !matches!(v, DataValue::Str(s) if s.is_empty()));
    Ok(values)
}

fn out_of_range(ty: FieldType, value: &DataValue) -> ProtocolError {
    ProtocolError::ValueOutOfRange {
        field: ty.code(),
        value: value.to_string(),
    }
}

fn write_field(buf: &mut Vec<u8>, ty: FieldType, value: &DataValue) -> ProtocolResult<()> {
    match ty {
        FieldType::Pad => buf.push(0),
        FieldType::Str => {
            let s = value.as_str().ok_or_else(|| out_of_range(ty, value))?;
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
        FieldType::Char => match value {
            DataValue::Str(s) if s.len() == 1 => buf.push(s.as_bytes()[0]),
            other => buf.push(int_in_range(ty, other)? as u8),
        },
        FieldType::Bool => {
            let truthy = match value {
                DataValue::Str(s) => !s.is_empty(),
                other => other.as_f64().map(|v| v != 0.0).unwrap_or(false),
            };
            buf.push(truthy as u8);
        }
        FieldType::F32 => {
            let v = value.as_f64().ok_or_else(|| out_of_range(ty, value))?;
            buf.extend_from_slice(&(v as f32).to_le_bytes());
        }
        FieldType::F64 => {
            let v = value.as_f64().ok_or_else(|| out_of_range(ty, value))?;
            buf.extend_from_slice(&v.to_le_bytes());
        }
        _ => {
            let v = int_in_range(ty, value)?;
            let width = ty.width().unwrap_or(0);
            // two's complement truncation is exact once the range check passed
            buf.extend_from_slice(&(v as i64 as u64).to_le_bytes()[..width]);
        }
    }
    Ok(())
}

fn int_in_range(ty: FieldType, value: &DataValue) -> ProtocolResult<i128> {
    let (min, max) = ty.int_range().ok_or_else(|| out_of_range(ty, value))?;
    let v = value.as_i128().ok_or_else(|| out_of_range(ty, value))?;
    if v < min || v > max {
        return Err(out_of_range(ty, value));
    }
    Ok(v)
}

fn read_field(ty: FieldType, raw: &[u8]) -> ProtocolResult<Option<DataValue>> {
    let mut le = [0u8; 8];
    le[..raw.len().min(8)].copy_from_slice(&raw[..raw.len().min(8)]);
    let unsigned = u64::from_le_bytes(le);

    let value = match ty {
        FieldType::Pad => return Ok(None),
        FieldType::Char => {
            let c = raw[0];
            DataValue::Str(if c == 0 { String::new() } else { (c as char).to_string() })
        }
        FieldType::Bool => DataValue::Int((raw[0] != 0) as i64),
        FieldType::U8 | FieldType::U16 | FieldType::U32 | FieldType::U64 => DataValue::UInt(unsigned),
        FieldType::I8 => DataValue::Int(raw[0] as i8 as i64),
        FieldType::I16 => DataValue::Int(unsigned as u16 as i16 as i64),
        FieldType::I32 => DataValue::Int(unsigned as u32 as i32 as i64),
        FieldType::I64 => DataValue::Int(unsigned as i64),
        FieldType::F32 => DataValue::Float(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64),
        FieldType::F64 => DataValue::Float(f64::from_le_bytes(le)),
        FieldType::Str => {
            let text = &raw[..raw.len() - 1];
            let text = std::str::from_utf8(text).map_err(|_| ProtocolError::InvalidUtf8("string field"))?;
            DataValue::Str(text.trim_end_matches('\0').to_string())
        }
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_repeat_counts() {
        assert_eq!(expand("3H").unwrap(), "HHH");
        assert_eq!(expand("s").unwrap(), "s");
        assert_eq!(expand("B2hs").unwrap(), "Bhhs");
        assert_eq!(expand("<10B").unwrap(), "BBBBBBBBBB");
        assert_eq!(expand("0H").unwrap(), "");
    }

    #[test]
    fn test_expand_rejects_bad_formats() {
        assert!(matches!(expand("3z"), Err(ProtocolError::InvalidFormat { .. })));
        assert!(matches!(expand("H3"), Err(ProtocolError::InvalidFormat { .. })));
    }

    #[test]
    fn test_expand_caps_field_count() {
        assert!(matches!(
            expand("4000000000B"),
            Err(ProtocolError::InvalidFormat { .. })
        ));
        assert!(matches!(
            expand("99999999999999999999999H"),
            Err(ProtocolError::InvalidFormat { .. })
        ));
        // each count fits, the sum does not
        assert!(matches!(
            expand("60000B60000B"),
            Err(ProtocolError::InvalidFormat { .. })
        ));
        assert_eq!(expand(&format!("{}B", MAX_FIELDS)).unwrap().len(), MAX_FIELDS);
    }

    #[test]
    fn test_string_width_from_data() {
        let layout = layout_for_data("s", &[DataValue::from("ab")]).unwrap();
        assert_eq!(layout.to_string(), "<3s");
        assert_eq!(layout.size(), 3);
    }

    #[test]
    fn test_string_width_from_bytes() {
        let layout = layout_for_bytes("Bs", &[7, b'a', b'b', 0]).unwrap();
        assert_eq!(layout.to_string(), "<B3s");
    }

    #[test]
    fn test_pack_mixed_fields() {
        let data = vec![
            DataValue::UInt(1),
            DataValue::Int(-2),
            DataValue::from("hi"),
            DataValue::Float(0.5),
        ];
        let bytes = pack("Bhxsf", &data).unwrap();

        assert_eq!(
            bytes,
            vec![1, 0xFE, 0xFF, 0, b'h', b'i', 0, 0x00, 0x00, 0x00, 0x3F]
        );
        assert_eq!(unpack("Bhxsf", &bytes).unwrap(), data);
    }

    #[test]
    fn test_pack_value_count_mismatch() {
        let err = pack("2H", &[DataValue::UInt(1)]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::LengthMismatch {
                format: "2H".to_string(),
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_pack_out_of_range() {
        assert!(matches!(
            pack("B", &[DataValue::UInt(256)]),
            Err(ProtocolError::ValueOutOfRange { field: 'B', .. })
        ));
        assert!(matches!(
            pack("H", &[DataValue::Int(-1)]),
            Err(ProtocolError::ValueOutOfRange { field: 'H', .. })
        ));
        assert!(matches!(
            pack("s", &[DataValue::UInt(1)]),
            Err(ProtocolError::ValueOutOfRange { field: 's', .. })
        ));
        assert!(matches!(
            pack("i", &[DataValue::Float(1.5)]),
            Err(ProtocolError::ValueOutOfRange { field: 'i', .. })
        ));
    }

    #[test]
    fn test_unpack_booleans_become_integers() {
        assert_eq!(
            unpack("??", &[1, 0]).unwrap(),
            vec![DataValue::Int(1), DataValue::Int(0)]
        );
    }

    #[test]
    fn test_unpack_drops_empty_strings() {
        let bytes = [0, b'x', 0, 5];
        assert_eq!(
            unpack("ssB", &bytes).unwrap(),
            vec![DataValue::from("x"), DataValue::UInt(5)]
        );
    }

    #[test]
    fn test_unpack_unterminated_string() {
        assert_eq!(
            unpack("Bs", &[1, b'a', b'b']),
            Err(ProtocolError::UnterminatedString { offset: 1 })
        );
    }

    #[test]
    fn test_unpack_length_checks() {
        assert!(matches!(
            unpack("H", &[1]),
            Err(ProtocolError::LengthMismatch { expected: 2, actual: 1, .. })
        ));
        assert!(matches!(
            unpack("B", &[1, 2]),
            Err(ProtocolError::LengthMismatch { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn test_signed_and_wide_integers() {
        let data = vec![
            DataValue::Int(i64::MIN),
            DataValue::UInt(u64::MAX),
            DataValue::Int(-100_000),
            DataValue::UInt(70_000),
        ];
        let bytes = pack("qQlL", &data).unwrap();
        assert_eq!(bytes.len(), 24);
        assert_eq!(unpack("qQlL", &bytes).unwrap(), data);
    }

    #[test]
    fn test_char_field() {
        let bytes = pack("c", &[DataValue::from("A")]).unwrap();
        assert_eq!(bytes, vec![b'A']);
        assert_eq!(unpack("c", &bytes).unwrap(), vec![DataValue::from("A")]);
    }

    #[test]
    fn test_value_count_ignores_padding() {
        assert_eq!(value_count("2xHs").unwrap(), 2);
    }
}
