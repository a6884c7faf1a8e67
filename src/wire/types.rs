//! AMQP data types: primitives, short/long strings, decimals, and the
//! order-preserving field table.
//!
//! All multi-byte integers are big-endian on the wire. Field tables decode
//! into an [`IndexMap`] so insertion order survives a round trip; equality
//! of tables ignores order (IndexMap's `PartialEq` semantics).

use indexmap::IndexMap;
use std::fmt;

/// Failure while decoding wire data. Carried up to the frame boundary where
/// it becomes a connection-fatal `MalformedFrame` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError(pub &'static str);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed wire data: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Largest short string the protocol can carry (single length octet).
pub const SHORTSTR_MAX: usize = 255;

/// Failure while encoding wire data: a short string (queue, exchange, or
/// consumer-tag name, routing key, table key, short property) longer than
/// the protocol's 255-byte limit. Surfaced to callers instead of
/// truncating, which would silently corrupt the name on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeError {
    pub length: usize,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "short string of {} bytes exceeds the {}-byte protocol limit",
            self.length, SHORTSTR_MAX
        )
    }
}

impl std::error::Error for EncodeError {}

pub type EncodeResult = Result<(), EncodeError>;

/// Read cursor over a frame payload. Every `take_*` checks remaining length
/// so a truncated payload surfaces as a decode error, never a panic.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take_bytes(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(DecodeError("truncated payload"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn take_u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take_bytes(1)?[0])
    }

    pub fn take_u16(&mut self) -> DecodeResult<u16> {
        let b = self.take_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn take_u32(&mut self) -> DecodeResult<u32> {
        let b = self.take_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn take_u64(&mut self) -> DecodeResult<u64> {
        let b = self.take_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn take_i8(&mut self) -> DecodeResult<i8> {
        Ok(self.take_u8()? as i8)
    }

    pub fn take_i16(&mut self) -> DecodeResult<i16> {
        Ok(self.take_u16()? as i16)
    }

    pub fn take_i32(&mut self) -> DecodeResult<i32> {
        Ok(self.take_u32()? as i32)
    }

    pub fn take_i64(&mut self) -> DecodeResult<i64> {
        Ok(self.take_u64()? as i64)
    }

    pub fn take_f32(&mut self) -> DecodeResult<f32> {
        Ok(f32::from_bits(self.take_u32()?))
    }

    pub fn take_f64(&mut self) -> DecodeResult<f64> {
        Ok(f64::from_bits(self.take_u64()?))
    }

    pub fn take_shortstr(&mut self) -> DecodeResult<String> {
        let len = self.take_u8()? as usize;
        let bytes = self.take_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError("short string is not utf-8"))
    }

    pub fn take_longstr(&mut self) -> DecodeResult<String> {
        let len = self.take_u32()? as usize;
        let bytes = self.take_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError("long string is not utf-8"))
    }

    pub fn take_table(&mut self) -> DecodeResult<FieldTable> {
        let len = self.take_u32()? as usize;
        let slice = self.take_bytes(len)?;
        let mut inner = Cursor::new(slice);
        let mut table = FieldTable::new();
        while inner.remaining() > 0 {
            let key = inner.take_shortstr()?;
            let value = FieldValue::decode(&mut inner)?;
            table.insert(key, value);
        }
        Ok(table)
    }
}

/// Exact-cost 2.5 fixed-point number: `value / 10^scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    pub scale: u8,
    pub value: i32,
}

/// A tagged field-table (or field-array) value.
///
/// Tags follow the AMQP 0-9-1 grammar, with the `x` byte-array extension.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Boolean(bool),
    ShortShortInt(i8),
    ShortShortUInt(u8),
    ShortInt(i16),
    ShortUInt(u16),
    LongInt(i32),
    LongUInt(u32),
    LongLongInt(i64),
    LongLongUInt(u64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    ShortString(String),
    LongString(String),
    Timestamp(u64),
    FieldArray(Vec<FieldValue>),
    FieldTable(FieldTable),
    Void,
    ByteArray(Vec<u8>),
}

impl FieldValue {
    fn tag(&self) -> u8 {
        match self {
            FieldValue::Boolean(_) => b't',
            FieldValue::ShortShortInt(_) => b'b',
            FieldValue::ShortShortUInt(_) => b'B',
            FieldValue::ShortInt(_) => b'U',
            FieldValue::ShortUInt(_) => b'u',
            FieldValue::LongInt(_) => b'I',
            FieldValue::LongUInt(_) => b'i',
            FieldValue::LongLongInt(_) => b'L',
            FieldValue::LongLongUInt(_) => b'l',
            FieldValue::Float(_) => b'f',
            FieldValue::Double(_) => b'd',
            FieldValue::Decimal(_) => b'D',
            FieldValue::ShortString(_) => b's',
            FieldValue::LongString(_) => b'S',
            FieldValue::Timestamp(_) => b'T',
            FieldValue::FieldArray(_) => b'A',
            FieldValue::FieldTable(_) => b'F',
            FieldValue::Void => b'V',
            FieldValue::ByteArray(_) => b'x',
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> EncodeResult {
        buf.push(self.tag());
        match self {
            FieldValue::Boolean(v) => buf.push(*v as u8),
            FieldValue::ShortShortInt(v) => buf.push(*v as u8),
            FieldValue::ShortShortUInt(v) => buf.push(*v),
            FieldValue::ShortInt(v) => buf.extend_from_slice(&v.to_be_bytes()),
            FieldValue::ShortUInt(v) => buf.extend_from_slice(&v.to_be_bytes()),
            FieldValue::LongInt(v) => buf.extend_from_slice(&v.to_be_bytes()),
            FieldValue::LongUInt(v) => buf.extend_from_slice(&v.to_be_bytes()),
            FieldValue::LongLongInt(v) => buf.extend_from_slice(&v.to_be_bytes()),
            FieldValue::LongLongUInt(v) => buf.extend_from_slice(&v.to_be_bytes()),
            FieldValue::Float(v) => buf.extend_from_slice(&v.to_bits().to_be_bytes()),
            FieldValue::Double(v) => buf.extend_from_slice(&v.to_bits().to_be_bytes()),
            FieldValue::Decimal(v) => {
                buf.push(v.scale);
                buf.extend_from_slice(&v.value.to_be_bytes());
            }
            FieldValue::ShortString(v) => encode_shortstr(buf, v)?,
            FieldValue::LongString(v) => encode_longstr(buf, v.as_bytes()),
            FieldValue::Timestamp(v) => buf.extend_from_slice(&v.to_be_bytes()),
            FieldValue::FieldArray(values) => {
                let mut inner = Vec::new();
                for value in values {
                    value.encode(&mut inner)?;
                }
                buf.extend_from_slice(&(inner.len() as u32).to_be_bytes());
                buf.extend_from_slice(&inner);
            }
            FieldValue::FieldTable(table) => table.encode(buf)?,
            FieldValue::Void => (),
            FieldValue::ByteArray(bytes) => {
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
        }
        Ok(())
    }

    pub fn decode(cursor: &mut Cursor<'_>) -> DecodeResult<FieldValue> {
        let tag = cursor.take_u8()?;
        Ok(match tag {
            b't' => FieldValue::Boolean(cursor.take_u8()? != 0),
            b'b' => FieldValue::ShortShortInt(cursor.take_i8()?),
            b'B' => FieldValue::ShortShortUInt(cursor.take_u8()?),
            b'U' => FieldValue::ShortInt(cursor.take_i16()?),
            b'u' => FieldValue::ShortUInt(cursor.take_u16()?),
            b'I' => FieldValue::LongInt(cursor.take_i32()?),
            b'i' => FieldValue::LongUInt(cursor.take_u32()?),
            b'L' => FieldValue::LongLongInt(cursor.take_i64()?),
            b'l' => FieldValue::LongLongUInt(cursor.take_u64()?),
            b'f' => FieldValue::Float(cursor.take_f32()?),
            b'd' => FieldValue::Double(cursor.take_f64()?),
            b'D' => FieldValue::Decimal(Decimal {
                scale: cursor.take_u8()?,
                value: cursor.take_i32()?,
            }),
            b's' => FieldValue::ShortString(cursor.take_shortstr()?),
            b'S' => FieldValue::LongString(cursor.take_longstr()?),
            b'T' => FieldValue::Timestamp(cursor.take_u64()?),
            b'A' => {
                let len = cursor.take_u32()? as usize;
                let slice = cursor.take_bytes(len)?;
                let mut inner = Cursor::new(slice);
                let mut values = Vec::new();
                while inner.remaining() > 0 {
                    values.push(FieldValue::decode(&mut inner)?);
                }
                FieldValue::FieldArray(values)
            }
            b'F' => FieldValue::FieldTable(cursor.take_table()?),
            b'V' => FieldValue::Void,
            b'x' => {
                let len = cursor.take_u32()? as usize;
                FieldValue::ByteArray(cursor.take_bytes(len)?.to_vec())
            }
            _ => return Err(DecodeError("unknown field value tag")),
        })
    }
}

/// An order-preserving string-keyed table of [`FieldValue`]s.
pub type FieldTableMap = IndexMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldTable(pub FieldTableMap);

impl FieldTable {
    pub fn new() -> FieldTable {
        FieldTable(IndexMap::new())
    }

    pub fn insert<K: Into<String>>(&mut self, key: K, value: FieldValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, FieldValue> {
        self.0.iter()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> EncodeResult {
        let mut inner = Vec::new();
        for (key, value) in &self.0 {
            encode_shortstr(&mut inner, key)?;
            value.encode(&mut inner)?;
        }
        buf.extend_from_slice(&(inner.len() as u32).to_be_bytes());
        buf.extend_from_slice(&inner);
        Ok(())
    }
}

/// Short strings are length-prefixed with a single octet; a longer value is
/// an encode error, never a truncation (a silently shortened queue name or
/// routing key would be a well-formed frame carrying the wrong name).
pub fn encode_shortstr(buf: &mut Vec<u8>, s: &str) -> EncodeResult {
    if s.len() > SHORTSTR_MAX {
        return Err(EncodeError { length: s.len() });
    }
    buf.push(s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Clip internally-generated text (close reply texts, which embed method
/// dumps of unbounded size) to the short-string limit at a character
/// boundary. Never used for caller-supplied names; those fail loudly in
/// [`encode_shortstr`] instead.
pub fn clip_shortstr(mut s: String) -> String {
    if s.len() > SHORTSTR_MAX {
        let mut end = SHORTSTR_MAX;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

pub fn encode_longstr(buf: &mut Vec<u8>, s: &[u8]) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: FieldValue) -> FieldValue {
        let mut buf = Vec::new();
        value.encode(&mut buf).unwrap();
        let mut cursor = Cursor::new(&buf);
        let out = FieldValue::decode(&mut cursor).unwrap();
        assert_eq!(cursor.remaining(), 0, "decode must consume the encoding");
        out
    }

    #[test]
    fn scalar_roundtrips() {
        for value in vec![
            FieldValue::Boolean(true),
            FieldValue::ShortShortInt(-8),
            FieldValue::ShortShortUInt(200),
            FieldValue::ShortInt(-30000),
            FieldValue::ShortUInt(60000),
            FieldValue::LongInt(-1 << 30),
            FieldValue::LongUInt(3_000_000_000),
            FieldValue::LongLongInt(i64::MIN),
            FieldValue::LongLongUInt(u64::MAX),
            FieldValue::Float(1.25),
            FieldValue::Double(-2.5e300),
            FieldValue::Decimal(Decimal { scale: 2, value: -314 }),
            FieldValue::ShortString("rk".to_string()),
            FieldValue::LongString("payload body".to_string()),
            FieldValue::Timestamp(1_500_000_000),
            FieldValue::Void,
            FieldValue::ByteArray(vec![0, 1, 2, 0xCE]),
        ] {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn nested_table_roundtrip_preserves_order() {
        let mut inner = FieldTable::new();
        inner.insert("z", FieldValue::Boolean(true));
        inner.insert("a", FieldValue::LongInt(7));

        let mut table = FieldTable::new();
        table.insert("second", FieldValue::FieldTable(inner));
        table.insert("first", FieldValue::LongString("v".to_string()));
        table.insert(
            "list",
            FieldValue::FieldArray(vec![FieldValue::Void, FieldValue::ShortUInt(9)]),
        );

        let mut buf = Vec::new();
        table.encode(&mut buf).unwrap();
        let decoded = Cursor::new(&buf).take_table().unwrap();

        assert_eq!(decoded, table);
        let keys: Vec<&str> = decoded.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["second", "first", "list"]);
    }

    #[test]
    fn table_equality_ignores_order() {
        let mut ab = FieldTable::new();
        ab.insert("a", FieldValue::Boolean(true));
        ab.insert("b", FieldValue::Boolean(false));

        let mut ba = FieldTable::new();
        ba.insert("b", FieldValue::Boolean(false));
        ba.insert("a", FieldValue::Boolean(true));

        assert_eq!(ab, ba);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let buf = [b'Z', 0, 0];
        let err = FieldValue::decode(&mut Cursor::new(&buf)).unwrap_err();
        assert_eq!(err, DecodeError("unknown field value tag"));
    }

    #[test]
    fn truncated_value_is_rejected() {
        let buf = [b'I', 0, 0];
        assert!(FieldValue::decode(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn overlong_short_string_is_an_encode_error() {
        let long = "x".repeat(256);
        let mut buf = Vec::new();
        assert_eq!(
            encode_shortstr(&mut buf, &long),
            Err(EncodeError { length: 256 })
        );

        let err = FieldValue::ShortString(long.clone())
            .encode(&mut Vec::new())
            .unwrap_err();
        assert_eq!(err.length, 256);

        // table keys are short strings too
        let mut table = FieldTable::new();
        table.insert(long, FieldValue::Void);
        assert!(table.encode(&mut Vec::new()).is_err());
    }

    #[test]
    fn boundary_short_string_encodes() {
        let exact = "y".repeat(255);
        let mut buf = Vec::new();
        encode_shortstr(&mut buf, &exact).unwrap();
        assert_eq!(buf[0], 255);
        assert_eq!(buf.len(), 256);
    }

    #[test]
    fn clip_respects_char_boundaries() {
        // 2-byte characters straddling the limit
        let text: String = "é".repeat(130);
        let clipped = clip_shortstr(text);
        assert!(clipped.len() <= SHORTSTR_MAX);
        assert_eq!(clipped.len(), 254);
        assert!(clipped.chars().all(|c| c == 'é'));

        let short = clip_shortstr("ok".to_string());
        assert_eq!(short, "ok");
    }
}
