//! # Bencode Decoding and Encoding
//!
//! Bencode is the serialization format used by torrent metainfo files and
//! tracker responses. It has four value kinds:
//!
//! - **Integer**: `i<digits>e`, e.g. `i42e` or `i-7e`
//! - **Byte string**: `<length>:<bytes>`, e.g. `4:spam` (bytes may be binary)
//! - **List**: `l<elements>e`
//! - **Dictionary**: `d<key><value>...e`, keys are byte strings
//!
//! The decoder produces a [`Value`] tree. Dictionaries keep their entries in
//! source byte order: well-formed metainfo already sorts keys
//! lexicographically, and re-sorting here would make it impossible to
//! reproduce the original bytes.
//!
//! ## Raw `info` capture
//!
//! The info-hash identifying a torrent is the SHA-1 of the *exact* bytes that
//! encode the `info` value inside the metainfo. A decode-then-reencode round
//! trip is not trustworthy for that purpose, so the decoder records the byte
//! span of the value bound to the top-level `info` key while it parses.
//! Nested `info` keys in inner dictionaries are ignored.

use std::ops::Range;

use thiserror::Error;

/// Decoding failure. Every malformed construct is reported under the single
/// `Malformed` kind with a short description of what was wrong.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BencodeError {
    #[error("malformed bencode: {0}")]
    Malformed(&'static str),
}

use BencodeError::Malformed;

type Result<T> = std::result::Result<T, BencodeError>;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `i...e`, a signed 64-bit integer.
    Int(i64),
    /// `<len>:<bytes>`, an uninterpreted byte string.
    Bytes(Vec<u8>),
    /// `l...e`, a sequence of values.
    List(Vec<Value>),
    /// `d...e`, key/value pairs in source order.
    Dict(Vec<(Vec<u8>, Value)>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The byte string as UTF-8 text, if it is one and decodes cleanly.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, Value)]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` in a dictionary value. Returns `None` for non-dicts and
    /// missing keys alike.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// The outcome of decoding a complete buffer.
pub struct Decoded<'a> {
    /// The root value.
    pub root: Value,
    /// The untouched encoding of the top-level `info` value, when the root is
    /// a dictionary containing one.
    pub info_raw: Option<&'a [u8]>,
}

/// Decodes a buffer holding exactly one bencode value.
///
/// Trailing bytes after the root value are rejected.
pub fn decode(buf: &[u8]) -> Result<Decoded<'_>> {
    let mut parser = Parser {
        buf,
        pos: 0,
        info_span: None,
    };

    let root = parser.parse_value(true)?;
    if parser.pos != buf.len() {
        return Err(Malformed("trailing bytes after the root value"));
    }

    Ok(Decoded {
        root,
        info_raw: parser.info_span.map(|span| &buf[span]),
    })
}

/// Re-encodes a value, emitting dictionary keys in their stored order.
/// Decoding and re-encoding a well-formed buffer reproduces it byte for
/// byte.
#[allow(dead_code)]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.extend_from_slice(format!("i{}e", n).as_bytes());
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(pairs) => {
            out.push(b'd');
            for (key, value) in pairs {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(value, out);
            }
            out.push(b'e');
        }
    }
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
    info_span: Option<Range<usize>>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(Malformed("unexpected end of input"))
    }

    fn bump(&mut self) -> Result<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    /// Parses one value at the cursor. `top_level` is true only for the root,
    /// so that only the outermost dictionary can bind the `info` span.
    fn parse_value(&mut self, top_level: bool) -> Result<Value> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(top_level),
            b'0'..=b'9' => self.parse_bytes().map(Value::Bytes),
            _ => Err(Malformed("unknown sentinel character")),
        }
    }

    fn parse_int(&mut self) -> Result<Value> {
        self.bump()?; // 'i'

        let negative = self.peek()? == b'-';
        if negative {
            self.bump()?;
        }

        let first = self.bump()?;
        if !first.is_ascii_digit() {
            return Err(Malformed("non-numeric integer body"));
        }
        if negative && first == b'0' {
            // covers both i-0e and i-0<digits>e
            return Err(Malformed("negative zero integer"));
        }

        let mut value: i64 = i64::from(first - b'0');
        if negative {
            value = -value;
        }

        let mut digits = 1usize;
        loop {
            match self.bump()? {
                b'e' => break,
                digit @ b'0'..=b'9' => {
                    if digits == 1 && first == b'0' {
                        return Err(Malformed("integer has a leading zero"));
                    }
                    let digit = i64::from(digit - b'0');
                    value = value
                        .checked_mul(10)
                        .and_then(|v| {
                            if negative {
                                v.checked_sub(digit)
                            } else {
                                v.checked_add(digit)
                            }
                        })
                        .ok_or(Malformed("integer overflow"))?;
                    digits += 1;
                }
                _ => return Err(Malformed("non-numeric integer body")),
            }
        }

        Ok(Value::Int(value))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let mut length: usize = 0;
        loop {
            match self.bump()? {
                b':' => break,
                digit @ b'0'..=b'9' => {
                    length = length
                        .checked_mul(10)
                        .and_then(|l| l.checked_add(usize::from(digit - b'0')))
                        .ok_or(Malformed("string length overflow"))?;
                }
                _ => return Err(Malformed("non-numeric string length")),
            }
        }

        let end = self
            .pos
            .checked_add(length)
            .filter(|&end| end <= self.buf.len())
            .ok_or(Malformed("string length exceeds remaining bytes"))?;

        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Value> {
        self.bump()?; // 'l'

        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value(false)?);
        }
        self.bump()?; // 'e'

        Ok(Value::List(items))
    }

    fn parse_dict(&mut self, top_level: bool) -> Result<Value> {
        self.bump()?; // 'd'

        let mut pairs = Vec::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(Malformed("dictionary key is not a byte string"));
            }
            let key = self.parse_bytes()?;

            let capture = top_level && key == b"info" && self.info_span.is_none();
            let value_begin = self.pos;

            let value = self.parse_value(false)?;
            if capture {
                self.info_span = Some(value_begin..self.pos);
            }

            pairs.push((key, value));
        }
        self.bump()?; // 'e'

        Ok(Value::Dict(pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_root(buf: &[u8]) -> Value {
        decode(buf).unwrap().root
    }

    #[test]
    fn test_decode_integers() {
        assert_eq!(decode_root(b"i42e"), Value::Int(42));
        assert_eq!(decode_root(b"i0e"), Value::Int(0));
        assert_eq!(decode_root(b"i-7e"), Value::Int(-7));
        assert_eq!(
            decode_root(b"i9223372036854775807e"),
            Value::Int(i64::MAX)
        );
        assert_eq!(
            decode_root(b"i-9223372036854775808e"),
            Value::Int(i64::MIN)
        );
    }

    #[test]
    fn test_reject_malformed_integers() {
        for input in [
            &b"i03e"[..],
            b"i-0e",
            b"i-03e",
            b"ie",
            b"i-e",
            b"i1x2e",
            b"i12",
            b"i9223372036854775808e",
        ] {
            assert!(decode(input).is_err(), "accepted {:?}", input);
        }
    }

    #[test]
    fn test_decode_byte_strings() {
        assert_eq!(decode_root(b"4:spam"), Value::Bytes(b"spam".to_vec()));
        assert_eq!(decode_root(b"0:"), Value::Bytes(vec![]));

        // binary content is preserved as-is
        assert_eq!(
            decode_root(b"3:\x00\xff\x01"),
            Value::Bytes(vec![0x00, 0xff, 0x01])
        );
    }

    #[test]
    fn test_reject_malformed_strings() {
        for input in [&b"4:spa"[..], b"4spam", b"-1:a", b":a", b"4"] {
            assert!(decode(input).is_err(), "accepted {:?}", input);
        }
    }

    #[test]
    fn test_reject_trailing_bytes() {
        assert_eq!(
            decode(b"i1ei2e"),
            Err(Malformed("trailing bytes after the root value"))
        );
        assert!(decode(b"4:spamx").is_err());
    }

    #[test]
    fn test_reject_unterminated_containers() {
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"d3:cow3:moo").is_err());
        assert!(decode(b"di1e3:mooe").is_err()); // integer key
        assert!(decode(b"").is_err());
    }

    #[test]
    fn test_dict_round_trip_preserves_bytes() {
        let input = b"d3:cow3:moo4:spam4:eggse";
        let decoded = decode(input).unwrap();

        let dict = decoded.root.as_dict().unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(decoded.root.get(b"cow").unwrap().as_bytes(), Some(&b"moo"[..]));
        assert_eq!(decoded.root.get(b"spam").unwrap().as_str(), Some("eggs"));

        assert_eq!(encode(&decoded.root), input.to_vec());
    }

    #[test]
    fn test_nested_round_trip() {
        let input = b"d1:ad1:bli1ei-2e3:xyzee1:ci9ee";
        let decoded = decode(input).unwrap();
        assert_eq!(encode(&decoded.root), input.to_vec());
    }

    #[test]
    fn test_info_raw_capture() {
        let input = b"d8:announce3:url4:infod4:name2:hiee";
        let decoded = decode(input).unwrap();
        assert_eq!(decoded.info_raw, Some(&b"d4:name2:hie"[..]));
    }

    #[test]
    fn test_nested_info_is_not_captured() {
        // `info` only occurs inside an inner dictionary
        let input = b"d3:food4:infoi1eee";
        let decoded = decode(input).unwrap();
        assert_eq!(decoded.info_raw, None);

        // an inner `info` must not shadow the top-level one
        let input = b"d1:ad4:infoi1ee4:infoi2ee";
        let decoded = decode(input).unwrap();
        assert_eq!(decoded.info_raw, Some(&b"i2e"[..]));
    }

    #[test]
    fn test_accessors() {
        let value = decode_root(b"d3:numi5e3:raw2:oke");
        assert_eq!(value.get(b"num").unwrap().as_int(), Some(5));
        assert_eq!(value.get(b"raw").unwrap().as_str(), Some("ok"));
        assert!(value.get(b"absent").is_none());
        assert!(value.get(b"num").unwrap().as_bytes().is_none());
        assert!(Value::Int(1).get(b"x").is_none());
    }
}
