//! Bencode codec: decode/encode the four bencode kinds used by `.torrent`
//! files and tracker responses.
//!
//! Byte strings that happen to be valid UTF-8 decode to [`Value::Text`];
//! everything else decodes to [`Value::Bytes`]. Dictionary keys are always
//! raw bytes (bencode dict keys need not be valid UTF-8), stored in a
//! `BTreeMap` so encoding naturally re-emits them in sorted order — the
//! canonical form the info-hash computation depends on.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("malformed integer at offset {0}")]
    InvalidInteger(usize),
    #[error("string length at offset {0} exceeds remaining input")]
    StringTooLong(usize),
    #[error("unterminated list or dictionary")]
    UnterminatedContainer,
    #[error("unknown leading byte {0:#04x} at offset {1}")]
    UnknownTag(u8, usize),
    #[error("{0} bytes remain after decoding the top-level value")]
    TrailingData(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the underlying bytes regardless of whether decoding
    /// classified this string as [`Value::Text`] or [`Value::Bytes`].
    pub fn as_raw_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Text(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, consumed) = decode_value(data, 0)?;
    if consumed != data.len() {
        return Err(BencodeError::TrailingData(data.len() - consumed));
    }
    Ok(value)
}

fn decode_value(data: &[u8], index: usize) -> Result<(Value, usize), BencodeError> {
    match data.get(index) {
        None => Err(BencodeError::UnexpectedEof),
        Some(b'i') => decode_int(data, index),
        Some(b'l') => decode_list(data, index),
        Some(b'd') => decode_dict(data, index),
        Some(b) if b.is_ascii_digit() => decode_bytestring(data, index),
        Some(&b) => Err(BencodeError::UnknownTag(b, index)),
    }
}

fn decode_int(data: &[u8], index: usize) -> Result<(Value, usize), BencodeError> {
    let start = index + 1;
    let end = find(data, b'e', start).ok_or(BencodeError::InvalidInteger(index))?;
    let digits = &data[start..end];
    if digits.is_empty() || digits == b"-" {
        return Err(BencodeError::InvalidInteger(index));
    }
    // Reject leading zeros (other than the literal "0") and "-0", matching
    // the canonical bencode grammar.
    let is_negative = digits[0] == b'-';
    let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
    if (unsigned.len() > 1 && unsigned[0] == b'0') || (is_negative && unsigned == b"0") {
        return Err(BencodeError::InvalidInteger(index));
    }
    let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger(index))?;
    let n: i64 = text.parse().map_err(|_| BencodeError::InvalidInteger(index))?;
    Ok((Value::Int(n), end + 1))
}

fn decode_bytestring(data: &[u8], index: usize) -> Result<(Value, usize), BencodeError> {
    let colon = find(data, b':', index).ok_or(BencodeError::StringTooLong(index))?;
    let len_text =
        std::str::from_utf8(&data[index..colon]).map_err(|_| BencodeError::StringTooLong(index))?;
    let len: usize = len_text
        .parse()
        .map_err(|_| BencodeError::StringTooLong(index))?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .ok_or(BencodeError::StringTooLong(index))?;
    if end > data.len() {
        return Err(BencodeError::StringTooLong(index));
    }
    let raw = &data[start..end];
    let value = match std::str::from_utf8(raw) {
        Ok(s) => Value::Text(s.to_string()),
        Err(_) => Value::Bytes(raw.to_vec()),
    };
    Ok((value, end))
}

fn decode_list(data: &[u8], index: usize) -> Result<(Value, usize), BencodeError> {
    let mut i = index + 1;
    let mut items = Vec::new();
    loop {
        match data.get(i) {
            None => return Err(BencodeError::UnterminatedContainer),
            Some(b'e') => return Ok((Value::List(items), i + 1)),
            Some(_) => {
                let (value, next) = decode_value(data, i)?;
                items.push(value);
                i = next;
            }
        }
    }
}

fn decode_dict(data: &[u8], index: usize) -> Result<(Value, usize), BencodeError> {
    let mut i = index + 1;
    let mut map = BTreeMap::new();
    loop {
        match data.get(i) {
            None => return Err(BencodeError::UnterminatedContainer),
            Some(b'e') => return Ok((Value::Dict(map), i + 1)),
            Some(_) => {
                let (key, next) = decode_bytestring(data, i)?;
                let key_bytes = key
                    .as_raw_bytes()
                    .expect("decode_bytestring always yields Text or Bytes")
                    .to_vec();
                let (value, next) = decode_value(data, next)?;
                map.insert(key_bytes, value);
                i = next;
            }
        }
    }
}

fn find(data: &[u8], needle: u8, from: usize) -> Option<usize> {
    data[from..].iter().position(|&b| b == needle).map(|p| p + from)
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Text(s) => encode_bytestring(s.as_bytes(), out),
        Value::Bytes(b) => encode_bytestring(b, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            // BTreeMap already iterates in sorted byte order.
            for (key, value) in map {
                encode_bytestring(key, out);
                encode_into(value, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_bytestring(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: Vec<(&str, Value)>) -> Value {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.as_bytes().to_vec(), v);
        }
        Value::Dict(map)
    }

    #[test]
    fn decodes_scenario_from_spec() {
        let decoded = decode(b"d4:listl5:apple6:banana6:potatoi42ee3:numi7ee").unwrap();
        let expected = dict(vec![
            (
                "list",
                Value::List(vec![
                    Value::Text("apple".into()),
                    Value::Text("banana".into()),
                    Value::Text("potato".into()),
                    Value::Int(42),
                ]),
            ),
            ("num", Value::Int(7)),
        ]);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn spec_example_exact() {
        let decoded = decode(b"d4:listl5:apple6:banana6:potatoi42ee3:numi7ee").unwrap();
        if let Value::Dict(map) = &decoded {
            let list = map.get(b"list".as_slice()).unwrap().as_list().unwrap();
            assert_eq!(list.len(), 4);
        } else {
            panic!("expected dict");
        }
    }

    #[test]
    fn round_trip_nested_structure() {
        let value = dict(vec![
            ("a", Value::Int(-17)),
            (
                "b",
                Value::List(vec![Value::Text("x".into()), Value::Bytes(vec![0xff, 0x00])]),
            ),
            ("z", Value::Int(0)),
        ]);
        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn encode_sorts_dict_keys() {
        let value = dict(vec![("zebra", Value::Int(1)), ("apple", Value::Int(2))]);
        let encoded = encode(&value);
        assert_eq!(encoded, b"d5:applei2e5:zebrai1ee");
    }

    #[test]
    fn non_utf8_bytestring_stays_bytes() {
        let raw = [0x04u8, b':', 0xff, 0xfe, 0x00, 0x01];
        let (value, consumed) = decode_value(&raw, 0).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(value, Value::Bytes(vec![0xff, 0xfe, 0x00, 0x01]));
    }

    #[test]
    fn rejects_trailing_data() {
        let err = decode(b"i1eee").unwrap_err();
        assert_eq!(err, BencodeError::TrailingData(3));
    }

    #[test]
    fn rejects_malformed_integer() {
        assert!(decode(b"i-e").is_err());
        assert!(decode(b"i01e").is_err());
        assert!(decode(b"iae").is_err());
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn rejects_string_length_overrun() {
        assert!(decode(b"10:short").is_err());
    }

    #[test]
    fn rejects_unterminated_container() {
        assert!(decode(b"l1:ai1e").is_err());
        assert!(decode(b"d1:a1:b").is_err());
    }

    #[test]
    fn rejects_unknown_leading_byte() {
        assert!(decode(b"x").is_err());
    }

    #[test]
    fn decode_encode_round_trip_for_generated_values() {
        // A small hand-built corpus standing in for a property test: every
        // value built from ints, byte strings, lists, and dicts with
        // byte-string keys survives decode(encode(x)) == x.
        let corpus = vec![
            Value::Int(0),
            Value::Int(i64::MIN + 1),
            Value::Int(i64::MAX),
            Value::Text(String::new()),
            Value::Bytes(vec![1, 2, 3, 255]),
            Value::List(vec![]),
            dict(vec![]),
            dict(vec![(
                "nested",
                Value::List(vec![dict(vec![("k", Value::Int(5))])]),
            )]),
        ];
        for value in corpus {
            let round_tripped = decode(&encode(&value)).unwrap();
            assert_eq!(round_tripped, value);
        }
    }
}
