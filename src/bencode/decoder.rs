use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::BTreeMap;
use tracing::instrument;

/// Decodes a complete bencode value from `input`.
///
/// The whole buffer must be consumed; trailing bytes after the first value
/// are rejected. This is the right entry point for metainfo files and
/// tracker response bodies, which are exactly one value each.
///
/// # Errors
/// Returns a [`BencodeError`] carrying the byte offset of the first
/// malformed byte.
#[instrument(skip(input), level = "trace")]
pub fn decode(input: &[u8]) -> BencodeResult<BencodeValue> {
    let mut decoder = Decoder::new(input);
    let value = decoder.decode_next()?;
    if decoder.pos != input.len() {
        return Err(BencodeError::TrailingBytes(decoder.pos));
    }
    Ok(value)
}

/// Recursive descent over a byte buffer with an explicit cursor, so every
/// failure can report where it happened.
struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEoi(self.pos))
    }

    fn advance(&mut self) -> BencodeResult<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    /// Consumes the decimal digits of an ASCII number up to (and including)
    /// `delimiter`, returning the digit slice. Used for both string lengths
    /// and integer bodies.
    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a [u8]> {
        let input = self.input;
        let start = self.pos;
        loop {
            let byte = self.advance()?;
            if byte == delimiter {
                return Ok(&input[start..self.pos - 1]);
            }
        }
    }

    /// `<len>:<bytes>`. The length is a non-negative decimal without leading
    /// zeros; exactly `len` raw bytes follow, not UTF-8 validated.
    fn decode_string(&mut self) -> BencodeResult<Vec<u8>> {
        let start = self.pos;
        let digits = self.read_until(b':')?;
        if !is_valid_number(digits) {
            return Err(BencodeError::InvalidStringLength(start));
        }
        // digits are ASCII, so from_utf8 cannot fail; parse can only
        // overflow usize
        let length = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::InvalidStringLength(start))?;

        if self.input.len() - self.pos < length {
            return Err(BencodeError::UnexpectedEoi(self.input.len()));
        }
        let bytes = self.input[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(bytes)
    }

    /// `i<digits>e`. No leading zero except `0` itself; `-0` and empty
    /// digits are rejected.
    fn decode_integer(&mut self) -> BencodeResult<i64> {
        let start = self.pos;
        let first = self.advance()?;
        if first != b'i' {
            return Err(BencodeError::InvalidFormat {
                offset: start,
                reason: "integer must start with 'i'",
            });
        }

        let digits = self.read_until(b'e')?;
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty() || (digits.first() == Some(&b'-') && unsigned == b"0") {
            return Err(BencodeError::InvalidInteger(start));
        }
        if !is_valid_number(unsigned) {
            return Err(BencodeError::InvalidInteger(start));
        }

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::InvalidInteger(start))
    }

    /// `l<value>*e`.
    fn decode_list(&mut self) -> BencodeResult<Vec<BencodeValue>> {
        let start = self.pos;
        let first = self.advance()?;
        if first != b'l' {
            return Err(BencodeError::InvalidFormat {
                offset: start,
                reason: "list must start with 'l'",
            });
        }

        let mut list = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.advance()?;
                return Ok(list);
            }
            list.push(self.decode_next()?);
        }
    }

    /// `d(<string><value>)*e`. Keys are byte strings; duplicates are
    /// rejected.
    fn decode_dict(&mut self) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
        let start = self.pos;
        let first = self.advance()?;
        if first != b'd' {
            return Err(BencodeError::InvalidFormat {
                offset: start,
                reason: "dictionary must start with 'd'",
            });
        }

        let mut dict = BTreeMap::new();
        loop {
            if self.peek()? == b'e' {
                self.advance()?;
                return Ok(dict);
            }
            let key_offset = self.pos;
            let key = self.decode_string()?;
            let value = self.decode_next()?;
            if dict.insert(key, value).is_some() {
                return Err(BencodeError::DuplicateKey(key_offset));
            }
        }
    }

    fn decode_next(&mut self) -> BencodeResult<BencodeValue> {
        match self.peek()? {
            b'0'..=b'9' => self.decode_string().map(BencodeValue::String),
            b'i' => self.decode_integer().map(BencodeValue::Integer),
            b'l' => self.decode_list().map(BencodeValue::List),
            b'd' => self.decode_dict().map(BencodeValue::Dict),
            _ => Err(BencodeError::InvalidFormat {
                offset: self.pos,
                reason: "unexpected value prefix",
            }),
        }
    }
}

/// Digits only, and no leading zero unless the number is exactly "0".
fn is_valid_number(digits: &[u8]) -> bool {
    if digits.is_empty() {
        return false;
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return false;
    }
    digits.iter().all(u8::is_ascii_digit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: Vec<(&[u8], BencodeValue)>) -> BencodeValue {
        BencodeValue::Dict(entries.into_iter().map(|(k, v)| (k.to_vec(), v)).collect())
    }

    #[test]
    fn decodes_integers() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
        assert_eq!(decode(b"i-7e").unwrap(), BencodeValue::Integer(-7));
        assert_eq!(
            decode(b"i9223372036854775807e").unwrap(),
            BencodeValue::Integer(i64::MAX)
        );
    }

    #[test]
    fn rejects_bad_integers() {
        assert!(matches!(decode(b"i-0e"), Err(BencodeError::InvalidInteger(0))));
        assert!(matches!(decode(b"i042e"), Err(BencodeError::InvalidInteger(0))));
        assert!(matches!(decode(b"ie"), Err(BencodeError::InvalidInteger(0))));
        assert!(matches!(decode(b"i12"), Err(BencodeError::UnexpectedEoi(3))));
    }

    #[test]
    fn decodes_strings() {
        assert_eq!(
            decode(b"4:spam").unwrap(),
            BencodeValue::String(b"spam".to_vec())
        );
        assert_eq!(decode(b"0:").unwrap(), BencodeValue::String(Vec::new()));
        // raw bytes, not UTF-8
        assert_eq!(
            decode(b"3:\xff\x00\x01").unwrap(),
            BencodeValue::String(vec![0xff, 0x00, 0x01])
        );
    }

    #[test]
    fn rejects_bad_strings() {
        assert!(matches!(
            decode(b"01:a"),
            Err(BencodeError::InvalidStringLength(0))
        ));
        assert!(matches!(decode(b"5:spam"), Err(BencodeError::UnexpectedEoi(6))));
        assert!(matches!(
            decode(b"-1:a"),
            Err(BencodeError::InvalidFormat { offset: 0, .. })
        ));
    }

    #[test]
    fn decodes_lists() {
        assert_eq!(
            decode(b"l4:spami42ee").unwrap(),
            BencodeValue::List(vec![
                BencodeValue::String(b"spam".to_vec()),
                BencodeValue::Integer(42),
            ])
        );
        assert_eq!(decode(b"le").unwrap(), BencodeValue::List(Vec::new()));
    }

    #[test]
    fn decodes_dicts() {
        assert_eq!(
            decode(b"d3:bar4:spam3:fooi42ee").unwrap(),
            dict(vec![
                (b"bar", BencodeValue::String(b"spam".to_vec())),
                (b"foo", BencodeValue::Integer(42)),
            ])
        );
    }

    #[test]
    fn rejects_duplicate_keys() {
        assert!(matches!(
            decode(b"d3:fooi1e3:fooi2ee"),
            Err(BencodeError::DuplicateKey(9))
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(matches!(
            decode(b"i1ei2e"),
            Err(BencodeError::TrailingBytes(3))
        ));
    }

    #[test]
    fn rejects_truncated_nesting() {
        assert!(matches!(
            decode(b"ld3:fooi1e"),
            Err(BencodeError::UnexpectedEoi(10))
        ));
    }

    #[test]
    fn error_offsets_point_into_nested_values() {
        // the bad integer starts at offset 7
        assert!(matches!(
            decode(b"d3:fooli-0eee"),
            Err(BencodeError::InvalidInteger(7))
        ));
    }
}
