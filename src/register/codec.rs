//! # Register Encoding and Decoding
//!
//! Pure functions converting between raw register words and logical values.
//! Multi-word values are first laid out as a big-endian byte buffer in the
//! register's word order, then read with the `nom` number parsers.

use bytes::{BufMut, BytesMut};
use nom::number::complete::{be_f32, be_i16, be_i32, be_i64, be_u16, be_u32, be_u64};
use nom::IResult;

use super::{RegisterKind, RegisterValue, WordOrder};
use crate::error::{DecodeError, EncodeError};

type ParseResult<'a, T> = IResult<&'a [u8], T, nom::error::Error<&'a [u8]>>;

/// Lay out words as bytes, most significant word first.
fn words_to_bytes(words: &[u16], order: WordOrder) -> BytesMut {
    let mut buf = BytesMut::with_capacity(words.len() * 2);
    match order {
        WordOrder::BigEndian => words.iter().for_each(|w| buf.put_u16(*w)),
        WordOrder::LittleEndian => words.iter().rev().for_each(|w| buf.put_u16(*w)),
    }
    buf
}

fn bytes_to_words(bytes: &[u8], order: WordOrder) -> Vec<u16> {
    let mut words: Vec<u16> = bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]))
        .collect();
    if order == WordOrder::LittleEndian {
        words.reverse();
    }
    words
}

fn number<'a, T: Into<f64>>(
    input: &'a [u8],
    parser: fn(&'a [u8]) -> ParseResult<'a, T>,
    expected: usize,
) -> Result<f64, DecodeError> {
    parser(input)
        .map(|(_, v)| v.into())
        .map_err(|_| DecodeError::WordCount {
            expected,
            actual: input.len() / 2,
        })
}

/// Decode `words` according to `kind`, dividing numeric results by `scale`.
pub fn decode(
    kind: RegisterKind,
    order: WordOrder,
    scale: f64,
    words: &[u16],
) -> Result<RegisterValue, DecodeError> {
    let expected = usize::from(kind.word_count());
    if words.len() != expected {
        return Err(DecodeError::WordCount {
            expected,
            actual: words.len(),
        });
    }

    let buf = words_to_bytes(words, order);
    let raw = match kind {
        RegisterKind::U16 => number(&buf, be_u16, expected)?,
        RegisterKind::S16 => number(&buf, be_i16, expected)?,
        RegisterKind::U32 => number(&buf, be_u32, expected)?,
        RegisterKind::S32 => number(&buf, be_i32, expected)?,
        RegisterKind::U64 => be_u64::<_, nom::error::Error<&[u8]>>(&buf[..])
            .map(|(_, v)| v as f64)
            .map_err(|_| DecodeError::WordCount { expected, actual: words.len() })?,
        RegisterKind::S64 => be_i64::<_, nom::error::Error<&[u8]>>(&buf[..])
            .map(|(_, v)| v as f64)
            .map_err(|_| DecodeError::WordCount { expected, actual: words.len() })?,
        RegisterKind::F32 => number(&buf, be_f32, expected)?,
        RegisterKind::Mapped(map) => {
            let code = words[0];
            let index = map
                .iter()
                .find(|(raw, _)| *raw == code)
                .map(|(_, index)| *index)
                .ok_or(DecodeError::UnmappedCode(u64::from(code)))?;
            return Ok(RegisterValue::Number(f64::from(index)));
        }
        RegisterKind::Text(_) => {
            // Text ignores word order: characters are packed in wire order
            return decode_text(&words_to_bytes(words, WordOrder::BigEndian));
        }
    };

    Ok(RegisterValue::Number(raw / scale))
}

fn decode_text(bytes: &[u8]) -> Result<RegisterValue, DecodeError> {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0 && *b != b' ')
        .map_or(0, |i| i + 1);
    let trimmed = &bytes[..end];
    if !trimmed.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return Err(DecodeError::InvalidText);
    }
    // All bytes are ASCII, so this cannot fail
    String::from_utf8(trimmed.to_vec())
        .map(RegisterValue::Text)
        .map_err(|_| DecodeError::InvalidText)
}

/// Encode a logical value into register words. Range checks against a
/// register's writable window happen in [`super::Register::encode_value`].
pub fn encode(
    kind: RegisterKind,
    order: WordOrder,
    scale: f64,
    value: f64,
) -> Result<Vec<u16>, EncodeError> {
    let raw = (value * scale).round();
    let mut buf = BytesMut::with_capacity(usize::from(kind.word_count()) * 2);

    match kind {
        RegisterKind::U16 => buf.put_u16(integral::<u16>(raw, value)?),
        RegisterKind::S16 => buf.put_i16(integral::<i16>(raw, value)?),
        RegisterKind::U32 => buf.put_u32(integral::<u32>(raw, value)?),
        RegisterKind::S32 => buf.put_i32(integral::<i32>(raw, value)?),
        RegisterKind::U64 => buf.put_u64(integral::<u64>(raw, value)?),
        RegisterKind::S64 => buf.put_i64(integral::<i64>(raw, value)?),
        RegisterKind::F32 => {
            let scaled = value * scale;
            if !scaled.is_finite() || scaled.abs() > f64::from(f32::MAX) {
                return Err(EncodeError::NotRepresentable(value));
            }
            buf.put_f32(scaled as f32);
        }
        RegisterKind::Mapped(map) => {
            let code = map
                .iter()
                .find(|(_, index)| f64::from(*index) == value)
                .map(|(raw, _)| *raw)
                .ok_or(EncodeError::NotRepresentable(value))?;
            return Ok(vec![code]);
        }
        RegisterKind::Text(_) => return Err(EncodeError::Unsupported),
    }

    Ok(bytes_to_words(&buf, order))
}

/// Encode text into `words` registers, NUL padded.
pub fn encode_text(text: &str, words: u16) -> Result<Vec<u16>, EncodeError> {
    let capacity = usize::from(words) * 2;
    if text.len() > capacity || !text.is_ascii() {
        return Err(EncodeError::Unsupported);
    }
    let mut buf = BytesMut::with_capacity(capacity);
    buf.put_slice(text.as_bytes());
    buf.put_bytes(0, capacity - text.len());
    Ok(bytes_to_words(&buf, WordOrder::BigEndian))
}

fn integral<T: TryFrom<i128>>(raw: f64, value: f64) -> Result<T, EncodeError> {
    if !raw.is_finite() || raw.abs() > 1.8e19 {
        return Err(EncodeError::NotRepresentable(value));
    }
    T::try_from(raw as i128).map_err(|_| EncodeError::NotRepresentable(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SEQUENCE: &[(u16, u16)] = &[(0, 0), (0xFFFF, 1)];

    fn num(v: RegisterValue) -> f64 {
        v.as_f64().unwrap()
    }

    #[test]
    fn test_decode_u32_big_endian_scaled() {
        let v = decode(RegisterKind::U32, WordOrder::BigEndian, 10.0, &[0x0001, 0x0002]).unwrap();
        assert!((num(v) - 6553.8).abs() < 1e-9);
    }

    #[test]
    fn test_decode_s32_little_endian() {
        // -1234 = 0xFFFFFB2E, sent low word first
        let v = decode(RegisterKind::S32, WordOrder::LittleEndian, 1.0, &[0xFB2E, 0xFFFF]).unwrap();
        assert_eq!(num(v), -1234.0);
    }

    #[test]
    fn test_decode_s16_sign_extends() {
        let v = decode(RegisterKind::S16, WordOrder::BigEndian, 10.0, &[0xFFF6]).unwrap();
        assert_eq!(num(v), -1.0);
    }

    #[test]
    fn test_decode_u64() {
        let v = decode(
            RegisterKind::U64,
            WordOrder::BigEndian,
            100.0,
            &[0x0000, 0x0000, 0x0001, 0x0000],
        )
        .unwrap();
        assert_eq!(num(v), 655.36);
    }

    #[test]
    fn test_decode_f32() {
        // 230.5 = 0x43668000
        let v = decode(RegisterKind::F32, WordOrder::BigEndian, 1.0, &[0x4366, 0x8000]).unwrap();
        assert_eq!(num(v), 230.5);
    }

    #[test]
    fn test_decode_text_trims_padding() {
        let words = [0x4232, 0x3320, 0x0000];
        assert_eq!(
            decode(RegisterKind::Text(3), WordOrder::BigEndian, 1.0, &words).unwrap(),
            RegisterValue::Text("B23".to_string())
        );
    }

    #[test]
    fn test_decode_text_rejects_binary() {
        let words = [0x41FF, 0x0000];
        assert_eq!(
            decode(RegisterKind::Text(2), WordOrder::BigEndian, 1.0, &words),
            Err(DecodeError::InvalidText)
        );
    }

    #[test]
    fn test_decode_mapped() {
        let kind = RegisterKind::Mapped(SEQUENCE);
        assert_eq!(num(decode(kind, WordOrder::BigEndian, 1.0, &[0xFFFF]).unwrap()), 1.0);
        assert_eq!(
            decode(kind, WordOrder::BigEndian, 1.0, &[0x0002]),
            Err(DecodeError::UnmappedCode(2))
        );
    }

    #[test]
    fn test_decode_word_count_mismatch() {
        assert_eq!(
            decode(RegisterKind::U32, WordOrder::BigEndian, 1.0, &[1]),
            Err(DecodeError::WordCount { expected: 2, actual: 1 })
        );
    }

    #[test]
    fn test_encode_rejects_unrepresentable() {
        assert_eq!(
            encode(RegisterKind::U16, WordOrder::BigEndian, 1.0, -1.0),
            Err(EncodeError::NotRepresentable(-1.0))
        );
        assert_eq!(
            encode(RegisterKind::Mapped(SEQUENCE), WordOrder::BigEndian, 1.0, 2.0),
            Err(EncodeError::NotRepresentable(2.0))
        );
    }

    #[test]
    fn test_encode_text() {
        assert_eq!(encode_text("B23", 3).unwrap(), vec![0x4232, 0x3300, 0x0000]);
        assert!(encode_text("too long", 2).is_err());
    }

    proptest! {
        #[test]
        fn prop_s32_round_trip(v in -2_000_000i32..2_000_000, little in any::<bool>()) {
            let order = if little { WordOrder::LittleEndian } else { WordOrder::BigEndian };
            let value = f64::from(v) / 10.0;
            let words = encode(RegisterKind::S32, order, 10.0, value).unwrap();
            let back = decode(RegisterKind::S32, order, 10.0, &words).unwrap();
            prop_assert!((back.as_f64().unwrap() - value).abs() < 0.05);
        }

        #[test]
        fn prop_u64_round_trip(v in 0u64..(1u64 << 40)) {
            let words = encode(RegisterKind::U64, WordOrder::BigEndian, 100.0, v as f64 / 100.0).unwrap();
            let back = decode(RegisterKind::U64, WordOrder::BigEndian, 100.0, &words).unwrap();
            prop_assert!((back.as_f64().unwrap() - v as f64 / 100.0).abs() < 0.005);
        }

        #[test]
        fn prop_f32_round_trip(v in -1.0e6f32..1.0e6f32) {
            let words = encode(RegisterKind::F32, WordOrder::BigEndian, 1.0, f64::from(v)).unwrap();
            let back = decode(RegisterKind::F32, WordOrder::BigEndian, 1.0, &words).unwrap();
            prop_assert_eq!(back.as_f64().unwrap(), f64::from(v));
        }

        #[test]
        fn prop_s16_round_trip(v in any::<i16>()) {
            let words = encode(RegisterKind::S16, WordOrder::BigEndian, 1.0, f64::from(v)).unwrap();
            prop_assert_eq!(words.len(), 1);
            let back = decode(RegisterKind::S16, WordOrder::BigEndian, 1.0, &words).unwrap();
            prop_assert_eq!(back.as_f64().unwrap(), f64::from(v));
        }
    }
}
