//! Little-endian value codecs and inline null sentinels for chunk payloads.
//!
//! Fixed-width columns store raw little-endian values with NULL encoded as
//! the type's sentinel. Text columns store `u32` length-prefixed values with
//! NULL as a `u32::MAX` length. Array columns store concatenated element
//! values in the data chunk and `u64` end-offsets (with a leading zero) in
//! the index chunk.

pub const NULL_BOOLEAN: i8 = i8::MIN;
pub const NULL_SMALLINT: i16 = i16::MIN;
pub const NULL_INT: i32 = i32::MIN;
pub const NULL_BIGINT: i64 = i64::MIN;
pub const NULL_FLOAT: f32 = f32::MIN;
pub const NULL_DOUBLE: f64 = f64::MIN;

/// Length prefix marking a NULL text value.
pub const NULL_TEXT_LEN: u32 = u32::MAX;

pub fn put_i8(out: &mut Vec<u8>, v: i8) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i16(out: &mut Vec<u8>, v: i16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

macro_rules! decode_chunk {
    ($name:ident, $ty:ty, $width:expr) => {
        /// Decode a fixed-width chunk payload into its values. Trailing
        /// partial values are ignored.
        pub fn $name(bytes: &[u8]) -> Vec<$ty> {
            bytes
                .chunks_exact($width)
                .map(|c| <$ty>::from_le_bytes(c.try_into().unwrap()))
                .collect()
        }
    };
}

decode_chunk!(decode_i8_chunk, i8, 1);
decode_chunk!(decode_i16_chunk, i16, 2);
decode_chunk!(decode_i32_chunk, i32, 4);
decode_chunk!(decode_i64_chunk, i64, 8);
decode_chunk!(decode_f32_chunk, f32, 4);
decode_chunk!(decode_f64_chunk, f64, 8);
decode_chunk!(decode_u64_chunk, u64, 8);

/// Decode a length-prefixed text chunk into optional strings.
pub fn decode_text_chunk(bytes: &[u8]) -> Vec<Option<String>> {
    let mut values = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        pos += 4;
        if len == NULL_TEXT_LEN {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if pos + len > bytes.len() {
            break;
        }
        values.push(Some(String::from_utf8_lossy(&bytes[pos..pos + len]).into_owned()));
        pos += len;
    }
    values
}
