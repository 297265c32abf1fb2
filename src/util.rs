//! Values passed through a register across a stack switch.

/// Internal type for a value that has been encoded in a `usize`.
pub type EncodedValue = usize;

/// Encodes a transfer result code.
#[inline]
pub fn encode_code(code: i32) -> EncodedValue {
    code as u32 as EncodedValue
}

/// Decodes a value produced by `encode_code`. Only the low 32 bits are
/// meaningful.
#[inline]
pub fn decode_code(val: EncodedValue) -> i32 {
    val as u32 as i32
}

#[test]
fn negative_codes_survive_encoding() {
    for code in [0, 1, 100, -1, i32::MIN, i32::MAX] {
        assert_eq!(decode_code(encode_code(code)), code);
    }
}
