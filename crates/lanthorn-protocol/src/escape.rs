//! Byte-exact JSON string rendering.
//!
//! Output buffers and environment values are byte sequences under
//! client control; they are not guaranteed to be UTF-8 and must
//! round-trip as faithfully as a JSON string permits. The rules:
//!
//! - `"` `\` and the named control escapes `\b \f \n \r \t` are
//!   escaped by name,
//! - every other control byte (< 0x20) becomes a literal `?`,
//! - all remaining bytes, including non-ASCII, pass through
//!   unchanged.

/// Appends `bytes` to `out` as a quoted JSON string under the rules
/// above.
pub fn write_json_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(b'"');
    for &b in bytes {
        match b {
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            0x08 => out.extend_from_slice(b"\\b"),
            0x0c => out.extend_from_slice(b"\\f"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x00..=0x1f => out.push(b'?'),
            _ => out.push(b),
        }
    }
    out.push(b'"');
}
