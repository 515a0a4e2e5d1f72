//! Hex formatting for frame-level debug logs

use std::fmt::Write;

/// Format bytes as spaced uppercase hex: `[0x01, 0x03, 0xAB]` -> `"01 03 AB"`
pub fn format_hex_pretty(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        // Writing into a String cannot fail
        let _ = write!(&mut out, "{byte:02X}");
    }
    out
}
