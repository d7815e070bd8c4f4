/// Formats `bytes` as a classic hex dump, 16 bytes per row, with addresses
/// starting at `base`.
pub fn hexdump(bytes: &[u8], base: usize) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let mut line = format!("{:06x}: ", base + row * 16);
        let mut chars = String::new();
        for byte in chunk {
            line.push_str(&format!("{:02x} ", byte));
            let c = *byte as char;
            chars.push(if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '.'
            });
        }

        out.push_str(&format!("{:<56} {}\n", line, chars));
    }

    out
}

/// Clamps `value` into `[min, max]`, mapping NaN to `min`.
pub fn clamp_f32(value: f32, min: f32, max: f32) -> f32 {
    if value.is_nan() {
        min
    } else {
        value.clamp(min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump_rows() {
        let data: Vec<u8> = (0..20).collect();
        let dump = hexdump(&data, 0x100);
        let lines: Vec<_> = dump.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("000100: 00 01 02"));
        assert!(lines[1].starts_with("000110: 10 11 12 13"));
    }

    #[test]
    fn test_hexdump_printable() {
        let dump = hexdump(b"hi\n", 0);
        assert!(dump.trim_end().ends_with("hi."));
    }

    #[test]
    fn test_clamp_nan() {
        assert_eq!(clamp_f32(f32::NAN, 10.0, 20.0), 10.0);
        assert_eq!(clamp_f32(50.0, 10.0, 20.0), 20.0);
    }
}
