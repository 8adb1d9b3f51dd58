use std::fmt::Write;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static MONOTONIC_ORIGIN: OnceLock<Instant> = OnceLock::new();

pub fn wait_ms(ms: u32) {
    std::thread::sleep(Duration::from_millis(ms as u64));
}

pub fn wait_us(us: u64) {
    std::thread::sleep(Duration::from_micros(us));
}

/// Microseconds since the first call in this process.
pub fn monotonic_us() -> u64 {
    MONOTONIC_ORIGIN.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Classic 16-bytes-per-row hex dump with an ASCII column.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();

    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "  {:04x}  ", row * 16);
        for k in 0..16 {
            if k % 8 == 0 {
                out.push_str("  ");
            }
            match chunk.get(k) {
                Some(b) => {
                    let _ = write!(out, "{:02x} ", b);
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  ");
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' });
        }
        out.push('\n');
    }

    out
}
