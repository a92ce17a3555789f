//! Line-protocol scanning and escaping
//!
//! Minimal byte-level helpers for the write path and the transfer engine:
//! splitting payloads into records, extracting the measurement, validating
//! the tag/field shape, normalizing timestamps to nanoseconds, and escaping
//! values when re-encoding rows as line protocol.

use chrono::Utc;

/// Nanosecond multipliers per precision unit accepted by `/write`
fn precision_factor(precision: &str) -> i64 {
    match precision {
        "u" | "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        "h" => 3_600 * 1_000_000_000,
        _ => 1,
    }
}

/// Scan one logical line starting at `pos`.
///
/// Returns `(next_pos, line)` where `line` excludes the terminating
/// newline. Newlines inside double-quoted field values do not terminate
/// the line; backslash escapes are honored inside quotes.
pub fn scan_line(buf: &[u8], pos: usize) -> (usize, &[u8]) {
    let mut quoted = false;
    let mut fields = false;
    let mut i = pos;
    while i < buf.len() {
        let c = buf[i];
        if c == b' ' && !quoted {
            fields = true;
        }
        if fields && c == b'"' && (i == 0 || buf[i - 1] != b'\\') {
            quoted = !quoted;
        }
        if c == b'\n' && !quoted {
            break;
        }
        i += 1;
    }
    (i, &buf[pos..i])
}

/// Skip space and tab characters from `pos`
pub fn skip_whitespace(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && (buf[pos] == b' ' || buf[pos] == b'\t' || buf[pos] == b'\0') {
        pos += 1;
    }
    pos
}

/// Extract the measurement name from the head of a line.
///
/// The measurement ends at the first unescaped comma or space. Escape
/// sequences are unescaped in the returned name. Errors if the line ends
/// before any tag/field separator.
pub fn scan_key(line: &[u8]) -> Result<String, String> {
    let mut name = Vec::with_capacity(line.len().min(64));
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b'\\' if i + 1 < line.len() => {
                name.push(line[i + 1]);
                i += 2;
            }
            b',' | b' ' => {
                return String::from_utf8(name).map_err(|e| e.to_string());
            }
            c => {
                name.push(c);
                i += 1;
            }
        }
    }
    Err("missing tag/field separator".to_string())
}

/// Quick shape check of everything after the measurement: the line must
/// contain a field set (`k=v` after an unescaped space) with balanced
/// double quotes. Not a full parse; malformed lines that pass here are
/// rejected by the upstream.
pub fn rapid_check(rest: &[u8]) -> bool {
    let mut quoted = false;
    let mut fields = false;
    let mut has_eq = false;
    let mut i = 0;
    while i < rest.len() {
        let c = rest[i];
        if c == b'\\' && !quoted {
            i += 2;
            continue;
        }
        if c == b'"' && (i == 0 || rest[i - 1] != b'\\') {
            quoted = !quoted;
        } else if !quoted {
            if c == b' ' && !fields {
                fields = true;
            } else if c == b'=' && fields {
                has_eq = true;
            }
        }
        i += 1;
    }
    fields && has_eq && !quoted
}

/// Normalize the line's timestamp to nanoseconds.
///
/// If the last space-delimited token (outside quotes) parses as an
/// integer timestamp it is scaled from `precision` to nanoseconds;
/// otherwise the current wall-clock nanosecond timestamp is appended.
pub fn append_nano(line: &[u8], precision: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 20);
    if let Some(sep) = last_unquoted_space(line) {
        let candidate = &line[sep + 1..];
        if let Some(ts) = parse_timestamp(candidate) {
            out.extend_from_slice(&line[..sep + 1]);
            let nanos = ts.saturating_mul(precision_factor(precision));
            out.extend_from_slice(nanos.to_string().as_bytes());
            return out;
        }
    }
    out.extend_from_slice(line);
    out.push(b' ');
    out.extend_from_slice(now_nanos().to_string().as_bytes());
    out
}

fn last_unquoted_space(line: &[u8]) -> Option<usize> {
    let mut quoted = false;
    let mut last = None;
    let mut i = 0;
    while i < line.len() {
        let c = line[i];
        if c == b'\\' && !quoted {
            i += 2;
            continue;
        }
        if c == b'"' {
            quoted = !quoted;
        } else if c == b' ' && !quoted {
            last = Some(i);
        }
        i += 1;
    }
    last
}

fn parse_timestamp(token: &[u8]) -> Option<i64> {
    if token.is_empty() {
        return None;
    }
    std::str::from_utf8(token).ok()?.parse::<i64>().ok()
}

/// Current wall clock in nanoseconds
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Escape a measurement name for line protocol (commas and spaces)
pub fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escape a tag key, tag value or field key (commas, equals, spaces)
pub fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

/// Escape a string field value (backslashes and double quotes)
pub fn escape_string_field(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Escape an identifier for interpolation into a quoted InfluxQL name
pub fn escape_identifier(s: &str) -> String {
    s.replace('"', "\\\"")
}
