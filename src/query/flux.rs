//! Flux query scanning
//!
//! Extracts the routing tuple `(bucket, measurement)` from flux source
//! text: the `from(bucket: "...")` call and the first
//! `r._measurement == "..."` (or `r["_measurement"] == "..."`) filter.

/// `(bucket, measurement)`; either may be empty when absent
pub fn scan_query(flux: &str) -> (String, String) {
    let bucket = value_after_marker(flux, "bucket")
        .or_else(|| value_after_marker(flux, "\"bucket\""))
        .unwrap_or_default();
    let measurement = value_after_marker(flux, "_measurement")
        .or_else(|| value_after_marker(flux, "\"_measurement\""))
        .unwrap_or_default();
    (bucket, measurement)
}

/// First double-quoted string following `marker` and its `:` / `==` / `]`
/// punctuation. Quote escapes are honored.
fn value_after_marker(src: &str, marker: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(rel) = src[search_from..].find(marker) {
        let after = search_from + rel + marker.len();
        let rest = src[after..].trim_start_matches(&[']', ')', ' ', '\t', '\n'][..]);
        let rest = rest
            .strip_prefix(':')
            .or_else(|| rest.strip_prefix("=="))
            .map(str::trim_start);
        if let Some(rest) = rest {
            if let Some(stripped) = rest.strip_prefix('"') {
                let mut out = String::new();
                let mut chars = stripped.chars();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                out.push(escaped);
                            }
                        }
                        '"' => return Some(out),
                        c => out.push(c),
                    }
                }
            }
        }
        search_from = after;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bucket_and_measurement() {
        let flux = r#"
from(bucket: "telegraf")
  |> range(start: -1h)
  |> filter(fn: (r) => r._measurement == "cpu" and r._field == "usage")
"#;
        assert_eq!(scan_query(flux), ("telegraf".to_string(), "cpu".to_string()));
    }

    #[test]
    fn supports_bracket_member_syntax() {
        let flux = r#"from(bucket:"b1") |> filter(fn: (r) => r["_measurement"] == "mem")"#;
        assert_eq!(scan_query(flux), ("b1".to_string(), "mem".to_string()));
    }

    #[test]
    fn missing_pieces_are_empty() {
        assert_eq!(scan_query("buckets()"), (String::new(), String::new()));
        let flux = r#"from(bucket: "only")"#;
        assert_eq!(scan_query(flux), ("only".to_string(), String::new()));
    }

    #[test]
    fn escaped_quotes_in_names() {
        let flux = r#"from(bucket: "b\"x") |> filter(fn: (r) => r._measurement == "m")"#;
        assert_eq!(scan_query(flux), ("b\"x".to_string(), "m".to_string()));
    }
}
