//! InfluxQL statement tokenization and clause helpers
//!
//! A light word-level tokenizer, just enough for the proxy's
//! classification tree: statement heads, FROM targets, `ON <db>`
//! clauses and LIMIT/OFFSET extraction. Full parsing stays upstream.

/// Split a query into word tokens, keeping quoted identifiers and
/// strings intact. Returns `None` on unbalanced quotes.
pub fn tokenize(q: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut chars = q.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                let quote = c;
                cur.push(c);
                let mut closed = false;
                while let Some(inner) = chars.next() {
                    cur.push(inner);
                    if inner == '\\' {
                        if let Some(escaped) = chars.next() {
                            cur.push(escaped);
                        }
                        continue;
                    }
                    if inner == quote {
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return None;
                }
            }
            c if c.is_whitespace() || c == ',' || c == ';' => {
                if !cur.is_empty() {
                    tokens.push(std::mem::take(&mut cur));
                }
            }
            '(' | ')' => {
                if !cur.is_empty() {
                    tokens.push(std::mem::take(&mut cur));
                }
                tokens.push(c.to_string());
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    Some(tokens)
}

fn is_kw(token: &str, kw: &str) -> bool {
    token.eq_ignore_ascii_case(kw)
}

/// First `n` tokens lowercased and joined, e.g. `"show tag keys"`
pub fn get_head_stmt(tokens: &[String], n: usize) -> String {
    tokens
        .iter()
        .take(n)
        .map(|t| t.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a FROM clause is present
pub fn check_from(tokens: &[String]) -> bool {
    tokens.iter().any(|t| is_kw(t, "from"))
}

pub fn check_select_or_show(tokens: &[String]) -> bool {
    tokens
        .first()
        .map(|t| is_kw(t, "select") || is_kw(t, "show"))
        .unwrap_or(false)
}

/// Statements carrying their own database: `CREATE|DROP DATABASE <db>`
/// and `SHOW DATABASES`. Returns `(checked, show_db, alter_db, db)`.
pub fn check_database_from_tokens(tokens: &[String]) -> (bool, bool, bool, String) {
    let show_db = tokens.len() >= 2 && is_kw(&tokens[0], "show") && is_kw(&tokens[1], "databases");
    let alter_db = tokens.len() >= 2
        && (is_kw(&tokens[0], "create") || is_kw(&tokens[0], "drop"))
        && is_kw(&tokens[1], "database");
    let db = if alter_db && tokens.len() >= 3 {
        unquote(&tokens[2])
    } else {
        String::new()
    };
    (alter_db || show_db, show_db, alter_db, db)
}

/// Database from an `ON <db>` clause, if present
pub fn get_database_from_tokens(tokens: &[String]) -> String {
    for (i, t) in tokens.iter().enumerate() {
        if is_kw(t, "on") && i + 1 < tokens.len() {
            return unquote(&tokens[i + 1]);
        }
    }
    String::new()
}

pub fn check_delete_or_drop_measurement(tokens: &[String]) -> bool {
    match tokens.first() {
        Some(t) if is_kw(t, "delete") => true,
        Some(t) if is_kw(t, "drop") => tokens
            .get(1)
            .map(|t| is_kw(t, "measurement") || is_kw(t, "series"))
            .unwrap_or(false),
        _ => false,
    }
}

/// Retention-policy DDL: `CREATE|ALTER|DROP RETENTION POLICY ...`
pub fn check_retention_policy(tokens: &[String]) -> bool {
    tokens.len() >= 3
        && (is_kw(&tokens[0], "create") || is_kw(&tokens[0], "alter") || is_kw(&tokens[0], "drop"))
        && is_kw(&tokens[1], "retention")
        && is_kw(&tokens[2], "policy")
}

/// The measurement targeted by the statement: the token after FROM, or
/// after MEASUREMENT/SERIES for drop statements. `rp.meas` style targets
/// yield the final segment, unquoted.
pub fn get_measurement_from_tokens(tokens: &[String]) -> Option<String> {
    let mut target = None;
    for (i, t) in tokens.iter().enumerate() {
        if is_kw(t, "from") || is_kw(t, "measurement") {
            target = tokens.get(i + 1);
            break;
        }
    }
    let raw = target?;
    let segment = last_dot_segment(raw);
    let meas = unquote(&segment);
    if meas.is_empty() {
        None
    } else {
        Some(meas)
    }
}

/// Whether the statement carries a LIMIT or OFFSET clause
pub fn check_limit_or_offset_clause(tokens: &[String]) -> bool {
    tokens
        .iter()
        .any(|t| is_kw(t, "limit") || is_kw(t, "offset"))
}

/// `(limit, offset)` values; absent clauses yield zero
pub fn get_limit_offset_from_tokens(tokens: &[String]) -> (i64, i64) {
    let mut limit = 0;
    let mut offset = 0;
    for (i, t) in tokens.iter().enumerate() {
        if is_kw(t, "limit") {
            if let Some(n) = tokens.get(i + 1).and_then(|v| v.parse().ok()) {
                limit = n;
            }
        } else if is_kw(t, "offset") {
            if let Some(n) = tokens.get(i + 1).and_then(|v| v.parse().ok()) {
                offset = n;
            }
        }
    }
    (limit, offset)
}

/// Strip `LIMIT <n>` and `OFFSET <n>` clauses from the raw query before
/// dispatch; the captured clause is re-applied to the merged result.
pub fn remove_limit_offset_clause(q: &str) -> String {
    let words: Vec<&str> = q.split_whitespace().collect();
    let mut out: Vec<&str> = Vec::with_capacity(words.len());
    let mut i = 0;
    while i < words.len() {
        let w = words[i];
        if (is_kw(w, "limit") || is_kw(w, "offset"))
            && words
                .get(i + 1)
                .map(|n| n.parse::<i64>().is_ok())
                .unwrap_or(false)
        {
            i += 2;
            continue;
        }
        out.push(w);
        i += 1;
    }
    out.join(" ")
}

fn last_dot_segment(raw: &str) -> String {
    let mut segments = Vec::new();
    let mut cur = String::new();
    let mut chars = raw.chars();
    let mut quoted = false;
    for c in chars.by_ref() {
        match c {
            '"' => {
                quoted = !quoted;
                cur.push(c);
            }
            '.' if !quoted => {
                segments.push(std::mem::take(&mut cur));
            }
            c => cur.push(c),
        }
    }
    segments.push(cur);
    segments.pop().unwrap_or_default()
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')))
    {
        raw[1..raw.len() - 1].replace("\\\"", "\"")
    } else {
        raw.to_string()
    }
}
