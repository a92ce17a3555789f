//! Shard key template engine
//!
//! A template is literal text interleaved with variable tokens from a
//! closed set (`%db`/`%mm` for shard keys, `%idx` for hash keys). Compiled
//! once at startup, rendered on every routed request.

/// One compiled template part
#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    /// Index into the variable set
    Var(usize),
}

/// A compiled shard key template, immutable after construction
#[derive(Debug, Clone)]
pub struct ShardTemplate {
    tpl: String,
    vars: Vec<String>,
    parts: Vec<Part>,
    counts: Vec<usize>,
}

impl ShardTemplate {
    /// Compile `tpl` over the variable set `vars`.
    ///
    /// Scans left-to-right trying every variable token at each position;
    /// a match emits the pending literal span and the variable part, then
    /// scanning resumes past the token. Unmatched positions advance by
    /// one byte and any trailing literal is emitted at end-of-input.
    pub fn compile(tpl: &str, vars: &[&str]) -> Self {
        let vars: Vec<String> = vars.iter().map(|v| v.to_string()).collect();
        let mut parts = Vec::new();
        let mut counts = vec![0usize; vars.len()];
        let mut lit_start = 0;
        let mut j = 0;
        while j < tpl.len() {
            let matched = vars
                .iter()
                .position(|v| !v.is_empty() && tpl[j..].starts_with(v.as_str()));
            match matched {
                Some(vi) => {
                    if j > lit_start {
                        parts.push(Part::Literal(tpl[lit_start..j].to_string()));
                    }
                    parts.push(Part::Var(vi));
                    counts[vi] += 1;
                    j += vars[vi].len();
                    lit_start = j;
                }
                None => j += 1,
            }
        }
        if j > lit_start {
            parts.push(Part::Literal(tpl[lit_start..j].to_string()));
        }
        Self {
            tpl: tpl.to_string(),
            vars,
            parts,
            counts,
        }
    }

    /// Render the template with `values` bound positionally to the
    /// variable set. Extra or missing values render as empty.
    pub fn render(&self, values: &[&str]) -> String {
        let mut size = self.tpl.len() as isize;
        for (vi, cnt) in self.counts.iter().enumerate() {
            let vlen = self.vars[vi].len() as isize;
            let bound = values.get(vi).map_or(0, |v| v.len() as isize);
            size += (bound - vlen) * *cnt as isize;
        }
        let mut out = String::with_capacity(size.max(0) as usize);
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Var(vi) => out.push_str(values.get(*vi).copied().unwrap_or("")),
            }
        }
        out
    }

    /// Occurrence count of the variable at position `vi` in the set
    pub fn count(&self, vi: usize) -> usize {
        self.counts.get(vi).copied().unwrap_or(0)
    }

    /// The raw template string
    pub fn raw(&self) -> &str {
        &self.tpl
    }

    /// Parts as plain strings (literals verbatim, variables as tokens)
    pub fn part_strings(&self) -> Vec<String> {
        self.parts
            .iter()
            .map(|p| match p {
                Part::Literal(s) => s.clone(),
                Part::Var(vi) => self.vars[*vi].clone(),
            })
            .collect()
    }
}
