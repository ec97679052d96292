//! Glob-style key patterns: `*` matches any run of characters, `?` exactly one.
//! Every other character is literal.

use regex::{Regex, RegexBuilder};

use crate::error::{CacheError, Result};

/// A compiled key pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(CacheError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".into(),
            });
        }

        let mut expr = String::with_capacity(pattern.len() * 2 + 2);
        expr.push('^');
        let mut buf = [0u8; 4];
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut buf))),
            }
        }
        expr.push('$');

        let regex = RegexBuilder::new(&expr)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| CacheError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The same pattern in Redis `SCAN MATCH` syntax.
    ///
    /// Redis also understands `[...]` classes and backslash escapes, which are
    /// literal here, so those characters are escaped.
    pub fn to_redis_pattern(&self) -> String {
        let mut out = String::with_capacity(self.source.len());
        for ch in self.source.chars() {
            if matches!(ch, '[' | ']' | '\\') {
                out.push('\\');
            }
            out.push(ch);
        }
        out
    }
}

impl std::fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}
