//! Shell-style glob matching for output specifications.
//!
//! `*` matches any run of characters, `?` exactly one, and every other
//! character matches itself. Patterns are anchored at the end but open at the
//! start, so `*.txt` matches both `a.txt` and `dir/a.txt`.

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    pattern: String,
    regex: Regex,
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&glob_to_regex(pattern)).map_err(|e| Error::InvalidGlob {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Translate a glob into an end-anchored regular expression.
pub fn glob_to_regex(pattern: &str) -> String {
    let mut output = String::with_capacity(pattern.len() + 10);
    // Inputs may arrive with or without a leading directory, so the start
    // is left open.
    output.push_str("^.*");
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => output.push_str(".*"),
            '?' => output.push('.'),
            _ => output.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    output.push('$');
    output
}

/// Compiles each distinct pattern once and hands out the shared matcher.
#[derive(Debug, Default, Clone)]
pub struct GlobCache {
    compiled: Arc<Mutex<HashMap<String, GlobMatcher>>>,
}

impl GlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pattern: &str) -> Result<GlobMatcher> {
        let mut compiled = self
            .compiled
            .lock()
            .map_err(|_| Error::Internal("glob cache lock poisoned".to_string()))?;
        if let Some(matcher) = compiled.get(pattern) {
            return Ok(matcher.clone());
        }
        let matcher = GlobMatcher::new(pattern)?;
        compiled.insert(pattern.to_string(), matcher.clone());
        Ok(matcher)
    }

    pub fn len(&self) -> usize {
        self.compiled.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_with_and_without_directory() {
        let m = GlobMatcher::new("*.txt").unwrap();
        assert!(m.is_match("a.txt"));
        assert!(m.is_match("dir/a.txt"));
        assert!(!m.is_match("a.txt.gz"));
    }

    #[test]
    fn test_question_mark_is_exactly_one_char() {
        let m = GlobMatcher::new("a?c").unwrap();
        assert!(m.is_match("abc"));
        assert!(!m.is_match("ac"));
        assert!(!m.is_match("abbc"));
    }

    #[test]
    fn test_dot_is_literal() {
        let m = GlobMatcher::new("out.bam").unwrap();
        assert!(m.is_match("out.bam"));
        assert!(!m.is_match("outxbam"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let m = GlobMatcher::new("sample(1)+[a].vcf").unwrap();
        assert!(m.is_match("sample(1)+[a].vcf"));
        assert!(!m.is_match("sample1a.vcf"));
    }

    #[test]
    fn test_cache_compiles_once() {
        let cache = GlobCache::new();
        cache.get("*.bam").unwrap();
        cache.get("*.bam").unwrap();
        cache.get("*.bai").unwrap();
        assert_eq!(cache.len(), 2);
    }
}
