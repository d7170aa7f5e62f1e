//! Glob-style key patterns
//!
//! Supports the pattern language used by store key scans:
//! - `*` matches any run of characters (including none)
//! - `?` matches exactly one character
//! - `[abc]`, `[a-z]`, `[^a-z]` match one character from (or not from) a set
//! - `\x` matches `x` literally

use regex::Regex;

use kvguard_common::{StoreError, StoreResult};

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> StoreResult<Self> {
        let translated = translate(pattern);
        let regex = Regex::new(&translated).map_err(|e| {
            StoreError::Command(format!("invalid key pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 8);
    out.push_str("(?s)^");

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                push_escaped(&mut out, chars[i]);
            }
            '[' => match find_class_end(&chars, i + 1) {
                Some(end) => {
                    push_class(&mut out, &chars[i + 1..end]);
                    i = end;
                }
                // Unterminated class: treat the bracket literally
                None => push_escaped(&mut out, '['),
            },
            c => push_escaped(&mut out, c),
        }
        i += 1;
    }

    out.push('$');
    out
}

/// Index of the `]` closing a class that starts at `start`.
fn find_class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start;
    if i < chars.len() && chars[i] == '^' {
        i += 1;
    }
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            ']' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn push_class(out: &mut String, body: &[char]) {
    if body.is_empty() || (body.len() == 1 && body[0] == '^') {
        // `[]` and `[^]` never match anything
        out.push_str("[^\\s\\S]");
        return;
    }

    out.push('[');
    let mut i = 0;
    if body[0] == '^' {
        out.push('^');
        i = 1;
    }
    let first = i;
    while i < body.len() {
        let c = body[i];
        if c == '\\' && i + 1 < body.len() {
            i += 1;
            push_escaped(out, body[i]);
        } else if c == '-' && i > first && i + 1 < body.len() {
            out.push('-');
        } else {
            push_escaped(out, c);
        }
        i += 1;
    }
    out.push(']');
}

fn push_escaped(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, key: &str) -> bool {
        GlobPattern::new(pattern).unwrap().matches(key)
    }

    #[test]
    fn test_star() {
        assert!(matches("k*", "k"));
        assert!(matches("k*", "key"));
        assert!(matches("k*", "k:1:2"));
        assert!(!matches("k*", "ak"));
        assert!(matches("*", ""));
        assert!(matches("user:*:name", "user:42:name"));
        assert!(!matches("user:*:name", "user:42:email"));
    }

    #[test]
    fn test_question_mark() {
        assert!(matches("h?llo", "hello"));
        assert!(matches("h?llo", "hallo"));
        assert!(!matches("h?llo", "hllo"));
        assert!(!matches("h?llo", "heello"));
    }

    #[test]
    fn test_classes() {
        assert!(matches("h[ae]llo", "hello"));
        assert!(matches("h[ae]llo", "hallo"));
        assert!(!matches("h[ae]llo", "hillo"));
        assert!(matches("h[^e]llo", "hallo"));
        assert!(!matches("h[^e]llo", "hello"));
        assert!(matches("h[a-c]llo", "hbllo"));
        assert!(!matches("h[a-c]llo", "hdllo"));
        assert!(matches("[-a]", "-"));
        assert!(!matches("[]", "a"));
    }

    #[test]
    fn test_escapes_and_regex_metacharacters() {
        assert!(matches("a\\*b", "a*b"));
        assert!(!matches("a\\*b", "axb"));
        assert!(matches("a.b", "a.b"));
        assert!(!matches("a.b", "axb"));
        assert!(matches("(x)+", "(x)+"));
        assert!(matches("price$", "price$"));
        assert!(matches("<tag>", "<tag>"));
    }

    #[test]
    fn test_unterminated_class_is_literal() {
        assert!(matches("a[b", "a[b"));
        assert!(!matches("a[b", "ab"));
    }

    #[test]
    fn test_newlines_in_keys() {
        assert!(matches("a*", "a\nb"));
        assert!(matches("a?b", "a\nb"));
    }

    #[test]
    fn test_as_str() {
        let pattern = GlobPattern::new("k*").unwrap();
        assert_eq!(pattern.as_str(), "k*");
    }
}
