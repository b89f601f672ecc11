//! Path glob patterns and ordered include/exclude rule sets
//!
//! Patterns are matched against `/`-separated relative paths:
//!
//! - `*` matches any run of characters except `/`
//! - `?` matches one character except `/`
//! - `**` matches across `/`; `**/` also matches zero directories
//! - `[abc]`, `[a-z]`, `[!abc]` match one character (never `/`)
//! - `{a,b}` matches either alternative
//! - `\x` matches `x` literally
//!
//! A [`RuleSet`] is an ordered list of patterns where a leading `!` turns the
//! pattern into an exclusion. Rules are applied in order, so a later include
//! can re-add a path an earlier exclude removed.

use crate::error::{CommandError, Result};
use regex::Regex;

/// A compiled glob pattern
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self> {
        let normalized = pattern.strip_prefix("./").unwrap_or(pattern);
        let invalid = |message: String| CommandError::InvalidGlob {
            pattern: pattern.to_string(),
            message,
        };

        let body = translate(normalized).map_err(invalid)?;
        let regex = Regex::new(&format!("^{}$", body)).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

fn translate(pattern: &str) -> std::result::Result<String, String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => {
                let start = i;
                while i < chars.len() && chars[i] == '*' {
                    i += 1;
                }
                if i - start == 1 {
                    out.push_str("[^/]*");
                } else if i < chars.len() && chars[i] == '/' {
                    i += 1;
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
                continue;
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                let (class, next) = translate_class(&chars, i)?;
                out.push_str(&class);
                i = next;
                continue;
            }
            '{' => {
                let close = matching_brace(&chars, i)
                    .ok_or_else(|| format!("unclosed '{{' at offset {}", i))?;
                let alternatives = split_alternatives(&chars[i + 1..close]);
                let translated = alternatives
                    .iter()
                    .map(|alt| translate(alt))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                out.push_str("(?:");
                out.push_str(&translated.join("|"));
                out.push(')');
                i = close + 1;
                continue;
            }
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| "trailing '\\'".to_string())?;
                out.push_str(&regex::escape(&escaped.to_string()));
                i += 2;
                continue;
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    Ok(out)
}

/// Translate a `[...]` class starting at `start`; returns the regex and the index after `]`
fn translate_class(chars: &[char], start: usize) -> std::result::Result<(String, usize), String> {
    let mut i = start + 1;
    let negated = matches!(chars.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    let mut body = String::new();
    let mut first = true;
    loop {
        let c = *chars
            .get(i)
            .ok_or_else(|| format!("unclosed '[' at offset {}", start))?;
        if c == ']' && !first {
            break;
        }
        first = false;
        if matches!(c, '\\' | '[' | ']' | '^' | '&' | '~') {
            body.push('\\');
        }
        body.push(c);
        i += 1;
    }

    if body.is_empty() {
        return Err(format!("empty character class at offset {}", start));
    }

    let class = if negated {
        format!("[^/{}]", body)
    } else {
        format!("[{}&&[^/]]", body)
    };
    Ok((class, i + 1))
}

fn matching_brace(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn split_alternatives(chars: &[char]) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.get(i + 1) {
                    current.push(*next);
                    i += 1;
                }
            }
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
        i += 1;
    }
    parts.push(current);
    parts
}

#[derive(Debug, Clone)]
struct Rule {
    include: bool,
    glob: Glob,
}

/// Ordered include/exclude patterns
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let rules = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                match p.strip_prefix('!') {
                    Some(rest) => Ok(Rule {
                        include: false,
                        glob: Glob::new(rest)?,
                    }),
                    None => Ok(Rule {
                        include: true,
                        glob: Glob::new(p)?,
                    }),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `path` survives the rules applied in order
    pub fn selects(&self, path: &str) -> bool {
        let mut included = false;
        for rule in &self.rules {
            if rule.include != included && rule.glob.is_match(path) {
                included = rule.include;
            }
        }
        included
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        Glob::new(pattern).unwrap().is_match(path)
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        assert!(matches("*.txt", "a.txt"));
        assert!(!matches("*.txt", "src/a.txt"));
        assert!(matches("src/*", "src/b.txt"));
        assert!(!matches("src/*", "src/nested/b.txt"));
    }

    #[test]
    fn test_double_star_crosses_segments() {
        assert!(matches("src/**", "src/b.txt"));
        assert!(matches("src/**", "src/deep/er/c.rs"));
        assert!(!matches("src/**", "lib/b.txt"));
        assert!(matches("**secret*", "src/secret.txt"));
        assert!(matches("**secret*", "secret"));
        assert!(!matches("**secret*", "src/secret/inner.txt"));
    }

    #[test]
    fn test_double_star_slash_matches_zero_dirs() {
        assert!(matches("**/*.log", "run.log"));
        assert!(matches("**/*.log", "var/log/run.log"));
        assert!(matches("a/**/b", "a/b"));
        assert!(matches("a/**/b", "a/x/y/b"));
    }

    #[test]
    fn test_question_mark_and_classes() {
        assert!(matches("file?.txt", "file1.txt"));
        assert!(!matches("file?.txt", "file/.txt"));
        assert!(matches("[ab].txt", "a.txt"));
        assert!(!matches("[ab].txt", "c.txt"));
        assert!(matches("[!ab].txt", "c.txt"));
        assert!(!matches("[!ab].txt", "a.txt"));
        assert!(matches("v[0-9]", "v7"));
        assert!(!matches("x[!a]y", "x/y"));
    }

    #[test]
    fn test_alternation_and_escape() {
        assert!(matches("*.{rs,toml}", "Cargo.toml"));
        assert!(matches("*.{rs,toml}", "main.rs"));
        assert!(!matches("*.{rs,toml}", "main.go"));
        assert!(matches("\\*.txt", "*.txt"));
        assert!(!matches("\\*.txt", "a.txt"));
        assert!(matches("a+b(1).txt", "a+b(1).txt"));
    }

    #[test]
    fn test_leading_dot_slash_is_ignored() {
        assert!(matches("./out/*.bin", "out/app.bin"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(
            Glob::new("[abc"),
            Err(CommandError::InvalidGlob { .. })
        ));
        assert!(Glob::new("{a,b").is_err());
        assert!(Glob::new("abc\\").is_err());
    }

    #[test]
    fn test_rule_set_order() {
        let rules = RuleSet::parse(&["src/**", "!**secret*"]).unwrap();
        assert!(rules.selects("src/b.txt"));
        assert!(!rules.selects("src/secret.txt"));
        assert!(!rules.selects("a.txt"));

        // A later include re-adds what an exclude removed
        let rules = RuleSet::parse(&["**", "!*.log", "keep.log"]).unwrap();
        assert!(rules.selects("keep.log"));
        assert!(!rules.selects("drop.log"));
        assert!(rules.selects("a.txt"));
    }

    #[test]
    fn test_exclude_only_selects_nothing() {
        let rules = RuleSet::parse(&["!*.txt"]).unwrap();
        assert!(!rules.selects("a.md"));
        assert!(RuleSet::parse::<&str>(&[]).unwrap().is_empty());
    }
}
