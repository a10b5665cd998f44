//! # Glob Matching
//!
//! Translates ownership globs into anchored regexes.
//!
//! | Glob  | Regex        | Meaning                                |
//! |-------|--------------|----------------------------------------|
//! | `**/` | `(?:.*/)?`   | any number of leading directories, or none |
//! | `/**` | `(?:/.*)?`   | (at the end) the directory and everything below |
//! | `**`  | `.*`         | anything, across separators            |
//! | `*`   | `[^/]*`      | anything within one path segment       |
//! | `?`   | `[^/]`       | one character within a segment         |
//!
//! Everything else matches literally. Paths are normalized before matching.

use regex::Regex;

use crate::state::io::normalize_path;

/// A compiled glob
#[derive(Debug, Clone)]
pub struct GlobPattern {
    pattern: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = normalize_path(pattern);
        let regex = Regex::new(&glob_to_regex(&pattern))?;
        Ok(Self { pattern, regex })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(&normalize_path(path))
    }
}

/// Translate a glob into an anchored regex source string
pub fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;

    while i < chars.len() {
        let rest = &chars[i..];
        if rest.starts_with(&['*', '*', '/']) {
            out.push_str("(?:.*/)?");
            i += 3;
        } else if rest.starts_with(&['/', '*', '*']) && rest.len() == 3 {
            out.push_str("(?:/.*)?");
            i += 3;
        } else if rest.starts_with(&['*', '*']) {
            out.push_str(".*");
            i += 2;
        } else if chars[i] == '*' {
            out.push_str("[^/]*");
            i += 1;
        } else if chars[i] == '?' {
            out.push_str("[^/]");
            i += 1;
        } else {
            out.push_str(&regex::escape(&chars[i].to_string()));
            i += 1;
        }
    }

    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(glob: &str, path: &str) -> bool {
        GlobPattern::new(glob).unwrap().matches(path)
    }

    #[test]
    fn test_translation_rules() {
        assert_eq!(glob_to_regex("**/a"), "^(?:.*/)?a$");
        assert_eq!(glob_to_regex("a/**"), "^a(?:/.*)?$");
        assert_eq!(glob_to_regex("a**b"), "^a.*b$");
        assert_eq!(glob_to_regex("*.ts"), "^[^/]*\\.ts$");
        assert_eq!(glob_to_regex("a?"), "^a[^/]$");
    }

    #[test]
    fn test_double_star_prefix_matches_zero_depth() {
        assert!(matches("**/*.d.ts", "index.d.ts"));
        assert!(matches("**/*.d.ts", "src/types/global.d.ts"));
        assert!(!matches("**/*.d.ts", "src/index.ts"));
    }

    #[test]
    fn test_trailing_double_star() {
        assert!(matches("src/api/**", "src/api"));
        assert!(matches("src/api/**", "src/api/users/get.ts"));
        assert!(!matches("src/api/**", "src/apix/users.ts"));
    }

    #[test]
    fn test_middle_double_star() {
        assert!(matches("src/**/test.ts", "src/test.ts"));
        assert!(matches("src/**/test.ts", "src/a/b/test.ts"));
        assert!(!matches("src/**/test.ts", "lib/a/test.ts"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        assert!(matches("src/*.ts", "src/main.ts"));
        assert!(!matches("src/*.ts", "src/nested/main.ts"));
    }

    #[test]
    fn test_question_mark() {
        assert!(matches("v?.json", "v1.json"));
        assert!(!matches("v?.json", "v10.json"));
        assert!(!matches("a?b", "a/b"));
    }

    #[test]
    fn test_literal_metacharacters_and_separators() {
        assert!(matches("src/(app)/page+.tsx", "src/(app)/page+.tsx"));
        assert!(matches("src/*.ts", ".\\src\\main.ts"));
        assert!(!matches("src/main.ts", "src/mainXts"));
    }
}
