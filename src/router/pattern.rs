//! URI glob patterns.
//!
//! | Token | Matches |
//! |-------|---------|
//! | `?`   | any single character |
//! | `*`   | any run of characters except `/` |
//! | `**`  | any run of characters |
//! | `$`   | end of input |
//! | `a\|b` | either alternative, tried left to right |
//!
//! Everything else compares ASCII case-insensitively. A pattern without `$`
//! is a prefix match: `/api` matches the first four bytes of `/api/users`.

/// Matches `pattern` against the start of `s`.
///
/// Returns the number of bytes of `s` consumed, or `None` when the pattern
/// does not match. Wildcards grab as much as they can and give back one
/// byte at a time until the rest of the pattern matches.
///
/// ```
/// use wharf::router::pattern::match_prefix;
///
/// assert_eq!(match_prefix("/api", "/api/users"), Some(4));
/// assert_eq!(match_prefix("**.cgi$", "/bin/run.cgi"), Some(12));
/// assert_eq!(match_prefix("**.cgi$", "/bin/run.cgi.txt"), None);
/// assert_eq!(match_prefix("/x|/api/*", "/api/users"), Some(10));
/// ```
pub fn match_prefix(pattern: &str, s: &str) -> Option<usize> {
    match_bytes(pattern.as_bytes(), s.as_bytes())
}

/// `true` when `pattern` matches a non-empty prefix of `s`.
pub fn matches(pattern: &str, s: &str) -> bool {
    match_prefix(pattern, s).is_some_and(|n| n > 0)
}

/// `true` when `pattern` uses any of `?`, `*`, `$` or `|`. Registrations
/// without one are literal URIs and only match exactly or on a `/`
/// boundary.
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['?', '*', '$', '|'])
}

fn match_bytes(pattern: &[u8], s: &[u8]) -> Option<usize> {
    if let Some(bar) = pattern.iter().position(|&b| b == b'|') {
        return match match_bytes(&pattern[..bar], s) {
            Some(n) if n > 0 => Some(n),
            _ => match_bytes(&pattern[bar + 1..], s),
        };
    }

    let mut i = 0;
    let mut j = 0;
    while i < pattern.len() {
        match pattern[i] {
            b'?' if j < s.len() => {}
            b'$' => return (j == s.len()).then_some(j),
            b'*' => {
                i += 1;
                let mut len = if pattern.get(i) == Some(&b'*') {
                    i += 1;
                    s.len() - j
                } else {
                    s[j..].iter().take_while(|&&b| b != b'/').count()
                };
                if i == pattern.len() {
                    return Some(j + len);
                }
                loop {
                    if let Some(rest) = match_bytes(&pattern[i..], &s[j + len..]) {
                        return Some(j + len + rest);
                    }
                    if len == 0 {
                        return None;
                    }
                    len -= 1;
                }
            }
            c => {
                if s.get(j).is_none_or(|b| !b.eq_ignore_ascii_case(&c)) {
                    return None;
                }
            }
        }
        i += 1;
        j += 1;
    }
    Some(j)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_prefix() {
        assert_eq!(match_prefix("/foo", "/foo/bar"), Some(4));
        assert_eq!(match_prefix("/foo", "/fo"), None);
        assert_eq!(match_prefix("/FOO", "/foo"), Some(4));
    }

    #[test]
    fn question_mark_needs_a_byte() {
        assert_eq!(match_prefix("/a?c", "/abc"), Some(4));
        assert_eq!(match_prefix("/ab?", "/ab"), None);
    }

    #[test]
    fn single_star_stops_at_slash() {
        assert_eq!(match_prefix("/img/*", "/img/a/b.png"), Some(6));
        assert_eq!(match_prefix("/img/*.png", "/img/logo.png"), Some(13));
        assert_eq!(match_prefix("/img/*.png$", "/img/a/b.png"), None);
    }

    #[test]
    fn double_star_crosses_slashes() {
        assert_eq!(match_prefix("/img/**.png$", "/img/a/b.png"), Some(12));
        assert_eq!(match_prefix("**", "/anything/at/all"), Some(16));
    }

    #[test]
    fn star_backtracks_from_longest() {
        // Greedy `*` must give back bytes so `.x` can match the last dot.
        assert_eq!(match_prefix("*.x", "a.x.x"), Some(5));
        assert_eq!(match_prefix("**.php$|**.cgi$", "/t/run.cgi"), Some(10));
    }

    #[test]
    fn dollar_anchors() {
        assert_eq!(match_prefix("/exact$", "/exact"), Some(6));
        assert_eq!(match_prefix("/exact$", "/exact/more"), None);
    }

    #[test]
    fn alternatives_need_nonempty_match() {
        // An empty first alternative never wins.
        assert_eq!(match_prefix("$|/b", "/b"), Some(2));
        assert!(matches("/nope|/yes", "/yes/please"));
        assert!(!matches("/nope|/also-no", "/yes"));
    }

    #[test]
    fn glob_detection() {
        assert!(is_glob("/api/**"));
        assert!(is_glob("/exact$"));
        assert!(is_glob("/a|/b"));
        assert!(is_glob("/v?"));
        assert!(!is_glob("/static"));
    }

    #[test]
    fn hidden_file_style_patterns() {
        assert!(matches("**.htpasswd$", "/secret/.htpasswd"));
        assert!(matches("**/.*", "/dir/.env"));
        assert!(!matches("**.htpasswd$", "/secret/htpasswd.txt"));
    }
}
