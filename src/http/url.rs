//! URL decoding and path normalization.

use percent_encoding::percent_decode_str;
use thiserror::Error;

/// The decoded URI was not valid UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("decoded URL is not valid UTF-8")]
pub struct InvalidEncoding;

/// Percent-decodes `s`. With `form` set, `+` also decodes to a space, as in
/// `application/x-www-form-urlencoded` data; in paths it stays literal.
///
/// Malformed escapes such as `%zz` are left untouched.
///
/// ```
/// use wharf::http::url::url_decode;
///
/// assert_eq!(url_decode("/a%20b+c", false).unwrap(), "/a b+c");
/// assert_eq!(url_decode("a%20b+c", true).unwrap(), "a b c");
/// assert!(url_decode("%ff", false).is_err());
/// ```
pub fn url_decode(s: &str, form: bool) -> Result<String, InvalidEncoding> {
    let spaced;
    let input = if form {
        spaced = s.replace('+', " ");
        spaced.as_str()
    } else {
        s
    };
    percent_decode_str(input)
        .decode_utf8()
        .map(|c| c.into_owned())
        .map_err(|_| InvalidEncoding)
}

/// Normalizes a decoded path: `\` becomes `/`, repeated slashes collapse,
/// `.` segments vanish and `..` pops its parent without ever climbing above
/// the root. A trailing slash survives.
///
/// ```
/// use wharf::http::url::remove_dot_segments;
///
/// assert_eq!(remove_dot_segments("/a/./b/../c"), "/a/c");
/// assert_eq!(remove_dot_segments("/../../etc/passwd"), "/etc/passwd");
/// assert_eq!(remove_dot_segments("//dir\\sub/"), "/dir/sub/");
/// ```
pub fn remove_dot_segments(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut stack: Vec<&str> = Vec::new();
    let mut trailing_slash = false;

    for segment in path.split('/') {
        trailing_slash = false;
        match segment {
            "" => trailing_slash = true,
            "." => trailing_slash = true,
            ".." => {
                stack.pop();
                trailing_slash = true;
            }
            other => stack.push(other),
        }
    }

    let mut out = String::with_capacity(path.len() + 1);
    for segment in &stack {
        out.push('/');
        out.push_str(segment);
    }
    if trailing_slash || out.is_empty() {
        out.push('/');
    }
    out
}

/// Splits a request target at the first `?`.
pub fn split_query(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// Parses `a=1&b=two` into decoded pairs. Keys without `=` get an empty
/// value; undecodable bytes are replaced rather than failing the request.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_lossy(key), decode_lossy(value))
        })
        .collect()
}

fn decode_lossy(s: &str) -> String {
    percent_decode_str(&s.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_is_literal_in_paths() {
        assert_eq!(url_decode("/c++", false).unwrap(), "/c++");
        assert_eq!(url_decode("c%2B%2B", true).unwrap(), "c++");
    }

    #[test]
    fn form_decoding_turns_plus_into_space() {
        assert_eq!(url_decode("a+b%21", true).unwrap(), "a b!");
        assert_eq!(url_decode("a+b", false).unwrap(), "a+b");
        assert!(url_decode("x+%ff", true).is_err());
    }

    #[test]
    fn malformed_escapes_pass_through() {
        assert_eq!(url_decode("/100%", false).unwrap(), "/100%");
        assert_eq!(url_decode("/%zz", false).unwrap(), "/%zz");
    }

    #[test]
    fn encoded_traversal_is_neutralized_after_decode() {
        let decoded = url_decode("/%2e%2e/%2e%2e/secret", false).unwrap();
        assert_eq!(remove_dot_segments(&decoded), "/secret");
    }

    #[test]
    fn dot_segment_edge_cases() {
        assert_eq!(remove_dot_segments(""), "/");
        assert_eq!(remove_dot_segments("/"), "/");
        assert_eq!(remove_dot_segments("/a/b/.."), "/a/");
        assert_eq!(remove_dot_segments("/a/."), "/a/");
        assert_eq!(remove_dot_segments("/a..b/c"), "/a..b/c");
        assert_eq!(remove_dot_segments("/.hidden"), "/.hidden");
    }

    #[test]
    fn query_splitting() {
        assert_eq!(split_query("/p?x=1?y"), ("/p", Some("x=1?y")));
        assert_eq!(split_query("/p"), ("/p", None));
    }

    #[test]
    fn query_pairs() {
        let pairs = parse_query("a=1&b=hello+world&flag&&c=%41");
        assert_eq!(
            pairs,
            vec![
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "hello world".to_owned()),
                ("flag".to_owned(), String::new()),
                ("c".to_owned(), "A".to_owned()),
            ]
        );
    }
}
