use std::collections::HashMap;

use regex::Regex;

use crate::errors::Result;

const SLASH_SUFFIX: &str = "-slash";
const EMPTY_REPLACEMENT: &str = "empty";

/// Compile a route pattern with `:name` segments into an anchored regex,
/// collecting the parameter names in order. `/users/:id/orders/:oid`
/// becomes `^/users/([^/]+)/orders/([^/]+)$`.
pub fn translate_route_pattern(pattern: &str) -> Result<(Regex, Vec<String>)> {
    let param_re = Regex::new(r":([^/]+)")?;
    let mut param_names = Vec::new();

    let mut regex_pattern = String::with_capacity(pattern.len() + 8);
    regex_pattern.push('^');
    let mut last = 0;
    for captures in param_re.captures_iter(pattern) {
        let whole = captures.get(0).expect("capture 0 always present");
        regex_pattern.push_str(&regex::escape(&pattern[last..whole.start()]));
        regex_pattern.push_str("([^/]+)");
        param_names.push(captures[1].to_string());
        last = whole.end();
    }
    regex_pattern.push_str(&regex::escape(&pattern[last..]));
    regex_pattern.push('$');

    Ok((Regex::new(&regex_pattern)?, param_names))
}

/// Match `path` against a `:name` route pattern; on success return the
/// captured parameter map with one entry per placeholder.
pub fn match_route(pattern: &str, path: &str) -> Result<Option<HashMap<String, String>>> {
    let (regex, param_names) = translate_route_pattern(pattern)?;
    let Some(captures) = regex.captures(path) else {
        return Ok(None);
    };

    let mut params = HashMap::with_capacity(param_names.len());
    for (idx, name) in param_names.iter().enumerate() {
        if let Some(value) = captures.get(idx + 1) {
            params.insert(name.clone(), value.as_str().to_string());
        }
    }
    Ok(Some(params))
}

/// Encode an endpoint path as a slug usable inside admin routes.
///
/// Internal slashes become hyphens, other non-alphanumerics collapse to a
/// single hyphen, and a trailing slash is preserved as a `-slash` suffix.
/// The empty path maps to the sentinel `empty`.
pub fn path_to_slug(path: &str) -> String {
    if path.is_empty() {
        return EMPTY_REPLACEMENT.to_string();
    }

    let mut slug = path.strip_prefix('/').unwrap_or(path).to_string();
    let has_trailing_slash = slug.ends_with('/');
    if has_trailing_slash {
        slug.pop();
    }

    let replaced: String = slug
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();

    // Collapse hyphen runs and trim the edges.
    let mut collapsed = String::with_capacity(replaced.len());
    let mut prev_hyphen = false;
    for c in replaced.chars() {
        if c == '-' {
            if !prev_hyphen {
                collapsed.push('-');
            }
            prev_hyphen = true;
        } else {
            collapsed.push(c);
            prev_hyphen = false;
        }
    }
    let mut slug = collapsed.trim_matches('-').to_string();

    if has_trailing_slash {
        slug.push_str(SLASH_SUFFIX);
    }

    if slug.is_empty() {
        EMPTY_REPLACEMENT.to_string()
    } else {
        slug
    }
}

/// Inverse of [`path_to_slug`]: recover a lookup path from a slug.
pub fn slug_to_path(slug: &str) -> String {
    if slug == EMPTY_REPLACEMENT {
        return String::new();
    }

    let mut body = slug.to_string();
    let has_trailing_slash = body.ends_with(SLASH_SUFFIX);
    if has_trailing_slash {
        body.truncate(body.len() - SLASH_SUFFIX.len());
    }

    let mut path = String::with_capacity(body.len() + 2);
    path.push('/');
    path.push_str(&body.replace('-', "/"));
    if has_trailing_slash {
        path.push('/');
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_route_pattern() {
        let (regex, names) = translate_route_pattern("/users/:id/orders/:oid").unwrap();
        assert_eq!(regex.as_str(), "^/users/([^/]+)/orders/([^/]+)$");
        assert_eq!(names, vec!["id".to_string(), "oid".to_string()]);
    }

    #[test]
    fn test_match_route_extracts_exactly_the_placeholders() {
        let params = match_route("/users/:id/orders/:oid", "/users/42/orders/7")
            .unwrap()
            .unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
        assert_eq!(params.get("oid").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_match_route_rejects_extra_segments() {
        assert!(match_route("/users/:id", "/users/42/extra")
            .unwrap()
            .is_none());
        assert!(match_route("/users/:id", "/users/").unwrap().is_none());
    }

    #[test]
    fn test_static_pattern_matches_itself_only() {
        assert!(match_route("/health", "/health").unwrap().unwrap().is_empty());
        assert!(match_route("/health", "/healthz").unwrap().is_none());
    }

    #[test]
    fn test_path_slug_roundtrip() {
        assert_eq!(path_to_slug("/users/list"), "users-list");
        assert_eq!(slug_to_path("users-list"), "/users/list");

        assert_eq!(path_to_slug("/users/"), "users-slash");
        assert_eq!(slug_to_path("users-slash"), "/users/");

        assert_eq!(path_to_slug(""), "empty");
        assert_eq!(slug_to_path("empty"), "");
    }

    #[test]
    fn test_path_to_slug_collapses_specials() {
        assert_eq!(path_to_slug("/a b/c!!d"), "a-b-c-d");
    }
}
