//! URL merging
//!
//! Resolves a new, possibly relative, URL against the one a session last
//! used. This is deliberately lighter than RFC 3986 reference resolution:
//! fields present in the new URL overlay the current ones, relative paths
//! are taken from the current path's directory, and dot segments are left
//! alone.

/// URL split into the components the merge works on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlParts {
    pub scheme: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub path: Option<String>,
    pub query: Option<String>,
}

impl UrlParts {
    /// Parse a URL or URL fragment. Nothing here fails: unrecognised input
    /// ends up in `path`, empty input yields no components at all.
    pub fn parse(input: &str) -> Self {
        let mut parts = UrlParts::default();

        let input = input.trim();
        let input = input.split_once('#').map_or(input, |(before, _)| before);
        let rest = match input.split_once('?') {
            Some((before, query)) => {
                parts.query = non_empty(query);
                before
            }
            None => input,
        };

        let remainder = if let Some((scheme, after)) = split_scheme(rest) {
            parts.scheme = Some(scheme.to_string());
            Some(after)
        } else {
            rest.strip_prefix("//")
        };

        match remainder {
            Some(after_slashes) => {
                let (authority, path) = match after_slashes.find('/') {
                    Some(index) => after_slashes.split_at(index),
                    None => (after_slashes, ""),
                };
                parts.parse_authority(authority);
                parts.path = non_empty(path);
            }
            None => parts.path = non_empty(rest),
        }

        parts
    }

    fn parse_authority(&mut self, authority: &str) {
        let host_port = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                match userinfo.split_once(':') {
                    Some((user, password)) => {
                        self.user = Some(user.to_string());
                        self.password = Some(password.to_string());
                    }
                    None => self.user = Some(userinfo.to_string()),
                }
                host_port
            }
            None => authority,
        };

        let (host, port) = if host_port.starts_with('[') {
            // Bracketed IPv6 literal; the port can only follow the bracket
            match host_port.find(']') {
                Some(end) => {
                    let (host, tail) = host_port.split_at(end + 1);
                    (host, tail.strip_prefix(':'))
                }
                None => (host_port, None),
            }
        } else {
            match host_port.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (host_port, None),
            }
        };

        self.host = non_empty(host);
        self.port = port
            .filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
            .map(str::to_string);
    }

    /// Reassemble as `scheme://[user[:password]@]host[:port]path`.
    /// The query is never part of the result.
    pub fn assemble(&self) -> String {
        let mut url = String::new();

        if let Some(scheme) = &self.scheme {
            url.push_str(scheme);
            url.push_str("://");
        } else if self.host.is_some() {
            url.push_str("//");
        }

        if let Some(user) = &self.user {
            url.push_str(user);
            if let Some(password) = &self.password {
                url.push(':');
                url.push_str(password);
            }
            url.push('@');
        }

        if let Some(host) = &self.host {
            url.push_str(host);
        }

        if let Some(port) = &self.port {
            url.push(':');
            url.push_str(port);
        }

        if let Some(path) = &self.path {
            url.push_str(path);
        }

        url
    }
}

/// Result of merging two URLs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedUrl {
    /// Absolute URL without query string
    pub url: String,
    /// Query string carried by the new URL, if any
    pub query: Option<String>,
}

impl MergedUrl {
    /// Query string decoded into name/value pairs
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .as_deref()
            .map(super::params::decode)
            .unwrap_or_default()
    }
}

/// Merge `new_url` into `current_url`
pub fn merge(current_url: &str, new_url: &str) -> MergedUrl {
    let mut parts = UrlParts::parse(current_url);
    let mut new = UrlParts::parse(new_url);

    if let Some(new_path) = &new.path {
        let relative = !new_path.starts_with('/');
        let has_base = parts.path.is_some() || parts.host.is_some();
        if relative && new.host.is_none() && has_base {
            let base = directory(parts.path.as_deref().unwrap_or(""));
            new.path = Some(format!("{}/{}", base, new_path));
        }
    }

    // A new host invalidates the inherited port and path
    if new.host.is_some() {
        if new.port.is_none() {
            parts.port = None;
        }
        parts.path = None;
    }

    let UrlParts {
        scheme,
        user,
        password,
        host,
        port,
        path,
        query,
    } = new;

    overlay(&mut parts.scheme, scheme);
    overlay(&mut parts.user, user);
    overlay(&mut parts.password, password);
    overlay(&mut parts.host, host);
    overlay(&mut parts.port, port);
    overlay(&mut parts.path, path);

    MergedUrl {
        url: parts.assemble(),
        query,
    }
}

/// Resolve `new_url` against `current_url`, dropping any query string
pub fn resolve(current_url: &str, new_url: &str) -> String {
    merge(current_url, new_url).url
}

fn overlay(target: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *target = value;
    }
}

/// Directory part of a path. The root directory is the empty string so
/// joining with `/` never doubles the slash.
fn directory(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[..index],
        None => "",
    }
}

fn split_scheme(input: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = input.split_once("://")?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    let valid = first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some((scheme, rest))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_filename() {
        assert_eq!(resolve("http://host/a/b?x=1", "c"), "http://host/a/c");
    }

    #[test]
    fn test_resolve_absolute_override_drops_port() {
        assert_eq!(resolve("http://host:8080/a", "http://other"), "http://other");
    }

    #[test]
    fn test_resolve_new_host_takes_its_own_path() {
        assert_eq!(resolve("http://host/a/b", "//other/x"), "http://other/x");
        assert_eq!(
            resolve("https://host:8443/a/b", "https://other:9000"),
            "https://other:9000"
        );
        assert_eq!(resolve("http://host/a/b", "http://other/c"), "http://other/c");
    }

    #[test]
    fn test_resolve_root_directory_has_no_double_slash() {
        assert_eq!(resolve("http://host/a", "c"), "http://host/c");
        assert_eq!(resolve("http://host", "c"), "http://host/c");
    }

    #[test]
    fn test_resolve_keeps_trailing_directory() {
        assert_eq!(
            resolve("https://m.example.ru/irkutsk/kvartiry/sdam/", "?s=1"),
            "https://m.example.ru/irkutsk/kvartiry/sdam/"
        );
        assert_eq!(
            resolve("https://m.example.ru/irkutsk/", "moskva/list"),
            "https://m.example.ru/irkutsk/moskva/list"
        );
    }

    #[test]
    fn test_resolve_absolute_path_keeps_authority() {
        assert_eq!(
            resolve("https://user:pw@host:8443/a/b", "/z"),
            "https://user:pw@host:8443/z"
        );
    }

    #[test]
    fn test_resolve_new_host_with_explicit_port() {
        assert_eq!(
            resolve("http://host:8080/a", "http://other:9090/b"),
            "http://other:9090/b"
        );
    }

    #[test]
    fn test_resolve_scheme_relative() {
        assert_eq!(resolve("https://host/a", "//cdn.example/x.js"), "https://cdn.example/x.js");
    }

    #[test]
    fn test_resolve_from_empty_current() {
        assert_eq!(resolve("", "http://host/path"), "http://host/path");
        assert_eq!(resolve("http://host/path", ""), "http://host/path");
    }

    #[test]
    fn test_merge_extracts_query() {
        let merged = merge("http://host/a", "b?s=0&q=a+b");
        assert_eq!(merged.url, "http://host/b");
        assert_eq!(merged.query.as_deref(), Some("s=0&q=a+b"));
        assert_eq!(
            merged.query_pairs(),
            vec![
                ("s".to_string(), "0".to_string()),
                ("q".to_string(), "a b".to_string())
            ]
        );
    }

    #[test]
    fn test_query_is_not_inherited() {
        let merged = merge("http://host/a?x=1", "b");
        assert_eq!(merged.query, None);
    }

    #[test]
    fn test_parse_components() {
        let parts = UrlParts::parse("https://u:p@[::1]:8443/path/to?q=1#frag");
        assert_eq!(parts.scheme.as_deref(), Some("https"));
        assert_eq!(parts.user.as_deref(), Some("u"));
        assert_eq!(parts.password.as_deref(), Some("p"));
        assert_eq!(parts.host.as_deref(), Some("[::1]"));
        assert_eq!(parts.port.as_deref(), Some("8443"));
        assert_eq!(parts.path.as_deref(), Some("/path/to"));
        assert_eq!(parts.query.as_deref(), Some("q=1"));
        assert_eq!(parts.assemble(), "https://u:p@[::1]:8443/path/to");
    }

    #[test]
    fn test_parse_empty_input() {
        assert_eq!(UrlParts::parse(""), UrlParts::default());
    }
}
