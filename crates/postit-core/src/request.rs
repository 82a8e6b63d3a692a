use reqwest::header::HeaderMap;
use reqwest::Method;
use url::Url;

use crate::error::BuildError;
use crate::record::Record;

/// A fully resolved outbound call.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// Methods the runner knows how to send. Case-insensitive.
pub fn parse_method(raw: &str) -> Result<Method, BuildError> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "HEAD" => Ok(Method::HEAD),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        _ => Err(BuildError::UnsupportedMethod(raw.to_string())),
    }
}

fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Substitute every `{column}` token in `template` with the record's value,
/// scanning once left to right. Substituted text is never rescanned. A token
/// naming a column the record doesn't have is an error.
pub fn resolve_template(template: &str, record: &Record) -> Result<String, BuildError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(['{', '}']) {
            Some(close) if after.as_bytes()[close] == b'}' && close > 0 => {
                let name = &after[..close];
                match record.get(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(BuildError::UnresolvedToken(name.to_string())),
                }
                rest = &after[close + 1..];
            }
            _ => {
                // not a token, keep the brace literally
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

impl Request {
    /// Build the request for one row. Run-level `defaults` are appended after
    /// any per-row headers, so duplicate keys keep both values.
    pub fn build(
        record: &Record,
        method: &str,
        template: &str,
        defaults: &HeaderMap,
    ) -> Result<Self, BuildError> {
        let method = parse_method(method)?;
        let raw = resolve_template(template, record)?;
        let url = Url::parse(&raw).map_err(|e| BuildError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in defaults {
            headers.append(name.clone(), value.clone());
        }

        let body = if carries_body(&method) {
            record.body().map(<[u8]>::to_vec)
        } else {
            None
        };

        Ok(Self {
            method,
            url,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_headers;
    use std::sync::Arc;

    fn record(pairs: &[(&str, &str)]) -> Record {
        let headers: Arc<[String]> = pairs.iter().map(|(k, _)| k.to_string()).collect();
        let values = pairs.iter().map(|(_, v)| v.to_string()).collect();
        Record::new(headers, values, "request_body")
    }

    #[test]
    fn test_resolve_every_occurrence() {
        let r = record(&[("id", "42"), ("kind", "user")]);
        let url = resolve_template("http://host/{kind}/{id}?again={id}", &r).unwrap();
        assert_eq!(url, "http://host/user/42?again=42");
    }

    #[test]
    fn test_resolve_is_not_recursive() {
        let r = record(&[("a", "{b}"), ("b", "x")]);
        assert_eq!(resolve_template("http://h/{a}", &r).unwrap(), "http://h/{b}");
    }

    #[test]
    fn test_resolve_is_pure() {
        let r = record(&[("id", "1")]);
        let before = r.clone();
        let first = resolve_template("http://h/{id}", &r).unwrap();
        let second = resolve_template("http://h/{id}", &r).unwrap();
        assert_eq!(first, second);
        assert_eq!(r, before);
    }

    #[test]
    fn test_unresolved_token_is_row_error() {
        let r = record(&[("id", "1")]);
        let err = resolve_template("http://h/{missing}", &r).unwrap_err();
        assert_eq!(err, BuildError::UnresolvedToken("missing".into()));
    }

    #[test]
    fn test_stray_braces_are_literal() {
        let r = record(&[("id", "1")]);
        assert_eq!(resolve_template("http://h/{}/{id}", &r).unwrap(), "http://h/{}/1");
        assert_eq!(resolve_template("http://h/{{id}", &r).unwrap(), "http://h/{1");
    }

    #[test]
    fn test_build_post_with_body_and_defaults() {
        let r = record(&[("id", "1"), ("request_body", "{}")]);
        let defaults = parse_headers(&["Accept: a, b".to_string()]).unwrap();
        let req = Request::build(&r, "post", "http://host/post/{id}", &defaults).unwrap();

        assert_eq!(req.method, Method::POST);
        assert_eq!(req.url.as_str(), "http://host/post/1");
        assert_eq!(req.body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(req.headers.get_all("accept").iter().count(), 2);
    }

    #[test]
    fn test_build_get_drops_body() {
        let r = record(&[("id", "1"), ("request_body", "{}")]);
        let req = Request::build(&r, "GET", "http://host/get/{id}", &HeaderMap::new()).unwrap();
        assert!(req.body.is_none());
    }

    #[test]
    fn test_build_invalid_url() {
        let r = record(&[("id", "1")]);
        let err = Request::build(&r, "GET", "not a url/{id}", &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, BuildError::InvalidUrl { .. }));
    }

    #[test]
    fn test_build_unsupported_method() {
        let r = record(&[("id", "1")]);
        let err = Request::build(&r, "TRACE", "http://h/{id}", &HeaderMap::new()).unwrap_err();
        assert_eq!(err, BuildError::UnsupportedMethod("TRACE".into()));
    }
}
