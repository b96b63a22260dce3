//! The parsed request handed to middleware and handlers.

use std::rc::Rc;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName};
use http::{Method, Version};

/// Query-string parameters, split on `&` and `=` in target order.
#[derive(Debug, Default, Clone)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Parses the query portion of a request target (everything after the
    /// first `?`). An absent query yields an empty set.
    #[must_use]
    pub fn parse(target: &str) -> Self {
        let Some((_, query)) = target.split_once('?') else {
            return Self::default();
        };
        let pairs = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_owned(), value.to_owned()),
                None => (pair.to_owned(), String::new()),
            })
            .collect();
        Self { pairs }
    }

    /// First value registered under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// An authenticated session attached to a connection, populated by the
/// mutual-TLS verification path from the client certificate's common name.
#[derive(Debug)]
pub struct UserSession {
    pub username: String,
}

/// One parsed HTTP request.
///
/// Owned by the connection for the duration of the request/response pair;
/// middleware sees it mutably, handlers by shared reference.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub version: Version,
    /// The raw request target, query string included.
    pub target: String,
    /// The target with the query string stripped.
    pub path: String,
    pub query: QueryParams,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub keep_alive: bool,
    /// Session established by mutual-TLS verification, if any.
    pub session: Option<Rc<UserSession>>,
    pub(crate) route_privileges: Option<Rc<[String]>>,
}

impl Request {
    #[must_use]
    pub fn new(
        method: Method,
        version: Version,
        target: String,
        headers: HeaderMap,
        body: Bytes,
        keep_alive: bool,
    ) -> Self {
        let path = match target.split_once('?') {
            Some((path, _)) => path.to_owned(),
            None => target.clone(),
        };
        let query = QueryParams::parse(&target);
        Self {
            method,
            version,
            target,
            path,
            query,
            headers,
            body,
            keep_alive,
            session: None,
            route_privileges: None,
        }
    }

    /// Header value as a string, or `None` when absent or not valid UTF-8.
    #[must_use]
    pub fn header(&self, name: impl HeaderLookup) -> Option<&str> {
        name.lookup(&self.headers)
    }

    /// HTTP version as `major * 10 + minor`.
    #[must_use]
    pub fn version_number(&self) -> u8 {
        match self.version {
            Version::HTTP_10 => 10,
            _ => 11,
        }
    }

    /// True when the request asks for a protocol switch
    /// (`Connection: upgrade` plus an `Upgrade` header).
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        let connection_upgrade = self
            .header(&header::CONNECTION)
            .is_some_and(|value| value.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
        connection_upgrade && self.headers.contains_key(header::UPGRADE)
    }

    /// True when the requested protocol switch is a websocket upgrade.
    #[must_use]
    pub fn is_websocket_upgrade(&self) -> bool {
        self.is_upgrade()
            && self
                .header(&header::UPGRADE)
                .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
    }

    /// Privileges required by the matched route, resolved before the
    /// middleware chain runs so an authorization middleware can
    /// short-circuit.
    #[must_use]
    pub fn required_privileges(&self) -> Option<&[String]> {
        self.route_privileges.as_deref()
    }

    /// True when the `Accept` header prefers an HTML rendering over raw
    /// JSON.
    #[must_use]
    pub fn prefers_html(&self) -> bool {
        self.header(&header::ACCEPT)
            .is_some_and(|accept| accept.contains("text/html"))
    }
}

/// Header lookup by `&str` name or by an `http::header` constant.
pub trait HeaderLookup {
    fn lookup<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str>;
}

impl HeaderLookup for &str {
    fn lookup<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers.get(*self).and_then(|value| value.to_str().ok())
    }
}

impl HeaderLookup for &HeaderName {
    fn lookup<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers.get(*self).and_then(|value| value.to_str().ok())
    }
}
