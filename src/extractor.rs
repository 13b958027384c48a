//! Request field extraction for the supported calling conventions.
//!
//! Two conventions are recognised:
//!
//! - [`Convention::Default`]: `addr`, `secret`, `domain` query parameters
//!   (`/update`, `/delete`).
//! - [`Convention::Legacy`]: DynDNS-compatible `myip`, `hostname` and
//!   `password`, where the password may also arrive via HTTP Basic-Auth
//!   (`/nic/update`, `/v2/update`, `/v3/update`).
//!
//! Both share `zone`, `ddnskeyname`, `type`, `value` and `action`.

use crate::error::{DdnsError, Result};
use crate::names::{NameResolver, ResolvedName};
use axum::extract::Query;
use axum::http::{header, HeaderMap, HeaderValue, Method, Uri};
use base64::Engine;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Requested change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Update => f.write_str("UPDATE"),
            Action::Delete => f.write_str("DELETE"),
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(format!("Unsupported action: {}", other)),
        }
    }
}

/// The parts of an HTTP request the pipeline looks at.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    method: Method,
    query: HashMap<String, String>,
    headers: HeaderMap,
    peer: Option<SocketAddr>,
    route_action: Action,
}

impl UpdateRequest {
    pub fn new(
        method: Method,
        query: HashMap<String, String>,
        headers: HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            method,
            query,
            headers,
            peer,
            route_action: Action::Update,
        }
    }

    /// Build from a method and a path-and-query string.
    pub fn from_uri(method: Method, uri: &str) -> Result<Self> {
        let uri: Uri = uri
            .parse()
            .map_err(|e| DdnsError::Serialization(format!("Invalid URI {}: {}", uri, e)))?;
        let Query(query) = Query::<HashMap<String, String>>::try_from_uri(&uri)
            .map_err(|e| DdnsError::Serialization(e.to_string()))?;
        Ok(Self::new(method, query, HeaderMap::new(), None))
    }

    /// Action implied by the route when neither `action` nor the method say otherwise.
    pub fn with_route_action(mut self, action: Action) -> Self {
        self.route_action = action;
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Raw query parameter, empty string when absent.
    pub fn param(&self, key: &str) -> &str {
        self.query.get(key).map(String::as_str).unwrap_or("")
    }

    /// Non-empty query parameter.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        Some(self.param(key)).filter(|v| !v.is_empty())
    }

    /// Password from an `Authorization: Basic` header.
    pub fn basic_auth_password(&self) -> Option<String> {
        let value = self.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let credentials = String::from_utf8(decoded).ok()?;
        let (_user, password) = credentials.split_once(':')?;
        Some(password.to_string())
    }

    /// All query values, for control character checks.
    pub(crate) fn values(&self) -> impl Iterator<Item = &str> {
        self.query.values().map(String::as_str)
    }
}

/// Calling convention, chosen by route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    Default,
    Legacy,
}

impl Convention {
    /// Comma-separated address list.
    pub fn address<'r>(&self, req: &'r UpdateRequest) -> &'r str {
        match self {
            Convention::Default => req.param("addr"),
            Convention::Legacy => req.param("myip"),
        }
    }

    /// Credential. Legacy clients may use Basic-Auth, which wins when non-empty.
    pub fn secret(&self, req: &UpdateRequest) -> String {
        match self {
            Convention::Default => req.param("secret").to_string(),
            Convention::Legacy => req
                .basic_auth_password()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| req.param("password").to_string()),
        }
    }

    /// Comma-separated domain list.
    pub fn domain<'r>(&self, req: &'r UpdateRequest) -> &'r str {
        match self {
            Convention::Default => req.param("domain"),
            Convention::Legacy => req.param("hostname"),
        }
    }

    pub fn zone<'r>(&self, req: &'r UpdateRequest) -> Option<&'r str> {
        req.non_empty("zone")
    }

    pub fn ddns_key_name<'r>(&self, req: &'r UpdateRequest) -> Option<&'r str> {
        req.non_empty("ddnskeyname")
    }

    /// Explicit record type.
    pub fn record_type<'r>(&self, req: &'r UpdateRequest) -> Option<&'r str> {
        req.non_empty("type")
    }

    /// Explicit record value for non-address records.
    pub fn value<'r>(&self, req: &'r UpdateRequest) -> Option<&'r str> {
        req.non_empty("value")
    }

    /// `action` parameter, then the `DELETE` method, then the route default.
    pub fn action(&self, req: &UpdateRequest) -> std::result::Result<Action, String> {
        if let Some(action) = req.non_empty("action") {
            return action.parse();
        }
        if *req.method() == Method::DELETE {
            return Ok(Action::Delete);
        }
        Ok(req.route_action)
    }

    /// Zone, record name, and key name for one domain of this request.
    pub fn resolve(&self, req: &UpdateRequest, domain: &str, default_zone: &str) -> ResolvedName {
        NameResolver::new(default_zone).resolve(domain, self.zone(req), self.ddns_key_name(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(uri: &str) -> UpdateRequest {
        UpdateRequest::from_uri(Method::GET, uri).unwrap()
    }

    fn basic(user_pass: &str) -> HeaderValue {
        let encoded = base64::engine::general_purpose::STANDARD.encode(user_pass);
        HeaderValue::from_str(&format!("Basic {}", encoded)).unwrap()
    }

    #[test]
    fn test_default_convention_fields() {
        let req = get("/update?secret=changeme&domain=foo,bar&addr=1.2.3.4&zone=example.org");
        let c = Convention::Default;
        assert_eq!(c.secret(&req), "changeme");
        assert_eq!(c.domain(&req), "foo,bar");
        assert_eq!(c.address(&req), "1.2.3.4");
        assert_eq!(c.zone(&req), Some("example.org"));
        assert_eq!(c.ddns_key_name(&req), None);
    }

    #[test]
    fn test_legacy_convention_fields() {
        let req = get("/nic/update?hostname=foo&myip=1.2.3.4&password=fromquery");
        let c = Convention::Legacy;
        assert_eq!(c.domain(&req), "foo");
        assert_eq!(c.address(&req), "1.2.3.4");
        assert_eq!(c.secret(&req), "fromquery");
        assert_eq!(Convention::Default.secret(&req), "");
    }

    #[test]
    fn test_legacy_basic_auth_wins() {
        let req = get("/nic/update?hostname=foo&password=fromquery")
            .with_header(header::AUTHORIZATION, basic("username:changeme"));
        assert_eq!(Convention::Legacy.secret(&req), "changeme");
    }

    #[test]
    fn test_legacy_empty_basic_auth_falls_back() {
        let req = get("/nic/update?hostname=foo&password=fromquery")
            .with_header(header::AUTHORIZATION, basic("username:"));
        assert_eq!(Convention::Legacy.secret(&req), "fromquery");
    }

    #[test]
    fn test_action_resolution() {
        let c = Convention::Default;
        assert_eq!(c.action(&get("/update?domain=foo")), Ok(Action::Update));
        assert_eq!(c.action(&get("/update?action=DELETE")), Ok(Action::Delete));
        assert_eq!(
            c.action(&get("/delete?domain=foo").with_route_action(Action::Delete)),
            Ok(Action::Delete)
        );
        let delete = UpdateRequest::from_uri(Method::DELETE, "/delete?domain=foo").unwrap();
        assert_eq!(c.action(&delete), Ok(Action::Delete));
        assert!(c.action(&get("/update?action=flush")).is_err());
    }

    #[test]
    fn test_resolve_uses_request_overrides() {
        let req = get("/update?domain=foo&zone=example.net&ddnskeyname=mykey");
        let name = Convention::Default.resolve(&req, "foo", "example.org.");
        assert_eq!(name.zone, "example.net");
        assert_eq!(name.fqdn, "foo.example.net");
        assert_eq!(name.key_name, "mykey");
    }
}
