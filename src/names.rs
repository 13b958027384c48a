//! Fully-qualified name, zone, and key name resolution.

/// Strip characters that could break out of an update command.
///
/// Trims leading and trailing characters that are not letters, digits, or
/// one of `. + - _ / =`. Inner characters are left alone.
pub fn escape(s: &str) -> String {
    s.trim_matches(|c: char| !(c.is_alphanumeric() || ".+-_/=".contains(c)))
        .to_string()
}

/// Names derived for one domain token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    /// Zone to authenticate against; empty when the domain is absolute.
    pub zone: String,
    /// Record name without trailing dot.
    pub fqdn: String,
    /// TSIG key name suffix.
    pub key_name: String,
}

/// Resolves names against an optional request zone and the configured one.
#[derive(Debug, Clone, Copy)]
pub struct NameResolver<'a> {
    default_zone: &'a str,
}

impl<'a> NameResolver<'a> {
    pub fn new(default_zone: &'a str) -> Self {
        Self { default_zone }
    }

    /// Zone for `domain`.
    ///
    /// A non-empty request zone wins. Otherwise the configured zone is used,
    /// except that a domain ending in a dot is taken as already qualified and
    /// gets no zone.
    pub fn zone(&self, domain: &str, requested: Option<&str>) -> String {
        if let Some(zone) = requested.map(escape).filter(|z| !z.is_empty()) {
            return zone.trim_end_matches('.').to_string();
        }
        if domain.ends_with('.') {
            return String::new();
        }
        escape(self.default_zone).trim_end_matches('.').to_string()
    }

    /// Record name for `domain` within `zone`.
    pub fn fqdn(&self, domain: &str, zone: &str) -> String {
        format!("{}.{}", escape(domain).trim_end_matches('.'), zone)
            .trim_end_matches('.')
            .to_string()
    }

    /// Key name: the requested one, else the zone, else the record name.
    pub fn key_name(&self, requested: Option<&str>, zone: &str, fqdn: &str) -> String {
        if let Some(key) = requested.map(escape).filter(|k| !k.is_empty()) {
            return key;
        }
        if !zone.is_empty() {
            return zone.to_string();
        }
        fqdn.to_string()
    }

    /// Resolve zone, record name, and key name in one go.
    pub fn resolve(
        &self,
        domain: &str,
        requested_zone: Option<&str>,
        requested_key: Option<&str>,
    ) -> ResolvedName {
        let zone = self.zone(domain, requested_zone);
        let fqdn = self.fqdn(domain, &zone);
        let key_name = self.key_name(requested_key, &zone, &fqdn);
        ResolvedName {
            zone,
            fqdn,
            key_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(zone: &str, fqdn: &str, key_name: &str) -> ResolvedName {
        ResolvedName {
            zone: zone.to_string(),
            fqdn: fqdn.to_string(),
            key_name: key_name.to_string(),
        }
    }

    #[test]
    fn test_escape_trims_edges_only() {
        assert_eq!(escape("foo.example.org"), "foo.example.org");
        assert_eq!(escape("  foo;\n"), "foo");
        assert_eq!(escape("\"c2VjcmV0+/=\""), "c2VjcmV0+/=");
        assert_eq!(escape("a b"), "a b");
        assert_eq!(escape(";;"), "");
    }

    #[test]
    fn test_unconfigured_zone() {
        let resolver = NameResolver::new("");
        assert_eq!(
            resolver.resolve("foo.example.org", None, None),
            resolved("", "foo.example.org", "foo.example.org")
        );
    }

    #[test]
    fn test_unconfigured_zone_with_zone_in_request() {
        let resolver = NameResolver::new("");
        assert_eq!(
            resolver.resolve("foo", Some("example.org"), None),
            resolved("example.org", "foo.example.org", "example.org")
        );
    }

    #[test]
    fn test_unconfigured_zone_with_key_in_request() {
        let resolver = NameResolver::new("");
        assert_eq!(
            resolver.resolve("foo.example.org", None, Some("example.org")),
            resolved("", "foo.example.org", "example.org")
        );
    }

    #[test]
    fn test_configured_zone_with_hostname() {
        let resolver = NameResolver::new("example.org.");
        assert_eq!(
            resolver.resolve("foo", None, None),
            resolved("example.org", "foo.example.org", "example.org")
        );
    }

    #[test]
    fn test_configured_zone_with_absolute_domain() {
        let resolver = NameResolver::new("example.org.");
        assert_eq!(
            resolver.resolve("foo.example.org.", None, None),
            resolved("", "foo.example.org", "foo.example.org")
        );
    }

    #[test]
    fn test_request_zone_wins_over_absolute_domain() {
        let resolver = NameResolver::new("example.org.");
        let name = resolver.resolve("foo.", Some("other.net."), None);
        assert_eq!(name.zone, "other.net");
        assert_eq!(name.fqdn, "foo.other.net");
    }

    #[test]
    fn test_empty_request_values_fall_back() {
        let resolver = NameResolver::new("example.org");
        assert_eq!(
            resolver.resolve("foo", Some(""), Some("")),
            resolved("example.org", "foo.example.org", "example.org")
        );
    }
}
