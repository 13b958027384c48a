//! Request validation into a [`WebserviceResponse`].

use crate::addr::{classify, RecordType};
use crate::config::Config;
use crate::detector::IpDetector;
use crate::extractor::{Action, Convention, UpdateRequest};
use crate::names::escape;
use serde::Serialize;
use tracing::{debug, warn};

/// Why a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DomainNotSet,
    InvalidCredentials,
    InvalidAddress,
    InvalidRecord,
    /// The domains need more than one zone or key to authenticate.
    MixedZones,
    UpdateFailed,
}

/// One record value and its type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub value: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
}

/// Result of one HTTP request.
///
/// `domain`, `address` and `addr_type` repeat the first domain and record
/// for clients that only understand a single value.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebserviceResponse {
    pub success: bool,
    pub message: String,
    pub domain: String,
    pub domains: Vec<String>,
    pub address: String,
    pub addr_type: String,
    pub records: Vec<Record>,
    #[serde(skip)]
    pub action: Action,
    #[serde(skip)]
    pub failure: Option<FailureKind>,
}

impl WebserviceResponse {
    /// Mark the response failed.
    pub fn fail(mut self, kind: FailureKind, message: impl Into<String>) -> Self {
        self.success = false;
        self.failure = Some(kind);
        self.message = message.into();
        debug!("Request rejected: {}", self.message);
        self
    }

    /// Validate `req` as read through `convention`.
    ///
    /// Never starts an update session. On success the domains and records
    /// are filled in and `success` is true.
    pub fn from_request(req: &UpdateRequest, config: &Config, convention: Convention) -> Self {
        let mut response = WebserviceResponse::default();

        if req.values().any(has_control_chars) || has_control_chars(&convention.secret(req)) {
            return response.fail(FailureKind::InvalidRecord, "Invalid characters in request");
        }

        response.domains = convention
            .domain(req)
            .split(',')
            .map(|d| d.trim().to_string())
            .collect();
        if response.domains.iter().any(|d| escape(d).is_empty()) {
            return response.fail(FailureKind::DomainNotSet, "Domain not set");
        }
        if let Some(message) = mixed_scope(req, config, convention, &response.domains) {
            warn!("Rejected batch: {}", message);
            return response.fail(FailureKind::MixedZones, message);
        }

        response.action = match convention.action(req) {
            Ok(action) => action,
            Err(message) => return response.fail(FailureKind::InvalidRecord, message),
        };

        let explicit_type = match convention.record_type(req).map(str::parse::<RecordType>) {
            None => None,
            Some(Ok(record_type)) => Some(record_type),
            Some(Err(message)) => return response.fail(FailureKind::InvalidRecord, message),
        };

        match explicit_type {
            Some(record_type) if !record_type.is_address() => {
                let value = convention
                    .value(req)
                    .unwrap_or_else(|| convention.address(req));
                let value = escape(value);
                if value.is_empty() && response.action == Action::Update {
                    return response.fail(
                        FailureKind::InvalidRecord,
                        format!("{} record requires a value", record_type),
                    );
                }
                response.records.push(Record { value, record_type });
            }
            _ => {
                for entry in convention.address(req).split(',').map(str::trim) {
                    if entry.is_empty() {
                        continue;
                    }
                    match accept_address(entry, explicit_type) {
                        Ok(record) => response.records.push(record),
                        Err(message) => {
                            warn!("Invalid address: {}", entry);
                            return response.fail(FailureKind::InvalidAddress, message);
                        }
                    }
                }
            }
        }

        if response.records.is_empty() {
            match response.action {
                Action::Update => {
                    let detector = IpDetector::from_config(&config.client_ip);
                    let detected = match detector.detect(req.headers(), req.peer()) {
                        Ok(ip) => ip.to_string(),
                        Err(_) => {
                            warn!("No usable client address for {:?}", req.peer());
                            return response.fail(
                                FailureKind::InvalidAddress,
                                "Client address is neither a valid IPv4 nor IPv6 address",
                            );
                        }
                    };
                    match accept_address(&detected, explicit_type) {
                        Ok(record) => response.records.push(record),
                        Err(message) => return response.fail(FailureKind::InvalidAddress, message),
                    }
                }
                Action::Delete => {
                    let types = match explicit_type {
                        Some(record_type) => vec![record_type],
                        None => vec![RecordType::A, RecordType::Aaaa],
                    };
                    response.records = types
                        .into_iter()
                        .map(|record_type| Record {
                            value: String::new(),
                            record_type,
                        })
                        .collect();
                }
            }
        }

        let secret = convention.secret(req);
        match config.shared_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(expected) if secret != expected => {
                warn!("Invalid shared secret for {}", response.domains.join(","));
                return response.fail(FailureKind::InvalidCredentials, "Invalid Credentials");
            }
            None if secret.is_empty() => {
                warn!("Missing secret for {}", response.domains.join(","));
                return response.fail(FailureKind::InvalidCredentials, "Invalid Credentials");
            }
            _ => {}
        }

        response.domain = response.domains[0].clone();
        response.address = response.records[0].value.clone();
        response.addr_type = response.records[0].record_type.to_string();
        response.success = true;
        response
    }
}

/// All domains of a request are sent in one session, which authenticates
/// once. They must resolve to the same zone, and to the same key name when
/// keys come from the request.
fn mixed_scope(
    req: &UpdateRequest,
    config: &Config,
    convention: Convention,
    domains: &[String],
) -> Option<String> {
    let compare_keys = !config.uses_shared_secret();
    let mut names = domains
        .iter()
        .map(|domain| (domain, convention.resolve(req, domain, &config.zone)));
    let (first_domain, first) = names.next()?;

    names
        .find(|(_, name)| {
            name.zone != first.zone || (compare_keys && name.key_name != first.key_name)
        })
        .map(|(domain, _)| {
            format!(
                "Domains {} and {} belong to different zones and cannot be updated together",
                first_domain, domain
            )
        })
}

fn has_control_chars(value: &str) -> bool {
    value.chars().any(char::is_control)
}

fn accept_address(
    entry: &str,
    expected: Option<RecordType>,
) -> std::result::Result<Record, String> {
    let record_type = classify(entry)
        .ok_or_else(|| format!("{} is neither a valid IPv4 nor IPv6 address", entry))?;
    if let Some(expected) = expected {
        if expected != record_type {
            return Err(format!("{} is not a valid {} address", entry, expected));
        }
    }
    Ok(Record {
        value: entry.to_string(),
        record_type,
    })
}
