//! Request handling from validated response to committed update.

use crate::config::Config;
use crate::error::{DdnsError, Result};
use crate::extractor::{Action, Convention, UpdateRequest};
use crate::nsupdate::{RecordRequest, SessionSettings, UpdateSession};
use crate::response::{FailureKind, WebserviceResponse};
use crate::store::{ExpiryRecord, ExpiryStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Run `requests` through one update session.
///
/// Stops queueing at the first failing command but always closes the
/// session. Any text the program prints counts as a failure.
pub async fn run_batch(settings: SessionSettings, requests: &[RecordRequest]) -> Result<()> {
    let mut session = UpdateSession::new(settings);
    run_session(&mut session, requests).await
}

async fn run_session(session: &mut UpdateSession, requests: &[RecordRequest]) -> Result<()> {
    session.start().await?;

    let mut queue_error = None;
    for req in requests {
        info!(
            "{} record {} request: {} -> {}",
            req.record_type, req.action, req.fqdn, req.value
        );
        if let Err(e) = session.apply(req).await {
            queue_error = Some(e);
            break;
        }
    }

    let closed = session.close().await;
    match (closed, queue_error) {
        (Err(e), _) => Err(e),
        (Ok(_), Some(e)) => Err(e),
        (Ok(out), None) if !out.trim().is_empty() => Err(DdnsError::Session(out.trim().to_string())),
        (Ok(_), None) => Ok(()),
    }
}

/// Shared request handling state.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    store: Option<Arc<dyn ExpiryStore>>,
}

impl Pipeline {
    pub fn new(config: Arc<Config>, store: Option<Arc<dyn ExpiryStore>>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate `req`, apply it to the nameserver, and report the outcome.
    pub async fn handle(&self, req: &UpdateRequest, convention: Convention) -> WebserviceResponse {
        let response = WebserviceResponse::from_request(req, &self.config, convention);
        if !response.success {
            return response;
        }

        let requests = self.record_requests(req, convention, &response);
        if let Err(e) = run_batch(SessionSettings::from_config(&self.config), &requests).await {
            warn!("Update of {} failed: {}", response.domains.join(","), e);
            return response.fail(FailureKind::UpdateFailed, e.to_string());
        }

        self.track_expiry(&requests).await;

        let mut response = response;
        response.message = success_message(&response);
        response
    }

    /// One request per record and domain, records outermost.
    pub fn record_requests(
        &self,
        req: &UpdateRequest,
        convention: Convention,
        response: &WebserviceResponse,
    ) -> Vec<RecordRequest> {
        let delegated = !self.config.uses_shared_secret();
        let secret = if delegated {
            convention.secret(req)
        } else {
            String::new()
        };

        let mut requests = Vec::with_capacity(response.records.len() * response.domains.len());
        for record in &response.records {
            for domain in &response.domains {
                let name = convention.resolve(req, domain, &self.config.zone);
                requests.push(RecordRequest {
                    domain: domain.clone(),
                    fqdn: name.fqdn,
                    zone: name.zone,
                    key_name: if delegated { name.key_name } else { String::new() },
                    secret: secret.clone(),
                    record_type: record.record_type,
                    value: record.value.clone(),
                    action: response.action,
                });
            }
        }
        requests
    }

    async fn track_expiry(&self, requests: &[RecordRequest]) {
        let Some(store) = &self.store else {
            return;
        };

        for req in requests {
            let key = ExpiryRecord::key_for(&req.fqdn, req.record_type);
            let result = match (req.action, self.config.expiry.record_expiry_secs) {
                (Action::Update, Some(secs)) => {
                    let now = Utc::now();
                    let expiry = i64::try_from(secs)
                        .ok()
                        .and_then(Duration::try_seconds)
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    store
                        .put(ExpiryRecord {
                            name: req.fqdn.clone(),
                            zone: req.zone.clone(),
                            record_type: req.record_type,
                            value: req.value.clone(),
                            ttl: self.config.record_ttl,
                            created: now,
                            expiry,
                        })
                        .await
                }
                (Action::Update, None) => continue,
                (Action::Delete, _) => store.delete(&key).await,
            };
            if let Err(e) = result {
                warn!("Failed to record expiry for {}: {}", key, e);
            }
        }
    }
}

fn success_message(response: &WebserviceResponse) -> String {
    let domains = response.domains.join(",");
    match response.action {
        Action::Delete => {
            let types: Vec<String> = response
                .records
                .iter()
                .map(|r| r.record_type.to_string())
                .collect();
            format!("Deleted {} records for {}", types.join("/"), domains)
        }
        Action::Update if response.records.iter().all(|r| r.record_type.is_address()) => format!(
            "Updated {} record for {} to IP address {}",
            response.addr_type, domains, response.address
        ),
        Action::Update => format!(
            "Updated {} record for {} to {}",
            response.addr_type, domains, response.address
        ),
    }
}
