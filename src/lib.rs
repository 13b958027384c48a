//! # rusty-dyndns
//!
//! An HTTP dynamic DNS gateway. Each request is validated, turned into
//! update commands, and committed to a nameserver through an `nsupdate`
//! session.
//!
//! ## Features
//!
//! - JSON endpoints (`/update`, `/delete`) and DynDNS compatible endpoints
//!   (`/nic/update`, `/v2/update`, `/v3/update`)
//! - A, AAAA, CNAME and TXT records, several domains per request
//! - Client address detection from forwarding headers or the peer address
//! - Shared-secret or per-request TSIG credentials
//! - Optional record expiry with a background sweeper
//!
//! ## Usage
//!
//! ```bash
//! # Serve with the default config file
//! rusty-dyndns
//!
//! # Serve without a config file
//! rusty-dyndns --no-config --server ns1.example.org --zone dyn.example.org. serve
//!
//! # Check configuration
//! rusty-dyndns validate
//! ```

pub mod addr;
pub mod config;
pub mod detector;
pub mod error;
pub mod extractor;
pub mod names;
pub mod nsupdate;
pub mod pipeline;
pub mod response;
pub mod server;
pub mod store;
pub mod sweeper;

pub use config::Config;
pub use detector::IpDetector;
pub use error::{DdnsError, Result};
pub use pipeline::Pipeline;
pub use response::WebserviceResponse;
pub use sweeper::Sweeper;
