//! MITM proxy library: canonical HTTP model, persistence, certificate
//! authority, proxy engine, and replay/scan services (spec §2).

pub mod canonical;
pub mod certificate_authority;
pub mod config;
pub mod control_api;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod replay;
pub mod scan;
pub mod store;

pub use canonical::{Request, Response};
pub use certificate_authority::CertificateAuthority;
pub use config::Config;
pub use error::StoreError;
pub use proxy::ProxyEngine;
pub use store::{PgStore, Store};
