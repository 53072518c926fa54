//! Certificate authority service (spec §4.3).
//!
//! Grounded in `certificate_manager.rs`'s root-CA loading and per-host
//! signing, with three deliberate departures the spec requires: the root
//! is never auto-generated (fail-fast on missing/malformed PEM, see
//! SPEC_FULL §11), the leaf cache is a bounded LRU with coalesced concurrent
//! mints (`moka::sync::Cache::get_with`) instead of an unbounded
//! `HashMap` behind an `RwLock`, and validity/serial number are drawn per
//! spec rather than left at rcgen's defaults.

use anyhow::{Context, Result};
use moka::sync::Cache;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, SanType, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::IpAddr;
use std::time::Duration as StdDuration;
use time::{Duration, OffsetDateTime};

/// Default leaf lifetime, matching the source's `createCert(..., 240)` call
/// (240 hours = 10 days).
pub const DEFAULT_LEAF_TTL: StdDuration = StdDuration::from_secs(240 * 60 * 60);

/// How far back of "now" a leaf's `not_before` is backdated, to tolerate
/// client/server clock skew.
const VALIDITY_SKEW: Duration = Duration::seconds(60);

/// A cache hit is only served if at least this much validity remains.
const CACHE_MARGIN: Duration = Duration::minutes(5);

const LEAF_CACHE_CAPACITY: u64 = 4096;

#[derive(Clone)]
struct CachedLeaf {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    expires_at: OffsetDateTime,
}

pub struct CertificateAuthority {
    root_cert: Certificate,
    root_keypair: KeyPair,
    cache: Cache<String, CachedLeaf>,
    ttl: StdDuration,
}

impl CertificateAuthority {
    /// Loads the root CA certificate and key from PEM files. Fails fast
    /// (spec §4.3 "Fails-fast if either is absent or malformed") rather
    /// than generating a throwaway root the way the teacher's
    /// `CertificateManager::new` does.
    pub fn load(ca_cert_path: &str, ca_key_path: &str) -> Result<Self> {
        Self::load_with_ttl(ca_cert_path, ca_key_path, DEFAULT_LEAF_TTL)
    }

    pub fn load_with_ttl(ca_cert_path: &str, ca_key_path: &str, ttl: StdDuration) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(ca_cert_path)
            .with_context(|| format!("failed to read CA certificate at {ca_cert_path}"))?;
        let key_pem = std::fs::read_to_string(ca_key_path)
            .with_context(|| format!("failed to read CA key at {ca_key_path}"))?;

        let root_keypair = KeyPair::from_pem(&key_pem).context("malformed CA private key")?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem).context("malformed CA certificate")?;
        let root_cert = params.self_signed(&root_keypair).context("failed to reconstruct CA certificate")?;

        Ok(Self {
            root_cert,
            root_keypair,
            cache: Cache::builder().max_capacity(LEAF_CACHE_CAPACITY).build(),
            ttl,
        })
    }

    /// MintLeaf(host, ttl) -> (cert_chain, key) (spec §4.3).
    ///
    /// Cache hits verify remaining validity exceeds `CACHE_MARGIN`; misses
    /// (including expired entries) mint a fresh leaf. `moka`'s `get_with`
    /// ensures concurrent mint requests for the same host coalesce into a
    /// single signing operation.
    pub fn get_certificate(&self, host: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let now = OffsetDateTime::now_utc();

        if let Some(cached) = self.cache.get(host) {
            if cached.expires_at - now > CACHE_MARGIN {
                return Self::decode(&cached);
            }
            self.cache.invalidate(host);
        }

        let host_owned = host.to_string();
        let ttl = self.ttl;
        let leaf = self
            .cache
            .try_get_with(host_owned.clone(), || Self::mint(&self.root_cert, &self.root_keypair, &host_owned, ttl))
            .map_err(|e| anyhow::anyhow!("failed to mint leaf certificate for {host}: {e}"))?;

        Self::decode(&leaf)
    }

    fn decode(leaf: &CachedLeaf) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert = CertificateDer::from(leaf.cert_der.clone());
        let key = PrivateKeyDer::try_from(leaf.key_der.clone())
            .map_err(|e| anyhow::anyhow!("failed to decode cached leaf key: {e}"))?;
        Ok((vec![cert], key))
    }

    fn mint(root_cert: &Certificate, root_keypair: &KeyPair, host: &str, ttl: StdDuration) -> Result<CachedLeaf> {
        tracing::debug!("minting leaf certificate for {host}");

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        params.subject_alt_names = vec![if let Ok(ip) = host.parse::<IpAddr>() {
            SanType::IpAddress(ip)
        } else {
            SanType::DnsName(host.to_string().try_into()?)
        }];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - VALIDITY_SKEW;
        let not_after = now + Duration::seconds(ttl.as_secs() as i64);
        params.not_after = not_after;

        let serial: u64 = rand::random();
        params.serial_number = Some(SerialNumber::from(serial));

        let keypair = KeyPair::generate()?;
        let cert = params.signed_by(&keypair, root_cert, root_keypair)?;

        Ok(CachedLeaf {
            cert_der: cert.der().to_vec(),
            key_der: keypair.serialize_der(),
            expires_at: not_after,
        })
    }
}
