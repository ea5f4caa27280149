//! OCSP stapling: CertID derivation, a time-bounded per-context
//! response cache, and the fetch against the stapling directory.

use crate::httpfetch::{FetchPool, LookupOutcome};
use crate::tls::context::TlsContext;
use crate::tls::der;
use base64::Engine;
use chrono::{TimeZone, Utc};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// The stable cache key / lookup key for a context's OCSP identity: the
/// DER `CertID`, base64-encoded.
pub fn derive_ocsp_key(leaf_der: &[u8], issuer_der: &[u8]) -> Option<String> {
    let (_, leaf) = X509Certificate::from_der(leaf_der).ok()?;
    let (_, issuer) = X509Certificate::from_der(issuer_der).ok()?;

    let issuer_name_hash: [u8; 20] = Sha1::digest(issuer.subject().as_raw()).into();

    let issuer_key_bytes = issuer.public_key().subject_public_key.as_ref();
    let issuer_key_hash: [u8; 20] = Sha1::digest(issuer_key_bytes).into();

    let serial_be = leaf.raw_serial();
    let der_bytes = der::encode_cert_id(&issuer_name_hash, &issuer_key_hash, serial_be);

    Some(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(der_bytes))
}

/// Extracts the primary AIA/OCSP responder URL from a leaf certificate,
/// if present.
pub fn extract_ocsp_url(leaf_der: &[u8]) -> Option<String> {
    use x509_parser::extensions::{GeneralName, ParsedExtension};
    use x509_parser::oid_registry::OID_PKIX_ACCESS_DESCRIPTOR_OCSP;

    let (_, leaf) = X509Certificate::from_der(leaf_der).ok()?;
    leaf.extensions().iter().find_map(|ext| match ext.parsed_extension() {
        ParsedExtension::AuthorityInfoAccess(aia) => aia
            .accessdescs
            .iter()
            .find(|desc| desc.access_method == OID_PKIX_ACCESS_DESCRIPTOR_OCSP)
            .and_then(|desc| match &desc.access_location {
                GeneralName::URI(uri) => Some(uri.to_string()),
                _ => None,
            }),
        _ => None,
    })
}

struct CacheEntry {
    response: Vec<u8>,
    next_update: Option<Instant>,
}

const SKEW: Duration = Duration::from_secs(30);

/// A one-entry-per-context LRU cache of stapled responses, keyed by the
/// context's OCSP key, plus the directory fetch.
pub struct OcspStapler {
    pool: Option<FetchPool>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl OcspStapler {
    pub fn new(pool: Option<FetchPool>) -> Self {
        OcspStapler {
            pool,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.pool.is_some()
    }

    /// Returns a cached, still-fresh staple for `ctx` without touching the
    /// network. `next_update` is already skew-adjusted at insert time, so
    /// this only needs a plain comparison against now.
    pub fn cached(&self, ctx: &TlsContext) -> Option<Vec<u8>> {
        let key = ctx.ocsp_der_b64.as_ref()?;
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(key)?;
        if let Some(next_update) = entry.next_update {
            if Instant::now() >= next_update {
                return None;
            }
        }
        Some(entry.response.clone())
    }

    /// Fetches a fresh staple for `ctx` from the directory and caches it.
    /// Returns `None` on `Empty`/`HttpError` — stapling is best-effort
    /// and must never fail the handshake — or on a syntactically invalid
    /// response.
    pub async fn fetch(&self, ctx: &TlsContext) -> Option<Vec<u8>> {
        let pool = self.pool.as_ref()?;
        let key = ctx.ocsp_der_b64.as_ref()?;

        let body = match pool.lookup(key).await {
            Ok(LookupOutcome::Found(body)) => body,
            Ok(LookupOutcome::Empty) => return None,
            Err(_) => return None,
        };

        if !der::looks_like_ocsp_response(&body) {
            return None;
        }

        let next_update = extract_next_update(&body);
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            key.clone(),
            CacheEntry {
                response: body.to_vec(),
                next_update,
            },
        );
        Some(body.to_vec())
    }

    /// Consults the cache first, falls back to a fetch.
    pub async fn staple_for(&self, ctx: &TlsContext) -> Option<Vec<u8>> {
        if let Some(cached) = self.cached(ctx) {
            return Some(cached);
        }
        self.fetch(ctx).await
    }
}

/// Best-effort `nextUpdate` extraction: walks the response looking for a
/// GeneralizedTime (tag 0x18) or UTCTime (tag 0x17) value and parses it.
/// Deliberately shallow — a missing or odd `nextUpdate` simply disables
/// caching rather than causing an error.
fn extract_next_update(der_bytes: &[u8]) -> Option<Instant> {
    let mut i = 0;
    while i < der_bytes.len() {
        let tag = der_bytes[i];
        if i + 1 >= der_bytes.len() {
            break;
        }
        let (len, header_len) = match read_len(&der_bytes[i + 1..]) {
            Some(v) => v,
            None => break,
        };
        let value_start = i + 1 + header_len;
        let value_end = value_start.checked_add(len)?;
        if value_end > der_bytes.len() {
            break;
        }
        if tag == 0x18 || tag == 0x17 {
            if let Some(system_time) = parse_asn1_time(&der_bytes[value_start..value_end]) {
                return Some(system_time_to_skewed_instant(system_time));
            }
        }
        i = value_end;
    }
    None
}

/// Converts an absolute `nextUpdate` into an `Instant` `SKEW` earlier,
/// bridging `SystemTime`'s wall-clock semantics to `Instant`'s monotonic
/// ones via the delta from `SystemTime::now()`. A `nextUpdate` already in
/// the past collapses to "now" so the entry reads as immediately stale.
fn system_time_to_skewed_instant(next_update: SystemTime) -> Instant {
    match next_update.duration_since(SystemTime::now()) {
        Ok(remaining) => Instant::now() + remaining.saturating_sub(SKEW),
        Err(_) => Instant::now(),
    }
}

fn read_len(buf: &[u8]) -> Option<(usize, usize)> {
    let first = *buf.first()?;
    if first & 0x80 == 0 {
        return Some((first as usize, 1));
    }
    let num_bytes = (first & 0x7f) as usize;
    if num_bytes == 0 || num_bytes > 4 || buf.len() < 1 + num_bytes {
        return None;
    }
    let mut len = 0usize;
    for &b in &buf[1..1 + num_bytes] {
        len = (len << 8) | b as usize;
    }
    Some((len, 1 + num_bytes))
}

/// Parses a DER GeneralizedTime (`YYYYMMDDHHMMSSZ`) or UTCTime
/// (`YYMMDDHHMMSSZ`) value into an absolute `SystemTime`. Only the
/// non-fractional, `Z`-suffixed form is accepted; anything else (local
/// offsets, fractional seconds) is rejected rather than guessed at.
fn parse_asn1_time(time_bytes: &[u8]) -> Option<SystemTime> {
    let s = std::str::from_utf8(time_bytes).ok()?;
    let s = s.strip_suffix('Z')?;
    let (year, rest) = match s.len() {
        13 => {
            let yy: i32 = s.get(0..2)?.parse().ok()?;
            let year = if yy < 50 { 2000 + yy } else { 1900 + yy };
            (year, s.get(2..)?)
        }
        15 => {
            let year: i32 = s.get(0..4)?.parse().ok()?;
            (year, s.get(4..)?)
        }
        _ => return None,
    };
    if rest.len() != 10 {
        return None;
    }
    let month: u32 = rest.get(0..2)?.parse().ok()?;
    let day: u32 = rest.get(2..4)?.parse().ok()?;
    let hour: u32 = rest.get(4..6)?.parse().ok()?;
    let minute: u32 = rest.get(6..8)?.parse().ok()?;
    let second: u32 = rest.get(8..10)?.parse().ok()?;
    let dt = Utc.with_ymd_and_hms(year, month, day, hour, minute, second).single()?;
    Some(dt.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn load_der(path: &str) -> Vec<u8> {
        let pem = fs::read_to_string(path).unwrap();
        let mut reader = pem.as_bytes();
        rustls_pemfile::certs(&mut reader).next().unwrap().unwrap().to_vec()
    }

    #[test]
    fn derives_ocsp_key_from_leaf_and_issuer() {
        let leaf = load_der("tests_fixtures/leaf_cert.pem");
        let issuer = load_der("tests_fixtures/ca_cert.pem");
        let key = derive_ocsp_key(&leaf, &issuer).expect("key derivation should succeed");
        assert!(!key.is_empty());
        // base64 URL-safe alphabet only.
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn extracts_aia_ocsp_url() {
        let leaf = load_der("tests_fixtures/leaf_cert.pem");
        let url = extract_ocsp_url(&leaf);
        assert_eq!(url.as_deref(), Some("http://ocsp.example.test/"));
    }

    #[test]
    fn no_aia_means_no_url() {
        let leaf = load_der("tests_fixtures/test_cert.pem");
        assert!(extract_ocsp_url(&leaf).is_none());
    }

    #[test]
    fn parses_generalized_time() {
        let parsed = parse_asn1_time(b"20990101000000Z").expect("should parse");
        let dt: chrono::DateTime<Utc> = parsed.into();
        assert_eq!(dt.format("%Y%m%d%H%M%S").to_string(), "20990101000000");
    }

    #[test]
    fn parses_utc_time_with_pivot_year() {
        let recent = parse_asn1_time(b"300101000000Z").expect("should parse");
        let dt: chrono::DateTime<Utc> = recent.into();
        assert_eq!(dt.format("%Y").to_string(), "2030");

        let old = parse_asn1_time(b"990101000000Z").expect("should parse");
        let dt: chrono::DateTime<Utc> = old.into();
        assert_eq!(dt.format("%Y").to_string(), "1999");
    }

    #[test]
    fn rejects_malformed_time() {
        assert!(parse_asn1_time(b"not-a-time").is_none());
        assert!(parse_asn1_time(b"20990101000000").is_none()); // missing Z
    }

    #[test]
    fn near_future_next_update_yields_short_lived_instant() {
        let soon = SystemTime::now() + Duration::from_secs(60);
        let instant = system_time_to_skewed_instant(soon);
        assert!(instant <= Instant::now() + Duration::from_secs(60));
        assert!(instant > Instant::now());
    }

    #[test]
    fn past_next_update_yields_already_stale_instant() {
        let past = SystemTime::now() - Duration::from_secs(60);
        let instant = system_time_to_skewed_instant(past);
        assert!(instant <= Instant::now());
    }
}
