//! The TLS context table: an ordered set of (SNI-pattern → TLS config)
//! with O(log n) lookup and a default fallback. The default entry is
//! built from frontend settings up front, never a zeroed slot filled in
//! later.

use crate::config::{Config, ContextCfg};
use crate::error::{ProxyError, Result};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs;
use std::sync::Arc;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// One entry in the context table: the signing material rustls needs
/// plus its cached OCSP identity.
#[derive(Clone)]
pub struct TlsContext {
    pub servername: Option<String>,
    pub certified_key: Arc<CertifiedKey>,
    pub leaf_der: CertificateDer<'static>,
    pub issuer_der: Option<CertificateDer<'static>>,
    pub npn_line: Vec<u8>,
    pub npn_protocols: Vec<String>,
    /// Lazily derived by `tls::ocsp` and cached back onto a clone of this
    /// context inside the table; `None` until first requested.
    pub ocsp_der_b64: Option<String>,
}

impl TlsContext {
    fn build(cert_path: &str, key_path: &str, npn: &[String], servername: Option<String>) -> Result<TlsContext> {
        let cert_bytes = fs::read(cert_path)
            .map_err(|e| ProxyError::Crypto(format!("reading cert '{cert_path}': {e}")))?;
        let key_bytes = fs::read(key_path)
            .map_err(|e| ProxyError::Crypto(format!("reading key '{key_path}': {e}")))?;

        let mut chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| ProxyError::Crypto(format!("parsing cert chain '{cert_path}': {e}")))?;
        if chain.is_empty() {
            return Err(ProxyError::Crypto(format!("'{cert_path}' contains no certificates")));
        }
        let leaf_der = chain[0].clone();
        let issuer_der = if chain.len() > 1 { Some(chain.remove(1)) } else { None };

        let key_der = rustls_pemfile::private_key(&mut key_bytes.as_slice())
            .map_err(|e| ProxyError::Crypto(format!("parsing private key '{key_path}': {e}")))?
            .ok_or_else(|| ProxyError::Crypto(format!("'{key_path}' contains no private key")))?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| ProxyError::Crypto(format!("unsupported key type in '{key_path}': {e}")))?;

        let certified_key = Arc::new(CertifiedKey::new(chain, signing_key));

        let npn_line = encode_npn(npn)?;

        let mut ctx = TlsContext {
            servername,
            certified_key,
            leaf_der,
            issuer_der,
            npn_line,
            npn_protocols: npn.to_vec(),
            ocsp_der_b64: None,
        };
        ctx.resolve_issuer();
        Ok(ctx)
    }

    /// Falls back to the trust store for the issuer certificate if the
    /// chain file didn't carry one, matching the leaf's `issuer` field
    /// against each trust-store candidate's `subject` rather than
    /// trusting the first root the OS hands back.
    pub fn resolve_issuer(&mut self) {
        if self.issuer_der.is_some() {
            return;
        }
        let Ok((_, leaf)) = X509Certificate::from_der(self.leaf_der.as_ref()) else {
            return;
        };
        let issuer_name = leaf.issuer().as_raw().to_vec();
        self.issuer_der = rustls_native_certs::load_native_certs()
            .certs
            .into_iter()
            .find(|candidate| {
                X509Certificate::from_der(candidate.as_ref())
                    .map(|(_, cert)| cert.subject().as_raw() == issuer_name.as_slice())
                    .unwrap_or(false)
            });
    }
}

/// The sorted table plus the default fallback context.
pub struct ContextTable {
    default: TlsContext,
    entries: Vec<TlsContext>,
}

impl ContextTable {
    /// Builds the table from `Config`. The default entry always comes
    /// from `frontend.{cert,key,npn}`; `contexts[]` entries are parsed,
    /// sorted case-insensitively by servername, and deduplicated (the
    /// uniqueness invariant is already enforced by `Config::validate`).
    pub fn build(config: &Config) -> Result<ContextTable> {
        let default = TlsContext::build(
            &config.frontend.cert,
            &config.frontend.key,
            &config.frontend.npn,
            None,
        )?;

        let mut entries = Vec::with_capacity(config.contexts.len());
        for ctx_cfg in &config.contexts {
            entries.push(build_entry(ctx_cfg)?);
        }
        entries.sort_by(|a, b| {
            a.servername
                .as_deref()
                .unwrap_or_default()
                .to_ascii_lowercase()
                .cmp(&b.servername.as_deref().unwrap_or_default().to_ascii_lowercase())
        });

        Ok(ContextTable { default, entries })
    }

    /// Case-insensitive binary search by full-length equality — no
    /// wildcard matching at this layer. Always returns *some* context: a
    /// match, or the default.
    pub fn lookup(&self, servername: &str) -> &TlsContext {
        let needle = servername.to_ascii_lowercase();
        let found = self
            .entries
            .binary_search_by(|entry| {
                entry
                    .servername
                    .as_deref()
                    .unwrap_or_default()
                    .to_ascii_lowercase()
                    .cmp(&needle)
            })
            .ok();
        match found {
            Some(idx) => &self.entries[idx],
            None => &self.default,
        }
    }

    pub fn default_context(&self) -> &TlsContext {
        &self.default
    }

    pub fn len(&self) -> usize {
        self.entries.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

fn build_entry(ctx_cfg: &ContextCfg) -> Result<TlsContext> {
    let npn = ctx_cfg.npn.clone().unwrap_or_default();
    TlsContext::build(&ctx_cfg.cert, &ctx_cfg.key, &npn, Some(ctx_cfg.servername.clone()))
}

/// Wire-encodes an NPN/ALPN protocol list as a length-prefixed
/// concatenation: one octet of length followed by the ASCII token,
/// repeated. Fails if the encoded line would not fit in a single TLS
/// extension (`u16::MAX` bytes).
pub fn encode_npn(protocols: &[String]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for proto in protocols {
        if proto.is_empty() || proto.len() > 255 {
            return Err(ProxyError::Config(format!("invalid NPN protocol '{proto}'")));
        }
        out.push(proto.len() as u8);
        out.extend_from_slice(proto.as_bytes());
    }
    if out.len() > u16::MAX as usize {
        return Err(ProxyError::Config("NPN line exceeds 2^16 - 1 bytes".into()));
    }
    Ok(out)
}

/// Inverse of `encode_npn`, used by tests to assert the round-trip
/// invariant.
pub fn decode_npn(line: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();
    let mut i = 0;
    while i < line.len() {
        let len = line[i] as usize;
        i += 1;
        if i + len > line.len() {
            break;
        }
        protocols.push(String::from_utf8_lossy(&line[i..i + len]).into_owned());
        i += len;
    }
    protocols
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_self_signed(dir: &tempfile::TempDir, name: &str) -> (String, String) {
        // A small fixed self-signed RSA cert/key pair used purely to
        // exercise the loader; generated once offline and embedded here
        // so tests don't need a crypto dependency to mint certs.
        let cert_pem = include_str!("../../tests_fixtures/test_cert.pem");
        let key_pem = include_str!("../../tests_fixtures/test_key.pem");
        let cert_path = dir.path().join(format!("{name}.cert.pem"));
        let key_path = dir.path().join(format!("{name}.key.pem"));
        fs::File::create(&cert_path).unwrap().write_all(cert_pem.as_bytes()).unwrap();
        fs::File::create(&key_path).unwrap().write_all(key_pem.as_bytes()).unwrap();
        (cert_path.to_string_lossy().into_owned(), key_path.to_string_lossy().into_owned())
    }

    #[test]
    fn npn_round_trips() {
        let protocols = vec!["http/1.1".to_string(), "h2".to_string()];
        let line = encode_npn(&protocols).unwrap();
        assert_eq!(line, b"\x08http/1.1\x02h2");
        assert_eq!(decode_npn(&line), protocols);
    }

    #[test]
    fn npn_rejects_empty_token() {
        assert!(encode_npn(&["".to_string()]).is_err());
    }

    #[test]
    fn table_lookup_is_total() {
        let dir = tempfile::tempdir().unwrap();
        let (def_cert, def_key) = write_self_signed(&dir, "default");
        let (a_cert, a_key) = write_self_signed(&dir, "a");
        let (b_cert, b_key) = write_self_signed(&dir, "b");

        let mut config = Config::default();
        config.frontend.cert = def_cert;
        config.frontend.key = def_key;
        config.contexts = vec![
            ContextCfg {
                servername: "b.example".into(),
                cert: b_cert,
                key: b_key,
                npn: None,
                ciphers: None,
                ecdh: None,
            },
            ContextCfg {
                servername: "a.example".into(),
                cert: a_cert,
                key: a_key,
                npn: None,
                ciphers: None,
                ecdh: None,
            },
        ];

        let table = ContextTable::build(&config).unwrap();
        assert_eq!(table.len(), 3);

        let hit = table.lookup("B.Example");
        assert_eq!(hit.servername.as_deref(), Some("b.example"));

        let miss = table.lookup("unknown.example");
        assert!(miss.servername.is_none());
    }
}
