//! SNI dispatch: resolves an inbound ClientHello's servername to a
//! `TlsContext`, consulting the local table first and a remote directory
//! second.
//!
//! `rustls::server::ResolvesServerCert` is synchronous and gives the
//! handshake no suspend point, so there is no direct way to await a
//! directory fetch from inside it. This module instead exposes a
//! `resolve` step meant to run *before* a worker builds the per-connection
//! `rustls::ServerConfig`: the caller peeks the ClientHello's SNI off the
//! first TLS record, calls `resolve` to get a concrete `TlsContext`
//! (synchronously from the table, or after one async fetch), and only
//! then builds the handshake.

use crate::config::Config;
use crate::httpfetch::{FetchPool, LookupOutcome};
use crate::tls::context::{ContextTable, TlsContext};
use rustls::sign::CertifiedKey;
use rustls_pki_types::CertificateDer;
use std::sync::Arc;

/// Parses the servername out of a raw TLS `ClientHello` record, the way
/// a worker does before the handshake has started. Returns `None` if the
/// record isn't a handshake record, isn't a ClientHello, or carries no
/// SNI extension — all of which fall back to the default context.
pub fn peek_sni(record: &[u8]) -> Option<String> {
    // TLS record header: type(1) version(2) length(2).
    if record.len() < 5 || record[0] != 0x16 {
        return None;
    }
    let body = &record[5..];
    // Handshake header: msg_type(1) length(3); msg_type 1 == ClientHello.
    if body.len() < 4 || body[0] != 0x01 {
        return None;
    }
    let mut i = 4;
    // legacy_version(2) + random(32).
    i += 2 + 32;
    if i >= body.len() {
        return None;
    }
    // session_id.
    let session_id_len = *body.get(i)? as usize;
    i += 1 + session_id_len;
    // cipher_suites.
    let cipher_suites_len = u16::from_be_bytes([*body.get(i)?, *body.get(i + 1)?]) as usize;
    i += 2 + cipher_suites_len;
    // compression_methods.
    let compression_len = *body.get(i)? as usize;
    i += 1 + compression_len;
    if i + 2 > body.len() {
        return None;
    }
    // extensions.
    let extensions_len = u16::from_be_bytes([*body.get(i)?, *body.get(i + 1)?]) as usize;
    i += 2;
    let extensions_end = (i + extensions_len).min(body.len());
    while i + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([body[i], body[i + 1]]);
        let ext_len = u16::from_be_bytes([body[i + 2], body[i + 3]]) as usize;
        let ext_start = i + 4;
        let ext_end = ext_start + ext_len;
        if ext_end > extensions_end {
            return None;
        }
        if ext_type == 0x0000 {
            return parse_server_name_extension(&body[ext_start..ext_end]);
        }
        i = ext_end;
    }
    None
}

fn parse_server_name_extension(ext_body: &[u8]) -> Option<String> {
    if ext_body.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([ext_body[0], ext_body[1]]) as usize;
    let list = &ext_body[2..2 + list_len.min(ext_body.len().saturating_sub(2))];
    let mut i = 0;
    while i + 3 <= list.len() {
        let name_type = list[i];
        let name_len = u16::from_be_bytes([list[i + 1], list[i + 2]]) as usize;
        let name_start = i + 3;
        let name_end = name_start + name_len;
        if name_end > list.len() {
            return None;
        }
        if name_type == 0x00 {
            return std::str::from_utf8(&list[name_start..name_end])
                .ok()
                .map(str::to_string);
        }
        i = name_end;
    }
    None
}

/// An ephemeral context assembled from a remote directory response —
/// same shape as a table entry but not retained past the connection that
/// requested it; directory answers are never cached at this layer.
pub fn ephemeral_context_from_bytes(servername: &str, bundle: &[u8]) -> Option<TlsContext> {
    // The directory answer is a PEM bundle: leaf cert (+ optional issuer)
    // followed by a PEM private key, mirroring the on-disk layout
    // `TlsContext::build` already knows how to parse — so reuse it by
    // round-tripping through temp buffers rather than duplicating parsing.
    let text = std::str::from_utf8(bundle).ok()?;

    let mut cert_blocks = Vec::new();
    let mut key_block = None;
    for block in split_pem_blocks(text) {
        if block.contains("PRIVATE KEY") {
            key_block = Some(block);
        } else if block.contains("CERTIFICATE") {
            cert_blocks.push(block);
        }
    }
    let key_pem = key_block?;
    if cert_blocks.is_empty() {
        return None;
    }
    let cert_pem = cert_blocks.join("\n");

    let mut cert_reader = cert_pem.as_bytes();
    let mut chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .filter_map(|r| r.ok())
        .collect();
    if chain.is_empty() {
        return None;
    }
    let leaf_der = chain[0].clone();
    let issuer_der = if chain.len() > 1 { Some(chain.remove(1)) } else { None };

    let mut key_reader = key_pem.as_bytes();
    let key_der = rustls_pemfile::private_key(&mut key_reader).ok()??;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der).ok()?;
    let certified_key = Arc::new(CertifiedKey::new(chain, signing_key));

    let mut ctx = TlsContext {
        servername: Some(servername.to_string()),
        certified_key,
        leaf_der,
        issuer_der,
        npn_line: Vec::new(),
        npn_protocols: Vec::new(),
        ocsp_der_b64: None,
    };
    ctx.resolve_issuer();
    Some(ctx)
}

fn split_pem_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut in_block = false;
    for line in text.lines() {
        if line.starts_with("-----BEGIN") {
            in_block = true;
            current.clear();
        }
        if in_block {
            current.push_str(line);
            current.push('\n');
        }
        if line.starts_with("-----END") {
            in_block = false;
            blocks.push(std::mem::take(&mut current));
        }
    }
    blocks
}

/// Ties the local table and the remote directory together for the
/// pre-handshake resolve step.
pub struct SniResolver {
    table: ContextTable,
    directory: Option<FetchPool>,
}

impl SniResolver {
    pub fn new(config: &Config, table: ContextTable) -> Self {
        let directory = config.sni.as_ref().filter(|p| p.enabled).and_then(|p| {
            FetchPool::new(&p.host, p.port, &p.query).ok()
        });
        SniResolver { table, directory }
    }

    pub fn table(&self) -> &ContextTable {
        &self.table
    }

    /// Resolves `servername` (or `None` for "no SNI presented") to a
    /// concrete context. Local hits never touch the network; misses fall
    /// through to the directory if one is configured, and an empty or
    /// failed directory answer falls back to the default context.
    pub async fn resolve(&self, servername: Option<&str>) -> TlsContext {
        let Some(name) = servername else {
            return self.table.default_context().clone();
        };

        let local = self.table.lookup(name);
        if local.servername.is_some() {
            return local.clone();
        }

        if let Some(pool) = &self.directory {
            if let Ok(LookupOutcome::Found(bytes)) = pool.lookup(name).await {
                if let Some(ctx) = ephemeral_context_from_bytes(name, &bytes) {
                    return ctx;
                }
            }
        }

        self.table.default_context().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(servername: &str) -> Vec<u8> {
        let mut sni_name = Vec::new();
        sni_name.push(0x00); // host_name
        sni_name.extend_from_slice(&(servername.len() as u16).to_be_bytes());
        sni_name.extend_from_slice(servername.as_bytes());

        let mut sni_list = Vec::new();
        sni_list.extend_from_slice(&(sni_name.len() as u16).to_be_bytes());
        sni_list.extend_from_slice(&sni_name);

        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&0x0000u16.to_be_bytes()); // extension type
        sni_ext.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(&sni_list);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // legacy_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id len
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites len
        body.extend_from_slice(&[0x00, 0x00]);
        body.push(1); // compression_methods len
        body.push(0);
        body.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&sni_ext);

        let mut handshake = Vec::new();
        handshake.push(0x01); // ClientHello
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(0x16); // handshake record
        record.extend_from_slice(&[0x03, 0x01]); // record version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn peeks_sni_from_client_hello() {
        let record = client_hello_with_sni("example.test");
        assert_eq!(peek_sni(&record).as_deref(), Some("example.test"));
    }

    #[test]
    fn non_handshake_record_has_no_sni() {
        let record = vec![0x17, 0x03, 0x03, 0x00, 0x01, 0x00];
        assert!(peek_sni(&record).is_none());
    }

    #[test]
    fn truncated_record_has_no_sni() {
        assert!(peek_sni(&[0x16, 0x03, 0x01]).is_none());
    }
}
