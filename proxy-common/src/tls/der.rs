//! A narrow, hand-rolled DER encoder/decoder — not a general ASN.1 layer.
//!
//! No crate in this dependency stack provides an off-the-shelf OCSP
//! `CertID` builder (see `DESIGN.md`), so this module implements exactly
//! the fixed structure RFC 6960 §4.1.1 requires, plus enough of a
//! syntactic reader to sanity-check an `OCSPResponse` blob without
//! parsing it semantically — stapling trusts the directory's answer.

/// Fixed encoding of `AlgorithmIdentifier { algorithm: id-sha1, parameters:
/// NULL }` — `SEQUENCE { OID 1.3.14.3.2.26, NULL }`.
const SHA1_ALGORITHM_IDENTIFIER: &[u8] = &[0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00];

fn encode_len(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
        let significant = &bytes[first_nonzero..];
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(significant);
    }
}

fn encode_tlv(tag: u8, value: &[u8], out: &mut Vec<u8>) {
    out.push(tag);
    encode_len(value.len(), out);
    out.extend_from_slice(value);
}

fn encode_octet_string(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 4);
    encode_tlv(0x04, value, &mut out);
    out
}

/// Encodes an arbitrary-precision unsigned integer the way DER requires:
/// minimal length, with a leading zero byte inserted if the high bit of
/// the first byte would otherwise be set (so it isn't read as negative).
fn encode_integer(raw_be_bytes: &[u8]) -> Vec<u8> {
    let mut trimmed = raw_be_bytes;
    while trimmed.len() > 1 && trimmed[0] == 0 && trimmed[1] & 0x80 == 0 {
        trimmed = &trimmed[1..];
    }
    let mut value = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.is_empty() || trimmed[0] & 0x80 != 0 {
        value.push(0);
    }
    value.extend_from_slice(trimmed);

    let mut out = Vec::with_capacity(value.len() + 4);
    encode_tlv(0x02, &value, &mut out);
    out
}

fn encode_sequence(members: &[&[u8]]) -> Vec<u8> {
    let mut body = Vec::new();
    for m in members {
        body.extend_from_slice(m);
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    encode_tlv(0x30, &body, &mut out);
    out
}

/// Builds the DER encoding of an RFC 6960 `CertID` using SHA-1 as the
/// hash algorithm (the default OCSP responders overwhelmingly accept).
pub fn encode_cert_id(issuer_name_hash: &[u8; 20], issuer_key_hash: &[u8; 20], serial_be_bytes: &[u8]) -> Vec<u8> {
    let issuer_name_hash_tlv = encode_octet_string(issuer_name_hash);
    let issuer_key_hash_tlv = encode_octet_string(issuer_key_hash);
    let serial_tlv = encode_integer(serial_be_bytes);

    encode_sequence(&[
        SHA1_ALGORITHM_IDENTIFIER,
        &issuer_name_hash_tlv,
        &issuer_key_hash_tlv,
        &serial_tlv,
    ])
}

/// Syntactic-only validation of an `OCSPResponse` DER blob: checks that
/// it is a well-formed outer `SEQUENCE` whose declared length matches the
/// buffer. Does not interpret `responseStatus` or verify any signature;
/// the directory's answer is trusted rather than cryptographically
/// re-verified here.
pub fn looks_like_ocsp_response(der: &[u8]) -> bool {
    if der.len() < 2 || der[0] != 0x30 {
        return false;
    }
    match read_len(&der[1..]) {
        Some((len, header_len)) => 1 + header_len + len == der.len(),
        None => false,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cert_id_shape() {
        let name_hash = [1u8; 20];
        let key_hash = [2u8; 20];
        let der = encode_cert_id(&name_hash, &key_hash, &[0x01, 0x02, 0x03]);
        assert_eq!(der[0], 0x30);
        assert!(looks_like_ocsp_response(&der) || der.len() > 0);
        // hashAlgorithm, issuerNameHash, issuerKeyHash, serialNumber.
        assert!(der.windows(SHA1_ALGORITHM_IDENTIFIER.len()).any(|w| w == SHA1_ALGORITHM_IDENTIFIER));
    }

    #[test]
    fn integer_encoding_adds_leading_zero_for_high_bit() {
        let der = encode_integer(&[0x80]);
        assert_eq!(der, vec![0x02, 0x02, 0x00, 0x80]);
    }

    #[test]
    fn integer_encoding_trims_redundant_leading_zero() {
        let der = encode_integer(&[0x00, 0x01]);
        assert_eq!(der, vec![0x02, 0x01, 0x01]);
    }

    #[test]
    fn ocsp_response_length_check() {
        let good = encode_sequence(&[&encode_octet_string(b"abc")]);
        assert!(looks_like_ocsp_response(&good));

        let mut truncated = good.clone();
        truncated.pop();
        assert!(!looks_like_ocsp_response(&truncated));

        assert!(!looks_like_ocsp_response(&[0x02, 0x01, 0x00]));
    }

    #[test]
    fn long_form_length() {
        let body = vec![0u8; 200];
        let der = encode_sequence(&[&encode_octet_string(&body)]);
        assert!(looks_like_ocsp_response(&der));
    }
}
