//! Decoder for the RFC 6962 `MerkleTreeLeaf` binary blob.

use crate::core::ParsedCertificate;
use chrono::{DateTime, Utc};
use thiserror::Error;
use x509_parser::prelude::*;

/// Leaf header: version (1) + leaf_type (1) + timestamp (8) + entry_type (2)
/// + the x509 entry's 3-byte certificate length.
const MIN_LEAF_LEN: usize = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeafParseError {
    #[error("leaf input too short")]
    TooShort,
    #[error("unknown entry type: {0}")]
    UnknownType(u16),
    #[error("certificate parse failed: {0}")]
    ParseFailed(String),
}

/// Decodes one `MerkleTreeLeaf` + `extra_data` pair into a certificate view.
///
/// Handles both x509 entries (type 0) and precert entries (type 1). For
/// precert entries the parseable certificate is carried in `extra_data`
/// because `leaf_input` only holds the TBS, which is not a valid DER
/// certificate on its own.
pub fn parse_leaf(
    leaf_input: &[u8],
    extra_data: &[u8],
) -> Result<ParsedCertificate, LeafParseError> {
    if leaf_input.len() < MIN_LEAF_LEN {
        return Err(LeafParseError::TooShort);
    }

    // Bytes 2..10: timestamp (big-endian u64, ms since Unix epoch).
    // Bytes 0..2 (version, leaf type) carry no information we use.
    let mut ts_bytes = [0u8; 8];
    ts_bytes.copy_from_slice(&leaf_input[2..10]);
    let timestamp_ms = u64::from_be_bytes(ts_bytes);
    let entry_type = u16::from_be_bytes([leaf_input[10], leaf_input[11]]);

    let cert_der = match entry_type {
        // x509_entry: 3-byte length + DER, inline in the leaf.
        0 => {
            let cert_len = read_u24(&leaf_input[12..15]);
            let end = 15 + cert_len;
            if leaf_input.len() < end {
                return Err(LeafParseError::TooShort);
            }
            &leaf_input[15..end]
        }
        // precert_entry: the leaf holds {issuer_key_hash, TBS}; the DER
        // certificate is framed as {u24 length, DER} in extra_data.
        1 => {
            if extra_data.len() < 3 {
                return Err(LeafParseError::TooShort);
            }
            let cert_len = read_u24(&extra_data[0..3]);
            let end = 3 + cert_len;
            if extra_data.len() < end {
                return Err(LeafParseError::TooShort);
            }
            &extra_data[3..end]
        }
        other => return Err(LeafParseError::UnknownType(other)),
    };

    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| LeafParseError::ParseFailed(e.to_string()))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string();

    let mut issuer = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string();
    if issuer.is_empty() {
        issuer = cert
            .issuer()
            .iter_organization()
            .next()
            .and_then(|org| org.as_str().ok())
            .unwrap_or("")
            .to_string();
    }

    let mut sans = Vec::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                sans.push((*dns).to_string());
            }
        }
    }

    Ok(ParsedCertificate {
        timestamp: DateTime::from_timestamp_millis(timestamp_ms as i64)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        serial: cert.tbs_certificate.serial.to_str_radix(16),
        common_name,
        sans,
        issuer,
        not_before: asn1_to_datetime(&cert.validity().not_before),
        not_after: asn1_to_datetime(&cert.validity().not_after),
    })
}

/// Reads a 3-byte big-endian unsigned integer.
fn read_u24(b: &[u8]) -> usize {
    (b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize
}

fn asn1_to_datetime(t: &ASN1Time) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
