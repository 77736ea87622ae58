//! Keyword matching against parsed certificate identities.

use crate::core::{Keyword, ParsedCertificate};

/// Pairs a keyword id with the domain string that triggered the match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordMatch {
    pub keyword_id: i64,
    pub matched_domain: String,
}

/// Checks a parsed certificate against all keywords.
///
/// Case-insensitive substring match; each keyword yields at most one result.
/// The Common Name is checked first, then the SANs in certificate order, and
/// the reported domain keeps its original case.
pub fn match_certificate(cert: &ParsedCertificate, keywords: &[Keyword]) -> Vec<KeywordMatch> {
    let mut results = Vec::new();
    let cn_lower = cert.common_name.to_lowercase();

    for kw in keywords {
        let needle = kw.value.to_lowercase();

        if !cert.common_name.is_empty() && cn_lower.contains(&needle) {
            results.push(KeywordMatch {
                keyword_id: kw.id,
                matched_domain: cert.common_name.clone(),
            });
            continue;
        }

        if let Some(san) = cert
            .sans
            .iter()
            .find(|san| san.to_lowercase().contains(&needle))
        {
            results.push(KeywordMatch {
                keyword_id: kw.id,
                matched_domain: san.clone(),
            });
        }
    }

    results
}
