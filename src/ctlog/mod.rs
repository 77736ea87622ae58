//! Certificate Transparency log access: the RFC 6962 HTTP client and the
//! `MerkleTreeLeaf` binary decoder.

mod client;
mod leaf;

pub use client::HttpLogClient;
pub use leaf::{parse_leaf, LeafParseError};
