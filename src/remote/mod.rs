//! Remote collection access
//!
//! This module fetches pages of a JSON collection over HTTP. It resolves page
//! URLs, follows `Link` header pagination, detects exhausted rate limits and
//! decodes page bodies into [`RemoteRecord`]s.

/// Transport abstraction and the page fetcher
mod client;
/// `Link` header parsing
mod link;
/// Record, page and error types
mod types;

pub use client::{HttpTransport, PageFetcher, ReqwestTransport};
pub use link::{LinkRelation, next_link, parse_link_header};
pub use types::*;
