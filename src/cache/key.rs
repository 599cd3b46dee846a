//! Cache key derivation.
//!
//! A key is built from up to four parts:
//!
//! ```text
//! {prefix}:{path}[:{query digest}][:user_{id}][:lang_{xx}]
//! ```
//!
//! The query digest is computed over the parameters sorted by name, so
//! `?a=1&b=2` and `?b=2&a=1` land on the same entry.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::context::Context;

/// Decodes a query string into a name-sorted map.
///
/// `+` is read as a space and `%XX` escapes are decoded. A repeated name keeps
/// its last value. Returns `None` when a component does not decode to valid
/// UTF-8; callers treat that the same as an empty query.
pub fn parse_query(query: &str) -> Option<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = urlencoding::decode(&name.replace('+', " ")).ok()?.into_owned();
        let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
        params.insert(name, value);
    }
    Some(params)
}

/// Canonical serialization of a query: its sorted parameters as a JSON object.
///
/// `None` for an absent, empty, or undecodable query.
pub fn canonical_query(query: Option<&str>) -> Option<String> {
    let params = parse_query(query?)?;
    if params.is_empty() {
        return None;
    }
    serde_json::to_string(&params).ok()
}

/// Hex SHA-256 prefix (128 bits) of the canonical query serialization.
pub fn query_digest(query: Option<&str>) -> Option<String> {
    let canonical = canonical_query(query)?;
    let hash = Sha256::digest(canonical.as_bytes());
    Some(hex::encode(&hash[..16]))
}

/// Two-character language tag taken from an `Accept-Language` value.
pub fn language_tag(accept_language: &str) -> Option<String> {
    let tag: String = accept_language.trim().chars().take(2).collect();
    if tag.is_empty() { None } else { Some(tag) }
}

/// Assembles a cache key from already-resolved parts.
pub fn build_key(
    prefix: &str,
    route: &str,
    query: Option<&str>,
    user_id: Option<&str>,
    language: Option<&str>,
) -> String {
    let mut key = format!("{prefix}:{route}");
    if let Some(digest) = query_digest(query) {
        key.push(':');
        key.push_str(&digest);
    }
    if let Some(id) = user_id {
        key.push_str(":user_");
        key.push_str(id);
    }
    if let Some(lang) = language.and_then(language_tag) {
        key.push_str(":lang_");
        key.push_str(&lang);
    }
    key
}

/// Derives the cache key for a request: its normalized path, query, caller
/// and `Accept-Language`.
pub fn cache_key(prefix: &str, ctx: &Context) -> String {
    let request = ctx.request();
    build_key(
        prefix,
        request.route_path(),
        request.query_string(),
        ctx.caller().map(|caller| caller.user_id.as_str()),
        request.headers().get("accept-language"),
    )
}
