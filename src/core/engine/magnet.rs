//! Minimal magnet URI handling: enough to derive a content id and a
//! display name from a descriptor, and to build one for seeded content.

use crate::core::session::ContentId;
use url::Url;

const BTIH_PREFIX: &str = "urn:btih:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magnet {
    pub content_id: ContentId,
    pub name: Option<String>,
    pub length: Option<u64>,
}

/// Parse `magnet:?xt=urn:btih:<hex>&dn=<name>&xl=<len>`.
pub fn parse(descriptor: &str) -> Result<Magnet, String> {
    let url = Url::parse(descriptor).map_err(|e| format!("not a URI: {e}"))?;
    if url.scheme() != "magnet" {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }

    let mut content_id = None;
    let mut name = None;
    let mut length = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" => {
                if let Some(hash) = value.strip_prefix(BTIH_PREFIX) {
                    content_id = ContentId::parse(hash);
                }
            }
            "dn" if !value.is_empty() => name = Some(value.into_owned()),
            "xl" => length = value.parse().ok(),
            _ => {}
        }
    }

    let content_id = content_id.ok_or_else(|| "missing xt=urn:btih:<hex>".to_string())?;
    Ok(Magnet {
        content_id,
        name,
        length,
    })
}

/// Build a descriptor for content known by id and name.
pub fn build(content_id: &ContentId, name: &str, length: Option<u64>) -> String {
    let mut url = format!("magnet:?xt={BTIH_PREFIX}{content_id}");
    let encoded: String = url::form_urlencoded::byte_serialize(name.as_bytes()).collect();
    url.push_str("&dn=");
    url.push_str(&encoded);
    if let Some(len) = length {
        url.push_str(&format!("&xl={len}"));
    }
    url
}
