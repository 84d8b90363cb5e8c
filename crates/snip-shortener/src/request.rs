use crate::error::PipelineError;
use snip_core::{DeleteRequest, OwnerId, ShortKey};

/// Parses a raw delete payload into requests on behalf of `owner`.
///
/// The payload is a JSON array of strings. Each element is either a bare key
/// (`"5"`) or a short URL rendered under `base_url` (`"http://host/5"`).
/// Nothing is returned unless every element resolves.
pub fn parse_delete_request(
    raw: &str,
    base_url: &str,
    owner: OwnerId,
) -> Result<Vec<DeleteRequest>, PipelineError> {
    let items: Vec<String> = serde_json::from_str(raw)
        .map_err(|err| PipelineError::MalformedRequest(err.to_string()))?;

    items
        .iter()
        .map(|item| {
            ShortKey::from_short_url(base_url, item)
                .map(|key| DeleteRequest::new(key, owner))
                .ok_or_else(|| {
                    PipelineError::MalformedRequest(format!("not a short key: {item:?}"))
                })
        })
        .collect()
}
