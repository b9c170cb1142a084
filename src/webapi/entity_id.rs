//! Identifier extraction from `OData-EntityId` headers.

use reqwest::header::HeaderMap;
use uuid::Uuid;

/// Header naming the created entity, e.g. `.../accounts(<id>)`.
pub const ODATA_ENTITY_ID: &str = "OData-EntityId";

/// Extracts the id enclosed in parentheses from an entity location.
///
/// Returns `None` when the value is missing, has no `(...)` pair, or the
/// enclosed text is not a UUID. Upserts addressed by alternate key echo the
/// key instead of a UUID, so `None` is an expected outcome, not an error.
pub fn extract_entity_id(location: Option<&str>) -> Option<Uuid> {
    let location = location?;
    let (_, rest) = location.split_once('(')?;
    let (inner, _) = rest.split_once(')')?;
    Uuid::parse_str(inner.trim()).ok()
}

/// Reads [`ODATA_ENTITY_ID`] from response headers.
pub fn entity_id_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    let value = headers.get(ODATA_ENTITY_ID).and_then(|v| v.to_str().ok());
    extract_entity_id(value)
}
