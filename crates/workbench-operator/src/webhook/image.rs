//! Image reference resolution against the workbench image catalog
//!
//! The last-image-selection annotation names a catalog entry as
//! `<imagestream>:<tag>`. Resolution walks the ImageStreams of the
//! operator namespace and picks the backing image of that tag. When a
//! tag has accumulated several backing images, the one with the latest
//! creation timestamp wins.

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use tracing::warn;

use workbench_common::Error;

/// A parsed image selection annotation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSelection {
    /// ImageStream name
    pub stream: String,
    /// Tag within the stream
    pub tag: String,
}

impl ImageSelection {
    /// Parse `<imagestream>:<tag>`; both parts must be non-empty
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let raw = raw.trim();
        match raw.split_once(':') {
            Some((stream, tag)) if !stream.is_empty() && !tag.is_empty() && !tag.contains(':') => {
                Ok(Self {
                    stream: stream.to_string(),
                    tag: tag.to_string(),
                })
            }
            _ => Err(Error::admission(format!(
                "malformed image selection {raw:?}, expected <imagestream>:<tag>"
            ))),
        }
    }
}

/// Resolve a selection to a docker image reference
///
/// Returns `None` when the stream or tag does not exist in the catalog;
/// the caller treats that as non-fatal and leaves the image untouched.
pub fn select_image_reference(
    streams: &[DynamicObject],
    selection: &ImageSelection,
) -> Option<String> {
    let stream = streams
        .iter()
        .find(|s| s.metadata.name.as_deref() == Some(selection.stream.as_str()))?;

    let tags = stream.data["status"]["tags"].as_array()?;
    let tag = tags
        .iter()
        .find(|t| t["tag"].as_str() == Some(selection.tag.as_str()))?;

    let items = tag["items"].as_array()?;
    items
        .iter()
        .filter_map(|item| {
            let reference = item["dockerImageReference"].as_str()?;
            let created = parse_created(item["created"].as_str());
            Some((created, reference))
        })
        .max_by_key(|(created, _)| *created)
        .map(|(_, reference)| reference.to_string())
}

/// Parse a backing image timestamp; unparseable ones sort earliest
fn parse_created(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                warn!(created = s, error = %e, "unparseable image timestamp");
                e
            })
            .ok()
    })
    .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
