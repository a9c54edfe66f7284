use crate::model::IndexRequest;
use serde::Deserialize;

/// The subset of a stream event the filter looks at.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct StreamEvent {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub entities: Entities,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Entities {
    #[serde(default)]
    pub media: Vec<Media>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Media {
    #[serde(rename = "type", default)]
    pub media_type: String,
    #[serde(default)]
    pub media_url: String,
}

/// Only the first attached media item is considered. Anything else is dropped without error.
pub fn inspect_event(event: &StreamEvent) -> Option<IndexRequest> {
    let media = event.entities.media.first()?;
    if media.media_type != "photo" {
        log::trace!("Skipping event with first media of type {:?}", media.media_type);
        return None;
    }
    Some(IndexRequest {
        url: media.media_url.clone(),
        description: event.text.clone(),
    })
}
