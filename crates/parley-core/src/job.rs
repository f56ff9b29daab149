use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One queued unit of work: send this text/media to this recipient for this tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub tenant_id: String,
    pub campaign_id: Option<String>,
    pub recipient: String,
    pub text: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaSource {
    File { path: PathBuf },
    Url { url: String },
}

/// Payload handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundContent {
    Text { text: String },
    Image { source: MediaSource, caption: String },
}

impl OutboundContent {
    pub fn text(&self) -> &str {
        match self {
            OutboundContent::Text { text } => text,
            OutboundContent::Image { caption, .. } => caption,
        }
    }
}
