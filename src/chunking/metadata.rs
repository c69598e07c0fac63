use crate::mqtt::Publish;

/// The user property that carries [`ChunkMetadata`] as JSON.
pub const CHUNK_USER_PROPERTY: &str = "__chunk";

/// Identifies one physical chunk of a logical message.
///
/// Only chunk 0 carries `total_chunks` and `checksum`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub message_id: String,
    pub chunk_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ChunkMetadataError {
    #[error("chunk metadata is not valid JSON")]
    Json(#[from] serde_json::Error),

    #[error("chunk 0 of message {message_id} is missing the total chunk count")]
    MissingTotal { message_id: String },

    #[error("chunk {chunk_index} of message {message_id} is outside of {total_chunks} chunks")]
    IndexOutOfRange {
        message_id: String,
        chunk_index: u32,
        total_chunks: u32,
    },
}

impl ChunkMetadata {
    /// Read the chunk metadata of `publish`.
    ///
    /// Returns `None` if `publish` isn't a chunk.
    pub fn from_publish(publish: &Publish) -> Option<Result<Self, ChunkMetadataError>> {
        let json = publish.user_property(CHUNK_USER_PROPERTY)?;
        Some(Self::from_json(json))
    }

    pub fn from_json(json: &str) -> Result<Self, ChunkMetadataError> {
        let metadata: Self = serde_json::from_str(json)?;

        if metadata.chunk_index == 0 && matches!(metadata.total_chunks, None | Some(0)) {
            return Err(ChunkMetadataError::MissingTotal {
                message_id: metadata.message_id,
            });
        }

        if let Some(total_chunks) = metadata.total_chunks {
            if metadata.chunk_index >= total_chunks {
                return Err(ChunkMetadataError::IndexOutOfRange {
                    message_id: metadata.message_id,
                    chunk_index: metadata.chunk_index,
                    total_chunks,
                });
            }
        }

        Ok(metadata)
    }

    pub fn to_json(&self) -> String {
        // Serializing a struct of strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
