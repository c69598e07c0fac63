use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;

use crate::checksum::{self, ChecksumAlgorithm};
use crate::chunking::metadata::CHUNK_USER_PROPERTY;
use crate::mqtt::{AckToken, Delivery, Publish};

/// Collects the chunks of one logical message.
pub struct ChunkedMessageAssembler {
    state: Mutex<AssemblyState>,
    created_at: Instant,
    checksum_algorithm: ChecksumAlgorithm,
}

struct AssemblyState {
    /// Keyed by chunk index so reassembly doesn't depend on arrival order.
    chunks: BTreeMap<u32, Delivery>,
    /// `0` until chunk 0 arrives.
    total_chunks: u32,
    checksum: Option<String>,
}

impl ChunkedMessageAssembler {
    pub fn new(checksum_algorithm: ChecksumAlgorithm) -> Self {
        ChunkedMessageAssembler {
            state: Mutex::new(AssemblyState {
                chunks: BTreeMap::new(),
                total_chunks: 0,
                checksum: None,
            }),
            created_at: Instant::now(),
            checksum_algorithm,
        }
    }

    /// Buffer a chunk. Returns `false` if a chunk with this index was already added.
    pub fn add_chunk(&self, index: u32, delivery: Delivery) -> bool {
        let mut state = self.lock();

        if state.chunks.contains_key(&index) {
            return false;
        }

        state.chunks.insert(index, delivery);
        true
    }

    /// Set the values carried by chunk 0.
    pub fn update_metadata(&self, total_chunks: u32, checksum: Option<String>) {
        let mut state = self.lock();
        state.total_chunks = total_chunks;
        state.checksum = checksum;
    }

    pub fn is_complete(&self) -> bool {
        self.lock().is_complete()
    }

    pub fn received_count(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn has_expired(&self, timeout: Duration) -> bool {
        self.created_at.elapsed() > timeout
    }

    /// Concatenate the chunks in index order and verify the checksum, if there was one.
    ///
    /// Returns `None` if the message is incomplete or fails verification.
    /// Acknowledging the returned delivery acknowledges every chunk.
    pub fn try_reassemble(&self) -> Option<Delivery> {
        let state = self.lock();

        if !state.is_complete() {
            return None;
        }

        // A chunk that arrived before chunk 0 may claim an index past the end.
        if !state.chunks.keys().copied().eq(0..state.total_chunks) {
            tracing::debug!(
                total_chunks = state.total_chunks,
                "chunk indices are not contiguous; cannot reassemble"
            );
            return None;
        }

        let segments = state.chunks.values().map(|chunk| &chunk.publish.payload[..]);

        if let Some(expected) = &state.checksum {
            if !checksum::verify_segments(segments.clone(), expected, self.checksum_algorithm) {
                tracing::debug!(expected, "checksum mismatch in reassembled message");
                return None;
            }
        }

        let len = segments.clone().map(<[u8]>::len).sum();
        let mut payload = BytesMut::with_capacity(len);
        segments.for_each(|segment| payload.extend_from_slice(segment));

        let template = &state.chunks.get(&0)?.publish;

        let mut publish = Publish {
            topic: template.topic.clone(),
            qos: template.qos,
            retain: template.retain,
            payload: payload.freeze(),
            properties: template.properties.clone(),
        };

        publish
            .properties
            .user_properties
            .retain(|(key, _)| key != CHUNK_USER_PROPERTY);

        let ack = AckToken::composite(state.chunks.values().map(|chunk| chunk.ack.clone()));

        Some(Delivery { publish, ack })
    }

    fn lock(&self) -> MutexGuard<'_, AssemblyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AssemblyState {
    fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.chunks.len() == self.total_chunks as usize
    }
}
