use crate::checksum::{self, ChecksumAlgorithm};
use crate::chunking::metadata::{ChunkMetadata, CHUNK_USER_PROPERTY};
use crate::mqtt::Publish;

/// The smallest maximum packet size chunking will work with.
pub const MIN_PACKET_SIZE: u32 = 128;

#[derive(thiserror::Error, Debug)]
pub enum SplitError {
    #[error("maximum packet size of {max_packet_size} bytes is below the minimum of {MIN_PACKET_SIZE}")]
    PacketSizeTooSmall { max_packet_size: u32 },

    #[error("static overhead of {static_overhead} bytes leaves no room for a payload in {max_packet_size} byte packets")]
    OverheadTooLarge {
        static_overhead: u32,
        max_packet_size: u32,
    },

    #[error("payload of {payload_len} bytes fits in a single chunk of {max_chunk_size} bytes")]
    PayloadFits {
        payload_len: usize,
        max_chunk_size: usize,
    },
}

/// Splits oversized messages into packet-sized chunks.
#[derive(Clone, Debug)]
pub struct ChunkedMessageSplitter {
    /// Bytes reserved in every packet for the fixed header, topic and properties.
    static_overhead: u32,
    checksum_algorithm: ChecksumAlgorithm,
}

impl ChunkedMessageSplitter {
    pub fn new(static_overhead: u32, checksum_algorithm: ChecksumAlgorithm) -> Self {
        ChunkedMessageSplitter {
            static_overhead,
            checksum_algorithm,
        }
    }

    /// The largest payload a single packet of `max_packet_size` bytes can carry.
    pub fn max_chunk_size(&self, max_packet_size: u32) -> Result<usize, SplitError> {
        if max_packet_size < MIN_PACKET_SIZE {
            return Err(SplitError::PacketSizeTooSmall { max_packet_size });
        }

        match max_packet_size.checked_sub(self.static_overhead) {
            Some(size) if size > 0 => Ok(size as usize),
            _ => Err(SplitError::OverheadTooLarge {
                static_overhead: self.static_overhead,
                max_packet_size,
            }),
        }
    }

    /// Split `publish` into chunks, in chunk index order.
    ///
    /// Fails if the payload would fit into a single packet.
    pub fn split(&self, publish: &Publish, max_packet_size: u32) -> Result<Vec<Publish>, SplitError> {
        let max_chunk_size = self.max_chunk_size(max_packet_size)?;
        let payload_len = publish.payload.len();

        if payload_len <= max_chunk_size {
            return Err(SplitError::PayloadFits {
                payload_len,
                max_chunk_size,
            });
        }

        let total_chunks = payload_len.div_ceil(max_chunk_size);
        let message_id = uuid::Uuid::new_v4().to_string();
        let checksum = checksum::calculate(&publish.payload, self.checksum_algorithm);

        let user_properties: Vec<_> = publish
            .properties
            .user_properties
            .iter()
            .filter(|(key, _)| key != CHUNK_USER_PROPERTY)
            .cloned()
            .collect();

        tracing::trace!(
            message_id,
            payload_len,
            total_chunks,
            topic = publish.topic,
            "splitting message"
        );

        let chunks = (0..total_chunks)
            .map(|index| {
                let start = index * max_chunk_size;
                let end = payload_len.min(start + max_chunk_size);

                let metadata = ChunkMetadata {
                    message_id: message_id.clone(),
                    // A payload of more than `u32::MAX` chunks couldn't be buffered anyway.
                    chunk_index: index as u32,
                    total_chunks: (index == 0).then_some(total_chunks as u32),
                    checksum: (index == 0).then(|| checksum.clone()),
                };

                let mut chunk = Publish {
                    topic: publish.topic.clone(),
                    qos: publish.qos,
                    retain: publish.retain,
                    payload: publish.payload.slice(start..end),
                    properties: publish.properties.clone(),
                };

                chunk.properties.user_properties = user_properties.clone();
                chunk
                    .properties
                    .user_properties
                    .push((CHUNK_USER_PROPERTY.to_owned(), metadata.to_json()));

                chunk
            })
            .collect();

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::checksum::{self, ChecksumAlgorithm};
    use crate::chunking::metadata::ChunkMetadata;
    use crate::mqtt::{Publish, PublishProperties, QoS};

    use super::{ChunkedMessageSplitter, SplitError};

    fn publish(len: usize) -> Publish {
        Publish {
            topic: "rpc/upload".into(),
            qos: QoS::AtLeastOnce,
            retain: true,
            payload: (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into(),
            properties: PublishProperties {
                content_type: Some("application/octet-stream".into()),
                response_topic: Some("clients/me/rpc/upload".into()),
                correlation_data: Some(Bytes::from_static(b"corr")),
                message_expiry_interval: Some(30),
                user_properties: vec![("origin".into(), "test".into())],
                ..Default::default()
            },
        }
    }

    #[test]
    fn three_hundred_kilobytes() {
        let splitter = ChunkedMessageSplitter::new(1000, ChecksumAlgorithm::Sha256);
        let original = publish(300_000);

        let chunks = splitter.split(&original, 64_000).unwrap();
        assert_eq!(chunks.len(), 5);

        for (index, chunk) in chunks.iter().enumerate() {
            let metadata = ChunkMetadata::from_publish(chunk).unwrap().unwrap();
            assert_eq!(metadata.chunk_index as usize, index);

            if index == 0 {
                assert_eq!(metadata.total_chunks, Some(5));
                assert_eq!(
                    metadata.checksum.as_deref(),
                    Some(&*checksum::calculate(&original.payload, ChecksumAlgorithm::Sha256))
                );
            } else {
                assert_eq!(metadata.total_chunks, None);
                assert_eq!(metadata.checksum, None);
            }

            assert_eq!(chunk.topic, original.topic);
            assert_eq!(chunk.qos, original.qos);
            assert!(chunk.retain);
            assert_eq!(chunk.properties.content_type, original.properties.content_type);
            assert_eq!(chunk.properties.response_topic, original.properties.response_topic);
            assert_eq!(chunk.properties.correlation_data, original.properties.correlation_data);
            assert_eq!(chunk.user_property("origin"), Some("test"));
        }

        let sizes: Vec<_> = chunks.iter().map(|chunk| chunk.payload.len()).collect();
        assert_eq!(sizes, [63_000, 63_000, 63_000, 63_000, 48_000]);

        let message_ids: Vec<_> = chunks
            .iter()
            .map(|chunk| ChunkMetadata::from_publish(chunk).unwrap().unwrap().message_id)
            .collect();
        assert!(message_ids.iter().all(|id| *id == message_ids[0]));
    }

    #[test]
    fn rejects_payload_that_fits() {
        let splitter = ChunkedMessageSplitter::new(100, ChecksumAlgorithm::Md5);

        assert!(matches!(
            splitter.split(&publish(156), 256),
            Err(SplitError::PayloadFits {
                payload_len: 156,
                max_chunk_size: 156
            })
        ));
        assert_eq!(splitter.split(&publish(157), 256).unwrap().len(), 2);
    }

    #[test]
    fn rejects_small_packets() {
        let splitter = ChunkedMessageSplitter::new(10, ChecksumAlgorithm::Md5);
        assert!(matches!(
            splitter.split(&publish(1000), 127),
            Err(SplitError::PacketSizeTooSmall { .. })
        ));

        let splitter = ChunkedMessageSplitter::new(1024, ChecksumAlgorithm::Md5);
        assert!(matches!(
            splitter.split(&publish(1000), 1024),
            Err(SplitError::OverheadTooLarge { .. })
        ));
    }
}
