//! Job creation payload.
//!
//! A job is created by a `JobsManager::new_job` call whose arguments are
//! SCALE-encoded as [`JobPayload`]. The listener recovers the stream and the
//! profile tag from the creating extrinsic's call data.

use crate::error::{ChainError, ChainResult};
use parity_scale_codec::{Decode, Encode};
use vtn_types::StreamId;

/// Call arguments of a job-creation extrinsic.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct JobPayload {
    /// Source stream, `<node>/<suffix>`.
    pub stream_id: String,
    /// Profile tag, one or more comma-separated profile names.
    pub transcoding_options: String,
    /// Maximum price per segment.
    pub max_price_per_segment: u128,
}

/// Parameters recovered from a job payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobParams {
    /// Stream to transcode.
    pub stream_id: StreamId,
    /// Unresolved profile tag.
    pub profile_tag: String,
}

impl JobPayload {
    /// Build a payload for `stream` and `tag`.
    pub fn new(stream: &StreamId, tag: impl Into<String>, max_price_per_segment: u128) -> Self {
        Self {
            stream_id: stream.to_string(),
            transcoding_options: tag.into(),
            max_price_per_segment,
        }
    }
}

/// Decode call data into job parameters.
///
/// Trailing bytes and malformed stream ids are decode errors.
pub fn parse_job_payload(input: &[u8]) -> ChainResult<JobParams> {
    let mut cursor = input;
    let payload =
        JobPayload::decode(&mut cursor).map_err(|e| ChainError::Decode(e.to_string()))?;
    if !cursor.is_empty() {
        return Err(ChainError::Decode(format!(
            "{} trailing bytes after job payload",
            cursor.len()
        )));
    }
    let stream_id = payload
        .stream_id
        .parse()
        .map_err(|e: vtn_types::TypesError| ChainError::Decode(e.to_string()))?;
    Ok(JobParams {
        stream_id,
        profile_tag: payload.transcoding_options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_payload() {
        let stream = StreamId::new("12D3KooWOrigin", "abcd").unwrap();
        let bytes = JobPayload::new(&stream, "P240p30fps16x9", 100).encode();

        let params = parse_job_payload(&bytes).unwrap();
        assert_eq!(params.stream_id, stream);
        assert_eq!(params.profile_tag, "P240p30fps16x9");
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let stream = StreamId::new("node", "s").unwrap();
        let bytes = JobPayload::new(&stream, "P240p30fps16x9", 1).encode();
        assert!(matches!(
            parse_job_payload(&bytes[..bytes.len() - 3]),
            Err(ChainError::Decode(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let stream = StreamId::new("node", "s").unwrap();
        let mut bytes = JobPayload::new(&stream, "P240p30fps16x9", 1).encode();
        bytes.push(0);
        assert!(parse_job_payload(&bytes).is_err());
    }

    #[test]
    fn test_malformed_stream_id_rejected() {
        let payload = JobPayload {
            stream_id: "no-separator".into(),
            transcoding_options: "P240p30fps16x9".into(),
            max_price_per_segment: 1,
        };
        assert!(matches!(
            parse_job_payload(&payload.encode()),
            Err(ChainError::Decode(_))
        ));
    }
}
