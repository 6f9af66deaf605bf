//! Wire format for uploads
//!
//! Request body: `{ "sessionMetadata": {...}, "executions": [...] }`,
//! gzip-compressed when larger than the configured threshold.
//! Response body: `{ "totalRecords": 3, "receiptId": "..." }`.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{SessionMetadata, TestBatch, TestExecution};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest<'a> {
    session_metadata: &'a SessionMetadata,
    executions: &'a [TestExecution],
}

/// Successful response body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadResponse {
    pub total_records: usize,
    #[serde(default)]
    pub receipt_id: Option<String>,
}

/// Serialized request body, ready to send
#[derive(Debug)]
pub(crate) struct EncodedPayload {
    pub body: Vec<u8>,
    pub compressed: bool,
    /// Size of the JSON before compression
    pub raw_len: usize,
}

/// Serialize `batch`, compressing when `compress_above` is set and the JSON
/// is larger than it.
pub(crate) fn encode(
    session: &SessionMetadata,
    batch: &TestBatch,
    compress_above: Option<usize>,
) -> Result<EncodedPayload> {
    let json = serde_json::to_vec(&UploadRequest {
        session_metadata: session,
        executions: &batch.executions,
    })?;
    let raw_len = json.len();

    match compress_above {
        Some(threshold) if raw_len > threshold => Ok(EncodedPayload {
            body: gzip(&json)?,
            compressed: true,
            raw_len,
        }),
        _ => Ok(EncodedPayload {
            body: json,
            compressed: false,
            raw_len,
        }),
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 4), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}
