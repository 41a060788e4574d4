//! Exchange frame codec.
//!
//! Layout: `magic "QXF1" | u32 version | u32 header_len | header JSON |
//! payload`, integers little-endian. The payload is an Arrow IPC stream: one
//! batch for `Data` frames, schema only for `End` frames.

use std::io::Cursor;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use quarry_common::{QuarryError, QueryId, Result};
use serde::{Deserialize, Serialize};

pub const FRAME_MAGIC: &[u8; 4] = b"QXF1";
pub const FRAME_VERSION: u32 = 1;
const FRAME_PREFIX_LEN: usize = 12;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// One batch; `seq` numbers it within `(producer_task, partition)`.
    Data,
    /// Producer finished the partition after `batches` data frames.
    End { batches: u64 },
}

/// Routing and dedup identity of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub query_id: QueryId,
    pub stage_id: u64,
    pub partition: usize,
    /// Producer partition index, identical across attempts of the same
    /// producer.
    pub producer_task: u64,
    /// Attempt of the producer task that sent the frame. Receivers keep only
    /// the newest attempt's frames, since a retry may slice its output
    /// differently.
    pub attempt: u32,
    pub seq: u64,
    pub kind: FrameKind,
}

/// Header plus Arrow IPC payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl ExchangeFrame {
    /// Data frame holding `batch`.
    pub fn data(header: FrameHeader, batch: &RecordBatch) -> Result<Self> {
        Ok(Self {
            payload: encode_ipc(&batch.schema(), std::slice::from_ref(batch))?,
            header: FrameHeader {
                kind: FrameKind::Data,
                ..header
            },
        })
    }

    /// End-of-partition frame carrying the producer's batch total and the
    /// schema.
    pub fn end(header: FrameHeader, batches: u64, schema: &SchemaRef) -> Result<Self> {
        Ok(Self {
            payload: encode_ipc(schema, &[])?,
            header: FrameHeader {
                kind: FrameKind::End { batches },
                ..header
            },
        })
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.header)
            .map_err(|e| QuarryError::Execution(format!("frame header encode failed: {e}")))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| QuarryError::Execution("frame header too large".to_string()))?;
        let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + header.len() + self.payload.len());
        out.extend_from_slice(FRAME_MAGIC);
        out.extend_from_slice(&FRAME_VERSION.to_le_bytes());
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_PREFIX_LEN {
            return Err(QuarryError::Execution(
                "exchange frame is too small to contain a header".to_string(),
            ));
        }
        if &bytes[0..4] != FRAME_MAGIC {
            return Err(QuarryError::Execution("invalid exchange frame magic".to_string()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FRAME_VERSION {
            return Err(QuarryError::Execution(format!(
                "unsupported exchange frame version {version}"
            )));
        }
        let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let header_end = FRAME_PREFIX_LEN + len;
        if bytes.len() < header_end {
            return Err(QuarryError::Execution(
                "exchange frame header length is invalid".to_string(),
            ));
        }
        let header = serde_json::from_slice(&bytes[FRAME_PREFIX_LEN..header_end])
            .map_err(|e| QuarryError::Execution(format!("frame header decode failed: {e}")))?;
        Ok(Self {
            header,
            payload: bytes[header_end..].to_vec(),
        })
    }

    /// Batches carried by the payload (empty for `End`).
    pub fn batches(&self) -> Result<Vec<RecordBatch>> {
        Ok(decode_ipc(&self.payload)?.1)
    }

    /// Schema of the payload.
    pub fn schema(&self) -> Result<SchemaRef> {
        Ok(decode_ipc(&self.payload)?.0)
    }
}

fn encode_ipc(schema: &Schema, batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut out, schema)
            .map_err(|e| QuarryError::Execution(format!("ipc writer init failed: {e}")))?;
        for b in batches {
            writer
                .write(b)
                .map_err(|e| QuarryError::Execution(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| QuarryError::Execution(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

fn decode_ipc(bytes: &[u8]) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| QuarryError::Execution(format!("ipc reader init failed: {e}")))?;
    let schema = reader.schema();
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| QuarryError::Execution(format!("ipc read failed: {e}")))?;
    Ok((schema, batches))
}
