//! Length-framed JSON protocol between the dispatcher and worker processes.
//!
//! Every message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON payload. Reserving the child's stdout for this protocol (rather than
//! letting test output flow through it directly) means captured stdout/
//! stderr travel as [`WorkerMessage::Stdout`]/[`WorkerMessage::Stderr`]
//! messages instead of being interleaved with framed bytes.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::model::{TestError, TestId, TestStatus, Variant};

/// Errors from framing or decoding a protocol message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error on protocol channel: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed protocol message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("protocol channel closed")]
    Closed,
}

/// A group assignment sent to a worker: tests sharing `(file, variant)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupAssignment {
    pub group_id: u64,
    pub file: std::path::PathBuf,
    pub variant: Variant,
    pub test_ids: Vec<TestId>,
    pub repeat_index: u32,
    pub retry_index: u32,
}

/// Parent → worker messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum ParentMessage {
    /// Sent once at worker startup.
    Init {
        worker_index: usize,
        config_snapshot: serde_json::Value,
        variant: Variant,
    },
    /// Assigns a test group to run.
    Run { group: GroupAssignment },
    /// Cooperative shutdown: worker drains `afterAll`s then exits 0.
    Stop,
}

/// The outcome of one test attempt, as reported by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEndResult {
    pub status: TestStatus,
    pub error: Option<TestError>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub data: HashMap<String, serde_json::Value>,
    pub annotations: Vec<String>,
    pub timed_out: bool,
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Worker → parent messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// The worker has initialized and is ready for a `run` assignment.
    Ready,
    /// A test has started executing.
    TestBegin {
        test_id: TestId,
        start_wall_clock: chrono::DateTime<chrono::Utc>,
    },
    /// Captured stdout for a test, or `test_id: None` if output could not be
    /// attributed to a test in-flight.
    Stdout { test_id: Option<TestId>, text: String },
    /// Captured stderr, same attribution rule as [`WorkerMessage::Stdout`].
    Stderr { test_id: Option<TestId>, text: String },
    /// A test has finished its current attempt.
    TestEnd {
        test_id: TestId,
        result: TestEndResult,
    },
    /// The assigned group finished cleanly, including `afterAll`.
    Done { group_id: u64 },
    /// Unrecoverable error; the parent treats this identically to a crash.
    FatalError { message: String },
}

/// Writes one length-framed JSON message.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-framed JSON message, or `Ok(None)` on clean EOF before
/// any bytes of the next frame arrive.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let message = serde_json::from_slice(&payload)?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_worker_message() {
        let mut buf = Vec::new();
        let msg = WorkerMessage::TestBegin {
            test_id: 7,
            start_wall_clock: chrono::Utc::now(),
        };
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: WorkerMessage = read_message(&mut cursor).await.unwrap().unwrap();
        match decoded {
            WorkerMessage::TestBegin { test_id, .. } => assert_eq!(test_id, 7),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_message_returns_none_on_clean_eof() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let decoded: Option<WorkerMessage> = read_message(&mut cursor).await.unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn round_trips_a_parent_message_with_group_assignment() {
        let mut buf = Vec::new();
        let msg = ParentMessage::Run {
            group: GroupAssignment {
                group_id: 1,
                file: "a.test.js".into(),
                variant: Variant::default(),
                test_ids: vec![1, 2, 3],
                repeat_index: 0,
                retry_index: 0,
            },
        };
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: ParentMessage = read_message(&mut cursor).await.unwrap().unwrap();
        match decoded {
            ParentMessage::Run { group } => assert_eq!(group.test_ids, vec![1, 2, 3]),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
