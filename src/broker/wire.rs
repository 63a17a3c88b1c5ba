//! Wire protocol for the broker gateway socket.
//!
//! Length-prefixed JSON frames over one duplex connection. Requests are
//! tagged with a session-scoped monotonic id; multi-part responses end
//! with an explicit `End` frame. Timeouts and error codes map to
//! {transient, fatal} through a fixed table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::models::Timeframe;

/// Hard ceiling on a single frame, guards against a corrupt length
/// prefix.
pub const MAX_FRAME_BYTES: u32 = 1 << 20;

// =============================================================================
// CONTRACTS & BARS
// =============================================================================

/// Instrument description sent with data requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpec {
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
}

impl ContractSpec {
    pub fn stock(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            sec_type: "STK".into(),
            exchange: "SMART".into(),
            currency: "USD".into(),
        }
    }
}

/// Bar payload as it crosses the wire. Session and quality metadata are
/// attached downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

// =============================================================================
// FRAMES
// =============================================================================

/// Frames sent by this side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect {
        client_id: u32,
    },
    HistoricalBars {
        request_id: u64,
        contract: ContractSpec,
        bar_size: Timeframe,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        what_to_show: String,
    },
    SubscribeMarketData {
        request_id: u64,
        contract: ContractSpec,
    },
    AccountInfo {
        request_id: u64,
    },
    Cancel {
        request_id: u64,
    },
    Ping,
    Disconnect,
}

/// Frames received from the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectAck {
        server_version: u32,
    },
    ConnectReject {
        code: u32,
        message: String,
    },
    Bar {
        request_id: u64,
        bar: WireBar,
    },
    Tick {
        request_id: u64,
        price: f64,
        size: i64,
        timestamp: DateTime<Utc>,
    },
    AccountSummary {
        request_id: u64,
        tag: String,
        value: String,
    },
    /// Terminator for a multi-part response.
    End {
        request_id: u64,
    },
    Error {
        request_id: Option<u64>,
        code: u32,
        message: String,
    },
    Pong,
}

impl ServerFrame {
    /// Which request stream a frame belongs to, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerFrame::Bar { request_id, .. }
            | ServerFrame::Tick { request_id, .. }
            | ServerFrame::AccountSummary { request_id, .. }
            | ServerFrame::End { request_id } => Some(*request_id),
            ServerFrame::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

// =============================================================================
// ERROR CLASSIFICATION
// =============================================================================

/// Retry class of a broker-signalled error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Throttled,
    Fatal,
}

/// Fixed error-code table. Codes follow the gateway's convention:
/// pacing violations are back-pressure, symbol and validation failures
/// are permanent, connectivity blips are retryable. Unknown codes are
/// treated as transient and burn a retry attempt.
pub fn classify_error(code: u32) -> ErrorClass {
    match code {
        // pacing violation
        420 => ErrorClass::Throttled,
        // no security definition found
        200 => ErrorClass::Fatal,
        // error validating request fields
        321 => ErrorClass::Fatal,
        // authentication failed
        140 => ErrorClass::Fatal,
        // historical data service error, retryable
        162 => ErrorClass::Transient,
        // couldn't connect / not connected / connectivity lost
        502 | 504 | 1100 | 1102 => ErrorClass::Transient,
        _ => ErrorClass::Transient,
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Write one frame: u32 big-endian length prefix, then the JSON body.
pub async fn write_frame<W, F>(writer: &mut W, frame: &F) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    F: Serialize,
{
    let body = serde_json::to_vec(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = body.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Read one frame. Returns `None` on a clean EOF at a frame boundary.
pub async fn read_frame<R, F>(reader: &mut R) -> std::io::Result<Option<F>>
where
    R: AsyncRead + Unpin,
    F: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let frame = serde_json::from_slice(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn frame_roundtrip() {
        let frame = ClientFrame::HistoricalBars {
            request_id: 7,
            contract: ContractSpec::stock("MSTR"),
            bar_size: Timeframe::Min1,
            range_start: Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap(),
            range_end: Utc.with_ymd_and_hms(2024, 1, 15, 21, 0, 0).unwrap(),
            what_to_show: "TRADES".into(),
        };
        let mut writer = std::io::Cursor::new(Vec::new());
        write_frame(&mut writer, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(writer.into_inner());
        let back: ClientFrame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame, back);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let frame: Option<ServerFrame> = read_frame(&mut cursor).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result: std::io::Result<Option<ServerFrame>> = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn multiple_frames_in_one_stream() {
        let mut writer = std::io::Cursor::new(Vec::new());
        write_frame(&mut writer, &ServerFrame::ConnectAck { server_version: 176 }).await.unwrap();
        write_frame(&mut writer, &ServerFrame::End { request_id: 3 }).await.unwrap();

        let mut cursor = std::io::Cursor::new(writer.into_inner());
        let first: ServerFrame = read_frame(&mut cursor).await.unwrap().unwrap();
        let second: ServerFrame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first, ServerFrame::ConnectAck { server_version: 176 });
        assert_eq!(second.request_id(), Some(3));
    }

    #[test]
    fn error_table_buckets() {
        assert_eq!(classify_error(420), ErrorClass::Throttled);
        assert_eq!(classify_error(200), ErrorClass::Fatal);
        assert_eq!(classify_error(321), ErrorClass::Fatal);
        assert_eq!(classify_error(1100), ErrorClass::Transient);
        // unknown codes retry until the attempt cap
        assert_eq!(classify_error(9999), ErrorClass::Transient);
    }
}
