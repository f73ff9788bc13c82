//! Control-plane protocol for simplevirtd and its clients.
//!
//! Messages are length-prefixed JSON frames:
//! - 4 bytes: message length (u32 big-endian)
//! - N bytes: JSON payload

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MAX_FRAME_SIZE: u32 = 1024 * 1024; // 1MB

/// Protocol version exchanged on connect. A client talking to a daemon
/// with a different version must refuse to continue.
pub const PROTOCOL_VERSION: i64 = 0;

/// Request from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Protocol version handshake, sent once after connecting.
    GetProtocolVersion,

    /// Register a virtual machine for supervision and start it.
    StartVm { name: String },

    /// Shut a virtual machine down and drop it from supervision.
    /// Synchronous: the response arrives after the guest has exited.
    ShutdownVm { name: String },

    /// Send an ACPI reset to a running virtual machine.
    ResetVm { name: String },

    /// List known virtual machines (configured and/or supervised).
    ListVms,

    /// Report the monitor status of one virtual machine.
    GetVmStatus { name: String },
}

/// Response from the daemon.
///
/// The tag is `result` rather than `status` because `GetVmStatus`
/// responses carry a `status` data field of their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(flatten)]
        data: Option<ResponseData>,
    },

    Error { message: String },
}

/// Additional data in successful responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    Version { version: i64 },
    Names { names: Vec<String> },
    Status { status: String },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok { data: None }
    }

    pub fn ok_with_data(data: ResponseData) -> Self {
        Response::Ok { data: Some(data) }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

/// Read a length-prefixed JSON frame from an async reader.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let len = reader
        .read_u32()
        .await
        .context("failed to read frame length")?;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame size {} exceeds maximum {}", len, MAX_FRAME_SIZE);
    }

    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .context("failed to read frame payload")?;

    serde_json::from_slice(&buf).context("failed to deserialize frame")
}

/// Write a length-prefixed JSON frame to an async writer.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(value).context("failed to serialize frame")?;
    let len = json.len() as u32;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame size {} exceeds maximum {}", len, MAX_FRAME_SIZE);
    }

    writer
        .write_u32(len)
        .await
        .context("failed to write frame length")?;
    writer
        .write_all(&json)
        .await
        .context("failed to write frame payload")?;
    writer.flush().await.context("failed to flush frame")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_roundtrip() {
        let req = Request::StartVm {
            name: "bola".to_string(),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Request = read_frame(&mut cursor).await.unwrap();

        match decoded {
            Request::StartVm { name } => assert_eq!(name, "bola"),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Result<Request> = read_frame(&mut cursor).await;
        assert!(decoded.is_err());
    }

    #[test]
    fn test_request_wire_shape() {
        let json = serde_json::to_string(&Request::GetVmStatus {
            name: "web01".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"get_vm_status","name":"web01"}"#);

        let json = serde_json::to_string(&Request::ListVms).unwrap();
        assert_eq!(json, r#"{"type":"list_vms"}"#);
    }

    #[test]
    fn test_response_wire_shape() {
        let json = serde_json::to_string(&Response::ok()).unwrap();
        assert_eq!(json, r#"{"result":"ok"}"#);

        let json = serde_json::to_string(&Response::ok_with_data(ResponseData::Status {
            status: "running".to_string(),
        }))
        .unwrap();
        assert_eq!(json, r#"{"result":"ok","status":"running"}"#);

        let decoded: Response = serde_json::from_str(&json).unwrap();
        match decoded {
            Response::Ok {
                data: Some(ResponseData::Status { status }),
            } => assert_eq!(status, "running"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_version_response() {
        let json = serde_json::to_string(&Response::ok_with_data(ResponseData::Version {
            version: PROTOCOL_VERSION,
        }))
        .unwrap();
        let decoded: Response = serde_json::from_str(&json).unwrap();
        match decoded {
            Response::Ok {
                data: Some(ResponseData::Version { version }),
            } => assert_eq!(version, 0),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
