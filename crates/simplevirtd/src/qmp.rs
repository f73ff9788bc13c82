//! QMP client for the hypervisor's line-JSON monitor socket.
//!
//! One full command per connection: read the greeting, leave capability
//! negotiation, execute, close. No state is kept between calls.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::value::RawValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{Error, Result};

pub struct Qmp {
    socket: PathBuf,
}

#[derive(Debug, Deserialize)]
struct QmpError {
    class: String,
    desc: String,
}

#[derive(Deserialize)]
struct QmpResponse {
    #[serde(rename = "return")]
    ret: Option<Box<RawValue>>,
    error: Option<QmpError>,
    #[serde(rename = "QMP")]
    greeting: Option<serde_json::Value>,
}

/// Reply to `query-status`. Extra fields in the hypervisor's answer are
/// ignored.
#[derive(Debug, Deserialize)]
pub struct QueryStatus {
    pub status: String,
    pub running: bool,
}

impl Qmp {
    pub fn new(socket: PathBuf) -> Self {
        Qmp { socket }
    }

    pub async fn powerdown(&self) -> Result<()> {
        self.send_command("system_powerdown").await.map(|_| ())
    }

    pub async fn reset(&self) -> Result<()> {
        self.send_command("system_reset").await.map(|_| ())
    }

    pub async fn query_status(&self) -> Result<QueryStatus> {
        let ret = self.send_command("query-status").await?;
        let ret = ret.ok_or(Error::MonitorHandshake)?;
        Ok(serde_json::from_str(ret.get())?)
    }

    /// Dial the monitor socket, perform the handshake, and execute one
    /// command. Returns the `return` value verbatim, if any.
    async fn send_command(&self, command: &str) -> Result<Option<Box<RawValue>>> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(Error::MonitorUnreachable)?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let greeting = read_response(&mut reader).await?;
        if greeting.greeting.is_none() {
            return Err(Error::MonitorHandshake);
        }

        call(&mut reader, &mut write_half, "qmp_capabilities").await?;
        call(&mut reader, &mut write_half, command).await
    }
}

async fn call<R, W>(reader: &mut R, writer: &mut W, command: &str) -> Result<Option<Box<RawValue>>>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut cmd = serde_json::to_vec(&serde_json::json!({ "execute": command }))?;
    cmd.push(b'\n');
    writer.write_all(&cmd).await?;
    writer.flush().await?;

    let resp = read_response(reader).await?;
    if let Some(QmpError { class, desc }) = resp.error {
        return Err(Error::MonitorCommand { class, desc });
    }

    Ok(resp.ret)
}

async fn read_response<R>(reader: &mut R) -> Result<QmpResponse>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::MonitorHandshake);
    }
    Ok(serde_json::from_str(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixListener;

    /// One-shot fake monitor: greets, acks capabilities, answers the next
    /// command with `reply`. Takes an already-bound listener so callers
    /// never race the bind.
    async fn fake_monitor(listener: UnixListener, reply: &'static str) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.contains("qmp_capabilities"), "got: {line}");
        write_half.write_all(b"{\"return\": {}}\n").await.unwrap();

        line.clear();
        reader.read_line(&mut line).await.unwrap();
        write_half.write_all(reply.as_bytes()).await.unwrap();
        write_half.write_all(b"\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_query_status() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("vm.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(fake_monitor(
            listener,
            r#"{"return": {"status": "running", "running": true}}"#,
        ));

        let status = Qmp::new(socket).query_status().await.unwrap();
        assert_eq!(status.status, "running");
        assert!(status.running);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_command_error_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("vm.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(fake_monitor(
            listener,
            r#"{"error": {"class": "CommandNotFound", "desc": "The command foo has not been found"}}"#,
        ));

        let err = Qmp::new(socket).powerdown().await.unwrap_err();
        match err {
            Error::MonitorCommand { class, desc } => {
                assert_eq!(class, "CommandNotFound");
                assert_eq!(desc, "The command foo has not been found");
            }
            other => panic!("unexpected error: {other}"),
        }

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_greeting_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("vm.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (_read_half, mut write_half) = stream.into_split();
            write_half.write_all(b"{\"not-qmp\": true}\n").await.unwrap();
        });

        let err = Qmp::new(socket).powerdown().await.unwrap_err();
        assert!(matches!(err, Error::MonitorHandshake), "got: {err}");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_socket() {
        let dir = tempfile::tempdir().unwrap();
        let err = Qmp::new(dir.path().join("gone.sock"))
            .query_status()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MonitorUnreachable(_)), "got: {err}");
    }
}
