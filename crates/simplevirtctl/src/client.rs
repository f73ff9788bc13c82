//! Connection to the daemon's control socket.

use std::path::Path;

use anyhow::{Context, Result};
use simplevirt_proto::{
    read_frame, write_frame, Request, Response, ResponseData, PROTOCOL_VERSION,
};
use tokio::net::UnixStream;

#[derive(Debug)]
pub struct Client {
    stream: UnixStream,
}

/// Outcome of one server call: `Failure` carries the server-reported
/// message and maps to exit code 1; transport errors stay `anyhow` and
/// map to exit code 2.
pub enum Outcome<T> {
    Success(T),
    Failure(String),
}

impl Client {
    /// Connect and verify the protocol version. A mismatch is a hard
    /// error.
    pub async fn connect(socket: &Path) -> Result<Client> {
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("failed to connect to {}", socket.display()))?;
        let mut client = Client { stream };

        let version = client.protocol_version().await?;
        if version != PROTOCOL_VERSION {
            anyhow::bail!("simplevirtctl: unsupported protocol version: {version}");
        }

        Ok(client)
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        write_frame(&mut self.stream, &request).await?;
        read_frame(&mut self.stream).await
    }

    async fn protocol_version(&mut self) -> Result<i64> {
        match self.call(Request::GetProtocolVersion).await? {
            Response::Ok {
                data: Some(ResponseData::Version { version }),
            } => Ok(version),
            other => anyhow::bail!("unexpected protocol version response: {other:?}"),
        }
    }

    pub async fn start_vm(&mut self, name: &str) -> Result<Outcome<()>> {
        self.simple_call(Request::StartVm {
            name: name.to_string(),
        })
        .await
    }

    pub async fn shutdown_vm(&mut self, name: &str) -> Result<Outcome<()>> {
        self.simple_call(Request::ShutdownVm {
            name: name.to_string(),
        })
        .await
    }

    pub async fn reset_vm(&mut self, name: &str) -> Result<Outcome<()>> {
        self.simple_call(Request::ResetVm {
            name: name.to_string(),
        })
        .await
    }

    pub async fn list_vms(&mut self) -> Result<Outcome<Vec<String>>> {
        match self.call(Request::ListVms).await? {
            Response::Ok {
                data: Some(ResponseData::Names { names }),
            } => Ok(Outcome::Success(names)),
            Response::Error { message } => Ok(Outcome::Failure(message)),
            other => anyhow::bail!("unexpected response: {other:?}"),
        }
    }

    pub async fn vm_status(&mut self, name: &str) -> Result<Outcome<String>> {
        let request = Request::GetVmStatus {
            name: name.to_string(),
        };
        match self.call(request).await? {
            Response::Ok {
                data: Some(ResponseData::Status { status }),
            } => Ok(Outcome::Success(status)),
            Response::Error { message } => Ok(Outcome::Failure(message)),
            other => anyhow::bail!("unexpected response: {other:?}"),
        }
    }

    async fn simple_call(&mut self, request: Request) -> Result<Outcome<()>> {
        match self.call(request).await? {
            Response::Ok { .. } => Ok(Outcome::Success(())),
            Response::Error { message } => Ok(Outcome::Failure(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Fake daemon that answers the version handshake with `version`,
    /// then echoes a canned response to the next request.
    async fn fake_daemon(listener: UnixListener, version: i64, reply: Response) {
        let (mut stream, _) = listener.accept().await.unwrap();

        let request: Request = read_frame(&mut stream).await.unwrap();
        assert!(matches!(request, Request::GetProtocolVersion));
        write_frame(
            &mut stream,
            &Response::ok_with_data(ResponseData::Version { version }),
        )
        .await
        .unwrap();

        if read_frame::<_, Request>(&mut stream).await.is_ok() {
            write_frame(&mut stream, &reply).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_connect_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ctl.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(fake_daemon(
            listener,
            PROTOCOL_VERSION,
            Response::ok_with_data(ResponseData::Names {
                names: vec!["aaa".to_string(), "bbb".to_string()],
            }),
        ));

        let mut client = Client::connect(&socket).await.unwrap();
        match client.list_vms().await.unwrap() {
            Outcome::Success(names) => assert_eq!(names, ["aaa", "bbb"]),
            Outcome::Failure(message) => panic!("unexpected failure: {message}"),
        }

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ctl.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(fake_daemon(listener, 99, Response::ok()));

        let err = Client::connect(&socket).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "simplevirtctl: unsupported protocol version: 99"
        );

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_failure_reported() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ctl.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(fake_daemon(
            listener,
            PROTOCOL_VERSION,
            Response::error("monitor: \"ghost\" not running"),
        ));

        let mut client = Client::connect(&socket).await.unwrap();
        match client.shutdown_vm("ghost").await.unwrap() {
            Outcome::Failure(message) => {
                assert_eq!(message, "monitor: \"ghost\" not running")
            }
            Outcome::Success(()) => panic!("expected failure"),
        }

        server.await.unwrap();
    }
}
