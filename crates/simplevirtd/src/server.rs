//! Control socket: bind, permissions, per-connection request loop, and
//! signal-driven teardown.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use nix::unistd::Group;
use simplevirt_proto::{read_frame, write_frame, Request, Response, ResponseData, PROTOCOL_VERSION};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::error::Result;
use crate::netdev::TAP_GROUP;
use crate::supervisor::Supervisor;

/// Bind the control socket, start the supervisor, and serve requests
/// until SIGINT/SIGTERM.
pub async fn serve(
    config_dir: PathBuf,
    runtime_dir: PathBuf,
    socket: PathBuf,
) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(config_dir, runtime_dir).await?;

    let group = Group::from_name(TAP_GROUP)
        .with_context(|| format!("failed to look up group {TAP_GROUP}"))?
        .with_context(|| format!("group {TAP_GROUP} does not exist"))?;

    let listener = UnixListener::bind(&socket)
        .with_context(|| format!("failed to bind {}", socket.display()))?;

    // clients authenticate by group membership: 0660, group simplevirt
    std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(0o660))
        .with_context(|| format!("failed to chmod {}", socket.display()))?;
    std::os::unix::fs::chown(&socket, None, Some(group.gid.as_raw()))
        .with_context(|| format!("failed to chown {}", socket.display()))?;

    spawn_signal_handler(supervisor.clone(), socket.clone())?;

    info!("listening on {}", socket.display());

    loop {
        let (stream, _) = listener.accept().await.context("accept failed")?;
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            handle_connection(stream, supervisor).await;
        });
    }
}

fn spawn_signal_handler(supervisor: Arc<Supervisor>, socket: PathBuf) -> anyhow::Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        let caught = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };

        info!("caught {caught}: shutting down virtual machines");
        supervisor.cleanup().await;

        let _ = std::fs::remove_file(&socket);
        std::process::exit(0);
    });

    Ok(())
}

/// One task per client: read request frames until the peer hangs up.
async fn handle_connection(mut stream: UnixStream, supervisor: Arc<Supervisor>) {
    loop {
        let request: Request = match read_frame(&mut stream).await {
            Ok(request) => request,
            // client closed the connection (or sent garbage)
            Err(_) => return,
        };

        let response = dispatch(&supervisor, request).await;

        if let Err(e) = write_frame(&mut stream, &response).await {
            error!("ipc: failed to write response: {e:#}");
            return;
        }
    }
}

async fn dispatch(supervisor: &Arc<Supervisor>, request: Request) -> Response {
    match request {
        Request::GetProtocolVersion => Response::ok_with_data(ResponseData::Version {
            version: PROTOCOL_VERSION,
        }),

        Request::StartVm { name } => {
            info!("ipc: StartVM({name:?})");
            respond(supervisor.start(&name, None).await)
        }

        // shutdown and reset are synchronous for the caller: wait for the
        // reconciler tick that executes them
        Request::ShutdownVm { name } => {
            info!("ipc: ShutdownVM({name:?})");
            let (tx, rx) = oneshot::channel();
            match supervisor.shutdown(&name, Some(tx)).await {
                Ok(()) => await_op_result(rx).await,
                Err(e) => {
                    error!("ipc: {e}");
                    Response::error(e.to_string())
                }
            }
        }

        Request::ResetVm { name } => {
            info!("ipc: ResetVM({name:?})");
            let (tx, rx) = oneshot::channel();
            match supervisor.reset(&name, Some(tx)).await {
                Ok(()) => await_op_result(rx).await,
                Err(e) => {
                    error!("ipc: {e}");
                    Response::error(e.to_string())
                }
            }
        }

        Request::ListVms => {
            info!("ipc: ListVMs()");
            match supervisor.list().await {
                Ok(names) => Response::ok_with_data(ResponseData::Names { names }),
                Err(e) => {
                    error!("ipc: {e}");
                    Response::error(e.to_string())
                }
            }
        }

        Request::GetVmStatus { name } => {
            info!("ipc: GetVMStatus({name:?})");
            match supervisor.list().await {
                Ok(names) if names.contains(&name) => {
                    Response::ok_with_data(ResponseData::Status {
                        status: supervisor.status(&name).await,
                    })
                }
                Ok(_) => Response::error(format!("virtual machine not found: {name}")),
                Err(e) => {
                    error!("ipc: {e}");
                    Response::error(e.to_string())
                }
            }
        }
    }
}

async fn await_op_result(rx: oneshot::Receiver<Result<()>>) -> Response {
    match rx.await {
        Ok(outcome) => respond(outcome),
        // a newer request displaced ours before the reconciler got to it
        Err(_) => Response::error("operation superseded before it was executed"),
    }
}

fn respond(outcome: Result<()>) -> Response {
    match outcome {
        Ok(()) => Response::ok(),
        Err(e) => {
            error!("ipc: {e}");
            Response::error(e.to_string())
        }
    }
}
