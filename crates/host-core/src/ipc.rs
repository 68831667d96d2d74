//! Local IPC between the privileged service and per-session UI helpers.
//!
//! Frames are 4-byte big-endian length prefixed JSON documents. This pipe is
//! a privilege boundary: both directions enforce the IPC frame-size cap and
//! drop the channel on the first malformed document instead of guessing.
//!
//! A helper introduces itself with [`UiToService::Hello`] carrying its OS
//! session id before anything else; the service side refuses channels that
//! do not.

use std::path::{Path, PathBuf};

use fv_types::{
    ipc::{ServiceToUi, UiToService},
    SessionId,
};
use peer_net::frame::{read_frame, write_frame, MAX_IPC_FRAME};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::debug;

use crate::error::{HostError, HostResult};

/// How long a freshly accepted channel has to identify itself.
pub const HELLO_DEADLINE: Duration = Duration::from_secs(10);

/// Events delivered off the service side of an IPC channel.
#[derive(Debug)]
pub enum IpcEvent {
    Message(UiToService),
    Disconnected,
}

enum Outgoing<T> {
    Message(T),
    Close,
}

/// Cloneable sending half of the service side.
#[derive(Clone)]
pub struct IpcSender {
    tx: mpsc::UnboundedSender<Outgoing<ServiceToUi>>,
}

impl IpcSender {
    pub fn send(&self, message: ServiceToUi) -> HostResult<()> {
        self.tx
            .send(Outgoing::Message(message))
            .map_err(|_| HostError::Net(peer_net::NetError::ChannelClosed))
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Service side of one helper connection, bound to an OS session.
pub struct IpcChannel {
    session_id: SessionId,
    sender: IpcSender,
    events: mpsc::UnboundedReceiver<IpcEvent>,
}

impl IpcChannel {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn sender(&self) -> IpcSender {
        self.sender.clone()
    }

    pub async fn recv(&mut self) -> Option<IpcEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (SessionId, IpcSender, mpsc::UnboundedReceiver<IpcEvent>) {
        (self.session_id, self.sender, self.events)
    }
}

/// Wrap an accepted stream: wait for the hello, then start the pumps.
pub async fn accept_stream<S>(stream: S) -> HostResult<IpcChannel>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut stream = stream;

    let session_id = tokio::time::timeout(HELLO_DEADLINE, async {
        let payload = read_frame(&mut stream, MAX_IPC_FRAME)
            .await?
            .ok_or(HostError::MissingHello)?;
        match serde_json::from_slice::<UiToService>(&payload)? {
            UiToService::Hello { session_id } => Ok(session_id),
            _ => Err(HostError::MissingHello),
        }
    })
    .await
    .map_err(|_| HostError::MissingHello)??;

    let (tx, events) = spawn_typed_pumps::<_, ServiceToUi, UiToService>(stream);
    Ok(IpcChannel {
        session_id,
        sender: IpcSender { tx },
        events,
    })
}

/// Events delivered off the helper side of an IPC channel.
#[derive(Debug)]
pub enum UiEvent {
    Message(ServiceToUi),
    Disconnected,
}

/// Helper side of the pipe. The service never constructs this; it exists for
/// the in-session helper process and for exercising the boundary in tests.
pub struct UiChannel {
    tx: mpsc::UnboundedSender<Outgoing<UiToService>>,
    events: mpsc::UnboundedReceiver<UiEvent>,
}

impl UiChannel {
    /// Wrap the helper end of a stream, announcing `session_id` first.
    pub async fn from_stream<S>(stream: S, session_id: SessionId) -> HostResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut stream = stream;
        let hello = serde_json::to_vec(&UiToService::Hello { session_id })?;
        write_frame(&mut stream, &hello, MAX_IPC_FRAME).await?;

        let (tx, events) = spawn_typed_pumps::<_, UiToService, ServiceToUi>(stream);
        Ok(UiChannel { tx, events })
    }

    pub fn send(&self, message: UiToService) -> HostResult<()> {
        self.tx
            .send(Outgoing::Message(message))
            .map_err(|_| HostError::Net(peer_net::NetError::ChannelClosed))
    }

    pub async fn recv(&mut self) -> Option<UiEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

trait DisconnectedEvent {
    fn disconnected() -> Self;
}

impl DisconnectedEvent for IpcEvent {
    fn disconnected() -> Self {
        IpcEvent::Disconnected
    }
}

impl DisconnectedEvent for UiEvent {
    fn disconnected() -> Self {
        UiEvent::Disconnected
    }
}

fn spawn_typed_pumps<S, Out, In>(
    stream: S,
) -> (
    mpsc::UnboundedSender<Outgoing<Out>>,
    mpsc::UnboundedReceiver<<In as IntoEvent>::Event>,
)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + IntoEvent + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing<Out>>();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<<In as IntoEvent>::Event>();
    let (closed_tx, mut closed_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outgoing::Message(message) => {
                    let payload = match serde_json::to_vec(&message) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(error = %e, "failed to encode IPC message");
                            continue;
                        }
                    };
                    if write_frame(&mut write_half, &payload, MAX_IPC_FRAME).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => break,
            }
        }
        let _ = write_half.shutdown().await;
        let _ = closed_tx.send(());
    });

    tokio::spawn(async move {
        let mut reader = read_half;
        loop {
            tokio::select! {
                res = read_frame(&mut reader, MAX_IPC_FRAME) => match res {
                    Ok(Some(payload)) => match serde_json::from_slice::<In>(&payload) {
                        Ok(message) => {
                            if evt_tx.send(message.into_event()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // Malformed documents on a privilege boundary end
                            // the conversation.
                            debug!(error = %e, "dropping IPC channel on malformed message");
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "IPC channel read failed");
                        break;
                    }
                },
                _ = &mut closed_rx => break,
            }
        }
        let _ = evt_tx.send(<In as IntoEvent>::Event::disconnected());
    });

    (out_tx, evt_rx)
}

trait IntoEvent {
    type Event: DisconnectedEvent + Send + 'static;
    fn into_event(self) -> Self::Event;
}

impl IntoEvent for UiToService {
    type Event = IpcEvent;
    fn into_event(self) -> IpcEvent {
        IpcEvent::Message(self)
    }
}

impl IntoEvent for ServiceToUi {
    type Event = UiEvent;
    fn into_event(self) -> UiEvent {
        UiEvent::Message(self)
    }
}

/// Default endpoint for the host IPC socket.
pub fn default_ipc_endpoint() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("farview-host.sock")
}

/// Unix-domain listener the UI helpers connect to.
#[cfg(unix)]
pub struct IpcServer {
    listener: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl IpcServer {
    pub fn bind(path: &Path) -> HostResult<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = tokio::net::UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.path
    }

    /// Accept the next helper connection and complete its hello.
    pub async fn accept(&self) -> HostResult<IpcChannel> {
        let (stream, _addr) = self.listener.accept().await?;
        accept_stream(stream).await
    }
}

/// Connect the helper side over the Unix socket.
#[cfg(unix)]
pub async fn connect_ui(path: &Path, session_id: SessionId) -> HostResult<UiChannel> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    UiChannel::from_stream(stream, session_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hello_binds_the_channel_to_a_session() {
        let (service_stream, helper_stream) = tokio::io::duplex(16 * 1024);

        let accept = tokio::spawn(async move { accept_stream(service_stream).await });
        let helper = UiChannel::from_stream(helper_stream, SessionId(7)).await.unwrap();

        let channel = accept.await.unwrap().unwrap();
        assert_eq!(channel.session_id(), SessionId(7));
        drop(helper);
    }

    #[tokio::test]
    async fn messages_cross_the_boundary_both_ways() {
        let (service_stream, helper_stream) = tokio::io::duplex(16 * 1024);

        let accept = tokio::spawn(async move { accept_stream(service_stream).await });
        let mut helper = UiChannel::from_stream(helper_stream, SessionId(2)).await.unwrap();
        let mut channel = accept.await.unwrap().unwrap();

        helper.send(UiToService::CredentialsRequest).unwrap();
        match channel.recv().await.unwrap() {
            IpcEvent::Message(UiToService::CredentialsRequest) => {}
            other => panic!("unexpected event {other:?}"),
        }

        channel
            .sender()
            .send(ServiceToUi::HostId(fv_types::HostId(42)))
            .unwrap();
        match helper.recv().await.unwrap() {
            UiEvent::Message(ServiceToUi::HostId(id)) => assert_eq!(id, fv_types::HostId(42)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_without_hello_is_refused() {
        let (service_stream, helper_stream) = tokio::io::duplex(16 * 1024);

        let accept = tokio::spawn(async move { accept_stream(service_stream).await });

        // Speak a valid message that is not a hello.
        let mut stream = helper_stream;
        let payload = serde_json::to_vec(&UiToService::CredentialsRequest).unwrap();
        write_frame(&mut stream, &payload, MAX_IPC_FRAME).await.unwrap();

        assert!(matches!(
            accept.await.unwrap(),
            Err(HostError::MissingHello)
        ));
    }

    #[tokio::test]
    async fn helper_drop_emits_disconnected() {
        let (service_stream, helper_stream) = tokio::io::duplex(16 * 1024);

        let accept = tokio::spawn(async move { accept_stream(service_stream).await });
        let helper = UiChannel::from_stream(helper_stream, SessionId(3)).await.unwrap();
        let mut channel = accept.await.unwrap().unwrap();

        helper.close();
        assert!(matches!(channel.recv().await, Some(IpcEvent::Disconnected)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_accepts_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.sock");
        let server = IpcServer::bind(&path).unwrap();

        let connect = tokio::spawn({
            let path = path.clone();
            async move { connect_ui(&path, SessionId(1)).await }
        });

        let channel = server.accept().await.unwrap();
        assert_eq!(channel.session_id(), SessionId(1));
        connect.await.unwrap().unwrap();
    }
}
