//! Request/response dispatch over a transport channel.

use futures::future::{self, BoxFuture, FutureExt};
use log::debug;
use std::sync::Arc;

use crate::channel::TransportChannel;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameKind};
use crate::protocol::{Command, Response};

/// Command execution, as seen by the client.
#[cfg_attr(test, mockall::automock)]
pub trait Dispatcher: Send + Sync {
    fn execute(&self, command: Command) -> BoxFuture<'static, Result<Response>>;
}

/// Turns commands into request frames and decodes the replies.
///
/// Holds no per-request state of its own: the pending replies live in the
/// channel, keyed by the correlation id allocated here. No retries.
pub struct CommandManager {
    channel: Arc<TransportChannel>,
}

impl CommandManager {
    pub fn new(channel: Arc<TransportChannel>) -> Self {
        Self { channel }
    }
}

fn decode_reply(reply: Frame) -> Result<Response> {
    match reply.kind {
        FrameKind::Response => Response::parse(reply.payload_str()?),
        FrameKind::Error => Err(Error::protocol(
            String::from_utf8_lossy(&reply.payload).into_owned(),
        )),
        other => Err(Error::invalid_response(format!(
            "unexpected {:?} frame in reply to a command",
            other
        ))),
    }
}

impl Dispatcher for CommandManager {
    fn execute(&self, command: Command) -> BoxFuture<'static, Result<Response>> {
        if self.channel.is_closed() {
            return future::ready(Err(Error::connection_closed(format!(
                "channel to {} is closed",
                self.channel.peer()
            ))))
            .boxed();
        }
        let id = self.channel.next_correlation_id();
        debug!("Dispatching {} as request {}", command.name(), id);
        let frame = Frame::request(id, command.encode().into_bytes());
        let channel = Arc::clone(&self.channel);
        async move { decode_reply(channel.send(frame).await?) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, write_frame, FrameCodec};
    use crate::resource::SharedResource;
    use tokio::io::DuplexStream;
    use tokio::runtime::Handle;

    fn dispatcher() -> (Arc<TransportChannel>, CommandManager, DuplexStream) {
        let resource = SharedResource::from_handle(Handle::current());
        let (client, server) = tokio::io::duplex(4096);
        let channel =
            TransportChannel::from_stream(client, "test", FrameCodec::Cbor, &resource).unwrap();
        let manager = CommandManager::new(Arc::clone(&channel));
        (channel, manager, server)
    }

    async fn reply_once(server: &mut DuplexStream, kind: FrameKind, payload: &str) -> String {
        let frame = read_frame(server, FrameCodec::Cbor).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Request);
        let line = frame.payload_str().unwrap().to_string();
        let reply = Frame::new(frame.id, kind, payload.as_bytes().to_vec());
        write_frame(server, FrameCodec::Cbor, &reply).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_execute_sends_encoded_command() {
        let (_channel, manager, mut server) = dispatcher();
        let command = Command::Set { key: "k".into(), value: "v w".into() };

        let (response, line) = tokio::join!(
            manager.execute(command),
            reply_once(&mut server, FrameKind::Response, "OK\r\n")
        );
        assert_eq!(line, "SET k v w");
        assert_eq!(response.unwrap(), Response::Ok);
    }

    #[tokio::test]
    async fn test_error_frame_becomes_protocol_error() {
        let (_channel, manager, mut server) = dispatcher();
        let (response, _) = tokio::join!(
            manager.execute(Command::Increment { key: "name".into(), amount: None }),
            reply_once(&mut server, FrameKind::Error, "value is not an integer")
        );
        assert!(matches!(
            response,
            Err(Error::Protocol { ref message }) if message == "value is not an integer"
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_fails_without_submitting() {
        let (channel, manager, mut server) = dispatcher();
        channel.close();

        let err = manager.execute(Command::Ping).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { .. }));

        // Nothing reached the wire
        let next = read_frame(&mut server, FrameCodec::Cbor).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        let (channel, manager, _server) = dispatcher();
        let pending = tokio::spawn(manager.execute(Command::Get { key: "k".into() }));
        tokio::task::yield_now().await;
        channel.close();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { .. }));
    }
}
