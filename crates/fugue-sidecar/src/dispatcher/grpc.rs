//! gRPC dispatcher: a single bidirectional stream to the function.
//!
//! Requests are written to the stream and replies correlated by waiting
//! up to the configured call timeout; a call with no reply inside the
//! window is treated as fire-and-forget. When the function half-closes
//! the stream the dispatcher raises its closed signal so the loop can
//! finish cleanly.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::Endpoint;
use tracing::{debug, warn};

use fugue_transport::Message;

use crate::dispatcher::Dispatcher;
use crate::error::SidecarError;

/// Wire shape shared with function invokers: opaque payload plus string
/// headers, streamed both ways.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(map = "string, string", tag = "2")]
    pub headers: HashMap<String, String>,
}

const CALL_PATH: &str = "/fugue.Function/Call";
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

pub struct GrpcDispatcher {
    requests: mpsc::Sender<WireMessage>,
    replies: mpsc::Receiver<WireMessage>,
    closed: watch::Receiver<bool>,
    call_timeout: Duration,
    /// Calls that timed out and whose eventual replies must be discarded
    /// rather than attributed to a later message.
    timed_out: usize,
}

impl GrpcDispatcher {
    pub async fn connect(port: u16, call_timeout: Duration) -> Result<Self, SidecarError> {
        let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))
            .map_err(|e| SidecarError::DispatcherConnect(e.to_string()))?
            .connect_timeout(CONNECT_TIMEOUT);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| SidecarError::DispatcherConnect(e.to_string()))?;

        let mut grpc = Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| SidecarError::DispatcherConnect(e.to_string()))?;

        let (request_tx, request_rx) = mpsc::channel::<WireMessage>(16);
        let codec: ProstCodec<WireMessage, WireMessage> = ProstCodec::default();
        let response = grpc
            .streaming(
                tonic::Request::new(ReceiverStream::new(request_rx)),
                PathAndQuery::from_static(CALL_PATH),
                codec,
            )
            .await
            .map_err(|status| SidecarError::DispatcherConnect(status.to_string()))?;
        let mut inbound = response.into_inner();

        let (reply_tx, replies) = mpsc::channel(16);
        let (closed_tx, closed) = watch::channel(false);
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(reply)) => {
                        if reply_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("function closed its reply stream");
                        break;
                    }
                    Err(status) => {
                        warn!(%status, "function reply stream failed");
                        break;
                    }
                }
            }
            let _ = closed_tx.send(true);
        });

        Ok(Self {
            requests: request_tx,
            replies,
            closed,
            call_timeout,
            timed_out: 0,
        })
    }
}

#[async_trait]
impl Dispatcher for GrpcDispatcher {
    async fn dispatch(&mut self, message: Message) -> Result<Option<Message>, SidecarError> {
        let (payload, headers) = message.into_parts();
        self.requests
            .send(WireMessage { payload, headers })
            .await
            .map_err(|_| SidecarError::StreamClosed)?;

        let deadline = tokio::time::Instant::now() + self.call_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.replies.recv()).await {
                Ok(Some(reply)) => {
                    // A reply owed to an earlier call that already timed
                    // out is late, not this message's answer.
                    if self.timed_out > 0 {
                        self.timed_out -= 1;
                        debug!("discarding late reply to a timed-out call");
                        continue;
                    }
                    return Ok(Some(Message::from_parts(reply.payload, reply.headers)));
                }
                Ok(None) => return Err(SidecarError::StreamClosed),
                // No reply inside the window: fire-and-forget call.
                Err(_) => {
                    self.timed_out += 1;
                    return Ok(None);
                }
            }
        }
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dispatcher(
        call_timeout: Duration,
    ) -> (
        GrpcDispatcher,
        mpsc::Receiver<WireMessage>,
        mpsc::Sender<WireMessage>,
        watch::Sender<bool>,
    ) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let (reply_tx, replies) = mpsc::channel(16);
        let (closed_tx, closed) = watch::channel(false);
        let dispatcher = GrpcDispatcher {
            requests: request_tx,
            replies,
            closed,
            call_timeout,
            timed_out: 0,
        };
        (dispatcher, request_rx, reply_tx, closed_tx)
    }

    fn echo(request: WireMessage) -> WireMessage {
        WireMessage {
            payload: request.payload,
            headers: HashMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reply_within_the_window_is_returned() {
        let (mut dispatcher, mut requests, replies, _closed_tx) =
            test_dispatcher(Duration::from_millis(100));

        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            replies.send(echo(request)).await.unwrap();
        });

        let reply = dispatcher.dispatch(Message::new(b"m1".to_vec())).await.unwrap();
        assert_eq!(reply.unwrap().payload(), b"m1");
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_not_attributed_to_the_next_message() {
        let (mut dispatcher, mut requests, replies, _closed_tx) =
            test_dispatcher(Duration::from_millis(100));

        // First call answered after the window, second immediately.
        tokio::spawn(async move {
            let first = requests.recv().await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            replies.send(echo(first)).await.unwrap();

            let second = requests.recv().await.unwrap();
            replies.send(echo(second)).await.unwrap();
        });

        let first = dispatcher.dispatch(Message::new(b"m1".to_vec())).await.unwrap();
        assert_eq!(first, None);

        // The slow m1 reply arrives mid-wait and must be discarded; m2
        // gets its own answer, not the stale one.
        let second = dispatcher.dispatch(Message::new(b"m2".to_vec())).await.unwrap();
        assert_eq!(second.unwrap().payload(), b"m2");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_function_means_fire_and_forget() {
        let (mut dispatcher, mut requests, _replies, _closed_tx) =
            test_dispatcher(Duration::from_millis(100));

        tokio::spawn(async move {
            let _ = requests.recv().await;
        });

        let reply = dispatcher.dispatch(Message::new(b"m1".to_vec())).await.unwrap();
        assert_eq!(reply, None);
    }
}
