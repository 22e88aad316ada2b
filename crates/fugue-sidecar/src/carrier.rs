//! The consume/invoke/produce loop for one replica.

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use fugue_transport::{Consumer, Producer, TransportError};

use crate::dispatcher::Dispatcher;
use crate::error::SidecarError;

/// Why the dispatch loop stopped cleanly.
#[derive(Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// A termination signal arrived.
    Terminated,
    /// The dispatcher reported end of stream: bounded input completed.
    EndOfStream,
}

/// Drain the consumer, invoking the dispatcher for each message and
/// forwarding replies to the output topic when one is configured.
///
/// Messages are processed strictly one at a time in arrival order.
/// Consumer and producer failures are fatal to the replica (the
/// orchestration layer restarts the pod); a failed dispatch only skips
/// that message.
pub async fn run(
    consumer: &mut dyn Consumer,
    producer: Option<&dyn Producer>,
    output: Option<&str>,
    dispatcher: &mut dyn Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) -> Result<LoopExit, SidecarError> {
    let mut closed = dispatcher.closed();
    let mut producer_errors = producer.map(|p| p.errors());

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("termination signal received, dispatch loop stopping");
                return Ok(LoopExit::Terminated);
            }
            _ = closed.changed() => {
                info!("end of stream, dispatch loop stopping");
                return Ok(LoopExit::EndOfStream);
            }
            Some(error) = next_producer_error(&mut producer_errors) => {
                return Err(error.into());
            }
            received = consumer.receive() => {
                let (message, topic) = received?;
                debug!(topic, "message received");
                match dispatcher.dispatch(message).await {
                    Ok(Some(reply)) => {
                        if let (Some(producer), Some(output)) = (producer, output) {
                            producer.send(output, reply).await?;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!(%error, "dispatch failed, skipping message");
                    }
                }
            }
        }
    }
}

async fn next_producer_error(
    errors: &mut Option<broadcast::Receiver<TransportError>>,
) -> Option<TransportError> {
    let Some(receiver) = errors else {
        return None;
    };
    loop {
        match receiver.recv().await {
            Ok(error) => return Some(error),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "producer error stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use fugue_transport::{MemoryTransport, Message};

    /// Uppercases payloads; closes its stream after a set number of calls
    /// when a limit is given.
    struct UppercaseDispatcher {
        calls: Arc<AtomicUsize>,
        remaining: Option<usize>,
        closed_tx: watch::Sender<bool>,
        closed: watch::Receiver<bool>,
        fail: bool,
    }

    impl UppercaseDispatcher {
        fn new() -> Self {
            let (closed_tx, closed) = watch::channel(false);
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                remaining: None,
                closed_tx,
                closed,
                fail: false,
            }
        }

        fn closing_after(mut self, calls: usize) -> Self {
            self.remaining = Some(calls);
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl Dispatcher for UppercaseDispatcher {
        async fn dispatch(&mut self, message: Message) -> Result<Option<Message>, SidecarError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SidecarError::Dispatch("invoker unavailable".into()));
            }
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
                if *remaining == 0 {
                    let _ = self.closed_tx.send(true);
                }
            }
            let upper = String::from_utf8(message.payload().to_vec())
                .unwrap()
                .to_uppercase();
            Ok(Some(Message::new(upper.into_bytes())))
        }

        fn closed(&self) -> watch::Receiver<bool> {
            self.closed.clone()
        }
    }

    #[tokio::test]
    async fn forwards_replies_to_the_output_topic() {
        let transport = MemoryTransport::new();
        let producer = transport.producer();
        producer.send("words", Message::new(b"hello".to_vec())).await.unwrap();
        producer.send("words", Message::new(b"world".to_vec())).await.unwrap();

        let mut consumer = transport.consumer(vec!["words".to_string()]);
        let mut dispatcher = UppercaseDispatcher::new().closing_after(2);
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let exit = run(
            &mut consumer,
            Some(&producer),
            Some("shouts"),
            &mut dispatcher,
            shutdown,
        )
        .await
        .unwrap();
        assert_eq!(exit, LoopExit::EndOfStream);

        let mut outputs = transport.consumer(vec!["shouts".to_string()]);
        let (first, _) = outputs.receive().await.unwrap();
        assert_eq!(first.payload(), b"HELLO");
        let (second, _) = outputs.receive().await.unwrap();
        assert_eq!(second.payload(), b"WORLD");
    }

    #[tokio::test]
    async fn termination_signal_stops_the_loop() {
        let transport = MemoryTransport::new();
        let mut consumer = transport.consumer(vec!["words".to_string()]);
        let mut dispatcher = UppercaseDispatcher::new();
        let (shutdown_tx, shutdown) = watch::channel(false);

        let handle = tokio::spawn(async move {
            run(&mut consumer, None, None, &mut dispatcher, shutdown).await
        });
        shutdown_tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), LoopExit::Terminated);
    }

    #[tokio::test]
    async fn dispatch_failure_skips_the_message() {
        let transport = MemoryTransport::new();
        let producer = transport.producer();
        producer.send("words", Message::new(b"bad".to_vec())).await.unwrap();

        let mut consumer = transport.consumer(vec!["words".to_string()]);
        let mut dispatcher = UppercaseDispatcher::new().failing();
        let calls = Arc::clone(&dispatcher.calls);
        let (shutdown_tx, shutdown) = watch::channel(false);

        let handle = tokio::spawn(async move {
            run(&mut consumer, Some(&producer), Some("shouts"), &mut dispatcher, shutdown).await
        });

        // The failing dispatch must not kill the loop; it keeps draining.
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), LoopExit::Terminated);
    }
}
