//! Per-channel writer task.
//!
//! Every open channel gets one task owning its [`FrameSink`]. Everything that
//! wants to write goes through a cloneable [`Outbox`], which keeps frames in
//! submission order and, depending on the [`WriteStrategy`], reports back when
//! the transport took the frame.

use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};
use wsrpc_transport::{FrameSink, TransportError, WriteStrategy};

type Ack = oneshot::Sender<Result<(), TransportError>>;

/// Outcome of a queued write.
pub(crate) type Written = BoxFuture<'static, Result<(), TransportError>>;

enum Outbound {
    Frame { data: Bytes, ack: Option<Ack> },
    Close,
}

/// Handle for queueing frames on a channel.
#[derive(Clone)]
pub(crate) struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
    strategy: WriteStrategy,
}

impl Outbox {
    /// Queue a frame now. The returned future resolves once the transport
    /// accepted it under [`WriteStrategy::Acknowledged`], immediately
    /// otherwise.
    pub(crate) fn write(&self, data: Bytes) -> Written {
        let queued = match self.strategy {
            WriteStrategy::Acknowledged => {
                let (ack, done) = oneshot::channel();
                self.tx
                    .send(Outbound::Frame {
                        data,
                        ack: Some(ack),
                    })
                    .map(|()| Some(done))
            }
            WriteStrategy::FireAndForget => self
                .tx
                .send(Outbound::Frame { data, ack: None })
                .map(|()| None),
        }
        .map_err(|_| TransportError::ConnectionClosed);

        async move {
            match queued {
                Ok(Some(done)) => done
                    .await
                    .unwrap_or(Err(TransportError::ConnectionClosed)),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        }
        .boxed()
    }

    /// Ask the writer to close the channel after the frames queued so far.
    pub(crate) fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    /// Whether the writer has stopped.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer for `sink`, optionally pinging every `ping` interval.
pub(crate) fn spawn_writer(
    sink: Box<dyn FrameSink>,
    strategy: WriteStrategy,
    ping: Option<Duration>,
) -> Outbox {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(sink, rx, ping));
    Outbox { tx, strategy }
}

async fn run_writer(
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    ping: Option<Duration>,
) {
    let mut ticker = ping.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame { data, ack }) => {
                    trace!("Writing {} bytes", data.len());
                    let result = sink.send(data).await;
                    match ack {
                        Some(ack) => {
                            let _ = ack.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                warn!("Write failed: {}", e);
                            }
                        }
                    }
                }
                Some(Outbound::Close) | None => break,
            },
            () = tick(&mut ticker) => {
                if let Err(e) = sink.ping().await {
                    debug!("Ping failed: {}", e);
                }
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Closing channel failed: {}", e);
    }

    rx.close();
    while let Some(outbound) = rx.recv().await {
        if let Outbound::Frame { ack: Some(ack), .. } = outbound {
            let _ = ack.send(Err(TransportError::ConnectionClosed));
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
