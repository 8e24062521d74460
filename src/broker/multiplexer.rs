//! Dynamic multiplexer over delivery streams
//!
//! Every queue contributes one gated source to a single `SelectAll` wait-set.
//! A source first reserves a slot in its queue's admission gate and only then
//! pulls the next envelope, so a queue that is at its concurrency limit stops
//! being read from while every other queue keeps flowing. The shared in-flight
//! ceiling, when configured, is left to the processing unit: a pulled envelope
//! always comes out of the multiplexer together with its reservation, so no
//! message is ever parked inside a source. The loop driving the multiplexer
//! never waits on a gate itself.

use crate::broker::delivery::{DeliveryEnvelope, DeliveryStream};
use crate::broker::gate::{AdmissionGate, Reservation};
use futures::stream::{self, BoxStream, SelectAll, StreamExt};

/// Item produced by the multiplexer
#[derive(Debug)]
pub enum Ready {
    /// A message from stream `index` holding its queue slot
    Message {
        index: usize,
        reservation: Reservation,
        envelope: DeliveryEnvelope,
    },
    /// Stream `index` has ended
    Closed { index: usize },
}

enum Source {
    Open(DeliveryStream),
    Done,
}

fn gated(index: usize, gate: AdmissionGate, stream: DeliveryStream) -> BoxStream<'static, Ready> {
    stream::unfold(Source::Open(stream), move |source| {
        let gate = gate.clone();
        async move {
            let mut stream = match source {
                Source::Open(stream) => stream,
                Source::Done => return None,
            };
            let Ok(reservation) = gate.reserve().await else {
                return Some((Ready::Closed { index }, Source::Done));
            };
            let Some(envelope) = stream.next().await else {
                return Some((Ready::Closed { index }, Source::Done));
            };
            Some((
                Ready::Message {
                    index,
                    reservation,
                    envelope,
                },
                Source::Open(stream),
            ))
        }
    })
    .boxed()
}

/// Waits on a runtime-sized set of delivery streams
pub struct Multiplexer {
    sources: SelectAll<BoxStream<'static, Ready>>,
    open: usize,
}

impl Multiplexer {
    /// Build the wait-set; stream `i` is gated by `gates[i]`
    pub fn new(streams: Vec<(AdmissionGate, DeliveryStream)>) -> Self {
        let open = streams.len();
        let sources = stream::select_all(
            streams
                .into_iter()
                .enumerate()
                .map(|(index, (gate, stream))| gated(index, gate, stream)),
        );
        Self { sources, open }
    }

    pub fn is_exhausted(&self) -> bool {
        self.open == 0
    }

    /// Next admitted message or stream closure
    ///
    /// Returns `None` once every stream has ended; with no streams at all that
    /// is immediately. Callers must stop polling at that point rather than loop.
    pub async fn next_ready(&mut self) -> Option<Ready> {
        if self.open == 0 {
            return None;
        }
        let ready = self.sources.next().await?;
        if let Ready::Closed { .. } = ready {
            self.open = self.open.saturating_sub(1);
        }
        Some(ready)
    }
}
