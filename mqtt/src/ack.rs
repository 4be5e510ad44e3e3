//! Correlates requests with the broker's acknowledgments.
//!
//! rumqttc assigns packet ids inside its event loop and reports them through
//! `Outgoing` events in the order requests were queued. Waiters are queued
//! here in that same order before the request is handed to the client, and
//! the outgoing event binds the oldest queued waiter to its packet id.
//!
//! After a reconnect rumqttc first replays unacknowledged publishes under
//! their old packet ids, then drains requests queued before the loss. Both
//! are skipped so they never bind a waiter created after the reconnect.

use crate::error::{Error, Result};
use crate::types::QoS;
use rumqttc::SubscribeReasonCode;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Receives the outcome of a tracked request.
pub(crate) type AckReceiver = oneshot::Receiver<Result<()>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { qos: QoS },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Kind {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl Request {
    fn kind(&self) -> Kind {
        match self {
            Request::Subscribe { .. } => Kind::Subscribe,
            Request::Unsubscribe { .. } => Kind::Unsubscribe,
            Request::Publish { .. } => Kind::Publish,
        }
    }
}

struct Waiter {
    request: Request,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl Waiter {
    fn finish(self, result: Result<()>) {
        if let Some(done) = self.done {
            // The caller may have stopped waiting after a timeout.
            let _ = done.send(result);
        }
    }
}

#[derive(Default)]
pub(crate) struct AckTracker {
    queued: VecDeque<Waiter>,
    inflight: HashMap<(Kind, u16), Waiter>,
    replaying: HashSet<u16>,
}

impl AckTracker {
    /// Queue a request whose outcome the caller waits for.
    pub(crate) fn enqueue(&mut self, request: Request) -> AckReceiver {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(Waiter {
            request,
            done: Some(tx),
        });
        rx
    }

    /// Queue a request nobody waits for, keeping the order aligned.
    pub(crate) fn enqueue_untracked(&mut self, request: Request) {
        self.queued.push_back(Waiter {
            request,
            done: None,
        });
    }

    /// Drop the most recent entry after the client refused the request.
    pub(crate) fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    /// An outgoing packet of `kind` left with packet id `pkid`.
    pub(crate) fn on_outgoing(&mut self, kind: Kind, pkid: u16) {
        if kind == Kind::Publish && self.replaying.remove(&pkid) {
            debug!(pkid, "replayed publish");
            return;
        }
        // Replays come first; anything else means they are over.
        self.replaying.clear();

        let matches_front = self
            .queued
            .front()
            .is_some_and(|w| w.request.kind() == kind);
        if !matches_front {
            debug!(?kind, pkid, "outgoing packet with no queued request");
            return;
        }

        let Some(waiter) = self.queued.pop_front() else {
            return;
        };

        match waiter.request {
            Request::Publish {
                qos: QoS::AtMostOnce,
            } => waiter.finish(Ok(())),
            _ => {
                if self.inflight.insert((kind, pkid), waiter).is_some() {
                    warn!(?kind, pkid, "packet id reused while in flight");
                }
            }
        }
    }

    pub(crate) fn on_suback(&mut self, pkid: u16, codes: &[SubscribeReasonCode]) {
        let Some(waiter) = self.inflight.remove(&(Kind::Subscribe, pkid)) else {
            debug!(pkid, "suback for unknown packet id");
            return;
        };

        let rejected = codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure));
        let result = match (&waiter.request, rejected) {
            (Request::Subscribe { topic }, true) => Err(Error::SubscribeRejected(topic.clone())),
            _ => Ok(()),
        };
        waiter.finish(result);
    }

    pub(crate) fn on_unsuback(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&(Kind::Unsubscribe, pkid)) {
            waiter.finish(Ok(()));
        }
    }

    pub(crate) fn on_puback(&mut self, pkid: u16) {
        self.complete_publish(pkid, QoS::AtLeastOnce);
    }

    pub(crate) fn on_pubcomp(&mut self, pkid: u16) {
        self.complete_publish(pkid, QoS::ExactlyOnce);
    }

    fn complete_publish(&mut self, pkid: u16, ack_for: QoS) {
        let key = (Kind::Publish, pkid);
        let expected = matches!(
            self.inflight.get(&key),
            Some(Waiter { request: Request::Publish { qos }, .. }) if *qos == ack_for
        );
        if !expected {
            debug!(pkid, ?ack_for, "publish ack for unknown packet id");
            return;
        }
        if let Some(waiter) = self.inflight.remove(&key) {
            waiter.finish(Ok(()));
        }
    }

    /// Fail every outstanding request.
    pub(crate) fn fail_all(&mut self, reason: &str) {
        self.replaying.clear();
        let queued = self.queued.drain(..);
        let inflight = self.inflight.drain().map(|(_, w)| w);
        for waiter in queued.chain(inflight) {
            waiter.finish(Err(Error::ConnectionLost(reason.to_string())));
        }
    }

    /// Fail every outstanding request after the transport dropped.
    ///
    /// Requests still queued in the client are sent after a reconnect, so
    /// their entries stay in line without a waiter. Publishes that were in
    /// flight are remembered until their replay goes out.
    pub(crate) fn connection_lost(&mut self, reason: &str) {
        for waiter in self.queued.iter_mut() {
            if let Some(done) = waiter.done.take() {
                let _ = done.send(Err(Error::ConnectionLost(reason.to_string())));
            }
        }

        for ((_, pkid), waiter) in self.inflight.drain() {
            if matches!(waiter.request, Request::Publish { qos } if qos != QoS::AtMostOnce) {
                self.replaying.insert(pkid);
            }
            waiter.finish(Err(Error::ConnectionLost(reason.to_string())));
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}
