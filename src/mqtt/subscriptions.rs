use std::collections::{HashMap, VecDeque};

use rumqttc::{ConnectReturnCode, Publish, QoS, SubscribeReasonCode};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{MqttMessage, SessionError};

pub type SubscribeReply = oneshot::Sender<Result<QoS, SessionError>>;

enum BatchKind {
    /// A caller waiting for the outcome of a single subscription.
    Subscribe(SubscribeReply),
    /// Topics restored after the broker lost the session.
    Resubscribe,
    /// A request issued before the session was resumed. Its caller was already failed and
    /// the resubscribe covers its topics; it only keeps packet ids paired in order.
    Superseded,
}

struct Batch {
    topics: Vec<String>,
    kind: BatchKind,
}

/// Topic filters the session is subscribed to, their handlers, and the SUBSCRIBE
/// packets still waiting for a SUBACK.
///
/// SUBSCRIBE requests are queued in the order they are handed to the client. The
/// client reports each packet id as the packet goes out, in that same order, which is
/// how a SUBACK is paired back with its topics.
#[derive(Default)]
pub struct Subscriptions {
    handlers: Vec<(String, mpsc::Sender<MqttMessage>)>,
    queued: VecDeque<Batch>,
    in_flight: HashMap<u16, Batch>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a CONNACK means the broker dropped our subscriptions.
    pub fn resubscribe_needed(code: ConnectReturnCode, session_present: bool) -> bool {
        code == ConnectReturnCode::Success && !session_present
    }

    pub fn track(&mut self, topic: &str, handler: mpsc::Sender<MqttMessage>) {
        match self.handlers.iter_mut().find(|(t, _)| t == topic) {
            Some((_, existing)) => *existing = handler,
            None => self.handlers.push((topic.to_string(), handler)),
        }
    }

    pub fn untrack(&mut self, topic: &str) {
        self.handlers.retain(|(t, _)| t != topic);
    }

    pub fn topics(&self) -> Vec<String> {
        self.handlers.iter().map(|(topic, _)| topic.clone()).collect()
    }

    pub fn queue_subscribe(&mut self, topic: &str, reply: SubscribeReply) {
        self.queued.push_back(Batch {
            topics: vec![topic.to_string()],
            kind: BatchKind::Subscribe(reply),
        });
    }

    pub fn queue_resubscribe(&mut self, topics: Vec<String>) {
        self.queued.push_back(Batch {
            topics,
            kind: BatchKind::Resubscribe,
        });
    }

    /// Records the packet id the client assigned to the oldest queued request.
    pub fn bind(&mut self, pkid: u16) {
        match self.queued.pop_front() {
            Some(batch) => {
                self.in_flight.insert(pkid, batch);
            }
            None => debug!("SUBSCRIBE {} was not issued by this session", pkid),
        }
    }

    /// Settles the request behind `pkid`. A resubscribe that the broker refused for
    /// any topic is returned as an error.
    pub fn acknowledge(
        &mut self,
        pkid: u16,
        return_codes: &[SubscribeReasonCode],
    ) -> Result<(), SessionError> {
        let Some(batch) = self.in_flight.remove(&pkid) else {
            debug!("SUBACK for unknown packet {}", pkid);
            return Ok(());
        };

        match batch.kind {
            BatchKind::Subscribe(reply) => {
                let topic = &batch.topics[0];
                let result = match return_codes.first() {
                    Some(SubscribeReasonCode::Success(qos)) => {
                        info!("Subscribed to '{}' with {:?}", topic, qos);
                        Ok(*qos)
                    }
                    _ => {
                        warn!("Broker rejected subscription to '{}'", topic);
                        self.untrack(topic);
                        Err(SessionError::SubscribeRejected(topic.clone()))
                    }
                };
                let _ = reply.send(result);
                Ok(())
            }
            BatchKind::Resubscribe => {
                info!("Resubscribe results: {:?}", return_codes);
                for (index, topic) in batch.topics.into_iter().enumerate() {
                    let granted = matches!(
                        return_codes.get(index),
                        Some(SubscribeReasonCode::Success(_))
                    );
                    if !granted {
                        return Err(SessionError::ResubscribeRejected(topic));
                    }
                }
                Ok(())
            }
            BatchKind::Superseded => {
                debug!("SUBACK {} for a request issued before the resume", pkid);
                Ok(())
            }
        }
    }

    /// Fails every pending subscription once the broker has lost the session. Their
    /// callers get `Interrupted` and their topics are dropped; the queue keeps a
    /// placeholder per request so packet ids still issued for them pair up in order.
    pub fn supersede_pending(&mut self) {
        for batch in self.queued.iter_mut() {
            let kind = std::mem::replace(&mut batch.kind, BatchKind::Superseded);
            if let BatchKind::Subscribe(reply) = kind {
                for topic in &batch.topics {
                    self.handlers.retain(|(t, _)| t != topic);
                }
                let _ = reply.send(Err(SessionError::Interrupted));
            }
        }
        self.interrupted();
    }

    /// Fails every request already sent, since the broker will never acknowledge them.
    /// Requests still queued in the client go out after the reconnect.
    pub fn interrupted(&mut self) {
        for (_, batch) in self.in_flight.drain() {
            if let BatchKind::Subscribe(reply) = batch.kind {
                for topic in &batch.topics {
                    self.handlers.retain(|(t, _)| t != topic);
                }
                let _ = reply.send(Err(SessionError::Interrupted));
            }
        }
    }

    /// Forwards an incoming publish to every handler whose filter matches its topic.
    pub fn dispatch(&mut self, publish: &Publish) {
        let message = MqttMessage {
            topic: publish.topic.clone(),
            payload: String::from_utf8_lossy(&publish.payload).to_string(),
        };

        let mut delivered = false;
        self.handlers.retain(|(filter, handler)| {
            if !topic_matches(filter, &message.topic) {
                return true;
            }
            delivered = true;
            match handler.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Handler for '{}' is lagging, dropping message", filter);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Handler for '{}' went away", filter);
                    false
                }
            }
        });

        if !delivered {
            debug!("No handler for message on '{}'", message.topic);
        }
    }
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    // Wildcards at the first level never match topics starting with '$'.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
