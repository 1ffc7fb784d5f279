use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};
use uuid::Uuid;

use crate::cdcrelay::types::UserId;
use crate::tlv::message::TLVMessage;

/// Hands a frame to every live stream session of the given users
pub trait DeliveryStream: Send + Sync {
    fn deliver(&self, users: &HashSet<UserId>, frame: &TLVMessage) -> DeliveryReport;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Frames queued on a session
    pub sent: usize,
    /// Frames dropped because a session queue was full or closed
    pub dropped: usize,
    /// Users without any open session
    pub offline: usize,
}

pub type SessionId = Uuid;

/// Registry of open stream sessions, keyed by user.
///
/// A user may hold several sessions (one per installation); each has its own
/// bounded outbound queue so one slow reader never stalls the others.
pub struct StreamHub {
    sessions: DashMap<UserId, HashMap<SessionId, Sender<TLVMessage>>>,
    buffer: usize,
}

impl StreamHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Open a session for `user`. The session stays registered until the
    /// returned lease is dropped.
    pub fn register(self: &Arc<Self>, user: UserId) -> (SessionLease, Receiver<TLVMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = channel(self.buffer);
        self.sessions.entry(user.clone()).or_default().insert(id, tx);
        info!("Registered stream session {} for user {}", id, user);

        let lease = SessionLease {
            hub: self.clone(),
            user,
            id,
        };
        (lease, rx)
    }

    fn unregister(&self, user: &str, id: SessionId) {
        if let Some(mut sessions) = self.sessions.get_mut(user) {
            sessions.remove(&id);
        }
        self.sessions.remove_if(user, |_, sessions| sessions.is_empty());
        info!("Unregistered stream session {} for user {}", id, user);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_online(&self, user: &str) -> bool {
        self.sessions.contains_key(user)
    }
}

impl DeliveryStream for StreamHub {
    fn deliver(&self, users: &HashSet<UserId>, frame: &TLVMessage) -> DeliveryReport {
        debug!("Delivering {:?} frame to {} users", frame.event_type, users.len());
        let mut report = DeliveryReport::default();

        for user in users {
            let Some(sessions) = self.sessions.get(user) else {
                debug!("User {} has no open session", user);
                report.offline += 1;
                continue;
            };
            for (id, tx) in sessions.iter() {
                match tx.try_send(frame.clone()) {
                    Ok(()) => report.sent += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!("Session {} of user {} is full, dropping frame", id, user);
                        report.dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Session {} of user {} already closed", id, user);
                        report.dropped += 1;
                    }
                }
            }
        }

        debug!(
            "Delivery done: {} sent, {} dropped, {} offline",
            report.sent, report.dropped, report.offline
        );
        report
    }
}

/// Registration of one stream session; unregisters on drop
pub struct SessionLease {
    hub: Arc<StreamHub>,
    user: UserId,
    id: SessionId,
}

impl SessionLease {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.hub.unregister(&self.user, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::types::EventType;

    fn users(list: &[&str]) -> HashSet<UserId> {
        list.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn frames_reach_every_session_of_a_user() {
        let hub = Arc::new(StreamHub::new(4));
        let (_a, mut rx_a) = hub.register("u1".into());
        let (_b, mut rx_b) = hub.register("u1".into());

        let report = hub.deliver(&users(&["u1", "u2"]), &TLVMessage::new(EventType::StreamData));
        assert_eq!(report, DeliveryReport { sent: 2, dropped: 0, offline: 1 });
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[test]
    fn dropping_the_lease_unregisters() {
        let hub = Arc::new(StreamHub::new(4));
        let (lease, _rx) = hub.register("u1".into());
        assert!(hub.is_online("u1"));
        drop(lease);
        assert!(!hub.is_online("u1"));
        assert_eq!(hub.session_count(), 0);
    }

    #[test]
    fn full_sessions_drop_instead_of_blocking() {
        let hub = Arc::new(StreamHub::new(1));
        let (_lease, _rx) = hub.register("u1".into());
        let frame = TLVMessage::new(EventType::StreamData);

        assert_eq!(hub.deliver(&users(&["u1"]), &frame).sent, 1);
        assert_eq!(hub.deliver(&users(&["u1"]), &frame).dropped, 1);
    }
}
