//! Fan-out of stream batches to the UI surfaces of one client installation.
//!
//! `FanoutRouter` owns all state and is driven by a single task through
//! `RouterCommand`s, so subscription changes and batch dispatch are applied
//! strictly in arrival order.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use log::{debug, info, warn};
use smallvec::SmallVec;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cdcrelay::record::{decode_records, group_by_table, DeliveryBatch, StreamPayload};
use crate::cdcrelay::types::TableName;
use crate::client::items::BoundedItemStore;
use crate::client::protocol::{ConnectionStatus, SurfaceId, SurfaceMessage, SurfaceRequest};
use crate::client::surfaces::SurfaceRegistry;
use crate::error::{ErrorCode, RelayError, Result};

#[derive(Debug)]
pub enum RouterCommand {
    Connect {
        id: SurfaceId,
        sender: UnboundedSender<SurfaceMessage>,
    },
    Request {
        id: SurfaceId,
        request: SurfaceRequest,
    },
    Disconnect {
        id: SurfaceId,
    },
    StreamPayload(Bytes),
    StreamStatus(ConnectionStatus),
}

pub struct FanoutRouter {
    subscriptions: HashMap<SurfaceId, HashSet<TableName>>,
    surfaces: SurfaceRegistry,
    items: BoundedItemStore,
    status: ConnectionStatus,
}

impl FanoutRouter {
    pub fn new(items: BoundedItemStore) -> Self {
        Self {
            subscriptions: HashMap::new(),
            surfaces: SurfaceRegistry::new(),
            items,
            status: ConnectionStatus::Disconnected,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn items(&self) -> &BoundedItemStore {
        &self.items
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    pub fn interest(&self, id: &SurfaceId) -> Option<&HashSet<TableName>> {
        self.subscriptions.get(id)
    }

    pub fn connect(&mut self, id: SurfaceId, sender: UnboundedSender<SurfaceMessage>) {
        self.surfaces.register(id, sender);
    }

    /// Drop a surface and everything it subscribed to
    pub fn disconnect(&mut self, id: &SurfaceId) {
        self.subscriptions.remove(id);
        self.surfaces.unregister(id);
    }

    pub fn subscribe(&mut self, id: SurfaceId, tables: &[TableName]) {
        if !self.surfaces.contains(&id) {
            warn!("Ignoring subscribe from unknown surface {}", id);
            return;
        }
        let interest = self.subscriptions.entry(id).or_default();
        interest.extend(tables.iter().filter(|t| !t.is_empty()).cloned());
        if interest.is_empty() {
            self.subscriptions.remove(&id);
        }
        debug!("Surface {} subscribed to {:?}", id, tables);
    }

    pub fn unsubscribe(&mut self, id: &SurfaceId, tables: &[TableName]) {
        let Some(interest) = self.subscriptions.get_mut(id) else {
            return;
        };
        for table in tables {
            interest.remove(table);
        }
        if interest.is_empty() {
            self.subscriptions.remove(id);
            debug!("Surface {} has no remaining subscriptions", id);
        }
    }

    pub fn handle_request(&mut self, id: SurfaceId, request: SurfaceRequest) {
        match request {
            SurfaceRequest::SubscribeCdc { tables } => self.subscribe(id, &tables),
            SurfaceRequest::UnsubscribeCdc { tables } => self.unsubscribe(&id, &tables),
            SurfaceRequest::GetState => self.send_state(id),
        }
    }

    fn send_state(&mut self, id: SurfaceId) {
        let snapshot = SurfaceMessage::StateSnapshot {
            status: self.status,
            tables: self.items.snapshot(),
        };
        if !self.surfaces.send_to(&id, snapshot) {
            self.disconnect(&id);
        }
    }

    /// Decode one raw stream frame payload and dispatch it per table.
    ///
    /// Returns the number of surface messages sent. An undecodable payload
    /// is dropped whole.
    pub fn on_stream_payload(&mut self, payload: &[u8]) -> usize {
        let envelope: StreamPayload<serde_json::Value> = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed stream payload ({} bytes): {}", payload.len(), e);
                return 0;
            }
        };
        let (records, _) = decode_records(envelope.data);
        group_by_table(records)
            .into_iter()
            .map(|batch| self.on_stream_event(batch))
            .sum()
    }

    /// Apply a batch to the item store and forward it to every surface
    /// interested in its table.
    pub fn on_stream_event(&mut self, batch: DeliveryBatch) -> usize {
        let report = self.items.apply(&batch.table_name, &batch.records);
        debug!("Applied {} batch: {:?}", batch.table_name, report);

        let targets: SmallVec<[SurfaceId; 8]> = self
            .subscriptions
            .iter()
            .filter(|(_, tables)| tables.contains(&batch.table_name))
            .map(|(id, _)| *id)
            .collect();

        let mut sent = 0;
        for id in targets {
            let msg = SurfaceMessage::CdcBatch {
                table: batch.table_name.clone(),
                records: batch.records.clone(),
            };
            if self.surfaces.send_to(&id, msg) {
                sent += 1;
            } else {
                self.disconnect(&id);
            }
        }
        debug!("Forwarded {} batch to {} surfaces", batch.table_name, sent);
        sent
    }

    pub fn on_stream_disconnect(&mut self) {
        self.set_status(ConnectionStatus::Disconnected);
    }

    pub fn on_stream_reconnect(&mut self) {
        self.set_status(ConnectionStatus::Connected);
    }

    /// Broadcast a status change to all surfaces, whatever their interest
    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        info!("Stream status {:?} -> {:?}", self.status, status);
        self.status = status;
        for id in self.surfaces.broadcast(&SurfaceMessage::ConnectionStatus { status }) {
            self.disconnect(&id);
        }
    }

    pub fn handle(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Connect { id, sender } => self.connect(id, sender),
            RouterCommand::Request { id, request } => self.handle_request(id, request),
            RouterCommand::Disconnect { id } => self.disconnect(&id),
            RouterCommand::StreamPayload(payload) => {
                self.on_stream_payload(&payload);
            }
            RouterCommand::StreamStatus(ConnectionStatus::Connected) => self.on_stream_reconnect(),
            RouterCommand::StreamStatus(ConnectionStatus::Disconnected) => self.on_stream_disconnect(),
        }
    }

    /// Process commands until every handle is gone
    pub async fn run(mut self, mut commands: UnboundedReceiver<RouterCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
        info!("Fan-out router stopped");
    }
}

/// Sends commands to a running `FanoutRouter`
#[derive(Debug, Clone)]
pub struct FanoutHandle {
    commands: UnboundedSender<RouterCommand>,
}

impl FanoutHandle {
    pub fn spawn(router: FanoutRouter) -> (Self, JoinHandle<()>) {
        let (tx, rx) = unbounded_channel();
        let task = tokio::spawn(router.run(rx));
        (Self { commands: tx }, task)
    }

    /// Attach a new surface; the returned handle detaches it when dropped
    pub fn connect(&self) -> Result<SurfaceHandle> {
        let (tx, rx) = unbounded_channel();
        let id = Uuid::new_v4();
        send_command(&self.commands, RouterCommand::Connect { id, sender: tx })?;
        Ok(SurfaceHandle {
            id,
            commands: self.commands.clone(),
            inbox: rx,
        })
    }

    pub fn stream_payload(&self, payload: Bytes) -> Result<()> {
        send_command(&self.commands, RouterCommand::StreamPayload(payload))
    }

    pub fn stream_status(&self, status: ConnectionStatus) -> Result<()> {
        send_command(&self.commands, RouterCommand::StreamStatus(status))
    }
}

fn send_command(commands: &UnboundedSender<RouterCommand>, command: RouterCommand) -> Result<()> {
    commands
        .send(command)
        .map_err(|_| RelayError::new(ErrorCode::SendFailed, "Fan-out router is not running"))
}

/// Subscription lease of one UI surface
#[derive(Debug)]
pub struct SurfaceHandle {
    id: SurfaceId,
    commands: UnboundedSender<RouterCommand>,
    inbox: UnboundedReceiver<SurfaceMessage>,
}

impl SurfaceHandle {
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn request(&self, request: SurfaceRequest) -> Result<()> {
        send_command(&self.commands, RouterCommand::Request { id: self.id, request })
    }

    pub fn subscribe<I, T>(&self, tables: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<TableName>,
    {
        let tables = tables.into_iter().map(Into::into).collect();
        self.request(SurfaceRequest::SubscribeCdc { tables })
    }

    pub fn unsubscribe<I, T>(&self, tables: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<TableName>,
    {
        let tables = tables.into_iter().map(Into::into).collect();
        self.request(SurfaceRequest::UnsubscribeCdc { tables })
    }

    pub fn get_state(&self) -> Result<()> {
        self.request(SurfaceRequest::GetState)
    }

    pub async fn recv(&mut self) -> Option<SurfaceMessage> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SurfaceMessage> {
        self.inbox.try_recv().ok()
    }
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        if self.commands.send(RouterCommand::Disconnect { id: self.id }).is_err() {
            debug!("Router already stopped when surface {} closed", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> FanoutRouter {
        FanoutRouter::new(BoundedItemStore::new(10, HashMap::new()))
    }

    fn attach(router: &mut FanoutRouter) -> (SurfaceId, UnboundedReceiver<SurfaceMessage>) {
        let (tx, rx) = unbounded_channel();
        let id = Uuid::new_v4();
        router.connect(id, tx);
        (id, rx)
    }

    #[test]
    fn last_unsubscribe_removes_entry() {
        let mut router = router();
        let (id, _rx) = attach(&mut router);
        router.subscribe(id, &["a".to_string(), "b".to_string()]);
        router.unsubscribe(&id, &["a".to_string()]);
        assert_eq!(router.interest(&id).map(HashSet::len), Some(1));
        router.unsubscribe(&id, &["b".to_string()]);
        assert!(router.interest(&id).is_none());
    }

    #[test]
    fn malformed_payload_changes_nothing() {
        let mut router = router();
        let (id, mut rx) = attach(&mut router);
        router.subscribe(id, &["trades".to_string()]);

        assert_eq!(router.on_stream_payload(b"{not json"), 0);
        assert_eq!(router.on_stream_payload(br#"{"records": []}"#), 0);
        assert!(rx.try_recv().is_err());
        assert!(router.items().snapshot().is_empty());
    }

    #[test]
    fn payload_is_split_per_table() {
        let mut router = router();
        let (id, mut rx) = attach(&mut router);
        router.subscribe(id, &["trades".to_string()]);

        let payload = json!({"data": [
            {"action": "insert", "table_name": "trades", "record": {"id": 1}},
            {"action": "insert", "table_name": "rss_items", "record": {"id": 2}},
            {"action": "insert", "table_name": "trades", "record": {"id": 3}}
        ]});
        let sent = router.on_stream_payload(payload.to_string().as_bytes());

        assert_eq!(sent, 1);
        match rx.try_recv().unwrap() {
            SurfaceMessage::CdcBatch { table, records } => {
                assert_eq!(table, "trades");
                assert_eq!(records.len(), 2);
            }
            other => panic!("unexpected message {:?}", other),
        }
        // Unsubscribed tables still reach the item store
        assert_eq!(router.items().len("rss_items"), 1);
    }

    #[test]
    fn closed_surface_is_dropped_on_send() {
        let mut router = router();
        let (id, rx) = attach(&mut router);
        router.subscribe(id, &["trades".to_string()]);
        drop(rx);

        router.on_stream_reconnect();
        assert_eq!(router.surface_count(), 0);
        assert!(router.interest(&id).is_none());
    }

    #[test]
    fn dropping_the_surface_handle_sends_disconnect() {
        let (tx, mut rx) = unbounded_channel();
        let handle = FanoutHandle { commands: tx };
        let surface = handle.connect().unwrap();
        let id = surface.id();
        drop(surface);

        assert!(matches!(rx.try_recv(), Ok(RouterCommand::Connect { id: c, .. }) if c == id));
        assert!(matches!(rx.try_recv(), Ok(RouterCommand::Disconnect { id: d }) if d == id));
    }

    #[test]
    fn repeated_status_is_not_rebroadcast() {
        let mut router = router();
        let (_id, mut rx) = attach(&mut router);
        router.on_stream_disconnect();
        assert!(rx.try_recv().is_err());
        router.on_stream_reconnect();
        router.on_stream_reconnect();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
