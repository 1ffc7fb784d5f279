use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::cdcrelay::hub::DeliveryStream;
use crate::cdcrelay::lifecycle::{LifecycleEvent, LifecycleManager, LifecycleReport};
use crate::cdcrelay::record::{decode_records, group_by_table, parse_webhook_body, ChangeRecord, StreamPayload};
use crate::cdcrelay::router::ChannelRouter;
use crate::cdcrelay::types::UserId;
use crate::error::Result;
use crate::tlv::message::TLVMessage;
use crate::tlv::types::{EventType, FieldType};

/// Outcome of one ingested webhook batch
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub processed: usize,
    /// Frames queued on stream sessions
    pub delivered: usize,
    /// Records in the body that could not be decoded
    pub dropped_records: usize,
}

/// Entry point for everything the HTTP side receives
pub struct EventHandler {
    pub router: ChannelRouter,
    pub lifecycle: Arc<LifecycleManager>,
    pub delivery: Arc<dyn DeliveryStream>,
}

impl EventHandler {
    pub fn new(router: ChannelRouter, lifecycle: Arc<LifecycleManager>, delivery: Arc<dyn DeliveryStream>) -> Self {
        Self {
            router,
            lifecycle,
            delivery,
        }
    }

    /// Router contract: loose records in, deduplicated users out
    pub fn route_values(&self, values: Vec<Value>) -> HashSet<UserId> {
        let (records, dropped) = decode_records(values);
        if dropped > 0 {
            warn!("{} records in route request could not be decoded", dropped);
        }
        self.router.route(&records)
    }

    /// Parse a webhook body and ingest what decodes.
    ///
    /// Fails only when the body is neither envelope shape.
    pub fn ingest_body(&self, body: &[u8]) -> Result<IngestReport> {
        let (records, dropped) = parse_webhook_body(body)?;
        if dropped > 0 {
            warn!("{} records in webhook body could not be decoded", dropped);
        }
        let mut report = self.ingest(records);
        report.dropped_records = dropped;
        Ok(report)
    }

    /// Route every table-scoped batch and hand it to the delivery stream
    pub fn ingest(&self, records: Vec<ChangeRecord>) -> IngestReport {
        let mut report = IngestReport {
            processed: records.len(),
            ..Default::default()
        };

        for batch in group_by_table(records) {
            if !self.router.handles_table(&batch.table_name) {
                debug!("No route for table {}, ignoring {} records", batch.table_name, batch.records.len());
                continue;
            }

            let users = self.router.route(&batch.records);
            if users.is_empty() {
                debug!("No recipients for {} batch", batch.table_name);
                continue;
            }

            let frame = match stream_frame(batch.records) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to build frame for table {}: {}", batch.table_name, e);
                    continue;
                }
            };
            let delivery = self.delivery.deliver(&users, &frame);
            report.delivered += delivery.sent;
        }

        info!("Ingested {} records, {} frames delivered", report.processed, report.delivered);
        report
    }

    pub fn handle_lifecycle(&self, event: &LifecycleEvent) -> LifecycleReport {
        let report = self.lifecycle.apply(event);
        if !report.is_complete() {
            warn!("Lifecycle event for {} left {} keys unapplied", event.user(), report.failed.len());
        }
        report
    }
}

/// `StreamData` frame carrying `{"data": records}`
pub fn stream_frame(records: Vec<ChangeRecord>) -> Result<TLVMessage> {
    let body = serde_json::to_vec(&StreamPayload { data: records })?;
    Ok(TLVMessage::new(EventType::StreamData).with_field(FieldType::Data, body))
}
