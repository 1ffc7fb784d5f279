use std::collections::HashMap;

use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::client::protocol::{SurfaceId, SurfaceMessage};

/// Outbound channels of the surfaces attached to the fan-out router.
///
/// Owned by the router task; never shared across threads.
#[derive(Debug, Default)]
pub struct SurfaceRegistry {
    surfaces: HashMap<SurfaceId, UnboundedSender<SurfaceMessage>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: SurfaceId, sender: UnboundedSender<SurfaceMessage>) {
        info!("Registering surface {}", id);
        self.surfaces.insert(id, sender);
    }

    pub fn unregister(&mut self, id: &SurfaceId) -> bool {
        let removed = self.surfaces.remove(id).is_some();
        if removed {
            info!("Unregistering surface {}", id);
        }
        removed
    }

    /// Send to one surface; false when it is unknown or gone
    pub fn send_to(&self, id: &SurfaceId, msg: SurfaceMessage) -> bool {
        match self.surfaces.get(id) {
            Some(sender) => match sender.send(msg) {
                Ok(()) => true,
                Err(_) => {
                    debug!("Surface {} receiver already closed", id);
                    false
                }
            },
            None => {
                warn!("Failed to send message: surface {} not registered", id);
                false
            }
        }
    }

    /// Send to every surface; returns the ids whose receiver is gone
    pub fn broadcast(&self, msg: &SurfaceMessage) -> Vec<SurfaceId> {
        debug!("Broadcasting to {} surfaces", self.surfaces.len());
        self.surfaces
            .iter()
            .filter(|(_, sender)| sender.send(msg.clone()).is_err())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn contains(&self, id: &SurfaceId) -> bool {
        self.surfaces.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}
