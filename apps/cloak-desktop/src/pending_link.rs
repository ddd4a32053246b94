use std::sync::{Mutex, MutexGuard, PoisonError};

use cloak_client_core::deep_link::AuthLinkPayload;

/// Single-slot holding area for a link that arrived before the display
/// listener was ready. Newer arrivals replace older undelivered ones.
#[derive(Debug, Default)]
pub struct PendingLinkBuffer {
    slot: Mutex<Option<AuthLinkPayload>>,
}

impl PendingLinkBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `payload`, returning whatever it displaced.
    pub fn store(&self, payload: AuthLinkPayload) -> Option<AuthLinkPayload> {
        self.slot().replace(payload)
    }

    pub fn drain(&self) -> Option<AuthLinkPayload> {
        self.slot().take()
    }

    /// Puts back a payload whose delivery was lost. A newer arrival wins.
    pub fn restore_if_empty(&self, payload: AuthLinkPayload) -> bool {
        let mut slot = self.slot();
        if slot.is_some() {
            return false;
        }
        *slot = Some(payload);
        true
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slot().is_none()
    }

    fn slot(&self) -> MutexGuard<'_, Option<AuthLinkPayload>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
