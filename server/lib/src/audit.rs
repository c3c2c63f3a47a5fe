//! Audit events emitted by the engine. Exactly one event is dispatched per
//! inbound request, whatever path the request took.

use serde::{Deserialize, Serialize};

use crate::external::AuditLogger;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum AuditAction {
    UserAuthorisation,
    DeviceAuthorisation,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub client_id: Option<String>,
    pub scope: Option<String>,
    pub username: Option<String>,
    pub success: bool,
    pub remote_addr: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction) -> Self {
        AuditEvent {
            action,
            client_id: None,
            scope: None,
            username: None,
            success: false,
            remote_addr: None,
        }
    }
}

/// Dispatches its event to the logger when dropped. Holding one of these for
/// the duration of a request guarantees the once-per-request audit trail on
/// every exit path, early returns included.
pub(crate) struct AuditGuard<'a> {
    logger: &'a dyn AuditLogger,
    event: Option<AuditEvent>,
}

impl<'a> AuditGuard<'a> {
    pub(crate) fn new(logger: &'a dyn AuditLogger, event: AuditEvent) -> Self {
        AuditGuard {
            logger,
            event: Some(event),
        }
    }

    pub(crate) fn set_username(&mut self, username: &str) {
        if let Some(event) = self.event.as_mut() {
            event.username = Some(username.to_string());
        }
    }

    pub(crate) fn set_success(&mut self) {
        if let Some(event) = self.event.as_mut() {
            event.success = true;
        }
    }
}

impl Drop for AuditGuard<'_> {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            self.logger.send(event);
        }
    }
}
