//! Admission control: at most one client session at any instant.
//!
//! The slot moves `Free -> Active -> Releasing -> Free`. A candidate that
//! arrives while the slot is anything but `Free` is refused, never queued.
//! `Releasing` covers the worker cleanup, so a quick reconnect cannot race
//! with background tasks left over from the previous client.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use botlink_ipc::{CommandKind, ErrorCode};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const PERMISSION_UPLOAD: &str = "robot:upload";
pub const PERMISSION_CONTROL: &str = "robot:control";
pub const PERMISSION_ALL: &str = "*";

/// Already-verified client identity, as asserted by the token issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Identity {
    /// Whether this identity may issue `kind`. Control commands are never
    /// client-issuable.
    pub fn allows(&self, kind: CommandKind) -> bool {
        let needed = match kind {
            CommandKind::Update => PERMISSION_UPLOAD,
            CommandKind::Start | CommandKind::Process => PERMISSION_CONTROL,
            CommandKind::Cleanup | CommandKind::Ping => return false,
        };
        self.permissions
            .iter()
            .any(|p| p == needed || p == PERMISSION_ALL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("another client session is active")]
    SessionOccupied,
}

impl AdmissionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AdmissionError::SessionOccupied => ErrorCode::ConnectionRejected,
        }
    }
}

/// The admitted client.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    subject: String,
    peer: Option<SocketAddr>,
    admitted_at: DateTime<Utc>,
    alive: AtomicBool,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Run when a session is released, before its slot becomes free.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    async fn on_release(&self, session: &Session);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Active(Uuid),
    Releasing(Uuid),
}

pub struct ConnectionManager {
    slot: Mutex<Slot>,
    cleanup: Arc<dyn CleanupHook>,
}

/// Frees the slot even if `release` is dropped mid-cleanup.
struct FreeOnDrop<'a> {
    slot: &'a Mutex<Slot>,
    id: Uuid,
}

impl Drop for FreeOnDrop<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if *slot == Slot::Releasing(self.id) {
            *slot = Slot::Free;
        }
    }
}

impl ConnectionManager {
    pub fn new(cleanup: Arc<dyn CleanupHook>) -> Self {
        Self {
            slot: Mutex::new(Slot::Free),
            cleanup,
        }
    }

    pub fn admit(
        &self,
        identity: &Identity,
        peer: Option<SocketAddr>,
    ) -> Result<Session, AdmissionError> {
        let mut slot = self.slot.lock();
        if *slot != Slot::Free {
            debug!(subject = %identity.subject, ?peer, slot = ?*slot, "admission rejected");
            return Err(AdmissionError::SessionOccupied);
        }
        let session = Session {
            id: Uuid::new_v4(),
            subject: identity.subject.clone(),
            peer,
            admitted_at: Utc::now(),
            alive: AtomicBool::new(true),
        };
        *slot = Slot::Active(session.id);
        info!(session = %session.id, subject = %session.subject, ?peer, "session admitted");
        Ok(session)
    }

    /// End `session`, running the cleanup hook before the slot is freed.
    /// Returns false if `session` was not the active one.
    pub async fn release(&self, session: &Session) -> bool {
        {
            let mut slot = self.slot.lock();
            if *slot != Slot::Active(session.id) {
                return false;
            }
            *slot = Slot::Releasing(session.id);
        }
        session.alive.store(false, Ordering::Release);
        let _free = FreeOnDrop {
            slot: &self.slot,
            id: session.id,
        };

        self.cleanup.on_release(session).await;
        info!(session = %session.id, "session released");
        true
    }

    /// Id of the session holding the slot, including one being released.
    pub fn active(&self) -> Option<Uuid> {
        match *self.slot.lock() {
            Slot::Free => None,
            Slot::Active(id) | Slot::Releasing(id) => Some(id),
        }
    }
}
