//! Operation lock and run control
//!
//! At most one backup or restore runs against a database at a time. A
//! second request fails immediately instead of queueing.
//!
//! `RunControl` carries cancellation into a run. Restores flip it into a
//! destructive state right before their first write; from then on cancel
//! requests are refused.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Backup => write!(f, "backup"),
            OperationKind::Restore => write!(f, "restore"),
        }
    }
}

/// The run currently holding the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveOperation {
    pub kind: OperationKind,
    pub label: String,
    pub started_at: DateTime<Utc>,
}

impl fmt::Display for ActiveOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' in progress since {}",
            self.kind,
            self.label,
            self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Process-wide mutual exclusion for backup and restore runs
#[derive(Debug, Clone, Default)]
pub struct OperationLock {
    gate: Arc<AsyncMutex<()>>,
    active: Arc<Mutex<Option<ActiveOperation>>>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock or report who holds it
    pub fn try_acquire(
        &self,
        kind: OperationKind,
        label: &str,
    ) -> Result<OperationGuard, ActiveOperation> {
        match self.gate.clone().try_lock_owned() {
            Ok(permit) => {
                let operation = ActiveOperation {
                    kind,
                    label: label.to_string(),
                    started_at: Utc::now(),
                };
                if let Ok(mut active) = self.active.lock() {
                    *active = Some(operation);
                }
                Ok(OperationGuard {
                    _permit: permit,
                    active: self.active.clone(),
                })
            }
            Err(_) => Err(self.current().unwrap_or_else(|| ActiveOperation {
                kind,
                label: "unknown".to_string(),
                started_at: Utc::now(),
            })),
        }
    }

    pub fn current(&self) -> Option<ActiveOperation> {
        self.active.lock().ok().and_then(|a| a.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }
}

/// Held for the duration of a run; releases on drop
pub struct OperationGuard {
    _permit: OwnedMutexGuard<()>,
    active: Arc<Mutex<Option<ActiveOperation>>>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            *active = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlState {
    Running,
    Cancelled,
    /// A restore has started writing
    Destructive,
}

/// Returned when a restore is past its first destructive write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRejected;

impl fmt::Display for CancelRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "restore is applying changes and can no longer be cancelled")
    }
}

impl std::error::Error for CancelRejected {}

/// Cancellation handle shared between the caller and a run
#[derive(Debug, Clone)]
pub struct RunControl {
    token: CancellationToken,
    state: Arc<Mutex<ControlState>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Arc::new(Mutex::new(ControlState::Running)),
        }
    }

    /// Control tied to an outer token, e.g. server shutdown
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            state: Arc::new(Mutex::new(ControlState::Running)),
        }
    }

    /// Request cancellation. Refused once a restore has begun writing.
    pub fn cancel(&self) -> Result<(), CancelRejected> {
        let mut state = self.state.lock().map_err(|_| CancelRejected)?;
        match *state {
            ControlState::Destructive => {
                crate::observability::log_event(
                    crate::observability::Event::RestoreCancelRejected,
                    &[],
                );
                Err(CancelRejected)
            }
            _ => {
                *state = ControlState::Cancelled;
                self.token.cancel();
                Ok(())
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if self.token.is_cancelled() {
            return !self.is_destructive();
        }
        self.state
            .lock()
            .map(|s| *s == ControlState::Cancelled)
            .unwrap_or(false)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Enter the destructive phase. Returns false if cancellation won
    /// the race, in which case nothing may be written.
    pub(crate) fn begin_destructive(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if *state == ControlState::Cancelled || self.token.is_cancelled() {
            *state = ControlState::Cancelled;
            return false;
        }
        *state = ControlState::Destructive;
        true
    }

    fn is_destructive(&self) -> bool {
        self.state
            .lock()
            .map(|s| *s == ControlState::Destructive)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected() {
        let lock = OperationLock::new();
        let guard = lock.try_acquire(OperationKind::Backup, "nightly").unwrap();

        let active = lock
            .try_acquire(OperationKind::Restore, "restore")
            .err()
            .unwrap();
        assert_eq!(active.kind, OperationKind::Backup);
        assert_eq!(active.label, "nightly");
        assert!(lock.is_busy());

        drop(guard);
        assert!(lock.current().is_none());
        assert!(lock.try_acquire(OperationKind::Restore, "restore").is_ok());
    }

    #[test]
    fn test_lock_shared_between_clones() {
        let lock = OperationLock::new();
        let other = lock.clone();
        let _guard = lock.try_acquire(OperationKind::Backup, "a").unwrap();
        assert!(other.try_acquire(OperationKind::Backup, "b").is_err());
    }

    #[test]
    fn test_cancel_before_destructive() {
        let control = RunControl::new();
        assert!(!control.is_cancelled());
        control.cancel().unwrap();
        assert!(control.is_cancelled());
        assert!(!control.begin_destructive());
    }

    #[test]
    fn test_cancel_rejected_after_destructive() {
        let control = RunControl::new();
        assert!(control.begin_destructive());
        assert_eq!(control.cancel(), Err(CancelRejected));
        assert!(!control.is_cancelled());
    }

    #[test]
    fn test_outer_token_cancels() {
        let token = CancellationToken::new();
        let control = RunControl::with_token(token.clone());
        token.cancel();
        assert!(control.is_cancelled());
        assert!(!control.begin_destructive());
    }
}
