use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{RecordsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Delete,
    Submit,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Delete => "delete",
            Operation::Submit => "submit",
        }
    }
}

/// Set of `(operation, id)` pairs currently being worked on.
///
/// `try_acquire` checks and inserts under one lock, so a duplicate request is
/// rejected immediately rather than queued. The returned guard releases its
/// entry when dropped, which covers early returns and `?` alike.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    active: Arc<Mutex<HashSet<(Operation, String)>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<(Operation, String)>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_acquire(&self, op: Operation, id: &str) -> Result<InFlightGuard> {
        let key = (op, id.to_string());
        if !self.lock().insert(key.clone()) {
            log::debug!("Rejecting duplicate {} for {id}", op.as_str());
            return Err(RecordsError::AlreadyInFlight(format!("{} {id}", op.as_str())));
        }
        Ok(InFlightGuard {
            owner: self.clone(),
            key,
        })
    }

    pub fn is_active(&self, op: Operation, id: &str) -> bool {
        self.lock().contains(&(op, id.to_string()))
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    owner: InFlight,
    key: (Operation, String),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_rejected_until_drop() {
        let inflight = InFlight::new();
        let guard = inflight.try_acquire(Operation::Delete, "r1").unwrap();
        assert!(inflight.is_active(Operation::Delete, "r1"));
        assert!(matches!(
            inflight.try_acquire(Operation::Delete, "r1"),
            Err(RecordsError::AlreadyInFlight(_))
        ));
        drop(guard);
        assert!(!inflight.is_active(Operation::Delete, "r1"));
        assert!(inflight.try_acquire(Operation::Delete, "r1").is_ok());
    }

    #[test]
    fn test_keys_are_per_operation_and_id() {
        let inflight = InFlight::new();
        let _a = inflight.try_acquire(Operation::Delete, "r1").unwrap();
        let _b = inflight.try_acquire(Operation::Delete, "r2").unwrap();
        let _c = inflight.try_acquire(Operation::Submit, "r1").unwrap();
    }
}
