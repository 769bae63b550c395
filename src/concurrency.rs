//! Detection of overlapping operations on one context instance.

use crate::error::{QueryError, Result};
use std::sync::{Arc, Mutex};

/// Tracks the operation currently running on a context. Entering while another operation is
/// active fails instead of waiting.
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyDetector {
    active: Arc<Mutex<Option<String>>>,
}

impl ConcurrencyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, operation: &str) -> Result<CriticalSection> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = active.as_ref() {
            return Err(QueryError::ConcurrentAccess {
                active: current.clone(),
                attempted: operation.to_string(),
            });
        }
        *active = Some(operation.to_string());
        Ok(CriticalSection {
            active: Arc::clone(&self.active),
        })
    }

    /// Name of the running operation, if any.
    pub fn active(&self) -> Option<String> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Held for the duration of an operation; leaving (including by error or drop of an unfinished
/// future) frees the context.
#[must_use]
#[derive(Debug)]
pub struct CriticalSection {
    active: Arc<Mutex<Option<String>>>,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_fails_until_the_first_leaves() {
        let detector = ConcurrencyDetector::new();
        let section = detector.enter("ToList").unwrap();
        match detector.enter("Count") {
            Err(QueryError::ConcurrentAccess { active, attempted }) => {
                assert_eq!(active, "ToList");
                assert_eq!(attempted, "Count");
            }
            other => panic!("expected concurrent access, got {:?}", other.map(|_| ())),
        }
        drop(section);
        assert!(detector.active().is_none());
        let _again = detector.enter("Count").unwrap();
        assert_eq!(detector.active().as_deref(), Some("Count"));
    }
}
