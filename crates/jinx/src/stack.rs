use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::error::InternalError;

/// The macros currently executing on one worker thread.
///
/// Each worker owns its own stack and hands it to the generators it creates,
/// so concurrent compilations never share one.
#[derive(Debug, Default)]
pub struct MacroStack {
    call_stack: Mutex<Vec<String>>,
}

impl MacroStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, Vec<String>> {
        self.call_stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.calls().len()
    }

    pub fn push(&self, unique_id: &str) {
        let mut calls = self.calls();
        calls.push(unique_id.to_string());
        tracing::debug!(depth = calls.len(), "push macro {}", unique_id);
    }

    /// Pop `unique_id`, which must be the most recent push.
    pub fn pop(&self, unique_id: &str) -> Result<(), InternalError> {
        let mut calls = self.calls();
        let got = calls.pop();
        tracing::debug!(depth = calls.len(), "pop macro {}", unique_id);
        match got {
            Some(got) if got == unique_id => Ok(()),
            got => Err(InternalError::StackCorruption {
                expected: unique_id.to_string(),
                got,
            }),
        }
    }

    /// Identities on the stack, outermost first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.calls().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_balance() {
        let stack = MacroStack::new();
        assert_eq!(stack.depth(), 0);
        stack.push("macro.pkg.a");
        stack.push("macro.pkg.b");
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.snapshot(), vec!["macro.pkg.a", "macro.pkg.b"]);

        stack.pop("macro.pkg.b").unwrap();
        stack.pop("macro.pkg.a").unwrap();
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_mismatched_pop_is_corruption() {
        let stack = MacroStack::new();
        stack.push("macro.pkg.a");
        let err = stack.pop("macro.pkg.b").unwrap_err();
        assert_eq!(
            err,
            InternalError::StackCorruption {
                expected: "macro.pkg.b".to_string(),
                got: Some("macro.pkg.a".to_string()),
            }
        );
    }

    #[test]
    fn test_pop_empty_is_corruption() {
        let stack = MacroStack::new();
        assert!(matches!(
            stack.pop("macro.pkg.a"),
            Err(InternalError::StackCorruption { got: None, .. })
        ));
    }
}
