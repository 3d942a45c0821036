//! Flush lifecycle callbacks.

use unitwork_core::Error;

/// Callbacks receive no arguments; returning `Err` aborts the flush.
type SessionEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Persistence context lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before the cascade phase of a flush.
    BeforeFlush,
    /// Fired after a flush completed successfully.
    AfterFlush,
}

/// Holds registered lifecycle callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    pub(crate) fn register(&mut self, event: SessionEvent, callback: SessionEventFn) {
        match event {
            SessionEvent::BeforeFlush => self.before_flush.push(callback),
            SessionEvent::AfterFlush => self.after_flush.push(callback),
        }
    }

    pub(crate) fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fire_runs_callbacks_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut callbacks = SessionEventCallbacks::default();
        let c = Arc::clone(&calls);
        callbacks.register(
            SessionEvent::BeforeFlush,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        callbacks.fire(SessionEvent::BeforeFlush).unwrap();
        callbacks.fire(SessionEvent::AfterFlush).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fire_stops_on_error() {
        let mut callbacks = SessionEventCallbacks::default();
        callbacks.register(SessionEvent::AfterFlush, Box::new(|| Err(Error::ContextClosed)));
        callbacks.register(
            SessionEvent::AfterFlush,
            Box::new(|| -> Result<(), Error> { panic!("second callback must not run") }),
        );
        assert!(callbacks.fire(SessionEvent::AfterFlush).is_err());
        assert_eq!(
            format!("{callbacks:?}"),
            "SessionEventCallbacks { before_flush: 0, after_flush: 2 }"
        );
    }
}
