//! Per-invocation execution context
//!
//! Everything an operation needs beyond its arguments travels in an
//! [`ExecutionContext`]: settings, the probed runtime capability and the
//! cancellation signal. Nothing is read from process-wide globals.

use crate::config::Settings;
use crate::error::{Result, StackError};
use crate::runtime::RuntimeCapability;
use once_cell::sync::OnceCell;
use tokio::sync::watch;

/// Sending half of a cancellation signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation of every operation observing the paired signal
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a connected handle/signal pair
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_, signal) = Self::new();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Fail with `Cancelled` if cancellation was already requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StackError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Execution context shared by the operations of one process invocation
#[derive(Debug)]
pub struct ExecutionContext {
    settings: Settings,
    capability: OnceCell<RuntimeCapability>,
    cancel: CancelSignal,
}

impl ExecutionContext {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            capability: OnceCell::new(),
            cancel: CancelSignal::never(),
        }
    }

    /// Attach a cancellation signal
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// The probed runtime capability, or `RuntimeNotProbed`
    pub fn capability(&self) -> Result<&RuntimeCapability> {
        self.capability.get().ok_or(StackError::RuntimeNotProbed)
    }

    /// Record the probe result. The first capability attached wins.
    pub fn attach_capability(&self, capability: RuntimeCapability) -> &RuntimeCapability {
        self.capability.get_or_init(|| capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Dialect, Version};
    use std::time::Duration;

    #[test]
    fn test_capability_missing_until_attached() {
        let ctx = ExecutionContext::new(Settings::default());
        assert!(matches!(ctx.capability(), Err(StackError::RuntimeNotProbed)));

        let first = RuntimeCapability::new(Dialect::Integrated, Version::new(2, 24, 6));
        let second = RuntimeCapability::new(Dialect::Legacy, Version::new(1, 29, 2));
        ctx.attach_capability(first.clone());
        ctx.attach_capability(second);

        assert_eq!(ctx.capability().unwrap(), &first);
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let (handle, signal) = CancelSignal::new();
        let waiter = signal.clone();

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter.cancelled())
            .await
            .unwrap();
        assert!(signal.is_cancelled());
        assert!(matches!(signal.check(), Err(StackError::Cancelled)));
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
        assert!(signal.check().is_ok());
    }
}
