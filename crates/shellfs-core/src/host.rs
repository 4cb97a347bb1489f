//! Host application seam.
//!
//! The VFS layer never talks to the terminal, the event loop or the
//! configuration store directly; everything it needs from the embedding
//! application comes through the [`Host`] trait. Production front ends
//! implement it once; tests use [`RecordingHost`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Services the embedding application provides to the VFS layer.
///
/// All methods have no-op defaults so a minimal embedder can use
/// [`NullHost`] unchanged.
pub trait Host {
    /// Show a transient progress/status message. Side effect only; the
    /// return value of the underlying UI call is never consulted.
    fn message(&self, _text: &str) {}

    /// Polled cancellation flag. During long transfers the engine checks
    /// this between chunks; a `true` triggers the abort/resync drain,
    /// not connection teardown.
    fn interrupted(&self) -> bool {
        false
    }

    /// Scoped acquisition of the interrupt key around raw pipe writes.
    fn enable_interrupt_key(&self) {}
    fn disable_interrupt_key(&self) {}

    /// User configuration directory; script overrides live under
    /// `<dir>/fish/<hostname>/<script-name>`.
    fn config_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Asked before an idle stamp is recorded for a connection. Return
    /// `true` if the application still displays a directory from it, in
    /// which case it is kept busy.
    fn in_use(&self, _mount_name: &str) -> bool {
        false
    }
}

/// Host that provides nothing. Useful for tools and tests that do not
/// care about progress output or cancellation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl Host for NullHost {}

/// A settable interrupt flag suitable for wiring to a signal handler or
/// a key poll.
#[derive(Debug, Default, Clone)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Read and clear, mirroring the "got interrupt" poll: asking about
    /// the interrupt consumes it.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Test host that records progress messages and exposes an interrupt
/// flag.
#[derive(Debug, Default)]
pub struct RecordingHost {
    messages: std::sync::Mutex<Vec<String>>,
    interrupt: InterruptFlag,
    config_dir: Option<PathBuf>,
}

impl RecordingHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config_dir(mut self, dir: &Path) -> Self {
        self.config_dir = Some(dir.to_path_buf());
        self
    }

    #[must_use]
    pub fn interrupt(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().expect("message log poisoned").clone()
    }
}

impl Host for RecordingHost {
    fn message(&self, text: &str) {
        self.messages
            .lock()
            .expect("message log poisoned")
            .push(text.to_string());
    }

    fn interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }

    fn config_dir(&self) -> Option<PathBuf> {
        self.config_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag_take_clears() {
        let flag = InterruptFlag::new();
        assert!(!flag.take());
        flag.raise();
        assert!(flag.is_raised());
        assert!(flag.take());
        assert!(!flag.is_raised());
    }

    #[test]
    fn test_recording_host_collects_messages() {
        let host = RecordingHost::new();
        host.message("one");
        host.message("two");
        assert_eq!(host.messages(), vec!["one", "two"]);
    }
}
