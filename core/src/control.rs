//! Cancellation and progress reporting for long-running encode/decode calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag. Clones share the same flag, so a caller can keep
/// one handle and pass another to the encoder or decoder.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Modulating,
    Embedding,
    Analyzing,
    Detecting,
    Demodulating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub completed: usize,
    pub total: usize,
}

/// Receives progress updates. Called per analysis window and per symbol, so
/// implementations should return quickly.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: Progress);
}

impl<F> ProgressObserver for F
where
    F: Fn(Progress) + Send + Sync,
{
    fn on_progress(&self, progress: Progress) {
        self(progress)
    }
}

/// Bundles the optional cancellation token and observer threaded through a call.
/// Built by [`crate::Encoder`] and [`crate::Decoder`] from their builder methods.
#[derive(Clone, Default)]
pub struct Control {
    cancel: Option<CancellationToken>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl Control {
    pub(crate) fn new(
        cancel: Option<CancellationToken>,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Self {
        Self { cancel, observer }
    }

    pub(crate) fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self::new(Some(token), self.observer.clone())
    }

    pub(crate) fn with_observer(&self, observer: Arc<dyn ProgressObserver>) -> Self {
        Self::new(self.cancel.clone(), Some(observer))
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub(crate) fn report(&self, stage: Stage, completed: usize, total: usize) {
        if let Some(observer) = &self.observer {
            observer.on_progress(Progress {
                stage,
                completed,
                total,
            });
        }
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("cancel", &self.cancel)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
