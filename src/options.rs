use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Configures a single evaluation.
///
/// ```
/// use evalgraph::{Interrupt, Options};
///
/// let interrupt = Interrupt::new();
/// let options = Options::new()
///     .keep_going(true)
///     .threads(4)
///     .interrupt(interrupt.clone());
/// assert_eq!(options.thread_count(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    keep_going: bool,
    threads: NonZeroUsize,
    change_pruning: bool,
    interrupt: Interrupt,
}

impl Options {
    /// Fail-fast options with one worker per available core.
    pub fn new() -> Self {
        Self {
            keep_going: false,
            threads: std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            change_pruning: true,
            interrupt: Interrupt::new(),
        }
    }

    /// Whether to keep evaluating independent subgraphs after an error.
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// The maximum number of computations running in parallel. Zero is
    /// treated as one.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = NonZeroUsize::new(threads).unwrap_or(NonZeroUsize::MIN);
        self
    }

    /// Whether a dirty entry may skip recomputation when none of its
    /// dependencies changed.
    pub fn change_pruning(mut self, enabled: bool) -> Self {
        self.change_pruning = enabled;
        self
    }

    /// Observe this handle for external cancellation.
    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Whether keep-going mode is enabled.
    pub fn is_keep_going(&self) -> bool {
        self.keep_going
    }

    /// The configured number of workers.
    pub fn thread_count(&self) -> usize {
        self.threads.get()
    }

    /// Whether change pruning is enabled.
    pub fn is_change_pruning(&self) -> bool {
        self.change_pruning
    }

    /// The interrupt handle observed by the evaluation.
    pub fn interrupt_handle(&self) -> &Interrupt {
        &self.interrupt
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloneable handle to cooperatively cancel an evaluation.
///
/// Cancellation is observed at the start of every computation invocation and
/// at every dependency request. It never preempts a running computation.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// Create a handle that is not triggered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request so the handle can be reused.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
