use std::time::Duration;

/// Errors surfaced by the engine.
///
/// Per-iteration failures are never represented here — they are captured as
/// `iteration_failed` rate samples and the run keeps going. Only
/// [`Error::Config`] stops a run from starting, and only
/// [`Error::ThresholdAbort`] stops one that is already running.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A scenario or threshold definition was malformed. Raised at setup,
    /// before any executor starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The VU pool could not supply a worker within the allowed wait.
    #[error("vu pool exhausted after waiting {waited:?} at capacity {capacity}")]
    ResourceExhausted { capacity: usize, waited: Duration },

    /// An executor's maximum duration elapsed before its intended work
    /// completed. Non-fatal; the executor reports `TimedOut`.
    #[error("executor `{scenario}` hit its max duration with work remaining")]
    Timeout { scenario: String },

    /// An abort-on-fail threshold tripped during a periodic evaluation.
    #[error("aborted by failing threshold `{0}`")]
    ThresholdAbort(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
