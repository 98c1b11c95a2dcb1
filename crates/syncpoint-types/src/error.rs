use std::any::Any;
use std::fmt;

/// Canonical category for a settlement failure.
///
/// This is a closed set: combinators and adapters map every failure onto one
/// of these kinds, and `catch` filters match against them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A second consumer was attached to a non-shared deferred.
    ///
    /// Programmer error; surfaced as a panic from the detecting call, never
    /// as a rejection delivered through the graph.
    Ownership,
    /// A deferred was used outside the barrier that owns it.
    ///
    /// Programmer error, like [`ErrorKind::Ownership`].
    CrossBarrier,
    /// Every parent of a `when_any` rejected.
    AllFailed,
    /// A `when_some` can no longer reach its required count of successes.
    Insufficient,
    /// The node was settled by the cancellation engine.
    Cancelled,
    /// The barrier was interrupted from outside the event loop.
    Interrupted,
    /// An operation exceeded its deadline.
    Timeout,
    /// A user callback failed; the message carries the original payload.
    User,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ownership => write!(f, "ownership"),
            Self::CrossBarrier => write!(f, "cross-barrier"),
            Self::AllFailed => write!(f, "all-failed"),
            Self::Insufficient => write!(f, "insufficient"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Timeout => write!(f, "timeout"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Structured settlement failure.
///
/// This replaces raw string errors with a stable shape that is easy to:
/// - classify (`kind`) for `catch` filters and retry policy,
/// - render (`message`) for user-facing summaries,
/// - trace (`causes`) back through aggregate failures such as `all-failed`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    /// Coarse failure category used by `catch` filters and observability.
    pub kind: ErrorKind,
    /// Human-readable summary safe to display in normal logs and UIs.
    pub message: String,
    /// Underlying failures, in a deterministic order defined per kind.
    ///
    /// Empty for leaf failures. `all-failed` carries one cause per parent in
    /// index order; `insufficient` carries causes in settlement order.
    pub causes: Vec<Failure>,
}

impl Failure {
    /// Creates a leaf [`Failure`] with no causes.
    ///
    /// Use [`Self::caused_by`] to chain underlying failures.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Appends an underlying failure, fluent style.
    pub fn caused_by(mut self, cause: Failure) -> Self {
        self.causes.push(cause);
        self
    }

    /// A cancellation settlement with the given reason.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, reason)
    }

    /// A timeout failure with the given description.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// The aggregate failure of a `when_any` whose parents all rejected.
    ///
    /// `causes` must be in parent index order.
    pub fn all_failed(causes: Vec<Failure>) -> Self {
        Self {
            kind: ErrorKind::AllFailed,
            message: format!("all {} parents rejected", causes.len()),
            causes,
        }
    }

    /// The failure of a `when_some` that can no longer succeed.
    pub fn insufficient(need: usize, causes: Vec<Failure>) -> Self {
        Self {
            kind: ErrorKind::Insufficient,
            message: format!("fewer than {need} successes remain possible"),
            causes,
        }
    }

    /// Translates a caught panic payload into a `user`-kind failure.
    ///
    /// String payloads (the common case for `panic!`) are carried verbatim in
    /// the message; anything else is summarised.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "callback panicked with a non-string payload".to_string()
        };
        Self::new(ErrorKind::User, message)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn display_uses_kind_slug_and_message() {
        let f = Failure::new(ErrorKind::Timeout, "no response after 2s");
        assert_eq!(f.to_string(), "timeout: no response after 2s");
    }

    #[test]
    fn aggregate_constructors_preserve_cause_order() {
        let f = Failure::all_failed(vec![
            Failure::new(ErrorKind::User, "first"),
            Failure::new(ErrorKind::Timeout, "second"),
        ]);
        assert_eq!(f.kind, ErrorKind::AllFailed);
        assert_eq!(f.causes[0].message, "first");
        assert_eq!(f.causes[1].message, "second");
    }

    #[test]
    fn from_panic_extracts_string_payloads() {
        let from_str = Failure::from_panic(Box::new("boom"));
        assert_eq!(from_str.kind, ErrorKind::User);
        assert_eq!(from_str.message, "boom");

        let from_string = Failure::from_panic(Box::new("owned".to_string()));
        assert_eq!(from_string.message, "owned");

        let from_other = Failure::from_panic(Box::new(17_u32));
        assert_eq!(from_other.message, "callback panicked with a non-string payload");
    }
}
