use strum_macros::{AsRefStr, Display, EnumString};

/// Result of actuating a single promise, or of a whole bundle/run.
///
/// Ordering is severity: a composite outcome is the worst (`max`) of its
/// parts, and a run exits non-zero when any promise reaches
/// [`Outcome::Fail`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    /// Host already compliant, nothing done.
    #[default]
    Noop,
    /// Not evaluated this run (lock held, ifelapsed throttle).
    Skipped,
    /// A repair was made (or would have been made, in dry-run).
    Change,
    /// A repair is needed but policy only allows warning.
    Warn,
    /// The promise is self-contradictory or non-convergent; not retried.
    Interrupted,
    /// Actuation was attempted and failed.
    Fail,
}

impl Outcome {
    /// Worst-of merge used when folding sub-operation results upward.
    pub fn and(self, other: Outcome) -> Outcome {
        self.max(other)
    }

    /// Fold an iterator of outcomes into the worst one seen.
    pub fn worst<I: IntoIterator<Item = Outcome>>(iter: I) -> Outcome {
        iter.into_iter().fold(Outcome::Noop, Outcome::and)
    }

    pub fn is_failure(self) -> bool {
        self >= Outcome::Fail
    }
}
