use core::fmt;

/// Progress of a single dispatch attempt.
///
/// Attempts move strictly forward through
/// `Validating -> QuotaChecked -> IdsSelected -> Locked -> Mutated -> Published -> Done`
/// and may exit to `Failed` from any of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DispatchPhase {
    Validating,
    QuotaChecked,
    IdsSelected,
    Locked,
    Mutated,
    Published,
    Done,
    Failed,
}

impl DispatchPhase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "VALIDATING",
            Self::QuotaChecked => "QUOTA_CHECKED",
            Self::IdsSelected => "IDS_SELECTED",
            Self::Locked => "LOCKED",
            Self::Mutated => "MUTATED",
            Self::Published => "PUBLISHED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// Whether shared state may have been mutated by the time an attempt
    /// reached this phase.
    pub const fn has_mutated(&self) -> bool {
        matches!(self, Self::Mutated | Self::Published | Self::Done)
    }
}

impl fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
