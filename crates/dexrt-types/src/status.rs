//! The per-class status state machine.

/// Lifecycle status of a class.
///
/// The success path is monotonic:
/// `NotReady -> Idx -> Loaded -> Resolving -> Resolved -> Verifying -> Verified ->
/// Initializing -> Initialized` (possibly via `VerifyingAtRuntime`).
/// `Error` and `Retired` are absorbing from any state except `Initialized`.
///
/// Variants are declared in ascending discriminant order so the derived
/// `Ord` matches the numeric ordering used for monotonicity checks.
#[repr(i8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClassStatus {
    /// Temp class replaced by its final class.
    Retired = -2,
    Error = -1,
    NotReady = 0,
    /// Descriptor and class-def index assigned.
    Idx = 1,
    /// Super class and interfaces loaded.
    Loaded = 2,
    /// Method and field linking in progress.
    Resolving = 3,
    /// Fully linked: vtable, itable, field offsets all final.
    Resolved = 4,
    Verifying = 5,
    /// Verifier soft failure; verification re-attempted at runtime.
    RetryVerificationAtRuntime = 6,
    VerifyingAtRuntime = 7,
    Verified = 8,
    Initializing = 9,
    Initialized = 10,
}

impl ClassStatus {
    pub fn from_i8(v: i8) -> ClassStatus {
        match v {
            -2 => ClassStatus::Retired,
            -1 => ClassStatus::Error,
            0 => ClassStatus::NotReady,
            1 => ClassStatus::Idx,
            2 => ClassStatus::Loaded,
            3 => ClassStatus::Resolving,
            4 => ClassStatus::Resolved,
            5 => ClassStatus::Verifying,
            6 => ClassStatus::RetryVerificationAtRuntime,
            7 => ClassStatus::VerifyingAtRuntime,
            8 => ClassStatus::Verified,
            9 => ClassStatus::Initializing,
            10 => ClassStatus::Initialized,
            _ => unreachable!("invalid class status {v}"),
        }
    }

    pub fn as_i8(self) -> i8 {
        self as i8
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClassStatus::Initialized | ClassStatus::Error | ClassStatus::Retired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_discriminants() {
        assert!(ClassStatus::Retired < ClassStatus::Error);
        assert!(ClassStatus::Error < ClassStatus::NotReady);
        assert!(ClassStatus::Loaded < ClassStatus::Resolved);
        assert!(ClassStatus::Resolved < ClassStatus::Verified);
        assert!(ClassStatus::Verified < ClassStatus::Initializing);
        assert!(ClassStatus::Initializing < ClassStatus::Initialized);
    }

    #[test]
    fn round_trips() {
        for v in [-2i8, -1, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10] {
            assert_eq!(ClassStatus::from_i8(v).as_i8(), v);
        }
    }
}
