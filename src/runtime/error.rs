//! Error types for the shared runtime services
//!
//! Domain errors use thiserror. Bind failures form a closed taxonomy that is
//! reported to programs as a negative integer in the index output variable,
//! never thrown across the instruction boundary.

use thiserror::Error;

/// Failure modes of a group bind operation.
///
/// Each variant maps to a distinct negative code so programs can branch on
/// the index output without string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BindError {
    /// The calling context is missing or no longer valid.
    #[error("calling controller is missing or invalid")]
    InvalidController,

    /// The mode token is neither claim nor access.
    #[error("bind mode is not recognized")]
    InvalidMode,

    /// Access mode named a pool that does not exist.
    #[error("named group does not exist")]
    GroupNotExist,

    /// Another live owner already claims this scope name.
    #[error("scope name is claimed by another controller")]
    GroupConflict,

    /// Refresh found no matching claimable units.
    #[error("no units available for the pool")]
    NoUnitsAvailable,

    /// Access mode found the pool but it has no members.
    #[error("named group is empty")]
    EmptyGroup,

    /// Claim mode was given a non-positive requested count.
    #[error("requested unit count must be positive")]
    InvalidCount,

    /// The unit-type selector does not resolve to a known kind.
    #[error("unit type selector does not resolve")]
    UnitTypeNotFound,
}

impl BindError {
    /// Negative integer reported in the index output on failure.
    pub fn code(&self) -> i32 {
        match self {
            BindError::InvalidController => -1,
            BindError::InvalidMode => -2,
            BindError::GroupNotExist => -3,
            BindError::GroupConflict => -4,
            BindError::NoUnitsAvailable => -5,
            BindError::EmptyGroup => -6,
            BindError::InvalidCount => -7,
            BindError::UnitTypeNotFound => -8,
        }
    }
}

/// Convenience result alias for bind operations.
pub type BindResult<T> = std::result::Result<T, BindError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_and_negative() {
        let all = [
            BindError::InvalidController,
            BindError::InvalidMode,
            BindError::GroupNotExist,
            BindError::GroupConflict,
            BindError::NoUnitsAvailable,
            BindError::EmptyGroup,
            BindError::InvalidCount,
            BindError::UnitTypeNotFound,
        ];
        let mut codes: Vec<i32> = all.iter().map(|err| err.code()).collect();
        assert!(codes.iter().all(|&code| code < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }
}
