//! Error types shared by every crate in the elastore workspace.
//!
//! The engine distinguishes *recoverable* operation failures (constraint
//! violations, double activations, malformed predicates), which the caller
//! sees and the table shrugs off, from *structural* failures
//! ([`InternalCorruption`], [`SchemaMismatch`]), which abort the offending
//! stream but leave the partition usable. Debug builds additionally
//! `debug_assert!` on structural failures so invariant violations fail loudly
//! under test.
//!
//! [`InternalCorruption`]: ElastoreError::InternalCorruption
//! [`SchemaMismatch`]: ElastoreError::SchemaMismatch

use thiserror::Error;

/// Result type alias used throughout the workspace.
pub type ElastoreResult<T> = Result<T, ElastoreError>;

/// All errors surfaced by the elastore engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ElastoreError {
    /// A mutation would violate a uniqueness or nullability constraint. The
    /// operation has no side effects.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A stream of the given type is already active on this table.
    #[error("stream of type {0} is already active")]
    AlreadyActive(String),

    /// An activation predicate string could not be parsed.
    #[error("malformed stream predicate: {0}")]
    PredicateParse(String),

    /// An engine invariant was violated. The enclosing stream (if any) is
    /// aborted; the partition remains usable.
    #[error("internal corruption: {0}")]
    InternalCorruption(String),

    /// A tuple's width disagrees with the block layout it is entering.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The requested operation exists in the interface but is not supported
    /// by this engine build.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Construct an [`ElastoreError::InternalCorruption`] from a format string.
#[macro_export]
macro_rules! internal_err {
    ($($tt:tt)*) => {
        $crate::ElastoreError::InternalCorruption(format!($($tt)*))
    };
}

/// Return early with an [`ElastoreError::InternalCorruption`].
///
/// Debug builds panic instead, so that invariant violations abort under test
/// rather than being silently recovered.
#[macro_export]
macro_rules! internal {
    ($($tt:tt)*) => {{
        debug_assert!(false, $($tt)*);
        return Err($crate::internal_err!($($tt)*));
    }};
}

/// Assert a structural invariant, returning [`ElastoreError::InternalCorruption`]
/// (release) or panicking (debug) when it does not hold.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($tt:tt)*) => {
        if !$cond {
            $crate::internal!($($tt)*);
        }
    };
    ($cond:expr) => {
        if !$cond {
            $crate::internal!("invariant failed: {}", stringify!($cond));
        }
    };
}

/// Assert that two expressions are equal, as [`invariant!`] does.
#[macro_export]
macro_rules! invariant_eq {
    ($a:expr, $b:expr) => {{
        let (a, b) = (&$a, &$b);
        if a != b {
            $crate::internal!(
                "invariant failed: {} == {} ({:?} != {:?})",
                stringify!($a),
                stringify!($b),
                a,
                b
            );
        }
    }};
}

/// Construct an [`ElastoreError::Unsupported`] from a format string.
#[macro_export]
macro_rules! unsupported_err {
    ($($tt:tt)*) => {
        $crate::ElastoreError::Unsupported(format!($($tt)*))
    };
}
