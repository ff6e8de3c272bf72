//! Stack error types

use crate::module::{FrameKind, ModuleId};
use thiserror::Error;

/// Broad classification of a [`StackError`].
///
/// Annotating an error with a backtrace never changes its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Arena growth denied by policy or allocator, or the hard maximum was reached
    ResourceExhausted,
    /// Misuse of the stack API
    InvalidArgument,
    /// The state resolver does not know the module
    NotFound,
    /// Opaque failure propagated from the state resolver
    ResolverFailure,
}

/// Errors produced by stack operations
#[derive(Debug, Error)]
pub enum StackError {
    /// Reservation does not fit and the stack may not grow
    #[error("stack overflow: {requested} bytes requested with {used} of {capacity} bytes in use")]
    ArenaExhausted {
        requested: usize,
        used: usize,
        capacity: usize,
    },

    /// Growing would exceed the maximum stack size
    #[error("stack overflow: {required} bytes required, maximum is {max}")]
    GrowthLimit { required: usize, max: usize },

    /// The allocator refused a storage request
    #[error("allocation of {size} bytes failed")]
    AllocationFailed { size: usize },

    /// Caller-supplied storage is smaller than the minimum
    #[error("stack storage of {size} bytes is below the minimum of {minimum}")]
    StorageTooSmall { size: usize, minimum: usize },

    /// Stack limits are inconsistent
    #[error("invalid stack limits: {reason}")]
    InvalidLimits { reason: String },

    /// `leave` without a matching `enter`
    #[error("leave on empty stack")]
    LeaveOnEmpty,

    /// Frame kind does not match the function's declared kind
    #[error("function {function} is {declared} and cannot be entered as a {requested} frame")]
    FrameKindMismatch {
        function: String,
        declared: FrameKind,
        requested: FrameKind,
    },

    /// Frame handle outlived its frame or the storage it pointed into
    #[error("stale frame handle at depth {depth}")]
    StaleFrame { depth: usize },

    /// Unwind target above the current depth
    #[error("cannot unwind to depth {target} from depth {depth}")]
    InvalidUnwindTarget { target: usize, depth: usize },

    /// Module not registered with the state resolver
    #[error("module {name} ({id}) not found")]
    ModuleNotFound { id: ModuleId, name: String },

    /// Failure reported by the state resolver itself
    #[error("module state resolver failed: {0}")]
    Resolver(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Error with the stack backtrace at the point it was raised
    #[error("{source}\nbacktrace:\n{backtrace}")]
    Annotated {
        source: Box<StackError>,
        backtrace: String,
    },
}

impl StackError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StackError::ArenaExhausted { .. }
            | StackError::GrowthLimit { .. }
            | StackError::AllocationFailed { .. } => ErrorKind::ResourceExhausted,
            StackError::StorageTooSmall { .. }
            | StackError::InvalidLimits { .. }
            | StackError::LeaveOnEmpty
            | StackError::FrameKindMismatch { .. }
            | StackError::StaleFrame { .. }
            | StackError::InvalidUnwindTarget { .. } => ErrorKind::InvalidArgument,
            StackError::ModuleNotFound { .. } => ErrorKind::NotFound,
            StackError::Resolver(_) => ErrorKind::ResolverFailure,
            StackError::Annotated { source, .. } => source.kind(),
        }
    }

    /// Wrap an arbitrary resolver failure
    pub fn resolver<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        StackError::Resolver(error.into())
    }

    /// Backtrace attached by [`crate::Stack::annotate_backtrace`], if any
    pub fn backtrace(&self) -> Option<&str> {
        match self {
            StackError::Annotated { backtrace, .. } => Some(backtrace),
            _ => None,
        }
    }

    /// The error with any backtrace annotation stripped
    pub fn root(&self) -> &StackError {
        match self {
            StackError::Annotated { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type for stack operations
pub type StackResult<T> = Result<T, StackError>;
