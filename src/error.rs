// src/error.rs
//! Unified error types and error scopes
//!
//! Every reported error carries an *escope*, a 32-bit tag identifying the
//! place inside the core where it arose. Error codes reserve the high bit
//! as a fatal marker: fatal errors terminate the process after best-effort
//! logging, everything else is returned to the caller and counted on the
//! reporting core.

use thiserror::Error;

/// Result alias used across the crate
pub type EmResult<T> = Result<T, EmError>;

/// Error kinds of the Event Machine core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmError {
    /// Illegal context for this call
    #[error("illegal context for this call")]
    BadContext,
    /// Illegal object state for this call
    #[error("illegal object state for this call")]
    BadState,
    /// Id not from a valid range
    #[error("id not from a valid range")]
    BadId,
    /// Resource allocation failed
    #[error("resource allocation failed")]
    AllocFailed,
    /// Resource already reserved by someone else
    #[error("resource already reserved")]
    NotFree,
    /// Resource not found
    #[error("resource not found")]
    NotFound,
    /// Value over the limit
    #[error("value over the limit")]
    TooLarge,
    /// Failure in a library function
    #[error("failure in a library function")]
    LibFailed,
    /// Implementation missing
    #[error("implementation missing")]
    NotImplemented,
    /// Pointer from a bad memory area
    #[error("pointer from a bad memory area")]
    BadPointer,
}

impl EmError {
    /// Numerical error code, without the fatal bit
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::BadContext => 1,
            Self::BadState => 2,
            Self::BadId => 3,
            Self::AllocFailed => 4,
            Self::NotFree => 5,
            Self::NotFound => 6,
            Self::TooLarge => 7,
            Self::LibFailed => 8,
            Self::NotImplemented => 9,
            Self::BadPointer => 10,
        }
    }
}

/// Fatal marker bit of an error code
pub const ERROR_FATAL_MASK: u32 = 0x8000_0000;

/// Mark an error code fatal
#[must_use]
pub const fn error_set_fatal(code: u32) -> u32 {
    code | ERROR_FATAL_MASK
}

/// Test whether an error code carries the fatal marker
#[must_use]
pub const fn error_is_fatal(code: u32) -> bool {
    code & ERROR_FATAL_MASK != 0
}

/// Error scope tags
///
/// An escope identifies where within the core an error originated. The
/// internal scopes use the `0xFE` type in the top byte.
pub mod escope {
    /// Error scope tag
    pub type Escope = u32;

    const INTERNAL_MASK: u32 = 0xFE << 24;

    /// Test whether an escope identifies an internal function
    #[must_use]
    pub const fn is_internal(escope: Escope) -> bool {
        escope & 0xFF00_0000 == INTERNAL_MASK
    }

    /* init escopes */
    pub const INIT: Escope = INTERNAL_MASK | 0x0001;
    pub const INIT_CORE: Escope = INTERNAL_MASK | 0x0002;

    /* event-group escopes */
    pub const EVENT_GROUP_CREATE: Escope = INTERNAL_MASK | 0x0100;
    pub const EVENT_GROUP_DELETE: Escope = INTERNAL_MASK | 0x0101;
    pub const EVENT_GROUP_APPLY: Escope = INTERNAL_MASK | 0x0102;
    pub const EVENT_GROUP_INCREMENT: Escope = INTERNAL_MASK | 0x0103;
    pub const EVENT_GROUP_UPDATE: Escope = INTERNAL_MASK | 0x0104;

    /* queue-group escopes */
    pub const QUEUE_GROUP_CREATE: Escope = INTERNAL_MASK | 0x0200;
    pub const QUEUE_GROUP_MODIFY: Escope = INTERNAL_MASK | 0x0201;
    pub const QUEUE_GROUP_DELETE: Escope = INTERNAL_MASK | 0x0202;
    pub const QUEUE_GROUP_DEFAULT: Escope = INTERNAL_MASK | 0x0206;

    /* object lifecycle escopes */
    pub const EO_ALLOC: Escope = INTERNAL_MASK | 0x0401;
    pub const QUEUE_ALLOC: Escope = INTERNAL_MASK | 0x0402;
    pub const QUEUE_INIT: Escope = INTERNAL_MASK | 0x0403;
    pub const QUEUE_STATE_CHANGE: Escope = INTERNAL_MASK | 0x0404;
    pub const EO_START_LOCAL_DONE: Escope = INTERNAL_MASK | 0x0405;
    pub const EO_STOP_LOCAL_DONE: Escope = INTERNAL_MASK | 0x0406;
    pub const EO_LOCAL_FUNC_CALL_REQ: Escope = INTERNAL_MASK | 0x0408;
    pub const EVENT_ALLOC: Escope = INTERNAL_MASK | 0x0409;
    pub const EVENT_FREE: Escope = INTERNAL_MASK | 0x040A;

    /* scheduler escopes */
    pub const SCHED_QUEUE_INIT: Escope = INTERNAL_MASK | 0x0500;
    pub const SCHEDULE_ATOMIC: Escope = INTERNAL_MASK | 0x0501;
    pub const SCHEDULE_PARALLEL: Escope = INTERNAL_MASK | 0x0502;
    pub const SCHEDULE_PARALLEL_ORD: Escope = INTERNAL_MASK | 0x0503;
    pub const PARALLEL_ORDERED_MAINTAIN_ORDER: Escope = INTERNAL_MASK | 0x0504;
    pub const SEND_ATOMIC: Escope = INTERNAL_MASK | 0x0507;
    pub const SEND_PARALLEL: Escope = INTERNAL_MASK | 0x0508;
    pub const SEND_PARALLEL_ORD: Escope = INTERNAL_MASK | 0x0509;
    pub const SEND_FROM_PARALLEL_ORD: Escope = INTERNAL_MASK | 0x050A;
    pub const DISPATCH: Escope = INTERNAL_MASK | 0x050B;

    /* internal-event escopes */
    pub const INTERNAL_NOTIF: Escope = INTERNAL_MASK | 0x0600;
    pub const INTERNAL_EVENT_RECEIVE: Escope = INTERNAL_MASK | 0x0601;
}
