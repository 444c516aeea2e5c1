//! Tagged error taxonomy for the client runtime (spec §7).
//!
//! Every fallible public operation returns [`Result<T>`], an alias over
//! [`RtdbError`]. Each variant wraps a nested enum naming the specific
//! sub-reason, so callers can match on kind without parsing strings.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RtdbError>;

#[derive(Debug, Error)]
pub enum RtdbError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),
    #[error("budget error: {0}")]
    Budget(#[from] BudgetError),
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("invalid type tag: expected {expected}, found {found}")]
    InvalidTag { expected: u8, found: u8 },
    #[error("invalid UTF-8 in string payload")]
    InvalidUTF8,
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("integer overflow: value does not fit declared width")]
    Overflow,
    #[error("invalid float: NaN or infinite value is not encodable")]
    InvalidFloat,
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },
    #[error("unknown type reference: {0}")]
    UnknownTypeRef(u32),
}

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("TLS error: {0}")]
    TlsError(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error, Clone)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Error, Clone)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Error, Clone)]
pub enum SubscriptionError {
    #[error("subscription rejected: {reason}")]
    Rejected { reason: String },
    #[error("timed out waiting for subscription to apply")]
    AppliedTimeout,
    #[error("too many retries")]
    TooManyRetries,
}

#[derive(Debug, Error, Clone)]
pub enum BudgetError {
    #[error("energy exhausted: required {required}, available {available}")]
    Exhausted { required: i64, available: i64 },
    #[error("budget exceeded")]
    BudgetExceeded,
}

#[derive(Debug, Error, Clone)]
pub enum PoolError {
    #[error("no healthy connection available")]
    NoHealthyConnection,
    #[error("circuit open")]
    CircuitOpen,
    #[error("failed to acquire connection: {0}")]
    AcquireFailed(String),
}

#[derive(Debug, Error, Clone)]
pub enum ScheduleError {
    #[error("schedule not found")]
    NotFound,
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("schedule already exists")]
    AlreadyExists,
}
