//! Error types for bluelink
//!
//! Every failure surfaced by the library is a [`BleError`]: a stable numeric
//! [`ErrorCode`], a message, an optional cause, the time it was raised and a
//! free-form context map. Codes are partitioned into bands (see
//! [`ErrorCategory`]) so callers can match on them without comparing strings.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::time::SystemTime;

// ----------------------------------------------------------------------------
// Error Codes
// ----------------------------------------------------------------------------

/// Category of an [`ErrorCode`]; each category owns a band of 1000 codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    Connection,
    Discovery,
    Operation,
    ReadWrite,
    Adapter,
    Advertising,
    Validation,
    Resource,
    Platform,
}

impl ErrorCategory {
    /// First code of the band
    pub const fn base(self) -> u16 {
        match self {
            ErrorCategory::Connection => 1000,
            ErrorCategory::Discovery => 2000,
            ErrorCategory::Operation => 3000,
            ErrorCategory::ReadWrite => 4000,
            ErrorCategory::Adapter => 5000,
            ErrorCategory::Advertising => 6000,
            ErrorCategory::Validation => 7000,
            ErrorCategory::Resource => 8000,
            ErrorCategory::Platform => 9000,
        }
    }

    /// Whether `code` belongs to this category
    pub fn contains(self, code: ErrorCode) -> bool {
        (self.base()..self.base() + 1000).contains(&code.0)
    }
}

/// Stable, programmatically matchable error code
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // Connection
    pub const CONNECTION_FAILED: Self = Self(1000);
    pub const CONNECTION_TIMEOUT: Self = Self(1001);
    pub const CONNECTION_LOST: Self = Self(1002);
    pub const DEVICE_NOT_CONNECTED: Self = Self(1003);
    pub const DEVICE_NOT_FOUND: Self = Self(1004);

    // Discovery
    pub const DISCOVERY_FAILED: Self = Self(2000);
    pub const DISCOVERY_TIMEOUT: Self = Self(2001);
    pub const SERVICE_NOT_FOUND: Self = Self(2002);
    pub const CHARACTERISTIC_NOT_FOUND: Self = Self(2003);
    pub const DESCRIPTOR_NOT_FOUND: Self = Self(2004);

    // Operation
    pub const OPERATION_FAILED: Self = Self(3000);
    pub const OPERATION_TIMEOUT: Self = Self(3001);
    pub const OPERATION_CANCELLED: Self = Self(3002);
    pub const OPERATION_NOT_SUPPORTED: Self = Self(3003);
    pub const INVALID_OPERATION: Self = Self(3004);
    pub const RETRIES_EXHAUSTED: Self = Self(3005);
    pub const TOO_MANY_REQUESTS: Self = Self(3006);

    // Read / write
    pub const READ_FAILED: Self = Self(4000);
    pub const WRITE_FAILED: Self = Self(4001);
    pub const SUBSCRIBE_FAILED: Self = Self(4002);
    pub const UNSUBSCRIBE_FAILED: Self = Self(4003);
    pub const NOTIFY_FAILED: Self = Self(4004);
    pub const VALUE_TOO_LONG: Self = Self(4005);

    // Adapter / manager
    pub const ADAPTER_NOT_AVAILABLE: Self = Self(5000);
    pub const ADAPTER_DISABLED: Self = Self(5001);
    pub const ADAPTER_ENABLE_FAILED: Self = Self(5002);
    pub const ADAPTER_DISABLE_FAILED: Self = Self(5003);
    pub const SCAN_FAILED: Self = Self(5004);

    // Advertising
    pub const ADVERTISING_FAILED: Self = Self(6000);
    pub const ADVERTISING_DATA_TOO_LARGE: Self = Self(6001);
    pub const SERVICE_REGISTRATION_FAILED: Self = Self(6002);

    // Validation
    pub const VALIDATION_FAILED: Self = Self(7000);
    pub const INVALID_UUID: Self = Self(7001);
    pub const INVALID_ADDRESS: Self = Self(7002);
    pub const INVALID_PROPERTIES: Self = Self(7003);

    // Resource
    pub const RESOURCE_BUSY: Self = Self(8000);
    pub const RESOURCE_NOT_FOUND: Self = Self(8001);
    pub const RESOURCE_CLEANUP_FAILED: Self = Self(8002);
    pub const MULTIPLE_ERRORS: Self = Self(8003);

    // Platform
    pub const PLATFORM_ERROR: Self = Self(9000);
    pub const PLATFORM_NOT_SUPPORTED: Self = Self(9001);
    pub const PERMISSION_DENIED: Self = Self(9002);

    /// Raw numeric value
    pub const fn value(self) -> u16 {
        self.0
    }

    /// Band this code belongs to
    pub fn category(self) -> ErrorCategory {
        match self.0 {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Discovery,
            3000..=3999 => ErrorCategory::Operation,
            4000..=4999 => ErrorCategory::ReadWrite,
            5000..=5999 => ErrorCategory::Adapter,
            6000..=6999 => ErrorCategory::Advertising,
            7000..=7999 => ErrorCategory::Validation,
            8000..=8999 => ErrorCategory::Resource,
            _ => ErrorCategory::Platform,
        }
    }

    /// Timeouts, busy resources, rate limiting and lost links are transient
    pub fn is_temporary(self) -> bool {
        matches!(
            self,
            ErrorCode::CONNECTION_TIMEOUT
                | ErrorCode::DISCOVERY_TIMEOUT
                | ErrorCode::OPERATION_TIMEOUT
                | ErrorCode::RESOURCE_BUSY
                | ErrorCode::TOO_MANY_REQUESTS
                | ErrorCode::CONNECTION_LOST
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Validation Error
// ----------------------------------------------------------------------------

/// A rejected input parameter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {parameter} = {value}: {reason}")]
pub struct ValidationError {
    pub parameter: String,
    pub value: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(
        parameter: impl Into<String>,
        value: impl fmt::Debug,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            parameter: parameter.into(),
            value: format!("{:?}", value),
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Structured Error
// ----------------------------------------------------------------------------

type Cause = Box<dyn StdError + Send + Sync + 'static>;

/// Structured error returned by every fallible bluelink operation
#[derive(Debug, thiserror::Error)]
#[error("[{code}] {message}{}", render_context(.context))]
pub struct BleError {
    code: ErrorCode,
    message: String,
    #[source]
    cause: Option<Cause>,
    timestamp: SystemTime,
    context: BTreeMap<String, String>,
}

fn render_context(context: &BTreeMap<String, String>) -> String {
    if context.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = context.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!(" ({})", pairs.join(", "))
}

impl BleError {
    /// Create an error with the given code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            timestamp: SystemTime::now(),
            context: BTreeMap::new(),
        }
    }

    /// Attach the underlying cause
    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Add a context entry; later entries with the same key replace earlier ones
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Wrap a driver failure with the operation and target it concerned.
    ///
    /// Temporary driver errors keep their code so they stay retryable; anything
    /// else is reported under `fallback`.
    pub fn from_driver(
        err: BleError,
        fallback: ErrorCode,
        operation: &str,
        target: impl ToString,
    ) -> Self {
        let code = if err.is_temporary() || err.code == ErrorCode::OPERATION_CANCELLED {
            err.code
        } else {
            fallback
        };
        BleError::new(code, format!("{} failed", operation))
            .with_context("operation", operation)
            .with_context("target", target)
            .with_cause(err)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    /// The direct cause, if any
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// The direct cause when it is itself a [`BleError`]
    pub fn ble_cause(&self) -> Option<&BleError> {
        self.cause().and_then(|c| c.downcast_ref::<BleError>())
    }

    /// The [`ValidationError`] behind a validation-band error
    pub fn validation(&self) -> Option<&ValidationError> {
        self.cause().and_then(|c| c.downcast_ref::<ValidationError>())
    }

    /// The individual failures of a joined error
    pub fn multi(&self) -> Option<&MultiError> {
        self.cause().and_then(|c| c.downcast_ref::<MultiError>())
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    pub fn is_temporary(&self) -> bool {
        self.code.is_temporary()
    }

    /// Temporary and not an explicit cancellation
    pub fn is_retryable(&self) -> bool {
        self.is_temporary() && self.code != ErrorCode::OPERATION_CANCELLED
    }
}

impl From<ValidationError> for BleError {
    fn from(err: ValidationError) -> Self {
        BleError::new(ErrorCode::VALIDATION_FAILED, err.to_string())
            .with_context("parameter", &err.parameter)
            .with_cause(err)
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl BleError {
    pub fn invalid_uuid(input: &str, reason: &str) -> Self {
        BleError::new(ErrorCode::INVALID_UUID, format!("invalid UUID {:?}: {}", input, reason))
    }

    pub fn invalid_address(input: &str, reason: &str) -> Self {
        BleError::new(
            ErrorCode::INVALID_ADDRESS,
            format!("invalid address {:?}: {}", input, reason),
        )
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        BleError::new(ErrorCode::INVALID_OPERATION, message)
    }

    pub fn resource_busy(message: impl Into<String>) -> Self {
        BleError::new(ErrorCode::RESOURCE_BUSY, message)
    }

    pub fn cancelled(operation: &str) -> Self {
        BleError::new(ErrorCode::OPERATION_CANCELLED, format!("{} cancelled", operation))
            .with_context("operation", operation)
    }

    pub fn not_supported(what: impl Into<String>) -> Self {
        BleError::new(ErrorCode::OPERATION_NOT_SUPPORTED, what)
    }

    pub fn not_connected(target: impl ToString) -> Self {
        BleError::new(ErrorCode::DEVICE_NOT_CONNECTED, "device not connected")
            .with_context("target", target)
    }
}

// ----------------------------------------------------------------------------
// Error Joining
// ----------------------------------------------------------------------------

/// Several independent failures reported together
#[derive(Debug, thiserror::Error)]
#[error("{} errors: {}", .errors.len(), summarize(.errors))]
pub struct MultiError {
    errors: Vec<BleError>,
}

fn summarize(errors: &[BleError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl MultiError {
    pub fn errors(&self) -> &[BleError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_errors(self) -> Vec<BleError> {
        self.errors
    }
}

/// Join errors: none yields `None`, one yields that error, several yield a
/// [`ErrorCode::MULTIPLE_ERRORS`] error whose cause is a [`MultiError`]
pub fn combine_errors(errors: impl IntoIterator<Item = BleError>) -> Option<BleError> {
    let mut errors: Vec<BleError> = errors.into_iter().collect();
    match errors.len() {
        0 => None,
        1 => errors.pop(),
        n => Some(
            BleError::new(ErrorCode::MULTIPLE_ERRORS, format!("{} operations failed", n))
                .with_context("count", n)
                .with_cause(MultiError { errors }),
        ),
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type BleResult<T> = core::result::Result<T, BleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_fall_in_their_band() {
        assert_eq!(ErrorCode::CONNECTION_LOST.category(), ErrorCategory::Connection);
        assert_eq!(ErrorCode::DISCOVERY_TIMEOUT.category(), ErrorCategory::Discovery);
        assert_eq!(ErrorCode::OPERATION_CANCELLED.category(), ErrorCategory::Operation);
        assert_eq!(ErrorCode::WRITE_FAILED.category(), ErrorCategory::ReadWrite);
        assert_eq!(ErrorCode::ADAPTER_DISABLED.category(), ErrorCategory::Adapter);
        assert_eq!(ErrorCode::ADVERTISING_FAILED.category(), ErrorCategory::Advertising);
        assert_eq!(ErrorCode::INVALID_UUID.category(), ErrorCategory::Validation);
        assert_eq!(ErrorCode::RESOURCE_BUSY.category(), ErrorCategory::Resource);
        assert_eq!(ErrorCode::PERMISSION_DENIED.category(), ErrorCategory::Platform);
        assert!(ErrorCategory::Resource.contains(ErrorCode::MULTIPLE_ERRORS));
        assert!(!ErrorCategory::Resource.contains(ErrorCode::READ_FAILED));
    }

    #[test]
    fn test_temporary_and_retryable() {
        let timeout = BleError::new(ErrorCode::CONNECTION_TIMEOUT, "timed out");
        assert!(timeout.is_temporary());
        assert!(timeout.is_retryable());

        let busy = BleError::resource_busy("scan active");
        assert!(busy.is_retryable());

        let cancelled = BleError::cancelled("scan");
        assert!(!cancelled.is_retryable());

        let invalid = BleError::invalid_uuid("xyz", "bad length");
        assert!(!invalid.is_temporary());
    }

    #[test]
    fn test_context_and_display() {
        let err = BleError::new(ErrorCode::READ_FAILED, "read failed")
            .with_context("target", "2a19")
            .with_context("attempt", 2);
        assert_eq!(err.context_value("target"), Some("2a19"));
        assert_eq!(err.context_value("attempt"), Some("2"));
        assert_eq!(err.to_string(), "[E4000] read failed (attempt=2, target=2a19)");
    }

    #[test]
    fn test_driver_wrapping_preserves_cause() {
        let driver = BleError::new(ErrorCode::PLATFORM_ERROR, "hci error 0x3e");
        let wrapped = BleError::from_driver(
            driver,
            ErrorCode::CONNECTION_FAILED,
            "connect",
            "12:34:56:78:9A:BC",
        );
        assert_eq!(wrapped.code(), ErrorCode::CONNECTION_FAILED);
        assert_eq!(wrapped.context_value("operation"), Some("connect"));
        let inner = wrapped.ble_cause().unwrap();
        assert_eq!(inner.code(), ErrorCode::PLATFORM_ERROR);
        assert!(std::error::Error::source(&wrapped).is_some());

        let timeout = BleError::new(ErrorCode::CONNECTION_TIMEOUT, "no response");
        let wrapped = BleError::from_driver(timeout, ErrorCode::CONNECTION_FAILED, "connect", "x");
        assert_eq!(wrapped.code(), ErrorCode::CONNECTION_TIMEOUT);
    }

    #[test]
    fn test_validation_error_conversion() {
        let err: BleError =
            ValidationError::new("window", 200u64, "window exceeds interval").into();
        assert_eq!(err.code(), ErrorCode::VALIDATION_FAILED);
        let validation = err.validation().unwrap();
        assert_eq!(validation.parameter, "window");
        assert_eq!(validation.value, "200");
    }

    #[test]
    fn test_combine_errors() {
        assert!(combine_errors(Vec::new()).is_none());

        let single = combine_errors(vec![BleError::new(ErrorCode::READ_FAILED, "a")]).unwrap();
        assert_eq!(single.code(), ErrorCode::READ_FAILED);
        assert!(single.multi().is_none());

        let joined = combine_errors(vec![
            BleError::new(ErrorCode::READ_FAILED, "a"),
            BleError::new(ErrorCode::WRITE_FAILED, "b"),
            BleError::new(ErrorCode::PLATFORM_ERROR, "c"),
        ])
        .unwrap();
        assert_eq!(joined.code(), ErrorCode::MULTIPLE_ERRORS);
        let multi = joined.multi().unwrap();
        assert_eq!(multi.len(), 3);
        assert_eq!(multi.errors()[1].code(), ErrorCode::WRITE_FAILED);
    }
}
