use crate::error::Error;

/// Result type alias used throughout fstore.
///
/// This is a type alias for `std::result::Result<T, Error>`. All fstore
/// operations that can fail should return this type.
pub type Result<T> = std::result::Result<T, Error>;
