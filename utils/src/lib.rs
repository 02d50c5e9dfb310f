/// Bounds-checked big-endian byte cursors.
pub mod bytes;
/// Error-handling utilities.
pub mod error;
