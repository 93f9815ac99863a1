//! Stable exit codes for the `telic` CLI.

/// Full success: verified value, no pending or blocked tests.
pub const FULL_SUCCESS: i32 = 0;
/// Incomplete: pending work remained, saturation, or a fatal
/// configuration error.
pub const INCOMPLETE: i32 = 1;
/// Partial success: everything runnable passed but blocked tests remain.
pub const PARTIAL_SUCCESS: i32 = 2;
