//! Process exit codes.
//! A job that ran and failed exits with its `ErrorClass::exit_code` (1-6).

pub const SUCCESS: i32 = 0;
pub const STARTUP_FAILED: i32 = 10; // Unreadable event or config file, or bad store URL
