//! Return codes carried in the `return_code` header word.
//!
//! Zero is success. Negative codes are bucketed by severity: above
//! [`WARNING_LIMIT`] is a warning, down to [`ERROR_LIMIT`] an error,
//! and at or below [`FATAL_LIMIT`] fatal for the connection.

pub const SUCCESS: i32 = 0;

pub const WARNING_LIMIT: i32 = -1;
pub const ERROR_LIMIT: i32 = -1000;
pub const FATAL_LIMIT: i32 = -2000;

pub const FAIL: i32 = -1001;
pub const NO_MGROUP: i32 = -1002;
pub const DUPLICATE_MEMBER: i32 = -1003;
pub const BAD_MGROUP: i32 = -1004;
pub const NOT_GROUP_MEMBER: i32 = -1005;
pub const SE_FAIL_SOFT: i32 = -1006;

pub const NO_CONNECTION: i32 = -2001;
pub const DEAD: i32 = -2002;
pub const NAKED: i32 = -2003;
pub const SE_FAIL_HARD: i32 = -2004;

/// Whether `code` is severe enough to take the connection down.
pub fn is_fatal(code: i32) -> bool {
    code <= FATAL_LIMIT
}
