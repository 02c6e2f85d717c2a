//! Stage outcomes and the packed return words guests use to report them.
//!
//! A stage export returns its status code in an integer. Stages that
//! need a second value pack both halves into one `i64`:
//!
//! | stage        | high 32 bits      | low 32 bits       |
//! |--------------|-------------------|-------------------|
//! | `score`      | score             | status code       |
//! | `postfilter` | nominating mode   | status code       |
//! | `permit`     | status code       | wait timeout (ms) |
//!
//! The reason string never travels in the return value; the guest sets
//! it through the `set_status_reason` host function.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Status code of a stage call, numbered as in the scheduler framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Code {
    Success = 0,
    Error = 1,
    Unschedulable = 2,
    UnschedulableAndUnresolvable = 3,
    Wait = 4,
    Skip = 5,
}

impl Code {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Code::Success),
            1 => Some(Code::Error),
            2 => Some(Code::Unschedulable),
            3 => Some(Code::UnschedulableAndUnresolvable),
            4 => Some(Code::Wait),
            5 => Some(Code::Skip),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Success => "Success",
            Code::Error => "Error",
            Code::Unschedulable => "Unschedulable",
            Code::UnschedulableAndUnresolvable => "UnschedulableAndUnresolvable",
            Code::Wait => "Wait",
            Code::Skip => "Skip",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: Code,
    reason: String,
}

impl Status {
    pub fn new(code: Code, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(Code::Success, "")
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(Code::Error, reason)
    }

    /// Build a status from a raw guest code and the reason it set.
    ///
    /// A code outside the known range is reported as an error rather
    /// than trusted.
    pub fn from_guest(code: i32, reason: Option<String>) -> Self {
        match Code::from_i32(code) {
            Some(code) => Self::new(code, reason.unwrap_or_default()),
            None => Self::error(format!("guest returned unknown status code {code}")),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::success()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.reason)
        }
    }
}

/// How a PostFilter result affects the pod's nominated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum NominatingMode {
    #[default]
    Noop = 0,
    Override = 1,
}

impl NominatingMode {
    /// Unknown modes fall back to `Noop`, which leaves the pod untouched.
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => NominatingMode::Override,
            _ => NominatingMode::Noop,
        }
    }
}

fn split_word(word: i64) -> (i32, i32) {
    ((word >> 32) as i32, word as i32)
}

/// Decode a `score` return word into `(score, code)`.
pub fn unpack_score(word: i64) -> (i32, i32) {
    split_word(word)
}

/// Decode a `postfilter` return word into `(nominating mode, code)`.
pub fn unpack_post_filter(word: i64) -> (NominatingMode, i32) {
    let (mode, code) = split_word(word);
    (NominatingMode::from_i32(mode), code)
}

/// Decode a `permit` return word into `(code, wait timeout)`.
pub fn unpack_permit(word: i64) -> (i32, Duration) {
    let (code, timeout) = split_word(word);
    (code, Duration::from_millis(u64::from(timeout as u32)))
}

/// Inverse of the decoders above, used by test guests and fixtures.
pub fn pack_word(high: i32, low: i32) -> i64 {
    (i64::from(high) << 32) | i64::from(low as u32)
}
