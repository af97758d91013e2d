// ABOUTME: Turns raw backend output into the structured execution result
// ABOUTME: Pure classification, UTF-8 decoding and size capping with no I/O

use crate::types::{ExecutionResult, ExecutionStatus, RawOutput, Termination};

/// Default ceiling for each of stdout and stderr in a result
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Classify and shape one execution's raw output
///
/// Status precedence: a killed run (timeout or cancel) is `TimedOut`
/// regardless of exit code, exit code 0 is `Completed`, everything else is
/// `Crashed`. Never produces `RejectedInput`.
pub fn normalize(raw: RawOutput, output_limit: usize) -> ExecutionResult {
    let status = match raw.termination {
        Termination::TimedOut | Termination::Cancelled => ExecutionStatus::TimedOut,
        Termination::Exited if raw.exit_code == Some(0) => ExecutionStatus::Completed,
        Termination::Exited => ExecutionStatus::Crashed,
    };

    let (stdout, stdout_cut) = decode_capped(&raw.stdout, output_limit);
    let (stderr, stderr_cut) = decode_capped(&raw.stderr, output_limit);

    ExecutionResult {
        status,
        exit_code: raw.exit_code,
        signal: raw.signal,
        stdout,
        stderr,
        duration_ms: u64::try_from(raw.duration.as_millis()).unwrap_or(u64::MAX),
        stdout_truncated: stdout_cut || raw.stdout_overflowed,
        stderr_truncated: stderr_cut || raw.stderr_overflowed,
    }
}

/// Lossy UTF-8 decode, cut to at most `limit` bytes on a char boundary
fn decode_capped(bytes: &[u8], limit: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= limit {
        return (text.into_owned(), false);
    }

    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}
