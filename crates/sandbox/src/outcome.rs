use serde::{Deserialize, Serialize};

use crate::provider::CommandOutput;

pub const TIMEOUT_MESSAGE: &str = "Execution timed out";
pub const SYNTHETIC_EXIT_CODE: i32 = -1;

/// Why an execution did not produce a result from the user code itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub output: String,
    pub error: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

impl ExecutionOutcome {
    pub fn completed(output: impl Into<String>, error: impl Into<String>, exit_code: i32) -> Self {
        Self {
            output: output.into(),
            error: error.into(),
            exit_code,
            failure: None,
        }
    }

    pub fn timed_out() -> Self {
        Self::failed(FailureReason::Timeout, TIMEOUT_MESSAGE)
    }

    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: message.into(),
            exit_code: SYNTHETIC_EXIT_CODE,
            failure: Some(reason),
        }
    }

    /// Whether the sandbox can be handed to the next caller without a reset.
    pub fn is_clean(&self) -> bool {
        self.failure.is_none()
    }

    pub fn truncated(mut self, max_bytes: usize) -> Self {
        self.output = truncate_output(self.output, max_bytes);
        self.error = truncate_output(self.error, max_bytes);
        self
    }
}

impl From<CommandOutput> for ExecutionOutcome {
    fn from(output: CommandOutput) -> Self {
        Self::completed(output.stdout, output.stderr, output.exit_code)
    }
}

pub fn truncate_output(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let kept = slice_to_boundary(&text, max_bytes);
    let dropped = text.len() - kept.len();
    format!("{kept}\n... [output truncated, {dropped} bytes dropped]")
}

fn slice_to_boundary(text: &str, max_len: usize) -> &str {
    let mut end = max_len.min(text.len());
    while !text.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_outcome_is_distinguishable_from_user_exit() {
        let timed_out = ExecutionOutcome::timed_out();
        let user_failure = ExecutionOutcome::completed("", "boom", -1);
        assert_eq!(timed_out.exit_code, SYNTHETIC_EXIT_CODE);
        assert_eq!(timed_out.error, TIMEOUT_MESSAGE);
        assert_eq!(timed_out.failure, Some(FailureReason::Timeout));
        assert!(user_failure.failure.is_none());
        assert!(user_failure.is_clean());
        assert!(!timed_out.is_clean());
    }

    #[test]
    fn command_output_converts_without_failure() {
        let outcome = ExecutionOutcome::from(CommandOutput {
            stdout: "2\n".to_owned(),
            stderr: String::new(),
            exit_code: 0,
        });
        assert_eq!(outcome, ExecutionOutcome::completed("2\n", "", 0));
    }

    #[test]
    fn truncate_output_keeps_short_text() {
        assert_eq!(truncate_output("hello".to_owned(), 10), "hello");
    }

    #[test]
    fn truncate_output_respects_char_boundaries() {
        let text = "é".repeat(10);
        let truncated = truncate_output(text, 5);
        assert!(truncated.starts_with("éé\n"));
        assert!(truncated.contains("16 bytes dropped"));
    }

    #[test]
    fn failure_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FailureReason::Infrastructure).unwrap();
        assert_eq!(json, "\"infrastructure\"");
        let outcome = serde_json::to_value(ExecutionOutcome::completed("a", "", 0)).unwrap();
        assert!(outcome.get("failure").is_none());
    }
}
