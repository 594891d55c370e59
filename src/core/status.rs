//! Status taxonomies
//!
//! Every status is a closed enum. On the wire a status is its numeric code,
//! which is what result consumers read; `Display` gives the snake_case name
//! used in logs.

use serde::{Serialize, Serializer};
use std::fmt;

/// Outcome of a single process run, as classified by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Timeout,
    Crash,
    Fail,
    CodeNotZero,
    /// Never produced by the process runner. Reserved for output parsers
    /// that detect a runtime error in a run that otherwise exited cleanly.
    RuntimeError,
}

impl ExecutionStatus {
    pub fn code(self) -> u8 {
        match self {
            ExecutionStatus::Success => 1,
            ExecutionStatus::Timeout => 2,
            ExecutionStatus::Crash => 3,
            ExecutionStatus::Fail => 4,
            ExecutionStatus::CodeNotZero => 5,
            ExecutionStatus::RuntimeError => 6,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Crash => "crash",
            ExecutionStatus::Fail => "fail",
            ExecutionStatus::CodeNotZero => "code_not_zero",
            ExecutionStatus::RuntimeError => "runtime_error",
        };
        write!(f, "{}", s)
    }
}

impl Serialize for ExecutionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// Grading verdict of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Success,
    SymbolNotFound,
    CompileFailed,
    ExecutionTimeout,
    ExecutionCrash,
    WrongOutput,
    ProfilerError,
    OutputNotFound,
    UnexpectedException,
    InternalError,
    UnzipFailed,
    ToolFailed,
}

impl TestStatus {
    pub fn code(self) -> u8 {
        match self {
            TestStatus::Success => 1,
            TestStatus::SymbolNotFound => 2,
            TestStatus::CompileFailed => 3,
            TestStatus::ExecutionTimeout => 4,
            TestStatus::ExecutionCrash => 5,
            TestStatus::WrongOutput => 6,
            TestStatus::ProfilerError => 7,
            TestStatus::OutputNotFound => 8,
            TestStatus::UnexpectedException => 9,
            TestStatus::InternalError => 10,
            TestStatus::UnzipFailed => 11,
            TestStatus::ToolFailed => 12,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Success => "success",
            TestStatus::SymbolNotFound => "symbol_not_found",
            TestStatus::CompileFailed => "compile_failed",
            TestStatus::ExecutionTimeout => "execution_timeout",
            TestStatus::ExecutionCrash => "execution_crash",
            TestStatus::WrongOutput => "wrong_output",
            TestStatus::ProfilerError => "profiler_error",
            TestStatus::OutputNotFound => "output_not_found",
            TestStatus::UnexpectedException => "unexpected_exception",
            TestStatus::InternalError => "internal_error",
            TestStatus::UnzipFailed => "unzip_failed",
            TestStatus::ToolFailed => "tool_failed",
        };
        write!(f, "{}", s)
    }
}

impl Serialize for TestStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// Lifecycle status of a whole program run against a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    AwaitingTests,
    CompileError,
    FinishedTesting,
    NoSourcesFound,
    CurrentlyTesting,
    Rejected,
}

impl TaskStatus {
    pub fn code(self) -> u8 {
        match self {
            TaskStatus::AwaitingTests => 1,
            TaskStatus::CompileError => 3,
            TaskStatus::FinishedTesting => 4,
            TaskStatus::NoSourcesFound => 6,
            TaskStatus::CurrentlyTesting => 7,
            TaskStatus::Rejected => 8,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::AwaitingTests => "awaiting_tests",
            TaskStatus::CompileError => "compile_error",
            TaskStatus::FinishedTesting => "finished_testing",
            TaskStatus::NoSourcesFound => "no_sources_found",
            TaskStatus::CurrentlyTesting => "currently_testing",
            TaskStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statuses_serialize_as_codes() {
        assert_eq!(serde_json::to_string(&TestStatus::WrongOutput).unwrap(), "6");
        assert_eq!(serde_json::to_string(&TaskStatus::Rejected).unwrap(), "8");
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::CodeNotZero).unwrap(),
            "5"
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TestStatus::ExecutionTimeout.to_string(), "execution_timeout");
        assert_eq!(TaskStatus::NoSourcesFound.to_string(), "no_sources_found");
    }
}
