//! Test execution engine: workspaces, process runner, verification and the
//! test/task drivers built on top of them.

pub mod command;
pub mod environment;
pub mod executer;
pub mod instance;
pub mod matching;
pub mod task;
pub mod test;
