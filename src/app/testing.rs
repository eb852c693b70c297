use std::sync::Mutex;

use crate::app::adb::runner::{CommandOutput, CommandRunner};
use crate::app::error::AppError;

type Script = dyn Fn(&[String]) -> Result<CommandOutput, AppError> + Send + Sync;

/// `CommandRunner` whose answers come from a closure; every call is recorded.
pub struct ScriptedRunner {
    script: Box<Script>,
    calls: Mutex<Vec<Vec<String>>>,
    detached: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new(
        script: impl Fn(&[String]) -> Result<CommandOutput, AppError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn detached(&self) -> Vec<Vec<String>> {
        self.detached.lock().expect("detached").clone()
    }

    pub fn count_calls(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|args| args.iter().any(|arg| arg == needle))
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, args: &[String], _trace_id: &str) -> Result<CommandOutput, AppError> {
        self.calls.lock().expect("calls").push(args.to_vec());
        (self.script)(args)
    }

    fn spawn_detached(&self, args: &[String], _trace_id: &str) -> Result<(), AppError> {
        self.detached.lock().expect("detached").push(args.to_vec());
        Ok(())
    }
}

pub fn ok_stdout(stdout: &str) -> Result<CommandOutput, AppError> {
    Ok(CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
    })
}

pub fn failed(stderr: &str) -> Result<CommandOutput, AppError> {
    Ok(CommandOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: Some(1),
    })
}
