//! Batched wrappers around the external datapath tools. Each transaction
//! queues operations, runs them in order through the injected runner, and
//! surfaces the first error from `commit`, so no flow or device mutation
//! interleaves mid-transaction.

pub mod ip;
pub mod iptables;
pub mod ovs;

use async_trait::async_trait;

use crate::{Error, Result};

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the program to completion, returning combined output. A
    /// non-zero exit is an error carrying the output.
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Spawns real processes.
pub struct ExecRunner;

#[async_trait]
impl CommandRunner for ExecRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(Error::Command {
                program: program.to_owned(),
                args: args.to_vec(),
                output: combined,
            });
        }
        Ok(combined)
    }
}

pub async fn set_sysctl(runner: &dyn CommandRunner, key: &str, value: &str) -> Result<()> {
    runner
        .run("sysctl", &["-w".to_owned(), format!("{key}={value}")])
        .await?;
    Ok(())
}

pub(crate) fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Records every command line and answers queries from canned output.
    pub struct FakeRunner {
        pub commands: Mutex<Vec<String>>,
        pub outputs: Mutex<HashMap<String, String>>,
        pub failures: Mutex<HashMap<String, String>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                outputs: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
            }
        }

        pub fn stub_output(&self, command: &str, output: &str) {
            self.outputs
                .lock()
                .unwrap()
                .insert(command.to_owned(), output.to_owned());
        }

        pub fn stub_failure(&self, command: &str, message: &str) {
            self.failures
                .lock()
                .unwrap()
                .insert(command.to_owned(), message.to_owned());
        }

        pub fn recorded(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<String> {
            let line = format!("{program} {}", args.join(" "));
            self.commands.lock().unwrap().push(line.clone());
            if let Some(message) = self.failures.lock().unwrap().get(&line) {
                return Err(Error::Command {
                    program: program.to_owned(),
                    args: args.to_vec(),
                    output: message.clone(),
                });
            }
            Ok(self
                .outputs
                .lock()
                .unwrap()
                .get(&line)
                .cloned()
                .unwrap_or_default())
        }
    }
}
