use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ProcessOutput, ShimError, Warehouse};

/// Warehouse reached through command-line programs.
///
/// SQL is piped to the stdin of a configured client (for example
/// `snowsql -f /dev/stdin` or `psql`). External processes run through
/// `sh -c` with the configured environment and working directory.
#[derive(Debug, Clone)]
pub struct CommandWarehouse {
    sql_client: Vec<String>,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl CommandWarehouse {
    /// `sql_client` is the program and its arguments, e.g. `["psql", "-v", "ON_ERROR_STOP=1"]`.
    pub fn new<I, S>(sql_client: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sql_client: sql_client.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: HashMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.envs(&self.env);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

fn capture(output: std::process::Output) -> ProcessOutput {
    ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

#[async_trait]
impl Warehouse for CommandWarehouse {
    async fn execute(&self, sql: &str) -> Result<(), ShimError> {
        let (program, args) = self
            .sql_client
            .split_first()
            .ok_or_else(|| ShimError::Warehouse("no SQL client configured".into()))?;

        let mut cmd = self.command(program);
        cmd.args(args);
        cmd.stdin(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| ShimError::Spawn(format!("{}: {}", program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(sql.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = capture(child.wait_with_output().await?);
        debug!(client = %program, exit_code = output.exit_code, "SQL client finished");
        if output.success() {
            Ok(())
        } else {
            Err(ShimError::Warehouse(format!(
                "{} exited with code {}: {}",
                program,
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }

    async fn run_external_process(&self, command_line: &str) -> Result<ProcessOutput, ShimError> {
        let mut cmd = self.command("sh");
        cmd.arg("-c").arg(command_line);
        let output = cmd
            .output()
            .await
            .map_err(|e| ShimError::Spawn(e.to_string()))?;
        Ok(capture(output))
    }
}
