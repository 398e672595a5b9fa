use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt as _;

use crate::state::{Machine, Step};

// Exit codes of the remote `forge-build` agent. 75 is EX_TEMPFAIL.
const EXIT_PERMANENT_FAILURE: i32 = 100;
const EXIT_TIMED_OUT: i32 = 101;
const EXIT_LOG_LIMIT: i32 = 102;
const EXIT_FAILURE_WITH_OUTPUT: i32 = 103;
const EXIT_TRANSIENT_FAILURE: i32 = 75;
const EXIT_SSH_FAILURE: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Success,
    TransientFailure,
    PermanentFailure,
    TimedOut,
    LogLimitExceeded,
    MiscFailure,
    BuildFailureWithOutput,
}

impl RemoteStatus {
    const fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            EXIT_PERMANENT_FAILURE => Self::PermanentFailure,
            EXIT_TIMED_OUT => Self::TimedOut,
            EXIT_LOG_LIMIT => Self::LogLimitExceeded,
            EXIT_FAILURE_WITH_OUTPUT => Self::BuildFailureWithOutput,
            EXIT_TRANSIENT_FAILURE => Self::TransientFailure,
            _ => Self::MiscFailure,
        }
    }
}

#[derive(Debug)]
pub struct RemoteResult {
    pub status: RemoteStatus,
    pub start_time: jiff::Timestamp,
    pub stop_time: jiff::Timestamp,
    pub error_msg: Option<String>,
    pub output_paths: Vec<store::StorePath>,
}

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    /// Transport-level failure: the machine is at fault, not the step.
    #[error("failed to reach machine: {0}")]
    Connect(String),

    #[error("std io error: `{0}`")]
    Io(#[from] std::io::Error),
}

/// Common ssh/scp options. A host key pinned in the inventory goes through a
/// generated known-hosts file; otherwise new hosts are accepted on first use.
async fn ssh_option_args(machine: &Machine) -> Result<Vec<String>, RemoteError> {
    let mut args = vec![
        "-oBatchMode=yes".to_owned(),
        "-oConnectTimeout=60".to_owned(),
    ];
    if let Some(key) = &machine.ssh_key {
        args.push("-i".to_owned());
        args.push(key.clone());
    }
    if let Some(host_key) = &machine.ssh_public_host_key {
        let host = machine.ssh_name.split('@').next_back().unwrap_or_default();
        let path = std::env::temp_dir().join(format!("forge-known-hosts-{host}"));
        fs_err::tokio::write(&path, format!("{host} {host_key}\n")).await?;
        args.push(format!("-oUserKnownHostsFile={}", path.display()));
    } else {
        args.push("-oStrictHostKeyChecking=accept-new".to_owned());
    }
    Ok(args)
}

/// Execute one step on a remote machine: ship the recipe, run the remote
/// build agent with the step's limits, stream the log to `log_path`, and
/// classify the agent's exit code. Transport failures come back as
/// `RemoteError::Connect` so the caller can demote the machine.
#[tracing::instrument(skip(local_store, machine, step, opts), fields(machine = %machine.ssh_name, recipe = %step.get_recipe_path()), err)]
pub async fn build_remote(
    local_store: &store::LocalStore,
    machine: &Arc<Machine>,
    step: &Arc<Step>,
    opts: &store::BuildOptions,
    log_path: &std::path::Path,
) -> Result<RemoteResult, RemoteError> {
    let start_time = jiff::Timestamp::now();
    let recipe_path = step.get_recipe_path();

    let options = ssh_option_args(machine).await?;
    {
        // one transfer per machine at a time
        let _send = machine.send_lock.lock().await;
        let status = tokio::process::Command::new("scp")
            .arg("-q")
            .args(&options)
            .arg(local_store.print_store_path(recipe_path))
            .arg(format!("{}:", machine.ssh_name))
            .stdin(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(RemoteError::Connect(format!(
                "copying recipe to '{}' failed with {status}",
                machine.ssh_name
            )));
        }
    }

    let mut log_file = fs_err::tokio::File::create(log_path).await?;
    let mut child = tokio::process::Command::new("ssh")
        .args(&options)
        .arg(&machine.ssh_name)
        .arg("--")
        .arg("forge-build")
        .arg("--recipe")
        .arg(recipe_path.base_name())
        .arg("--max-silent-time")
        .arg(opts.get_max_silent_time().to_string())
        .arg("--timeout")
        .arg(opts.get_build_timeout().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // drain stderr concurrently so neither pipe can fill up and stall the
    // child
    let stderr_task = child.stderr.take().map(|mut err| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = tokio::io::copy(&mut err, &mut buf).await;
            buf
        })
    });
    if let Some(mut out) = child.stdout.take() {
        tokio::io::copy(&mut out, &mut log_file).await?;
    }
    let mut stderr = String::new();
    if let Some(task) = stderr_task
        && let Ok(buf) = task.await
    {
        log_file.write_all(&buf).await?;
        stderr = String::from_utf8_lossy(&buf).into_owned();
    }
    log_file.flush().await?;

    let status = child.wait().await?;
    let stop_time = jiff::Timestamp::now();

    let code = status.code().unwrap_or(EXIT_SSH_FAILURE);
    if code == EXIT_SSH_FAILURE {
        // ssh itself failed (connect refused, handshake, killed by signal)
        return Err(RemoteError::Connect(format!(
            "ssh to '{}' failed: {}",
            machine.ssh_name,
            stderr.lines().last().unwrap_or("no output")
        )));
    }

    let remote_status = RemoteStatus::from_exit_code(code);
    Ok(RemoteResult {
        status: remote_status,
        start_time,
        stop_time,
        error_msg: if remote_status == RemoteStatus::Success {
            None
        } else {
            Some(stderr.lines().last().unwrap_or("build failed").to_owned())
        },
        output_paths: step
            .get_outputs()
            .into_iter()
            .filter_map(|o| o.path)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_classification() {
        assert_eq!(RemoteStatus::from_exit_code(0), RemoteStatus::Success);
        assert_eq!(
            RemoteStatus::from_exit_code(EXIT_PERMANENT_FAILURE),
            RemoteStatus::PermanentFailure
        );
        assert_eq!(
            RemoteStatus::from_exit_code(EXIT_TIMED_OUT),
            RemoteStatus::TimedOut
        );
        assert_eq!(
            RemoteStatus::from_exit_code(EXIT_LOG_LIMIT),
            RemoteStatus::LogLimitExceeded
        );
        assert_eq!(
            RemoteStatus::from_exit_code(EXIT_FAILURE_WITH_OUTPUT),
            RemoteStatus::BuildFailureWithOutput
        );
        assert_eq!(
            RemoteStatus::from_exit_code(EXIT_TRANSIENT_FAILURE),
            RemoteStatus::TransientFailure
        );
        assert_eq!(RemoteStatus::from_exit_code(1), RemoteStatus::MiscFailure);
    }
}
