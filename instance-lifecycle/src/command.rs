//! Running shell commands on the instance through the remote command channel

use crate::backend::CommandChannel;
use crate::error::{Error, Result};
use crate::poll::{poll_until, Poll, PollPolicy};
use crate::types::InvocationStatus;
use std::sync::Arc;
use tracing::{info, warn};

/// Dispatches a command and waits for its terminal status
#[derive(Clone)]
pub struct RemoteCommandExecutor {
    channel: Arc<dyn CommandChannel>,
    policy: PollPolicy,
}

impl RemoteCommandExecutor {
    pub fn new(channel: Arc<dyn CommandChannel>, policy: PollPolicy) -> Self {
        Self { channel, policy }
    }

    /// Run `command` on the instance and return its standard output.
    ///
    /// An invocation the channel does not know about yet counts as pending.
    /// A failed status yields [`Error::CommandFailed`] with the captured
    /// stderr; running out of polls yields [`Error::Timeout`].
    pub fn execute(&self, instance_id: &str, command: &str) -> Result<String> {
        let command_id = self.channel.send_command(instance_id, command)?;
        info!(instance_id, command_id = %command_id, command, "remote command dispatched");

        let operation = format!("command {}", command_id);
        poll_until(&operation, &self.policy, || {
            let Some(invocation) = self.channel.get_invocation(&command_id, instance_id)? else {
                return Ok(Poll::Pending);
            };
            match invocation.status {
                InvocationStatus::Pending => Ok(Poll::Pending),
                InvocationStatus::Success => {
                    info!(command_id = %command_id, "remote command succeeded");
                    Ok(Poll::Ready(invocation.stdout))
                }
                InvocationStatus::Failed => {
                    warn!(command_id = %command_id, stderr = %invocation.stderr.trim(), "remote command failed");
                    Err(Error::CommandFailed {
                        command: command.to_string(),
                        stderr: invocation.stderr,
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{Operation, ScriptedCommand};
    use crate::backend::InMemoryCloud;
    use crate::types::PowerState;
    use std::time::Duration;

    fn executor(attempts: u32) -> (Arc<InMemoryCloud>, RemoteCommandExecutor) {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.add_instance("i-1", PowerState::Running, &["vol-1"]);
        let executor =
            RemoteCommandExecutor::new(cloud.clone(), PollPolicy::new(Duration::ZERO, attempts));
        (cloud, executor)
    }

    #[test]
    fn not_found_polls_count_as_pending() {
        let (cloud, executor) = executor(10);
        cloud.script_command(
            "backup",
            ScriptedCommand::success("backup complete\n").after_not_found(4),
        );

        let stdout = executor.execute("i-1", "/opt/backup.sh").unwrap();
        assert_eq!(stdout, "backup complete\n");
        assert_eq!(cloud.calls(Operation::GetInvocation), 5);
    }

    #[test]
    fn pending_status_keeps_polling() {
        let (cloud, executor) = executor(10);
        cloud.script_command("sleep", ScriptedCommand::success("done").after_pending(3));
        assert_eq!(executor.execute("i-1", "sleep 5").unwrap(), "done");
        assert_eq!(cloud.calls(Operation::GetInvocation), 4);
    }

    #[test]
    fn failed_status_carries_stderr() {
        let (cloud, executor) = executor(10);
        cloud.script_command("restore", ScriptedCommand::failure("no such backup"));

        match executor.execute("i-1", "/opt/restore.sh old").unwrap_err() {
            Error::CommandFailed { command, stderr } => {
                assert_eq!(command, "/opt/restore.sh old");
                assert_eq!(stderr, "no such backup");
            }
            other => panic!("expected command failure, got {other:?}"),
        }
    }

    #[test]
    fn invisible_invocation_times_out() {
        let (cloud, executor) = executor(60);
        cloud.script_command("hang", ScriptedCommand::lost());

        let err = executor.execute("i-1", "hang").unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 60, .. }));
        assert_eq!(cloud.calls(Operation::GetInvocation), 60);
    }

    #[test]
    fn dispatch_failure_is_not_polled() {
        let (cloud, executor) = executor(5);
        cloud.fail_next(Operation::SendCommand, "throttled");
        assert!(matches!(
            executor.execute("i-1", "true").unwrap_err(),
            Error::Upstream(_)
        ));
        assert_eq!(cloud.calls(Operation::GetInvocation), 0);
    }
}
