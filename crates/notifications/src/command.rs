use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use layer7waf_common::Layer7Error;

/// A notification to hand to the configured outbound command. The command
/// is treated as opaque: it receives these as positional arguments and is
/// expected to do the actual delivery (Slack, email, PagerDuty, whatever the
/// operator has wired up).
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub event_type: String,
    pub title: String,
    pub body: String,
    pub tag: String,
    pub urls: Vec<String>,
}

/// Runs the configured outbound command with `message`'s fields as
/// arguments. Success is exit status 0 with no stderr after trimming;
/// anything else is a failure the caller records in a `NotificationRecord`.
pub async fn run_notify_command(
    command: &str,
    message: &OutboundMessage,
    timeout_secs: u64,
) -> Result<(), Layer7Error> {
    if command.trim().is_empty() {
        return Err(Layer7Error::validation("no outbound_command configured"));
    }

    let mut cmd = Command::new(command);
    cmd.arg("--notification-type").arg(&message.event_type);
    if !message.tag.is_empty() {
        cmd.arg("--tag").arg(&message.tag);
    }
    cmd.arg("--title").arg(&message.title).arg("--body").arg(&message.body);
    cmd.args(&message.urls);

    let output = timeout(Duration::from_secs(timeout_secs), cmd.output())
        .await
        .map_err(|_| Layer7Error::transient(format!("outbound command timed out after {timeout_secs}s")))?
        .map_err(|e| Layer7Error::transient(format!("failed to spawn outbound command: {e}")))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if output.status.success() && stderr.trim().is_empty() {
        Ok(())
    } else {
        Err(Layer7Error::transient(format!(
            "outbound command exited {:?}: {}",
            output.status.code(),
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage {
            event_type: "ban_created".into(),
            title: "IP banned".into(),
            body: "203.0.113.5 banned for sqli".into(),
            tag: "waf".into(),
            urls: vec![],
        }
    }

    #[tokio::test]
    async fn successful_command_reports_ok() {
        let result = run_notify_command("true", &message(), 5).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn failing_command_reports_error() {
        let result = run_notify_command("false", &message(), 5).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let result = run_notify_command("", &message(), 5).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unknown_command_reports_error() {
        let result = run_notify_command("/no/such/binary", &message(), 5).await;
        assert!(result.is_err());
    }
}
