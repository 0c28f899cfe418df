// src/utils/notify.rs: Completion e-mail

use std::process::Stdio;

use anyhow::{anyhow, Result};
use log::{info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::defs::SENDMAIL_TAG;
use crate::report::RunReport;

/// Renders a message suitable for `sendmail -t`.
pub fn compose_email(recipient: &str, report: &RunReport) -> String {
    format!(
        "To: {}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\n{}",
        recipient,
        report.subject(),
        report.summary_text()
    )
}

async fn sendmail(message: &str) -> Result<()> {
    let mut child = Command::new(SENDMAIL_TAG)
        .arg("-t")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn {}: {}", SENDMAIL_TAG, e))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("Failed to open {} stdin", SENDMAIL_TAG))?;
    stdin.write_all(message.as_bytes()).await?;
    drop(stdin);

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(anyhow!(
            "{} exited with {}: {}",
            SENDMAIL_TAG,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Sends the completion summary. Delivery problems are logged and never
/// change the outcome of the run.
pub async fn send_completion_email(recipient: &str, report: &RunReport) {
    let message = compose_email(recipient, report);
    match sendmail(&message).await {
        Ok(()) => info!("Sent completion summary to {}", recipient),
        Err(e) => warn!("Could not send completion e-mail to {}: {}", recipient, e),
    }
}
