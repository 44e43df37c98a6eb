//! Terminal session source.
//!
//! The monitor observes sessions through [`SessionSource`] so tests can
//! substitute a scripted fake; the production impl shells out to tmux.

use anyhow::{bail, Context};
use std::future::Future;
use tokio::process::Command;

/// One captured view of a session's pane.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capture {
    pub buffer: String,
    pub cursor_x: u64,
    pub cursor_y: u64,
}

pub trait SessionSource: Send + Sync {
    /// Names of the currently live sessions.
    fn list_sessions(&self) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send;
    /// Current pane buffer and cursor for one session.
    fn capture(&self, session: &str) -> impl Future<Output = anyhow::Result<Capture>> + Send;
}

/// tmux-backed session source.
pub struct TmuxSource;

impl SessionSource for TmuxSource {
    async fn list_sessions(&self) -> anyhow::Result<Vec<String>> {
        let output = Command::new("tmux")
            .args(["list-sessions", "-F", "#{session_name}"])
            .output()
            .await
            .context("running tmux list-sessions")?;
        // No server running means no sessions, not an error.
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn capture(&self, session: &str) -> anyhow::Result<Capture> {
        let pane = Command::new("tmux")
            .args(["capture-pane", "-p", "-t", session])
            .output()
            .await
            .context("running tmux capture-pane")?;
        if !pane.status.success() {
            bail!("tmux capture-pane failed for session {session}");
        }

        let cursor = Command::new("tmux")
            .args([
                "display-message",
                "-p",
                "-t",
                session,
                "#{cursor_x},#{cursor_y}",
            ])
            .output()
            .await
            .context("running tmux display-message")?;
        let (cursor_x, cursor_y) = parse_cursor(&String::from_utf8_lossy(&cursor.stdout));

        Ok(Capture {
            buffer: String::from_utf8_lossy(&pane.stdout).into_owned(),
            cursor_x,
            cursor_y,
        })
    }
}

/// Deliver keystrokes to a session verbatim.
pub async fn send_keys(session: &str, text: &str) -> anyhow::Result<()> {
    let status = Command::new("tmux")
        .args(["send-keys", "-t", session, "-l", "--", text])
        .status()
        .await
        .context("running tmux send-keys")?;
    if !status.success() {
        bail!("tmux send-keys failed for session {session}");
    }
    Ok(())
}

fn parse_cursor(raw: &str) -> (u64, u64) {
    let mut parts = raw.trim().splitn(2, ',');
    let x = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let y = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cursor_output() {
        assert_eq!(parse_cursor("12,3\n"), (12, 3));
        assert_eq!(parse_cursor("0,0"), (0, 0));
        assert_eq!(parse_cursor("garbage"), (0, 0));
    }
}
