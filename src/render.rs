//! Pluggable headless-render escalation.
//!
//! Rendering lives behind an external command boundary: the configured
//! program receives the URL and the user agent and prints the rendered HTML
//! on stdout. This keeps browser automation out of the crawler while still
//! honoring the fetch timeout.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("rendering disabled")]
    Disabled,

    #[error("render command timed out after {0:?}")]
    Timeout(Duration),

    #[error("render command failed: {0}")]
    CommandFailed(String),

    #[error("render command produced no HTML")]
    EmptyOutput,
}

/// How escalated fetches are performed.
#[derive(Debug, Clone)]
pub enum Renderer {
    /// `--no-render`, or no command configured.
    Disabled,
    /// Run `program [args..] <url>` and read HTML from stdout.
    Command(String),
}

impl Renderer {
    pub fn from_options(render: bool, render_cmd: Option<&str>) -> Self {
        match (render, render_cmd) {
            (true, Some(cmd)) if !cmd.trim().is_empty() => Renderer::Command(cmd.to_string()),
            _ => Renderer::Disabled,
        }
    }

    pub async fn render(
        &self,
        url: &Url,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<String, RenderError> {
        let command_line = match self {
            Renderer::Disabled => return Err(RenderError::Disabled),
            Renderer::Command(cmd) => cmd,
        };

        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| RenderError::CommandFailed("empty render command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(parts)
            .arg(url.as_str())
            .env("MDMIRROR_USER_AGENT", user_agent)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| RenderError::CommandFailed(e.to_string()))?;
        let mut stdout = child.stdout.take().expect("stdout piped");

        let run = async {
            let mut html = String::new();
            stdout
                .read_to_string(&mut html)
                .await
                .map_err(|e| RenderError::CommandFailed(e.to_string()))?;
            let status = child
                .wait()
                .await
                .map_err(|e| RenderError::CommandFailed(e.to_string()))?;
            if !status.success() {
                return Err(RenderError::CommandFailed(format!(
                    "exit status {}",
                    status.code().unwrap_or(-1)
                )));
            }
            Ok(html)
        };

        let html = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| RenderError::Timeout(timeout))??;

        if html.trim().is_empty() {
            return Err(RenderError::EmptyOutput);
        }
        Ok(html)
    }
}
