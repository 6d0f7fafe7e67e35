//! Audio playback through an external command.

use std::io::Write;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::narration::{AudioClip, Player};

/// Plays a clip by writing it to a temporary file and running `command <file>`.
#[derive(Debug, Clone)]
pub struct CommandPlayer {
    command: Vec<String>,
}

impl CommandPlayer {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            bail!("player command is empty");
        }
        Ok(Self { command })
    }
}

#[async_trait]
impl Player for CommandPlayer {
    async fn play(&self, clip: &AudioClip, cancel: CancellationToken) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("parley-narration-")
            .suffix(&format!(".{}", clip.format))
            .tempfile()
            .context("creating audio file")?;
        file.write_all(&clip.bytes).context("writing audio file")?;
        file.flush()?;
        let path = file.into_temp_path();

        let (program, args) = self
            .command
            .split_first()
            .context("player command is empty")?;
        let mut child = Command::new(program)
            .args(args)
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("starting player {}", program))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.context("waiting for player")?;
                if !status.success() {
                    bail!("player {} exited with {}", program, status);
                }
            }
            _ = cancel.cancelled() => {
                debug!("playback cancelled");
                if let Err(e) = child.kill().await {
                    debug!("failed to kill player: {:?}", e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::{Duration, Instant};

    fn clip() -> AudioClip {
        AudioClip {
            bytes: Bytes::from_static(b"RIFF"),
            format: "wav".to_string(),
        }
    }

    fn player(command: &[&str]) -> CommandPlayer {
        CommandPlayer::new(command.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandPlayer::new(Vec::new()).is_err());
        assert!(CommandPlayer::new(vec![" ".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_player_receives_file_path() {
        let player = player(&["sh", "-c", "test -s \"$1\"", "sh"]);
        player.play(&clip(), CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_player_failure_is_reported() {
        let player = player(&["false"]);
        assert!(player.play(&clip(), CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_playback() {
        let player = player(&["sh", "-c", "sleep 10", "sh"]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        player.play(&clip(), cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
