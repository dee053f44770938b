//! Upstream encoder process

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use crate::config::MediaConfig;

/// Program and arguments used to launch the producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProducerCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Screen capture to fragmented MP4 on stdout.
    pub fn from_config(config: &MediaConfig) -> Self {
        let args = match &config.extra_args {
            Some(args) => args.clone(),
            None => capture_args(config),
        };
        Self::new(config.program.clone(), args)
    }

    /// Spawn with stdout and stderr piped. The child is killed if its handle
    /// is dropped.
    pub fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

fn capture_args(config: &MediaConfig) -> Vec<String> {
    let framerate = config.framerate.to_string();
    let gop = framerate.clone();
    let size = format!("{}x{}", config.width, config.height);
    let fragment = config.fragment_duration_us.to_string();

    let args = [
        "-f", "x11grab",
        "-video_size", size.as_str(),
        "-framerate", framerate.as_str(),
        "-i", config.display.as_str(),
        "-c:v", config.encoder.as_str(),
        "-preset", "ultrafast",
        "-tune", "zerolatency",
        "-profile:v", "baseline",
        "-level", "3.1",
        "-pix_fmt", "yuv420p",
        "-g", gop.as_str(),
        "-keyint_min", gop.as_str(),
        "-sc_threshold", "0",
        "-b:v", config.bitrate.as_str(),
        "-maxrate", config.bitrate.as_str(),
        "-bufsize", "1M",
        "-an",
        "-f", "mp4",
        "-movflags", "frag_keyframe+empty_moov+default_base_moof+faststart",
        "-frag_duration", fragment.as_str(),
        "-reset_timestamps", "1",
        "pipe:1",
    ];
    args.iter().map(|s| s.to_string()).collect()
}

/// Log producer diagnostics until the pipe closes. Reading is what matters:
/// an undrained stderr pipe eventually blocks the producer.
pub(crate) async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(producer = ?pid, "{}", line.trim_end()),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(producer = ?pid, error = %e, "Producer stderr read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_args_follow_config() {
        let config = MediaConfig {
            width: 1280,
            height: 720,
            framerate: 60,
            ..MediaConfig::default()
        };
        let cmd = ProducerCommand::from_config(&config);

        assert_eq!(cmd.program, "ffmpeg");
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-video_size 1280x720"));
        assert!(joined.contains("-framerate 60"));
        assert!(joined.contains("-g 60"));
        assert!(joined.contains("-frag_duration 100000"));
        assert_eq!(cmd.args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn extra_args_replace_generated_list() {
        let config = MediaConfig {
            extra_args: Some(vec!["-i".into(), "input.mp4".into()]),
            ..MediaConfig::default()
        };
        assert_eq!(
            ProducerCommand::from_config(&config).args,
            vec!["-i".to_string(), "input.mp4".to_string()]
        );
    }
}
