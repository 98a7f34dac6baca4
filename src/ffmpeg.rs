use crate::auth::AuthError;
use ffmpeg_sidecar::child::FfmpegChild;
use ffmpeg_sidecar::command::FfmpegCommand;
use ffmpeg_sidecar::event::{FfmpegEvent, LogLevel};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{ChildStdout, ExitStatus};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, trace, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum TranscodeError {
    /// No token could be obtained, so the video cannot be fetched.
    #[error("video unavailable: authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("{0}")]
    WrongMode(&'static str),
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(#[source] io::Error),
    #[error("ffmpeg i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("ffmpeg failed: {0}")]
    Failed(String),
}

/// Where the transcoded video goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    /// Fragmented MP4 on ffmpeg's stdout, read incrementally.
    Pipe,
    /// Re-encoded MP4 written to this path. The caller deletes it.
    File(PathBuf),
}

impl OutputMode {
    /// A timestamp-named `.mp4` in the system temp directory.
    pub fn temp_file() -> Self {
        let name = format!("{}.mp4", chrono::Utc::now().timestamp_millis());
        OutputMode::File(std::env::temp_dir().join(name))
    }
}

/// Everything ffmpeg needs to pull one manifest.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    manifest: Url,
    mode: OutputMode,
    headers: Vec<(String, String)>,
}

impl TranscodeRequest {
    pub fn new(manifest: Url, mode: OutputMode) -> Self {
        Self {
            manifest,
            mode,
            headers: Vec::new(),
        }
    }

    /// Add a request header for ffmpeg's HTTP input.
    pub fn header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, TranscodeError> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() || name.contains([':', '\r', '\n']) {
            return Err(TranscodeError::InvalidHeader {
                name,
                reason: "header names must be non-empty and free of ':' and line breaks".into(),
            });
        }
        if value.contains(['\r', '\n']) {
            return Err(TranscodeError::InvalidHeader {
                name,
                reason: "header values must not contain line breaks".into(),
            });
        }
        self.headers.push((name, value));
        Ok(self)
    }

    pub fn manifest(&self) -> &Url {
        &self.manifest
    }

    pub fn mode(&self) -> &OutputMode {
        &self.mode
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Headers in the CRLF-terminated form ffmpeg's `-headers` option takes.
    pub fn header_block(&self) -> String {
        self.headers
            .iter()
            .map(|(name, value)| format!("{}: {}\r\n", name, value))
            .collect()
    }

    /// Arguments after the ffmpeg binary, in order.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        // Input options have to precede -i to apply to the HLS fetch.
        if !self.headers.is_empty() {
            args.extend(["-headers".into(), self.header_block()]);
        }
        args.extend(["-i".into(), self.manifest.to_string()]);

        match &self.mode {
            OutputMode::Pipe => {
                args.extend(
                    ["-movflags", "frag_keyframe+empty_moov", "-f", "mp4", "pipe:1"]
                        .map(String::from),
                );
            }
            OutputMode::File(path) => {
                args.extend(
                    [
                        "-y",
                        "-movflags", "+faststart",
                        "-c:v", "libx264",
                        "-max_muxing_queue_size", "9999",
                        "-maxrate", "4.5M",
                        "-bufsize", "9M",
                        "-crf", "23",
                        "-preset", "faster",
                        "-flags", "+global_header",
                        "-pix_fmt", "yuv420p",
                        "-profile:v", "baseline",
                        "-c:a", "aac",
                        "-ac", "2",
                    ]
                    .map(String::from),
                );
                args.push(path.to_string_lossy().into_owned());
            }
        }
        args
    }

    /// Build the ffmpeg command. `ffmpeg_path` overrides the binary
    /// ffmpeg-sidecar would pick.
    pub fn into_command(self, ffmpeg_path: Option<&Path>) -> TranscodeCommand {
        let mut command = match ffmpeg_path {
            Some(path) => FfmpegCommand::new_with_path(path),
            None => FfmpegCommand::new(),
        };
        command.args(self.args());
        TranscodeCommand {
            command,
            mode: self.mode,
        }
    }
}

/// A built but not yet started ffmpeg invocation.
pub struct TranscodeCommand {
    command: FfmpegCommand,
    mode: OutputMode,
}

impl TranscodeCommand {
    pub fn mode(&self) -> &OutputMode {
        &self.mode
    }

    /// Full argument list handed to the ffmpeg process.
    pub fn get_args(&self) -> Vec<String> {
        self.command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    /// Start a [`OutputMode::Pipe`] transcode and hand back its stdout.
    pub fn stream(mut self) -> Result<TranscodeStream, TranscodeError> {
        if self.mode != OutputMode::Pipe {
            return Err(TranscodeError::WrongMode("stream() needs OutputMode::Pipe"));
        }

        let mut child = self.command.spawn().map_err(TranscodeError::Spawn)?;
        let Some(stdout) = child.take_stdout() else {
            kill_and_reap(&mut child);
            return Err(TranscodeError::Failed("ffmpeg stdout is not piped".into()));
        };
        let stderr = child.take_stderr().map(|stderr| {
            std::thread::spawn(move || drain_log(stderr))
        });

        let pid = child.as_inner().id();
        debug!(pid, "ffmpeg streaming to pipe");
        Ok(TranscodeStream {
            pid,
            child: Some(child),
            stdout,
            stderr,
        })
    }

    /// Run a [`OutputMode::File`] transcode to completion. Blocks.
    pub fn run(mut self) -> Result<PathBuf, TranscodeError> {
        let OutputMode::File(output_path) = self.mode.clone() else {
            return Err(TranscodeError::WrongMode("run() needs OutputMode::File"));
        };

        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut child = self.command.spawn().map_err(TranscodeError::Spawn)?;
        let mut error_msg: Option<String> = None;

        let events = child
            .iter()
            .map_err(|e| TranscodeError::Failed(format!("cannot read ffmpeg output: {}", e)))?;
        for event in events {
            match event {
                FfmpegEvent::Log(LogLevel::Error | LogLevel::Fatal, msg) => {
                    warn!(message = %msg, "ffmpeg error");
                    error_msg = Some(msg);
                }
                FfmpegEvent::Log(LogLevel::Warning, msg) => {
                    debug!(message = %msg, "ffmpeg warning");
                }
                FfmpegEvent::Done => break,
                _ => {}
            }
        }

        let status = child.wait()?;
        if !status.success() || !output_path.exists() {
            return Err(TranscodeError::Failed(error_msg.unwrap_or_else(|| {
                format!("ffmpeg exited with {} without producing output", status)
            })));
        }
        Ok(output_path)
    }
}

/// A running pipe-mode transcode.
///
/// Reading yields the MP4 bytes as ffmpeg produces them. Dropping the
/// stream before [`TranscodeStream::finish`] kills the process so it
/// cannot stay blocked on a full pipe.
pub struct TranscodeStream {
    pid: u32,
    child: Option<FfmpegChild>,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<Option<String>>>,
}

impl TranscodeStream {
    /// OS process id of ffmpeg.
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Drain whatever is left, wait for ffmpeg, and report its outcome.
    pub fn finish(mut self) -> Result<(), TranscodeError> {
        io::copy(&mut self.stdout, &mut io::sink())?;

        let status = match self.child.take() {
            Some(mut child) => child.wait()?,
            None => return Ok(()),
        };
        let last_error = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .flatten();

        check_status(status, last_error)
    }
}

impl Read for TranscodeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for TranscodeStream {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!("transcode stream dropped early, stopping ffmpeg");
            kill_and_reap(&mut child);
        }
    }
}

fn check_status(status: ExitStatus, last_error: Option<String>) -> Result<(), TranscodeError> {
    if status.success() {
        Ok(())
    } else {
        Err(TranscodeError::Failed(
            last_error.unwrap_or_else(|| format!("ffmpeg exited with {}", status)),
        ))
    }
}

fn kill_and_reap(child: &mut FfmpegChild) {
    if let Err(e) = child.kill() {
        trace!(error = %e, "ffmpeg already gone");
    }
    if let Err(e) = child.wait() {
        warn!(error = %e, "could not reap ffmpeg");
    }
}

/// Log ffmpeg's stderr and return the last error line seen.
fn drain_log(stderr: impl Read) -> Option<String> {
    let mut last_error = None;
    for line in BufReader::new(stderr).lines() {
        let Ok(line) = line else { break };
        if line.starts_with("[error]") || line.starts_with("[fatal]") {
            warn!(message = %line, "ffmpeg error");
            last_error = Some(line);
        } else {
            trace!(message = %line, "ffmpeg");
        }
    }
    last_error
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Url {
        Url::parse("https://v.redd.it/abc123/HLSPlaylist.m3u8?a=1").unwrap()
    }

    fn position(args: &[String], needle: &str) -> usize {
        args.iter()
            .position(|a| a == needle)
            .unwrap_or_else(|| panic!("{needle} missing from {args:?}"))
    }

    #[test]
    fn pipe_mode_writes_fragmented_mp4_to_stdout() {
        let args = TranscodeRequest::new(manifest(), OutputMode::Pipe).args();
        assert_eq!(
            args,
            vec![
                "-i",
                "https://v.redd.it/abc123/HLSPlaylist.m3u8?a=1",
                "-movflags",
                "frag_keyframe+empty_moov",
                "-f",
                "mp4",
                "pipe:1",
            ]
        );
    }

    #[test]
    fn headers_are_one_input_option_before_the_input() {
        let request = TranscodeRequest::new(manifest(), OutputMode::Pipe)
            .header("User-Agent", "redvid/test")
            .unwrap()
            .header("Authorization", "bearer abc123")
            .unwrap();
        let args = request.args();

        let headers = position(&args, "-headers");
        assert!(headers < position(&args, "-i"));
        assert_eq!(
            args[headers + 1],
            "User-Agent: redvid/test\r\nAuthorization: bearer abc123\r\n"
        );
        assert_eq!(args.iter().filter(|a| *a == "-headers").count(), 1);
    }

    #[test]
    fn file_mode_reencodes_into_the_named_file() {
        let out = PathBuf::from("/tmp/redvid-test/out.mp4");
        let args = TranscodeRequest::new(manifest(), OutputMode::File(out.clone())).args();

        assert_eq!(args.last().map(String::as_str), Some("/tmp/redvid-test/out.mp4"));
        assert_eq!(args[position(&args, "-c:v") + 1], "libx264");
        assert_eq!(args[position(&args, "-c:a") + 1], "aac");
        assert_eq!(args[position(&args, "-pix_fmt") + 1], "yuv420p");
        assert!(!args.contains(&"pipe:1".to_string()));
    }

    #[test]
    fn header_injection_is_rejected() {
        let err = TranscodeRequest::new(manifest(), OutputMode::Pipe)
            .header("X-Test", "a\r\nInjected: yes")
            .unwrap_err();
        assert!(matches!(err, TranscodeError::InvalidHeader { .. }));

        let err = TranscodeRequest::new(manifest(), OutputMode::Pipe)
            .header("Bad: name", "value")
            .unwrap_err();
        assert!(matches!(err, TranscodeError::InvalidHeader { .. }));
    }

    #[test]
    fn command_carries_request_arguments() {
        let request = TranscodeRequest::new(manifest(), OutputMode::Pipe)
            .header("User-Agent", "redvid/test")
            .unwrap();
        let expected = request.args();
        let command = request.into_command(Some(Path::new("/usr/bin/ffmpeg")));

        let args = command.get_args();
        assert!(args.ends_with(&expected), "{args:?}");
        assert_eq!(command.mode(), &OutputMode::Pipe);
    }

    #[test]
    fn modes_are_checked_before_spawning() {
        let command = TranscodeRequest::new(manifest(), OutputMode::Pipe)
            .into_command(Some(Path::new("/nonexistent/ffmpeg")));
        assert!(matches!(command.run(), Err(TranscodeError::WrongMode(_))));

        let command = TranscodeRequest::new(manifest(), OutputMode::temp_file())
            .into_command(Some(Path::new("/nonexistent/ffmpeg")));
        assert!(matches!(command.stream(), Err(TranscodeError::WrongMode(_))));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let command = TranscodeRequest::new(manifest(), OutputMode::Pipe)
            .into_command(Some(Path::new("/nonexistent/ffmpeg")));
        assert!(matches!(command.stream(), Err(TranscodeError::Spawn(_))));
    }

    #[test]
    fn temp_file_lands_in_temp_dir() {
        match OutputMode::temp_file() {
            OutputMode::File(path) => {
                assert!(path.starts_with(std::env::temp_dir()));
                assert_eq!(path.extension().and_then(|e| e.to_str()), Some("mp4"));
            }
            OutputMode::Pipe => panic!("expected a file"),
        }
    }

    #[test]
    fn drained_log_keeps_last_error() {
        let log = "[info] Input #0, hls\n[error] first\n[info] more\n[error] HTTP error 403 Forbidden\n";
        assert_eq!(
            drain_log(log.as_bytes()).as_deref(),
            Some("[error] HTTP error 403 Forbidden")
        );
    }

    /// Writes an executable shell script standing in for ffmpeg.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn spawn_stream(ffmpeg: &Path) -> TranscodeStream {
        // A freshly written script can briefly be "text file busy" while
        // other test threads fork.
        for _ in 0..20 {
            let command = TranscodeRequest::new(manifest(), OutputMode::Pipe)
                .header("User-Agent", "redvid/test")
                .unwrap()
                .into_command(Some(ffmpeg));
            match command.stream() {
                Ok(stream) => return stream,
                Err(TranscodeError::Spawn(e)) if e.raw_os_error() == Some(26) => {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                Err(e) => panic!("spawn failed: {e}"),
            }
        }
        panic!("fake ffmpeg stayed busy");
    }

    #[cfg(unix)]
    fn is_running(pid: u32) -> bool {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(unix)]
    #[test]
    fn dropping_an_unfinished_stream_stops_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), "exec yes frame");

        let mut stream = spawn_stream(&ffmpeg);
        let pid = stream.id();
        let mut head = [0u8; 6];
        stream.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"frame\n");
        assert!(is_running(pid));

        drop(stream);
        assert!(!is_running(pid));
    }

    #[cfg(unix)]
    #[test]
    fn finish_drains_output_and_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), "for i in 1 2 3 4 5; do echo frame; done");

        let mut stream = spawn_stream(&ffmpeg);
        let mut first = [0u8; 6];
        stream.read_exact(&mut first).unwrap();
        stream.finish().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn finish_reports_the_last_ffmpeg_error() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(
            dir.path(),
            "echo '[error] HTTP error 403 Forbidden' >&2\nexit 1",
        );

        let err = spawn_stream(&ffmpeg).finish().unwrap_err();
        match err {
            TranscodeError::Failed(message) => assert!(message.contains("403"), "{message}"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
