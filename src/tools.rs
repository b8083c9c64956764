// LoanLiberator - Library Loan Archiver
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! External tool invocation
//!
//! Every tool is a black box taking explicit file arguments: the stream
//! downloader, the segment decryptor, the media remuxer and the optional
//! e-book packager. A non-zero exit status becomes
//! [`LiberatorError::ExternalToolFailure`] carrying the tail of stderr.
//!
//! # FFmpeg Progress Format
//! The remuxer reports progress on stderr:
//! ```text
//! Duration: 01:23:45.67, start: 0.000000, bitrate: 64 kb/s
//! size=   12345kB time=00:12:34.56 bitrate= 123.4kbits/s speed=45.6x
//! ```
//! Progress is traced at debug level in 10% steps.

use crate::error::{LiberatorError, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Lines of stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// A configured external program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTool {
    name: String,
    program: PathBuf,
}

impl ExternalTool {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run to completion in `cwd` (or the current directory)
    ///
    /// # Errors
    /// - `ExternalToolNotFound` if the program cannot be launched
    /// - `ExternalToolFailure` on a non-zero exit status
    pub async fn run<I, S>(&self, args: I, cwd: Option<&Path>) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        tracing::debug!(tool = %self.name, command = ?cmd.as_std(), "running external tool");
        self.execute(&mut cmd).await
    }

    async fn execute(&self, cmd: &mut Command) -> Result<()> {
        let mut child = cmd.spawn().map_err(|e| self.launch_error(e))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LiberatorError::internal(format!("{}: stderr not captured", self.name)))?;

        let mut reader = BufReader::new(stderr).lines();
        let mut tail: Vec<String> = Vec::new();
        let mut progress = ProgressTracker::default();

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|e| LiberatorError::FileIoError(format!("Failed to read {} output: {}", self.name, e)))?
        {
            if let Some(percent) = progress.observe(&line) {
                tracing::debug!(tool = %self.name, percent, "progress");
            }

            tail.push(line);
            if tail.len() > STDERR_TAIL_LINES {
                tail.remove(0);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| LiberatorError::FileIoError(format!("Failed to wait for {}: {}", self.name, e)))?;

        if !status.success() {
            return Err(LiberatorError::ExternalToolFailure {
                tool: self.name.clone(),
                status: status.code().unwrap_or(-1),
                stderr: tail.join("\n"),
            });
        }

        Ok(())
    }

    /// Check that the program launches (`-version` style probe)
    pub async fn check_available(&self, probe_arg: &str) -> Result<()> {
        Command::new(&self.program)
            .arg(probe_arg)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|_| ())
            .map_err(|e| self.launch_error(e))
    }

    fn launch_error(&self, err: std::io::Error) -> LiberatorError {
        if err.kind() == std::io::ErrorKind::NotFound {
            LiberatorError::ExternalToolNotFound(format!("{} ({})", self.name, self.program.display()))
        } else {
            LiberatorError::FileIoError(format!("Failed to spawn {}: {}", self.name, err))
        }
    }
}

/// Paths of every external program the pipeline may call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSet {
    pub ffmpeg: ExternalTool,
    pub downloader: ExternalTool,
    pub decryptor: ExternalTool,
    pub epub_zip: Option<ExternalTool>,
}

impl ToolSet {
    pub fn new(
        ffmpeg: PathBuf,
        yt_dlp: PathBuf,
        mp4decrypt: PathBuf,
        epub_zip: Option<PathBuf>,
    ) -> Self {
        Self {
            ffmpeg: ExternalTool::new("ffmpeg", ffmpeg),
            downloader: ExternalTool::new("yt-dlp", yt_dlp),
            decryptor: ExternalTool::new("mp4decrypt", mp4decrypt),
            epub_zip: epub_zip.map(|p| ExternalTool::new("epubzip", p)),
        }
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new(
            PathBuf::from("ffmpeg"),
            PathBuf::from("yt-dlp"),
            PathBuf::from("mp4decrypt"),
            None,
        )
    }
}

/// Turns remuxer stderr lines into whole-percent milestones
#[derive(Debug, Default)]
struct ProgressTracker {
    duration: Option<f64>,
    last_step: u32,
}

impl ProgressTracker {
    /// Returns a percentage each time another 10% step is crossed
    fn observe(&mut self, line: &str) -> Option<u32> {
        if self.duration.is_none() {
            self.duration = parse_duration_from_line(line);
            return None;
        }

        let total = self.duration?;
        let elapsed = parse_time_from_line(line)?;
        if total <= 0.0 {
            return None;
        }

        let percent = ((elapsed / total).clamp(0.0, 1.0) * 100.0) as u32;
        let step = percent / 10;
        if step > self.last_step {
            self.last_step = step;
            Some(percent)
        } else {
            None
        }
    }
}

/// Parse `Duration: HH:MM:SS.mm, ...`
fn parse_duration_from_line(line: &str) -> Option<f64> {
    let start = line.find("Duration:")?;
    let rest = line[start + "Duration:".len()..].trim_start();
    let value = rest.split(',').next()?.trim();
    parse_timestamp(value)
}

/// Parse the `time=HH:MM:SS.mm` field of a progress line
fn parse_time_from_line(line: &str) -> Option<f64> {
    line.split_whitespace()
        .find_map(|part| part.strip_prefix("time="))
        .and_then(parse_timestamp)
}

/// `HH:MM:SS.mm` to seconds
fn parse_timestamp(timestamp: &str) -> Option<f64> {
    let parts: Vec<&str> = timestamp.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
