use std::{ffi::OsStr, path::Path, process::Stdio, sync::OnceLock};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    process::Command,
};
use tokio_stream::{wrappers::SplitStream, StreamExt};

fn bitrate_regex() -> &'static Regex {
    static BITRATE_RE: OnceLock<Regex> = OnceLock::new();
    BITRATE_RE.get_or_init(|| Regex::new(r"bitrate: (\d+) kb/s").expect("bitrate regex is valid"))
}

/// Get the bitrate (kb/s) that ffmpeg announces on a line like
/// `Duration: 00:24:00.02, start: 1.4, bitrate: 5012 kb/s`.
pub fn parse_bitrate_line(line: &str) -> Option<u64> {
    bitrate_regex()
        .captures(line)
        .and_then(|captures| captures.get(1))
        .and_then(|kbps| kbps.as_str().parse().ok())
}

/// Read diagnostic output until the first bitrate announcement. Returns 0 if the stream
/// closes without one.
pub async fn scan_bitrate<R>(reader: R) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    // ffmpeg echoes container metadata verbatim, which is not always utf-8:
    let mut lines = SplitStream::new(reader.split(b'\n'));
    while let Some(line) = lines.next().await {
        let line = line?;
        if let Some(kbps) = parse_bitrate_line(&String::from_utf8_lossy(&line)) {
            return Ok(kbps);
        }
    }
    Ok(0)
}

/// Run `ffmpeg -i <input>` without an output file and read the source bitrate from stderr.
pub async fn probe_bitrate(ffmpeg: &OsStr, input: &Path) -> Result<u64> {
    let mut child = Command::new(ffmpeg)
        .arg("-i")
        .arg(input)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Could not run {ffmpeg:?} to probe {input:?}"))?;

    let stderr = child
        .stderr
        .take()
        .context("The probe's stderr was not captured")?;
    let kbps = scan_bitrate(BufReader::new(stderr)).await?;

    // ffmpeg always fails when given no output, so the status says nothing:
    let status = child.wait().await?;
    log::trace!("Probe of {input:?} exited with {status}");

    if kbps == 0 {
        log::debug!("No bitrate found in the probe output for {input:?}");
    }
    Ok(kbps)
}
