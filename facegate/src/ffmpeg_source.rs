//! Default video backend: an ffmpeg child process per stream, decoding to
//! raw RGB24 on its stdout. ffprobe supplies the stream geometry first so
//! the reader knows the frame size.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info};

use crate::engines::{RawImage, StreamOpener, VideoStream};

#[derive(Default)]
pub struct FfmpegStreamOpener {}

impl StreamOpener for FfmpegStreamOpener {
    fn open(&self, url: &str) -> Result<Box<dyn VideoStream>> {
        let (width, height) = probe_geometry(url)?;
        info!("stream {url}: {width}x{height}");

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error"]);
        if url.starts_with("rtsp://") {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        cmd.args(["-i", url, "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        debug!("spawning {cmd:?}");
        let mut child = cmd
            .spawn()
            .wrap_err("failed to spawn ffmpeg; is it installed?")?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("ffmpeg child has no stdout"))?;

        Ok(Box::new(FfmpegStream {
            child,
            stdout,
            width,
            height,
        }))
    }
}

struct FfmpegStream {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
}

impl VideoStream for FfmpegStream {
    fn read_frame(&mut self) -> Result<RawImage> {
        let mut data = vec![0u8; self.width as usize * self.height as usize * 3];
        self.stdout
            .read_exact(&mut data)
            .wrap_err("stream ended")?;
        Ok(RawImage {
            width: self.width,
            height: self.height,
            data,
        })
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn probe_geometry(url: &str) -> Result<(u32, u32)> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=s=x:p=0",
            url,
        ])
        .stdin(Stdio::null())
        .output()
        .wrap_err("failed to run ffprobe; is it installed?")?;
    if !output.status.success() {
        return Err(eyre!(
            "ffprobe failed for {url}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

fn parse_probe_output(stdout: &str) -> Result<(u32, u32)> {
    let line = stdout
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| eyre!("ffprobe produced no geometry"))?;
    let (w, h) = line
        .trim()
        .split_once('x')
        .ok_or_else(|| eyre!("unexpected ffprobe output: {line:?}"))?;
    let width: u32 = w.parse().wrap_err("bad width from ffprobe")?;
    let height: u32 = h.parse().wrap_err("bad height from ffprobe")?;
    if width == 0 || height == 0 {
        return Err(eyre!("ffprobe reported zero-sized stream: {line:?}"));
    }
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_geometry_line() {
        assert_eq!(parse_probe_output("1920x1080\n").unwrap(), (1920, 1080));
    }

    #[test]
    fn skips_blank_lines() {
        assert_eq!(parse_probe_output("\n640x480\n").unwrap(), (640, 480));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_probe_output("").is_err());
        assert!(parse_probe_output("no geometry here\n").is_err());
        assert!(parse_probe_output("0x0\n").is_err());
    }
}
