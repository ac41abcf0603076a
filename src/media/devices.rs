//! V4L2 capture device enumeration

use std::path::Path;

use crate::error::Result;

/// Number of `/dev/videoN` nodes probed when `v4l2-ctl` is unavailable
const PROBE_LIMIT: u32 = 10;

/// A video capture node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDevice {
    pub name: String,
    pub path: String,
}

/// List capture devices, via `v4l2-ctl --list-devices` when installed
pub async fn list_capture_devices() -> Result<Vec<CaptureDevice>> {
    if let Ok(v4l2_ctl) = which::which("v4l2-ctl") {
        let output = tokio::process::Command::new(v4l2_ctl)
            .arg("--list-devices")
            .output()
            .await?;

        if output.status.success() {
            return Ok(parse_v4l2_ctl(&String::from_utf8_lossy(&output.stdout)));
        }
        tracing::debug!(
            "v4l2-ctl failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    probe_video_nodes(Path::new("/dev"), Path::new("/sys/class/video4linux")).await
}

/// Parse the grouped output of `v4l2-ctl --list-devices`
///
/// ```text
/// HD Webcam: HD Webcam (usb-0000:00:14.0-1):
///         /dev/video0
///         /dev/video1
///         /dev/media0
/// ```
pub fn parse_v4l2_ctl(output: &str) -> Vec<CaptureDevice> {
    let mut devices = Vec::new();
    let mut current = String::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if !line.starts_with(char::is_whitespace) {
            current = line.trim().trim_end_matches(':').to_string();
            continue;
        }

        let path = line.trim();
        if path.starts_with("/dev/video") {
            devices.push(CaptureDevice {
                name: current.clone(),
                path: path.to_string(),
            });
        }
    }

    devices
}

async fn probe_video_nodes(dev_dir: &Path, sysfs_dir: &Path) -> Result<Vec<CaptureDevice>> {
    let mut devices = Vec::new();

    for index in 0..PROBE_LIMIT {
        let node = format!("video{index}");
        let path = dev_dir.join(&node);
        if tokio::fs::metadata(&path).await.is_err() {
            continue;
        }

        let path = path.to_string_lossy().into_owned();
        let name = match tokio::fs::read_to_string(sysfs_dir.join(&node).join("name")).await {
            Ok(name) => name.trim().to_string(),
            Err(_) => path.clone(),
        };
        devices.push(CaptureDevice { name, path });
    }

    Ok(devices)
}
