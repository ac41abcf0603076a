//! Encoder presets and process argument templates

use std::fmt;
use std::net::SocketAddr;

use crate::config::{CaptureConfig, MediaConfig};

/// H.264 encoder used by the encode bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderPreset {
    /// libx264 tuned for latency
    Software,
    /// V4L2 memory-to-memory hardware encoder (Raspberry Pi and similar)
    V4l2M2m,
    /// Encoder named in configuration
    Custom(String),
}

impl EncoderPreset {
    /// Preset for a target `(os, arch)` as reported by `std::env::consts`
    ///
    /// The V4L2 M2M encoder exists only on Linux SoCs: 32-bit ARM boards and
    /// 64-bit ARM Linux (Raspberry Pi OS). ARM macOS and other hosts get
    /// libx264.
    pub fn for_target(os: &str, arch: &str) -> Self {
        match (os, arch) {
            (_, "arm") | ("linux", "aarch64") => Self::V4l2M2m,
            _ => Self::Software,
        }
    }

    /// Preset for the running host
    pub fn detect() -> Self {
        Self::for_target(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Configured override, else host detection
    pub fn resolve(config: &MediaConfig) -> Self {
        match config.encoder.as_deref() {
            Some(name) => Self::from_name(name),
            None => Self::detect(),
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "libx264" => Self::Software,
            "h264_v4l2m2m" => Self::V4l2M2m,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn encoder_name(&self) -> &str {
        match self {
            Self::Software => "libx264",
            Self::V4l2M2m => "h264_v4l2m2m",
            Self::Custom(name) => name,
        }
    }

    /// Extra flags after `-c:v`
    fn tuning_args(&self) -> &'static [&'static str] {
        match self {
            Self::Software => &["-preset", "ultrafast", "-tune", "zerolatency"],
            _ => &[],
        }
    }
}

impl fmt::Display for EncoderPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoder_name())
    }
}

/// Program and arguments of one bridge process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Capture from V4L2, encode H.264, send MPEG-TS to `endpoint`
    pub fn encode(media: &MediaConfig, capture: &CaptureConfig, preset: &EncoderPreset, endpoint: SocketAddr) -> Self {
        let mut args = v4l2_input_args(capture);
        args.push("-c:v".to_string());
        args.push(preset.encoder_name().to_string());
        args.extend(preset.tuning_args().iter().map(|s| s.to_string()));
        args.push("-f".to_string());
        args.push("mpegts".to_string());
        args.push(udp_url(endpoint));

        Self::new(media.ffmpeg_path.clone(), args)
    }

    /// Decode and display the MPEG-TS stream arriving on `endpoint`
    pub fn preview_endpoint(media: &MediaConfig, endpoint: SocketAddr) -> Self {
        let args = ["-fflags", "nobuffer", "-flags", "low_delay", "-framedrop"]
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(udp_url(endpoint)))
            .collect();

        Self::new(media.ffplay_path.clone(), args)
    }

    /// Display the capture device locally, no network involved
    pub fn preview_device(media: &MediaConfig, capture: &CaptureConfig) -> Self {
        Self::new(media.ffplay_path.clone(), v4l2_input_args(capture))
    }

    /// Command line as a single string, for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn v4l2_input_args(capture: &CaptureConfig) -> Vec<String> {
    vec![
        "-f".to_string(),
        "v4l2".to_string(),
        "-framerate".to_string(),
        capture.frame_rate.to_string(),
        "-video_size".to_string(),
        format!("{}x{}", capture.width, capture.height),
        "-input_format".to_string(),
        capture.pixel_format.clone(),
        "-i".to_string(),
        capture.device.clone(),
    ]
}

fn udp_url(endpoint: SocketAddr) -> String {
    format!("udp://{}", endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_by_target() {
        assert_eq!(EncoderPreset::for_target("linux", "x86_64"), EncoderPreset::Software);
        assert_eq!(EncoderPreset::for_target("linux", "arm"), EncoderPreset::V4l2M2m);
        assert_eq!(EncoderPreset::for_target("linux", "aarch64"), EncoderPreset::V4l2M2m);
        assert_eq!(EncoderPreset::for_target("macos", "aarch64"), EncoderPreset::Software);
        assert_eq!(EncoderPreset::for_target("windows", "aarch64"), EncoderPreset::Software);
        assert_eq!(EncoderPreset::for_target("linux", "riscv64"), EncoderPreset::Software);
    }

    #[test]
    fn test_config_overrides_detection() {
        let mut media = MediaConfig::default();
        assert_eq!(EncoderPreset::resolve(&media), EncoderPreset::detect());

        media.encoder = Some("h264_v4l2m2m".to_string());
        assert_eq!(EncoderPreset::resolve(&media), EncoderPreset::V4l2M2m);

        media.encoder = Some("h264_nvenc".to_string());
        assert_eq!(EncoderPreset::resolve(&media).encoder_name(), "h264_nvenc");
    }

    #[test]
    fn test_software_encode_args() {
        let spec = ProcessSpec::encode(
            &MediaConfig::default(),
            &CaptureConfig::default(),
            &EncoderPreset::Software,
            "192.168.1.20:5000".parse().unwrap(),
        );

        assert_eq!(spec.program, "ffmpeg");
        assert_eq!(
            spec.command_line(),
            "ffmpeg -f v4l2 -framerate 30 -video_size 1280x720 -input_format yuyv422 -i /dev/video0 \
             -c:v libx264 -preset ultrafast -tune zerolatency -f mpegts udp://192.168.1.20:5000"
        );
    }

    #[test]
    fn test_hardware_encode_has_no_x264_tuning() {
        let spec = ProcessSpec::encode(
            &MediaConfig::default(),
            &CaptureConfig::default(),
            &EncoderPreset::V4l2M2m,
            "10.0.0.2:6000".parse().unwrap(),
        );

        assert!(spec.args.contains(&"h264_v4l2m2m".to_string()));
        assert!(!spec.args.contains(&"zerolatency".to_string()));
        assert_eq!(spec.args.last().map(String::as_str), Some("udp://10.0.0.2:6000"));
    }

    #[test]
    fn test_preview_args() {
        let media = MediaConfig::default();
        let spec = ProcessSpec::preview_endpoint(&media, "0.0.0.0:5000".parse().unwrap());
        assert_eq!(spec.command_line(), "ffplay -fflags nobuffer -flags low_delay -framedrop udp://0.0.0.0:5000");

        let capture = CaptureConfig {
            device: "/dev/video2".to_string(),
            ..Default::default()
        };
        let spec = ProcessSpec::preview_device(&media, &capture);
        assert_eq!(spec.program, "ffplay");
        assert_eq!(spec.args.last().map(String::as_str), Some("/dev/video2"));
    }
}
