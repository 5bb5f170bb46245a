//! Vellum demo viewer.
//!
//! Clears every acquired swapchain image to an animated color. Resizing,
//! minimizing and restoring the window exercise swapchain recreation.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vellum-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--frames-in-flight <N>`: Frames recorded ahead of the GPU (default: 2)
//! - `--no-vsync`: Prefer mailbox or immediate presentation
//! - `--validation`: Enable the Khronos validation layer
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use vellum_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

/// Command line options.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ViewerArgs {
    frames_in_flight: Option<usize>,
    vsync: bool,
    validation: bool,
}

impl Default for ViewerArgs {
    fn default() -> Self {
        Self {
            frames_in_flight: None,
            vsync: true,
            validation: false,
        }
    }
}

impl ViewerArgs {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let mut parsed = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--frames-in-flight" => {
                    let value = args
                        .get(i + 1)
                        .ok_or_else(|| anyhow::anyhow!("--frames-in-flight needs a value"))?;
                    let frames: usize = value
                        .parse()
                        .map_err(|e| anyhow::anyhow!("Invalid --frames-in-flight {value:?}: {e}"))?;
                    if frames == 0 {
                        anyhow::bail!("--frames-in-flight must be at least 1");
                    }
                    parsed.frames_in_flight = Some(frames);
                    i += 1;
                }
                "--no-vsync" => parsed.vsync = false,
                "--validation" => parsed.validation = true,
                other => anyhow::bail!("Unknown argument {other:?}, see --help"),
            }
            i += 1;
        }

        Ok(parsed)
    }

    fn app_config(&self) -> AppConfig {
        let mut config = AppConfig::new("Vellum Viewer")
            .with_size(WIDTH, HEIGHT)
            .with_vsync(self.vsync);
        // Validation stays on by default in debug builds.
        if self.validation {
            config = config.with_validation(true);
        }
        if let Some(frames) = self.frames_in_flight {
            config = config.with_frames_in_flight(frames);
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let viewer_args = ViewerArgs::parse(&args)?;
    run_app::<Viewer>(viewer_args.app_config())
}

fn print_help() {
    eprintln!(
        "Vellum demo viewer

USAGE:
    cargo run -p vellum-viewer -- [OPTIONS]

OPTIONS:
    --frames-in-flight <N>  Frames recorded ahead of the GPU (default: 2)
    --no-vsync              Prefer mailbox or immediate presentation
    --validation            Enable the Khronos validation layer
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("vellum-viewer")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults() {
        let parsed = ViewerArgs::parse(&args(&[])).unwrap();
        assert_eq!(parsed, ViewerArgs::default());
        assert!(parsed.app_config().vsync);
    }

    #[test]
    fn all_flags() {
        let parsed =
            ViewerArgs::parse(&args(&["--frames-in-flight", "3", "--no-vsync", "--validation"]))
                .unwrap();
        let config = parsed.app_config();
        assert_eq!(config.frames_in_flight, 3);
        assert!(!config.vsync);
        assert!(config.validation);
    }

    #[test]
    fn rejects_bad_frame_counts() {
        assert!(ViewerArgs::parse(&args(&["--frames-in-flight", "0"])).is_err());
        assert!(ViewerArgs::parse(&args(&["--frames-in-flight", "two"])).is_err());
        assert!(ViewerArgs::parse(&args(&["--frames-in-flight"])).is_err());
        assert!(ViewerArgs::parse(&args(&["--fullscreen"])).is_err());
    }
}
