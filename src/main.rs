//! camsrc command-line tool: run the camera source and report on the
//! buffers it produces.
//!
//! ```bash
//! # 100 frames from the first V4L2 camera, 2x2 binning
//! camsrc --num-buffers 101 --set binning=2
//!
//! # Scripted mock camera, checking every frame
//! camsrc --mock --num-buffers 51 --verify --set whitebalance=onepush
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use camsrc::mock::{MockDriver, TestPattern};
use camsrc::validation::{validate_block_replication, validate_buffer_sequence, validate_padding};
use camsrc::{
    logger, CameraSource, DeviceDriver, Downstream, FrameGeometry, Result, Setting, SourceConfig,
    V4l2Driver, VideoBuffer,
};
use clap::Parser;
use tracing::{debug, error, info};

/// Live video source for USB3 machine-vision cameras
#[derive(Parser, Debug)]
#[command(name = "camsrc", version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use the built-in mock camera instead of a V4L2 device
    #[arg(long)]
    mock: bool,

    /// V4L2 node number to open (`/dev/videoN`); default is the first camera
    #[arg(short, long, conflicts_with = "mock")]
    device: Option<usize>,

    /// End the stream once this many frames have been counted
    #[arg(short, long)]
    num_buffers: Option<u64>,

    /// Change a parameter after startup (repeatable)
    #[arg(short, long = "set", value_name = "NAME=VALUE")]
    settings: Vec<Setting>,

    /// Check frame structure and buffer sequence while running
    #[arg(long)]
    verify: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logger::init(&args.log_level);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "camsrc failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SourceConfig::load(path)?,
        None => SourceConfig::default(),
    };
    if args.num_buffers.is_some() {
        config.num_buffers = args.num_buffers;
    }

    if args.dump_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    if args.mock {
        let (driver, _handle) = MockDriver::builder()
            .pattern(TestPattern::ColorBars)
            .build();
        stream(driver, config, args)
    } else {
        let driver = args.device.map_or_else(V4l2Driver::new, V4l2Driver::with_node);
        stream(driver, config, args)
    }
}

fn stream<D: DeviceDriver>(driver: D, config: SourceConfig, args: &Args) -> Result<()> {
    let source = CameraSource::new(driver, config);
    source.start()?;

    for setting in &args.settings {
        // Failures are logged by the source and do not stop the stream.
        let _ = source.set(*setting);
    }

    let mut sink = Reporter {
        verify: args.verify.then(|| source.geometry()).flatten(),
        previous: None,
        frames: 0,
    };
    let result = source.run(&mut sink);

    info!(
        frames = sink.frames,
        exposure_ms = source.exposure(),
        gain = source.gain(),
        binning = %source.binning(),
        white_balance = %source.white_balance(),
        "stream finished"
    );
    source.stop();
    result.map(|_| ())
}

/// Downstream that logs buffers and optionally checks them.
struct Reporter {
    verify: Option<FrameGeometry>,
    previous: Option<VideoBuffer>,
    frames: u64,
}

impl Downstream for Reporter {
    fn accept(&mut self, buffer: VideoBuffer) -> Result<()> {
        self.frames += 1;
        debug!(
            offset = buffer.offset,
            pts = ?buffer.pts,
            duration = buffer.duration,
            markers = ?buffer.markers,
            "buffer"
        );
        if buffer.offset % 25 == 0 {
            info!(offset = buffer.offset, width = buffer.width, height = buffer.height, "frame");
        }

        if let Some(geometry) = &self.verify {
            // Marker overlays are drawn over the image, so marked frames are
            // only checked for sequence.
            if buffer.markers.is_empty() {
                validate_block_replication(&buffer, geometry)?;
                validate_padding(&buffer, geometry)?;
            }
            let current = VideoBuffer {
                data: Vec::new(),
                ..buffer
            };
            if let Some(previous) = self.previous.take() {
                validate_buffer_sequence(&[previous, current.clone()])?;
            }
            self.previous = Some(current);
        }
        Ok(())
    }
}
