//! Integration tests against the vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded, e.g. `sudo modprobe vivid n_devs=1 node_types=0x1`
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! vivid has no registers, strobe or hardware LUT, so these tests cover
//! the parts of the source that go through plain V4L2: open, format
//! negotiation, streaming, binning by format change, and controls.
//!
//! Tests fail, not skip, when vivid is not available.

#![cfg(feature = "integration")]

use std::fs;
use std::path::Path;

use camsrc::session::CameraSession;
use camsrc::validation::{validate_block_replication, validate_buffer_sequence, validate_padding};
use camsrc::{
    Binning, CameraSettings, CameraSource, FlowOutcome, LutMode, Setting, SourceConfig,
    V4l2Driver, VideoBuffer,
};
use serial_test::serial;

/// Find all vivid capture nodes.
///
/// Uses sysfs to check the device name before opening, so real cameras
/// on the same machine are never touched.
fn find_vivid_devices() -> Vec<usize> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    let mut devices = Vec::new();
    for index in 0..10 {
        let name_path = video4linux.join(format!("video{index}")).join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };
        if !name.to_lowercase().contains("vivid") {
            continue;
        }

        let mut session = CameraSession::new(V4l2Driver::with_node(index));
        if session.open().is_ok() {
            session.close();
            devices.push(index);
        }
    }
    devices
}

/// Returns the first vivid node, failing the test if there is none.
macro_rules! require_vivid {
    () => {
        match find_vivid_devices().first().copied() {
            Some(idx) => idx,
            None => {
                panic!(
                    "vivid virtual camera not available.\n\
                     Load vivid with: sudo modprobe vivid n_devs=1 node_types=0x1\n\
                     Or run unit tests only: cargo test --lib"
                );
            }
        }
    };
}

/// vivid only offers a discrete size list, so the sensor stand-in is the
/// largest size and no ROI tuning is attempted.
fn vivid_config(binning: Binning) -> SourceConfig {
    SourceConfig {
        camera: CameraSettings {
            binning,
            lut: LutMode::Off,
            ..CameraSettings::default()
        },
        tune_roi: false,
        ..SourceConfig::default()
    }
}

fn started(index: usize, binning: Binning) -> CameraSource<V4l2Driver> {
    let source = CameraSource::new(V4l2Driver::with_node(index), vivid_config(binning));
    source.start().expect("Failed to start vivid source");
    let caps = source.caps();
    source.set_caps(&caps).expect("vivid should accept its own caps");
    source
}

fn capture(source: &CameraSource<V4l2Driver>, frames: usize) -> Vec<VideoBuffer> {
    (0..frames)
        .map(|_| match source.create().expect("Failed to capture frame") {
            FlowOutcome::Buffer(buffer) => buffer,
            FlowOutcome::EndOfStream => unreachable!("no buffer limit configured"),
        })
        .collect()
}

#[test]
#[serial]
fn test_vivid_session_open() {
    let index = require_vivid!();

    let mut session = CameraSession::new(V4l2Driver::with_node(index));
    session.open().expect("Failed to open vivid device");
    let info = session.info().cloned().expect("info should be cached");

    println!("Opened vivid device:");
    println!("  Card: {}", info.model);
    println!("  Driver: {}", info.vendor);
    println!("  Bus: {}", info.sensor_info);
    println!("  Largest size: {}", info.sensor_resolution);

    assert!(info.vendor.contains("vivid"), "Expected vivid driver");
    assert!(session.is_present());
    session.close();
    assert!(!session.is_present());
}

#[test]
#[serial]
fn test_vivid_caps_fixed_at_largest_size() {
    let index = require_vivid!();

    let source = CameraSource::new(V4l2Driver::with_node(index), vivid_config(Binning::One));
    source.start().expect("Failed to start vivid source");
    let caps = source.caps();
    let geometry = source.geometry().expect("geometry after start");

    println!("Caps: {caps}");
    assert_eq!(caps.width, Some(geometry.output_width));
    assert_eq!(caps.height, Some(geometry.output_height));
    source.stop();
    assert!(!source.device_present());
}

#[test]
#[serial]
fn test_vivid_capture_sequence() {
    let index = require_vivid!();
    let source = started(index, Binning::One);

    let buffers = capture(&source, 10);
    for buffer in &buffers {
        println!(
            "Buffer {}: pts={:?}, {} bytes",
            buffer.offset,
            buffer.pts,
            buffer.data.len()
        );
    }

    let geometry = source.geometry().expect("geometry");
    let first = buffers.first().expect("buffers captured");
    assert_eq!((first.width, first.height), (geometry.output_width, geometry.output_height));
    validate_buffer_sequence(&buffers).expect("sequence should be clean");
    source.stop();
}

#[test]
#[serial]
fn test_vivid_binning_two_replicates_blocks() {
    let index = require_vivid!();
    let source = started(index, Binning::Two);

    let geometry = source.geometry().expect("geometry");
    println!(
        "Raw {}x{} expanded to {}x{}",
        geometry.raw_width, geometry.raw_height, geometry.output_width, geometry.output_height
    );
    assert_eq!(geometry.binning, Binning::Two);

    let buffers = capture(&source, 3);
    let last = buffers.last().expect("buffers captured");
    validate_block_replication(last, &geometry).expect("blocks should be uniform");
    validate_padding(last, &geometry).expect("padding should be black");
    source.stop();
}

#[test]
#[serial]
fn test_vivid_controls() {
    let index = require_vivid!();
    let source = started(index, Binning::One);

    for setting in ["saturation=50", "sharpness=4", "gain=2"] {
        let setting: Setting = setting.parse().expect("setting should parse");
        let result = source.set(setting);
        println!("{setting}: {result:?}");
    }

    // vivid clamps to its own control ranges, so only the direction is checked.
    assert!(source.saturation() > 0);
    assert_eq!(source.binning(), Binning::One);
    assert!(source.is_capturing());

    let buffers = capture(&source, 2);
    assert_eq!(buffers.len(), 2);
    source.stop();
}
