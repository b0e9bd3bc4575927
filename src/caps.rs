//! Caps offered to the host pipeline.
//!
//! The source produces a single layout: interleaved 24-bit RGB at the
//! output size, variable frame rate. Caps travel as text of the form
//! `video/x-raw,format=RGB,width=1288,height=964,framerate=0/1`.

use std::fmt;
use std::str::FromStr;

use crate::traits::{CameraError, Result};

/// Media type of every caps this source handles.
pub const MEDIA_TYPE: &str = "video/x-raw";
/// The only pixel format produced.
pub const RGB_FORMAT: &str = "RGB";

/// Row stride of an RGB frame: 3 bytes per pixel, rounded up to 4 bytes.
#[must_use]
pub const fn rgb_stride(width: u32) -> u32 {
    (width * 3 + 3) & !3
}

/// Raw video caps. Absent fields are unconstrained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCaps {
    /// Pixel format name.
    pub format: String,
    /// Frame width in pixels.
    pub width: Option<u32>,
    /// Frame height in pixels.
    pub height: Option<u32>,
    /// Frame rate as numerator/denominator; `0/1` is variable.
    pub framerate: Option<(u32, u32)>,
}

impl VideoCaps {
    /// Caps advertised before a device is open: RGB at any size.
    #[must_use]
    pub fn template() -> Self {
        Self {
            format: RGB_FORMAT.to_owned(),
            width: None,
            height: None,
            framerate: None,
        }
    }

    /// Fixed RGB caps at `width` x `height`, variable frame rate.
    #[must_use]
    pub fn rgb(width: u32, height: u32) -> Self {
        Self {
            format: RGB_FORMAT.to_owned(),
            width: Some(width),
            height: Some(height),
            framerate: Some((0, 1)),
        }
    }

    /// Whether both dimensions are fixed.
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        self.width.is_some() && self.height.is_some()
    }

    /// Row stride these caps imply, when the width is fixed.
    #[must_use]
    pub fn stride(&self) -> Option<u32> {
        self.width.map(rgb_stride)
    }

    /// Check that these caps describe RGB frames of `width` x `height`.
    pub fn check_output(&self, width: u32, height: u32) -> Result<()> {
        if self.format != RGB_FORMAT {
            return Err(CameraError::UnsupportedCaps(format!(
                "format {} is not {RGB_FORMAT}",
                self.format
            )));
        }
        if self.width != Some(width) || self.height != Some(height) {
            return Err(CameraError::UnsupportedCaps(format!(
                "{self} does not match output size {width}x{height}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for VideoCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{MEDIA_TYPE},format={}", self.format)?;
        if let Some(width) = self.width {
            write!(f, ",width={width}")?;
        }
        if let Some(height) = self.height {
            write!(f, ",height={height}")?;
        }
        if let Some((num, den)) = self.framerate {
            write!(f, ",framerate={num}/{den}")?;
        }
        Ok(())
    }
}

impl FromStr for VideoCaps {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        let mut fields = s.split(',').map(str::trim);
        let media = fields.next().unwrap_or_default();
        if media != MEDIA_TYPE {
            return Err(CameraError::UnsupportedCaps(format!(
                "media type {media:?} is not {MEDIA_TYPE}"
            )));
        }

        let mut caps = Self {
            format: String::new(),
            width: None,
            height: None,
            framerate: None,
        };
        for field in fields.filter(|field| !field.is_empty()) {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| CameraError::UnsupportedCaps(format!("malformed field {field:?}")))?;
            let value = strip_type(value.trim());
            match key.trim() {
                "format" => value.clone_into(&mut caps.format),
                "width" => caps.width = Some(parse_number(key, value)?),
                "height" => caps.height = Some(parse_number(key, value)?),
                "framerate" => {
                    let (num, den) = value.split_once('/').ok_or_else(|| {
                        CameraError::UnsupportedCaps(format!("malformed framerate {value:?}"))
                    })?;
                    caps.framerate = Some((parse_number(key, num)?, parse_number(key, den)?));
                }
                _ => {}
            }
        }

        if caps.format.is_empty() {
            return Err(CameraError::UnsupportedCaps(format!("{s:?} has no format")));
        }
        Ok(caps)
    }
}

/// Drop a leading `(type)` annotation such as `(int)1288`.
fn strip_type(value: &str) -> &str {
    value
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .map_or(value, |(_, rest)| rest.trim())
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| CameraError::UnsupportedCaps(format!("{key} {value:?} is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_stride_rounds_to_four() {
        assert_eq!(rgb_stride(1288), 3864);
        assert_eq!(rgb_stride(1), 4);
        assert_eq!(rgb_stride(5), 16);
        assert_eq!(rgb_stride(808), 2424);
    }

    #[test]
    fn test_display() {
        assert_eq!(VideoCaps::template().to_string(), "video/x-raw,format=RGB");
        assert_eq!(
            VideoCaps::rgb(1288, 964).to_string(),
            "video/x-raw,format=RGB,width=1288,height=964,framerate=0/1"
        );
    }

    #[test]
    fn test_parse_with_type_annotations() {
        let caps: VideoCaps = "video/x-raw, format=(string)RGB, width=(int)808, height=(int)608, framerate=(fraction)0/1"
            .parse()
            .expect("caps should parse");
        assert_eq!(caps, VideoCaps::rgb(808, 608));
        assert!(caps.is_fixed());
        assert_eq!(caps.stride(), Some(2424));
    }

    #[test]
    fn test_parse_rejects_other_media() {
        let err = "audio/x-raw,format=S16LE"
            .parse::<VideoCaps>()
            .expect_err("audio should be rejected");
        assert!(matches!(err, CameraError::UnsupportedCaps(_)));
        assert!("video/x-raw,width=abc,format=RGB".parse::<VideoCaps>().is_err());
        assert!("video/x-raw,width=10".parse::<VideoCaps>().is_err());
    }

    #[test]
    fn test_check_output() {
        let caps = VideoCaps::rgb(1288, 964);
        caps.check_output(1288, 964).expect("matching caps");
        assert!(caps.check_output(644, 482).is_err());

        let gray = VideoCaps {
            format: "GRAY8".to_owned(),
            ..VideoCaps::rgb(1288, 964)
        };
        assert!(matches!(
            gray.check_output(1288, 964),
            Err(CameraError::UnsupportedCaps(_))
        ));
    }
}
