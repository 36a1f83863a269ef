//! Target panel description.

use crate::error::{Error, Result};

/// Display class of the target printer panel.
///
/// The class decides how many source subpixels collapse into one output
/// pixel and how many channels the layer PNGs carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BoardKind {
    /// 8-bit colour panel: three source subpixels become the R, G and B
    /// channels of one output pixel.
    Rgb8Bit,
    /// 3-bit greyscale panel: two source subpixels are averaged into one
    /// greyscale output pixel.
    Grey3Bit,
}

impl BoardKind {
    /// PNG channels per output pixel.
    pub fn channels(self) -> u32 {
        match self {
            BoardKind::Rgb8Bit => 3,
            BoardKind::Grey3Bit => 1,
        }
    }

    /// Source subpixels consumed per output pixel.
    pub fn subpixels_per_pixel(self) -> u32 {
        match self {
            BoardKind::Rgb8Bit => 3,
            BoardKind::Grey3Bit => 2,
        }
    }

    /// PNG colour type byte for the IHDR chunk.
    pub fn png_color_type(self) -> u8 {
        match self {
            BoardKind::Rgb8Bit => 2,
            BoardKind::Grey3Bit => 0,
        }
    }
}

/// Description of the output panel a run targets. Immutable for the whole
/// run and shared freely between workers.
#[derive(Clone, Debug)]
pub struct TargetProfile {
    /// Human-readable label, recorded in the manifest.
    pub label: String,
    /// Output pixels per row.
    pub out_width: u32,
    /// Display class.
    pub board: BoardKind,
    /// Maximum printable height. Prints taller than this are refused before
    /// any layer is decoded.
    pub max_z_mm: f32,
    /// Source subpixel pitch, micrometres. Area statistics are computed on
    /// the source grid with this pitch on both axes.
    pub pixel_pitch_um: f32,
}

impl TargetProfile {
    /// Convenience constructor for an RGB panel profile.
    pub fn rgb8(label: &str, out_width: u32, pixel_pitch_um: f32, max_z_mm: f32) -> TargetProfile {
        TargetProfile {
            label: label.to_owned(),
            out_width,
            board: BoardKind::Rgb8Bit,
            max_z_mm,
            pixel_pitch_um,
        }
    }

    /// Convenience constructor for a greyscale panel profile.
    pub fn grey3(label: &str, out_width: u32, pixel_pitch_um: f32, max_z_mm: f32) -> TargetProfile {
        TargetProfile {
            label: label.to_owned(),
            out_width,
            board: BoardKind::Grey3Bit,
            max_z_mm,
            pixel_pitch_um,
        }
    }

    /// Source subpixels one output row can represent.
    pub fn subpixel_capacity(&self) -> u32 {
        self.out_width * self.board.subpixels_per_pixel()
    }

    /// Centered left padding, in source subpixels, for a given source width.
    pub fn pad_left(&self, src_w: u32) -> u32 {
        self.subpixel_capacity().saturating_sub(src_w) / 2
    }

    /// Source pixel pitch in millimetres.
    pub fn pitch_mm(&self) -> f64 {
        f64::from(self.pixel_pitch_um) * 1e-3
    }

    /// Reject profiles that cannot represent a source row of `src_w`
    /// subpixels, or prints taller than the panel's travel.
    pub fn validate(&self, src_w: u32, print_height_mm: f32) -> Result<()> {
        if self.out_width == 0 {
            return Err(Error::InvalidFormat("profile out_width is zero".into()));
        }
        if self.subpixel_capacity() < src_w {
            return Err(Error::InvalidFormat(format!(
                "profile '{}' holds {} subpixels per row but the source is {} wide",
                self.label,
                self.subpixel_capacity(),
                src_w
            )));
        }
        if self.max_z_mm > 0.0 && print_height_mm > self.max_z_mm {
            return Err(Error::InvalidFormat(format!(
                "print height {:.2} mm exceeds the profile's {:.2} mm travel",
                print_height_mm, self.max_z_mm
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_capacity_is_three_per_pixel() {
        let p = TargetProfile::rgb8("t", 3840, 50.0, 260.0);
        assert_eq!(p.subpixel_capacity(), 11520);
        assert_eq!(p.pad_left(11520), 0);
        assert_eq!(p.pad_left(11518), 1);
    }

    #[test]
    fn grey_capacity_is_two_per_pixel() {
        // 16K panel in 3-bit mode: 7568 output pixels cover 15136 subpixels.
        let p = TargetProfile::grey3("t", 7568, 30.0, 300.0);
        assert_eq!(p.subpixel_capacity(), 15136);
        assert_eq!(p.pad_left(15136), 0);
    }

    #[test]
    fn undersized_profile_is_rejected() {
        let p = TargetProfile::grey3("t", 100, 50.0, 0.0);
        assert!(p.validate(201, 0.0).is_err());
        assert!(p.validate(200, 0.0).is_ok());
    }

    #[test]
    fn too_tall_print_is_rejected() {
        let p = TargetProfile::rgb8("t", 3840, 50.0, 100.0);
        assert!(p.validate(3840, 150.0).is_err());
        assert!(p.validate(3840, 99.0).is_ok());
    }
}
