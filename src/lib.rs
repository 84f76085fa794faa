//! Reading and writing the slice files consumed by masked-stereolithography
//! (MSLA) resin printers.
//!
//! These files all share a basic shape: a fixed header at offset zero, a pair
//! of RGB preview thumbnails, a table of per-layer records, and a pile of
//! compressed (and sometimes scrambled) layer masks referenced from that table
//! by absolute `(offset, length)` pairs. The details -- record layouts, which
//! run-length scheme is in use, which key schedule scrambles the layers --
//! vary by vendor and by firmware revision.
//!
//! The crate is organized bottom-up:
//!
//! - `crypto` implements the keystream ciphers.
//! - `rle` implements the run-length codecs.
//! - `codec` glues a codec and a cipher together for one file's layers.
//! - `output` assembles file images, with content-addressed deduplication of
//!   compressed layers; `input` does bounds-checked, zero-copy parsing.
//! - `format` holds one adapter per vendor format, behind the `Format` trait,
//!   and the extension table used to pick one.
//! - `model` is the format-independent description of a print.
//!
//! The record types in this module are shared by the ChiTu-derived formats
//! (`ctb`, `cbddlp`, `phz`, `fdg`). They are `zerocopy` types, so they can be
//! read directly out of a file image and written back out as bytes.

use num_derive::FromPrimitive;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub mod codec;
pub mod crypto;
pub mod error;
pub mod format;
pub mod input;
pub mod model;
pub mod output;
pub mod rle;

pub use error::{Error, Payload, Result};
pub use format::{Format, Kind, Options};
pub use model::{
    Bottom, BottomStyle, Exposure, Layer, PreviewKind, Print, Printable,
    Properties, Size,
};

/// Little-endian `u16` with no alignment requirement.
pub type U16LE = U16<LittleEndian>;
/// Little-endian `u32` with no alignment requirement.
pub type U32LE = U32<LittleEndian>;

/// Little-endian IEEE-754 `f32` with no alignment requirement.
#[derive(Copy, Clone, Default, PartialEq, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct F32LE([u8; 4]);

impl F32LE {
    pub fn new(x: f32) -> Self {
        Self(x.to_le_bytes())
    }

    pub fn get(self) -> f32 {
        f32::from_le_bytes(self.0)
    }
}

impl From<f32> for F32LE {
    fn from(x: f32) -> Self {
        Self::new(x)
    }
}

impl core::fmt::Debug for F32LE {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.get().fmt(f)
    }
}

/// Magic numbers found in the first word of the ChiTu-derived formats.
///
/// Anycubic files don't have one of these; they start with a text mark
/// instead (see `format::pws`).
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum Magic {
    /// Grayscale layers, RLE7, scrambled with the CTB key schedule.
    Ctb = 0x12FD_0086,
    /// Bit-plane layers, one table entry per plane. Also used by `.photon`.
    Cbddlp = 0x12FD_0019,
    /// Grayscale layers, RLE7a, single large header.
    Phz = 0x9FDA_83AE,
    /// Voxelab's take on CTB with its own key schedule.
    Fdg = 0xBD3C_7AC8,
}

/// The first eight bytes of every ChiTu-derived file.
#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct MagicHeader {
    pub magic: U32LE,
    pub version: U32LE,
}

/// Describes an embedded preview image.
#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct PreviewHeader {
    /// Image size in pixels, `[x, y]`.
    pub size: [U32LE; 2],
    /// Absolute file offset of RLE15-encoded pixel data.
    pub data_offset: U32LE,
    /// Length of encoded pixel data in bytes.
    pub data_len: U32LE,
    pub _reserved: [U32LE; 4],
}

/// Describes one layer (or, in bit-plane files, one plane of one layer).
#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct LayerHeader {
    /// Absolute height of the build platform for this layer, in mm.
    pub z: F32LE,
    /// Exposure time in seconds. Zero means "use the header default."
    pub exposure_s: F32LE,
    /// Light-off time in seconds. Zero means "use the header default."
    pub light_off_time_s: F32LE,
    /// Absolute file offset of encoded layer data.
    pub data_offset: U32LE,
    /// Length of encoded layer data in bytes.
    pub data_len: U32LE,
    pub _reserved0: U32LE,
    /// Size of the `ImageInfo` record placed directly before the layer data,
    /// in files that have one; otherwise zero.
    pub info_size: U32LE,
    pub _reserved1: [U32LE; 2],
}

/// Per-layer overrides stored directly in front of the layer data in version
/// 3 CTB and FDG files.
#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct ImageInfo {
    /// Copy of the layer's table entry.
    pub layer: LayerHeader,
    /// Size of this record plus the layer data that follows.
    pub total_size: U32LE,
    pub lift_height_mm: F32LE,
    pub lift_speed_mmpm: F32LE,
    pub _reserved0: [U32LE; 2],
    pub retract_speed_mmpm: F32LE,
    pub _reserved1: [U32LE; 5],
    /// Backlight PWM level, 0-255, oddly stored as a float.
    pub light_pwm: F32LE,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;
    use std::mem::size_of;

    #[test]
    fn record_sizes() {
        assert_eq!(size_of::<MagicHeader>(), 8);
        assert_eq!(size_of::<PreviewHeader>(), 32);
        assert_eq!(size_of::<LayerHeader>(), 36);
        assert_eq!(size_of::<ImageInfo>(), 0x54);
    }

    #[test]
    fn magic_lookup() {
        assert_eq!(Magic::from_u32(0x12FD_0086), Some(Magic::Ctb));
        assert_eq!(Magic::from_u32(0x9FDA_83AE), Some(Magic::Phz));
        assert_eq!(Magic::from_u32(0xDEAD_BEEF), None);
    }

    #[test]
    fn f32le_bytes() {
        let x = F32LE::new(16.5);
        assert_eq!(x.as_bytes(), &[0x00, 0x00, 0x84, 0x41]);
        assert_eq!(x.get(), 16.5);
    }
}
