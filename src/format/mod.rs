//! Vendor file formats.
//!
//! Each submodule implements `Format` for one family of files. `Kind` names
//! every supported file type and maps file extensions (and magic numbers) onto
//! a configured formatter.
//!
//! The ChiTu-derived formats (`ctb`, `cbddlp`, `phz`, `fdg`) share their
//! preview and layer table records, and the helpers for reading and writing
//! those live here.

use std::io::Write;
use std::mem::size_of;
use std::path::Path;
use std::time::Duration;

use image::RgbImage;
use num_traits::FromPrimitive;
use zerocopy::AsBytes;

use crate::codec::{self, EncodedSlice, SliceCodec};
use crate::error::{Error, Result};
use crate::input::{self, LayerRecord};
use crate::model::{Exposure, PreviewKind, Printable, Properties, Size};
use crate::output::{self, CompressedBlock, FileImage};
use crate::{
    ImageInfo, LayerHeader, Magic, MagicHeader, PreviewHeader, F32LE, U32LE,
};

pub mod cbddlp;
pub mod ctb;
pub mod fdg;
pub mod lgs;
pub mod phz;
pub mod pws;

/// Lift height used when a file doesn't specify one, in mm.
pub const DEFAULT_LIFT_HEIGHT_MM: f32 = 5.0;
/// Lift speed used when a file doesn't specify one, in mm/min.
pub const DEFAULT_LIFT_SPEED_MMPM: f32 = 300.0;
/// Retract speed used when a file doesn't specify one, in mm/min.
pub const DEFAULT_RETRACT_SPEED_MMPM: f32 = 300.0;
/// Retract height used when a file doesn't specify one, in mm.
pub const DEFAULT_RETRACT_HEIGHT_MM: f32 = 6.0;
/// Z extent of the build volume recorded in ChiTu headers. Printers ignore
/// it, and the model doesn't track it.
pub const BED_Z_MM: f32 = 155.0;

/// A file format: something that can turn bytes into a `Printable` and back.
pub trait Format {
    /// Short name, as used for the file extension.
    fn name(&self) -> &'static str;

    /// Size of the fixed header at the start of the file.
    fn header_size(&self) -> usize;

    /// Parses a complete file image. Layers are decoded lazily, so errors in
    /// layer data show up when the layer is requested.
    fn decode(&self, data: Vec<u8>) -> Result<Box<dyn Printable>>;

    /// Writes `printable` to `sink`.
    fn encode(&self, printable: &dyn Printable, sink: &mut dyn Write)
        -> Result<()>;
}

/// Supported file types.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Kind {
    Ctb,
    Cbddlp,
    /// Version 1 of `Cbddlp`, under its own extension.
    Photon,
    Phz,
    Fdg,
    Pws,
    Pw0,
    /// Longer Orange 10.
    Lgs,
    /// Longer Orange 30.
    Lgs30,
}

/// File extensions and the formats they imply.
pub static EXTENSIONS: &[(&str, Kind)] = &[
    ("ctb", Kind::Ctb),
    ("cbddlp", Kind::Cbddlp),
    ("photon", Kind::Photon),
    ("phz", Kind::Phz),
    ("fdg", Kind::Fdg),
    ("pws", Kind::Pws),
    ("pw0", Kind::Pw0),
    ("lgs", Kind::Lgs),
    ("lgs30", Kind::Lgs30),
];

/// Mark at the start of Anycubic files.
pub const ANYCUBIC_MARK: &[u8; 8] = b"ANYCUBIC";

impl Kind {
    /// Looks up a file extension, with or without the leading dot, ignoring
    /// case.
    pub fn from_extension(ext: &str) -> Option<Kind> {
        let ext = ext.trim_start_matches('.');
        EXTENSIONS
            .iter()
            .find(|(e, _)| e.eq_ignore_ascii_case(ext))
            .map(|&(_, kind)| kind)
    }

    /// Looks up the extension of `path`.
    pub fn from_path(path: &Path) -> Option<Kind> {
        Kind::from_extension(path.extension()?.to_str()?)
    }

    /// Guesses the format of a file image from its first few bytes.
    ///
    /// `pws` and `pw0` files can't be told apart this way; both are reported
    /// as `Pws`.
    pub fn detect(data: &[u8]) -> Option<Kind> {
        if data.starts_with(ANYCUBIC_MARK) {
            return Some(Kind::Pws);
        }
        if data.starts_with(lgs::MARK) {
            return Some(lgs::detect(data));
        }
        let header = input::parse_type::<MagicHeader>(data, 0).ok()?;
        Some(match Magic::from_u32(header.magic.get())? {
            Magic::Ctb => Kind::Ctb,
            Magic::Cbddlp if header.version.get() == 1 => Kind::Photon,
            Magic::Cbddlp => Kind::Cbddlp,
            Magic::Phz => Kind::Phz,
            Magic::Fdg => Kind::Fdg,
        })
    }

    /// Canonical extension for this kind.
    pub fn extension(self) -> &'static str {
        EXTENSIONS
            .iter()
            .find(|&&(_, kind)| kind == self)
            .map(|&(ext, _)| ext)
            .unwrap_or("bin")
    }

    /// Builds a formatter for this kind, checking `options` against what the
    /// format can represent.
    pub fn formatter(self, options: &Options) -> Result<Box<dyn Format>> {
        Ok(match self {
            Kind::Ctb => Box::new(ctb::Ctb::new(options)?),
            Kind::Cbddlp | Kind::Photon => {
                Box::new(cbddlp::Cbddlp::new(self, options)?)
            }
            Kind::Phz => Box::new(phz::Phz::new(options)?),
            Kind::Fdg => Box::new(fdg::Fdg::new(options)?),
            Kind::Pws | Kind::Pw0 => Box::new(pws::Pws::new(self, options)?),
            Kind::Lgs | Kind::Lgs30 => Box::new(lgs::Lgs::new(self, options)?),
        })
    }
}

/// Overrides for how a file is written.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Antialiasing level, for formats that store bit planes.
    pub anti_alias: Option<u32>,
    /// Format revision.
    pub version: Option<u32>,
    /// Layer encryption seed, for formats that scramble layers. Zero disables
    /// scrambling; if absent, a random seed is chosen.
    pub encryption_seed: Option<u32>,
}

impl Options {
    /// Checks the requested version against `allowed`, returning the first
    /// allowed version if none was requested.
    pub(crate) fn version(&self, format: &str, allowed: &[u32]) -> Result<u32> {
        match self.version {
            None => Ok(allowed[0]),
            Some(v) if allowed.contains(&v) => Ok(v),
            Some(v) => Err(Error::invalid(format!(
                "{} can't be written as version {} (supported: {:?})",
                format, v, allowed
            ))),
        }
    }

    /// Checks the requested antialiasing level against `allowed`, returning 1
    /// if none was requested.
    pub(crate) fn anti_alias(&self, format: &str, allowed: &[u32]) -> Result<u32> {
        match self.anti_alias {
            None => Ok(1),
            Some(aa) if allowed.contains(&aa) => Ok(aa),
            Some(aa) => Err(Error::invalid(format!(
                "{} doesn't support antialiasing level {} (supported: {:?})",
                format, aa, allowed
            ))),
        }
    }

    /// Warns about options the format has no use for.
    pub(crate) fn ignore_anti_alias(&self, format: &str) {
        if let Some(aa) = self.anti_alias.filter(|&aa| aa != 1) {
            log::warn!("{} stores grayscale; ignoring antialias level {}", format, aa);
        }
    }

    pub(crate) fn ignore_seed(&self, format: &str) {
        if let Some(seed) = self.encryption_seed.filter(|&s| s != 0) {
            log::warn!("{} is never encrypted; ignoring seed 0x{:08x}", format, seed);
        }
    }
}

/// Resolves an optional seed, picking a random one if needed.
pub(crate) fn seed_or_random(format: &str, seed: Option<u32>) -> u32 {
    seed.unwrap_or_else(|| {
        let seed = crate::crypto::random_seed();
        log::warn!("{}: no encryption seed given, using 0x{:08x}", format, seed);
        seed
    })
}

/// Checks the magic header at the start of `data`, returning the version.
pub(crate) fn check_magic(
    data: &[u8],
    format: &'static str,
    magic: Magic,
    versions: &[u32],
) -> Result<u32> {
    let header = input::parse_type::<MagicHeader>(data, 0)?;
    let found = header.magic.get();
    if found != magic as u32 {
        return Err(Error::FormatMismatch { format, found });
    }
    let version = header.version.get();
    if !versions.contains(&version) {
        return Err(Error::UnsupportedVersion { format, version });
    }
    Ok(version)
}

/// Converts a duration to the float seconds files store.
pub fn seconds(d: Duration) -> f32 {
    d.as_secs_f32()
}

/// Replaces negative values, which some slicers use for "unset."
pub(crate) fn or_default(x: f32, default: f32) -> f32 {
    if x < 0. {
        default
    } else {
        x
    }
}

/// Estimates resin use, in ml, from the total lit pixel count across all
/// layers.
pub fn resin_volume_ml(bits_on: u64, size: &Size) -> f32 {
    let pixels = size.pixels();
    if pixels == 0 {
        return 0.;
    }
    let bed_area = f64::from(size.bed_mm[0]) * f64::from(size.bed_mm[1]);
    let pixel_volume =
        f64::from(size.layer_height_mm) * bed_area / pixels as f64;
    (bits_on as f64 * pixel_volume / 1000.) as f32
}

/// Fills in the exposure fields that ChiTu headers don't record.
pub(crate) fn motion_defaults(exposure: &mut Exposure) {
    exposure.lift_height_mm = DEFAULT_LIFT_HEIGHT_MM;
    exposure.lift_speed_mmpm = DEFAULT_LIFT_SPEED_MMPM;
    exposure.retract_speed_mmpm = DEFAULT_RETRACT_SPEED_MMPM;
    exposure.retract_height_mm = DEFAULT_RETRACT_HEIGHT_MM;
}

/// Converts a PWM field (stored as a `u16`, or even a float) to a level,
/// treating zero as "full power."
pub(crate) fn pwm_level(raw: f32) -> u8 {
    if raw <= 0. || raw.is_nan() {
        255
    } else {
        raw.min(255.) as u8
    }
}

////////////////////////////////////////////////////////////////////////////////
// Previews (ChiTu formats)

/// An RLE15-encoded preview image, ready to be placed.
#[derive(Clone, Debug)]
pub(crate) struct PreviewBlock {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PreviewBlock {
    /// Encodes the `kind` preview from `properties`, if there is one.
    pub fn encode(
        properties: &Properties,
        kind: PreviewKind,
        max_run: usize,
    ) -> Option<Self> {
        let image = properties.previews.get(&kind)?;
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        Some(Self {
            width: image.width(),
            height: image.height(),
            data: codec::encode_preview(image, max_run),
        })
    }

    /// Bytes occupied by the header and data together.
    pub fn span(&self) -> u32 {
        (size_of::<PreviewHeader>() + self.data.len()) as u32
    }

    /// Writes the header at `offset`, immediately followed by the data.
    pub fn put(self, file: &mut FileImage, offset: u32) {
        let data_offset = offset + size_of::<PreviewHeader>() as u32;
        let header = PreviewHeader {
            size: [U32LE::new(self.width), U32LE::new(self.height)],
            data_offset: U32LE::new(data_offset),
            data_len: U32LE::new(self.data.len() as u32),
            ..PreviewHeader::default()
        };
        file.put(offset, header.as_bytes());
        file.put(data_offset, self.data);
    }
}

/// Works out where a preview goes if placed at `base`. Returns the header
/// offset (zero if there's no preview) and the next free offset.
pub(crate) fn place_preview(
    preview: &Option<PreviewBlock>,
    base: u32,
    aligned: bool,
) -> (u32, u32) {
    match preview {
        None => (0, base),
        Some(p) => {
            let end = base + p.span();
            (base, if aligned { output::align4(end) } else { end })
        }
    }
}

/// Reads both previews into `properties`.
pub(crate) fn read_previews(
    data: &[u8],
    huge_offset: u32,
    tiny_offset: u32,
    properties: &mut Properties,
) -> Result<()> {
    for &(kind, offset) in
        &[(PreviewKind::Huge, huge_offset), (PreviewKind::Tiny, tiny_offset)]
    {
        if let Some(image) = input::parse_preview(data, offset, kind)? {
            properties.previews.insert(kind, image);
        }
    }
    Ok(())
}

/// Nearest-neighbour rescale, for formats with fixed preview sizes.
pub(crate) fn rescale_preview(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() != (width, height) {
        log::warn!(
            "rescaling {}x{} preview to {}x{}",
            image.width(),
            image.height(),
            width,
            height
        );
    }
    image::imageops::resize(image, width, height, image::imageops::FilterType::Nearest)
}

////////////////////////////////////////////////////////////////////////////////
// Layer tables (ChiTu formats)

/// A layer after compression, waiting for its payloads to be placed.
#[derive(Clone, Debug)]
pub(crate) struct EncodedLayer {
    pub z_mm: f32,
    pub exposure: Exposure,
    pub slice: EncodedSlice,
}

/// Compresses every layer of `printable` with `codec`, in parallel.
pub(crate) fn compress_layers(
    printable: &dyn Printable,
    codec: &SliceCodec,
) -> Result<Vec<EncodedLayer>> {
    output::encode_layers(printable, |index, layer| EncodedLayer {
        z_mm: layer.z_mm,
        exposure: layer.exposure,
        slice: codec.encode(&layer.mask, index),
    })
}

/// Bytes occupied by a layer table with `entries` entries.
pub(crate) fn layer_table_size(entries: usize) -> u32 {
    (size_of::<LayerHeader>() * entries) as u32
}

/// Places the payloads of `layers` and writes the layer table describing them
/// at `table_offset`. Returns the total lit pixel count.
///
/// Bit-plane files store plane `k` of layer `n` at table index `n + k * N`.
/// With `with_info`, each payload is preceded by an `ImageInfo` record
/// carrying the motion settings of the first layer to use it. Identical
/// payloads are stored once either way.
pub(crate) fn place_layers(
    file: &mut FileImage,
    table_offset: u32,
    layers: Vec<EncodedLayer>,
    with_info: bool,
) -> Result<u64> {
    let count = layers.len();
    let info_size = size_of::<ImageInfo>() as u32;
    let mut bits_on = 0;

    for (n, layer) in layers.into_iter().enumerate() {
        bits_on += layer.slice.bits_on;
        let exposure = layer.exposure;
        for (k, payload) in layer.slice.payloads.into_iter().enumerate() {
            let mut entry = LayerHeader {
                z: F32LE::new(layer.z_mm),
                exposure_s: F32LE::new(seconds(exposure.light_on)),
                light_off_time_s: F32LE::new(seconds(exposure.light_off)),
                data_len: U32LE::new(payload.len() as u32),
                ..LayerHeader::default()
            };

            if with_info {
                entry.info_size = U32LE::new(info_size);
                let total_size = info_size + payload.len() as u32;
                let (offset, placed) =
                    file.alloc_prefixed(CompressedBlock::new(payload), info_size)?;
                entry.data_offset = U32LE::new(offset);
                if placed {
                    // Layers sharing this payload also share the info record
                    // of the first of them.
                    let info = ImageInfo {
                        layer: entry.clone(),
                        total_size: U32LE::new(total_size),
                        lift_height_mm: F32LE::new(exposure.lift_height_mm),
                        lift_speed_mmpm: F32LE::new(exposure.lift_speed_mmpm),
                        retract_speed_mmpm: F32LE::new(exposure.retract_speed_mmpm),
                        light_pwm: F32LE::new(f32::from(exposure.light_pwm)),
                        ..ImageInfo::default()
                    };
                    file.put(offset - info_size, info.as_bytes());
                }
            } else {
                let offset = file.alloc(CompressedBlock::new(payload))?;
                entry.data_offset = U32LE::new(offset);
            }

            let index = n + k * count;
            file.put(
                table_offset + layer_table_size(index),
                entry.as_bytes(),
            );
        }
    }
    Ok(bits_on)
}

/// Reads a layer table into `LayerRecord`s.
///
/// `planes` is the number of table entries per layer (see `place_layers`).
/// Exposure starts from `Properties::layer_exposure` and takes any overrides
/// found in the table and in `ImageInfo` records.
pub(crate) fn read_layers(
    data: &[u8],
    table_offset: u32,
    layer_count: u32,
    planes: u32,
    properties: &Properties,
) -> Result<Vec<LayerRecord>> {
    let total = layer_count
        .checked_mul(planes)
        .ok_or_else(|| Error::invalid("layer table too large"))?;
    let table = input::parse_slice::<LayerHeader>(data, table_offset, total)?;
    let info_size = size_of::<ImageInfo>() as u32;

    (0..layer_count)
        .map(|n| {
            let entry = &table[n as usize];
            let mut exposure = properties.layer_exposure(n);
            if entry.exposure_s.get() > 0. {
                exposure.light_on = crate::model::secs(entry.exposure_s.get());
            }
            if entry.light_off_time_s.get() > 0. {
                exposure.light_off =
                    crate::model::secs(entry.light_off_time_s.get());
            }

            let declared = entry.info_size.get();
            let data_offset = entry.data_offset.get();
            if declared >= info_size && data_offset >= declared {
                let info = input::parse_type_prefix::<ImageInfo>(
                    data,
                    data_offset - declared,
                    declared,
                )?;
                exposure.lift_height_mm = info.lift_height_mm.get();
                exposure.lift_speed_mmpm = info.lift_speed_mmpm.get();
                exposure.retract_speed_mmpm = info.retract_speed_mmpm.get();
                exposure.light_pwm = pwm_level(info.light_pwm.get());
            }

            let payloads = (0..planes)
                .map(|k| {
                    let e = &table[(n + k * layer_count) as usize];
                    input::payload_range(data, e.data_offset.get(), e.data_len.get())
                })
                .collect::<Result<_>>()?;

            Ok(LayerRecord {
                z_mm: entry.z.get(),
                exposure,
                payloads,
            })
        })
        .collect()
}
