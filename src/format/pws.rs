//! Anycubic PWS and PW0 files.
//!
//! Anycubic's container is unrelated to ChiTu's. A fixed "file mark" at
//! offset zero points at four sections (header, preview, layer table, layer
//! data), each of which but the last starts with a 12-byte name and a length.
//! The preview is uncompressed RGB565 at a fixed size, and nothing is
//! scrambled.
//!
//! The two variants differ only in layer encoding: `pws` concatenates RLE1 bit
//! planes, `pw0` uses RLE4 with a checksum.

use std::io::Write;
use std::mem::size_of;

use image::{Rgb, RgbImage};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use super::{Format, Kind, Options, ANYCUBIC_MARK};
use crate::codec::{SliceCodec, SliceEncoding};
use crate::error::{Error, Payload, Result};
use crate::input::{self, LayerRecord, Slices};
use crate::model::{secs, Printable, Properties};
use crate::output::{CompressedBlock, FileImage};
use crate::rle::RleError;
use crate::{PreviewKind, F32LE, U32LE};

/// Fixed preview size, in pixels.
pub const PREVIEW_SIZE: [u32; 2] = [224, 168];
const PREVIEW_DPI: u32 = 42;

const FILE_VERSION: u32 = 1;
const SECTION_COUNT: u32 = 4;

const HEADER_MARK: &[u8] = b"HEADER";
const PREVIEW_MARK: &[u8] = b"PREVIEW";
const LAYER_DEF_MARK: &[u8] = b"LAYERDEF";

const ANTI_ALIAS_LEVELS: &[u32] = &[1, 2, 4, 8];

#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct FileMark {
    /// `ANYCUBIC`, NUL padded.
    pub mark: [u8; 12],
    pub version: U32LE,
    pub section_count: U32LE,
    pub header_offset: U32LE,
    pub _reserved0: U32LE,
    pub preview_offset: U32LE,
    pub _reserved1: U32LE,
    pub layer_def_offset: U32LE,
    pub _reserved2: U32LE,
    pub layer_data_offset: U32LE,
}

/// Introduces every section but the layer data.
#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Section {
    pub mark: [u8; 12],
    /// Length of the section contents, not counting this record.
    pub length: U32LE,
}

#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct PwsHeader {
    /// Size of one pixel, in microns.
    pub pixel_size_um: F32LE,
    pub layer_height_mm: F32LE,
    pub exposure_s: F32LE,
    pub light_off_time_s: F32LE,
    pub bot_exposure_s: F32LE,
    /// Bottom layer count, oddly stored as a float.
    pub bot_layer_count: F32LE,
    pub lift_dist_mm: F32LE,
    pub lift_speed_mmps: F32LE,
    pub retract_speed_mmps: F32LE,
    pub print_volume_ml: F32LE,
    pub antialias_level: U32LE,
    pub resolution: [U32LE; 2],
    pub print_mass_g: F32LE,
    pub print_price: F32LE,
    pub resin_type: U32LE,
    /// Nonzero if the layer table's motion settings override the header's.
    pub per_layer_override: U32LE,
    pub _reserved: [U32LE; 3],
}

#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct PreviewInfo {
    pub width: U32LE,
    pub resolution_dpi: U32LE,
    pub height: U32LE,
}

#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct PwsLayer {
    pub data_offset: U32LE,
    pub data_len: U32LE,
    pub lift_dist_mm: F32LE,
    pub lift_speed_mmps: F32LE,
    pub exposure_s: F32LE,
    /// Thickness of this layer.
    pub layer_height_mm: F32LE,
    pub _reserved: [U32LE; 2],
}

fn mark(name: &[u8]) -> [u8; 12] {
    let mut mark = [0; 12];
    mark[..name.len()].copy_from_slice(name);
    mark
}

/// Finds the section named `name` at `offset`, returning the offset and
/// length of its contents.
fn section(
    data: &[u8],
    offset: u32,
    name: &[u8],
    format: &'static str,
) -> Result<(u32, u32)> {
    let section = input::parse_type::<Section>(data, offset)?;
    if section.mark != mark(name) {
        let mut found = [0; 4];
        found.copy_from_slice(&section.mark[..4]);
        return Err(Error::FormatMismatch {
            format,
            found: u32::from_le_bytes(found),
        });
    }
    let body = offset + size_of::<Section>() as u32;
    let len = section.length.get();
    input::parse_bytes(data, body, len)?;
    Ok((body, len))
}

/// Serializes a section: the `Section` record followed by `parts`.
fn write_section(name: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let length: usize = parts.iter().map(|p| p.len()).sum();
    let section = Section {
        mark: mark(name),
        length: U32LE::new(length as u32),
    };
    let mut out = section.as_bytes().to_vec();
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

fn encode_rgb565(image: &RgbImage) -> Vec<u8> {
    image
        .pixels()
        .flat_map(|p| {
            let v = u16::from(p[0] >> 3) << 11
                | u16::from(p[1] >> 2) << 5
                | u16::from(p[2] >> 3);
            v.to_le_bytes().to_vec()
        })
        .collect()
}

fn decode_rgb565(width: u32, height: u32, data: &[u8]) -> Result<RgbImage, RleError> {
    let expected = width as usize * height as usize * 2;
    if data.len() < expected {
        return Err(RleError::TooFewPixels);
    }
    if data.len() > expected {
        return Err(RleError::ExtraData);
    }
    let mut image = RgbImage::new(width, height);
    for (pixel, bytes) in image.pixels_mut().zip(data.chunks_exact(2)) {
        let v = u16::from_le_bytes([bytes[0], bytes[1]]);
        let r = (v >> 11) as u8 & 0x1f;
        let g = (v >> 5) as u8 & 0x3f;
        let b = v as u8 & 0x1f;
        *pixel = Rgb([r << 3 | r & 7, g << 2 | g & 3, b << 3 | b & 7]);
    }
    Ok(image)
}

/// Anycubic format, in either variant.
#[derive(Clone, Debug)]
pub struct Pws {
    name: &'static str,
    levels: u32,
}

impl Pws {
    /// Configures a writer for `kind`, which must be `Pws` or `Pw0`.
    pub fn new(kind: Kind, options: &Options) -> Result<Self> {
        let (name, levels): (_, &[u32]) = if kind == Kind::Pw0 {
            ("pw0", &[1])
        } else {
            ("pws", ANTI_ALIAS_LEVELS)
        };
        options.version(name, &[FILE_VERSION])?;
        let levels = options.anti_alias(name, levels)?;
        options.ignore_seed(name);
        Ok(Self { name, levels })
    }

    fn encoding(&self, levels: u32) -> SliceEncoding {
        if self.name == "pw0" {
            SliceEncoding::Rle4
        } else {
            SliceEncoding::Rle1 { levels }
        }
    }
}

impl Format for Pws {
    fn name(&self) -> &'static str {
        self.name
    }

    fn header_size(&self) -> usize {
        size_of::<FileMark>()
    }

    fn decode(&self, data: Vec<u8>) -> Result<Box<dyn Printable>> {
        let filemark = input::parse_type::<FileMark>(&data, 0)?;
        if filemark.mark != mark(ANYCUBIC_MARK) {
            let mut found = [0; 4];
            found.copy_from_slice(&filemark.mark[..4]);
            return Err(Error::FormatMismatch {
                format: self.name,
                found: u32::from_le_bytes(found),
            });
        }
        let version = filemark.version.get();
        if version != FILE_VERSION {
            return Err(Error::UnsupportedVersion {
                format: self.name,
                version,
            });
        }

        let (offset, len) =
            section(&data, filemark.header_offset.get(), HEADER_MARK, self.name)?;
        let header = input::parse_type_prefix::<PwsHeader>(&data, offset, len)?;

        let levels = header.antialias_level.get().max(1);
        if !ANTI_ALIAS_LEVELS.contains(&levels) {
            return Err(Error::invalid(format!(
                "{}: unsupported antialias level {}",
                self.name, levels
            )));
        }

        let mut properties = Properties::default();
        let size = &mut properties.size;
        size.resolution = [header.resolution[0].get(), header.resolution[1].get()];
        let pixel_mm = header.pixel_size_um.get() / 1000.;
        size.bed_mm = [
            size.resolution[0] as f32 * pixel_mm,
            size.resolution[1] as f32 * pixel_mm,
        ];
        size.layer_height_mm = header.layer_height_mm.get();

        let exposure = &mut properties.exposure;
        exposure.light_on = secs(header.exposure_s.get());
        exposure.light_off = secs(header.light_off_time_s.get());
        exposure.lift_height_mm = header.lift_dist_mm.get();
        exposure.lift_speed_mmpm = header.lift_speed_mmps.get() * 60.;
        exposure.retract_height_mm = super::DEFAULT_RETRACT_HEIGHT_MM;
        exposure.retract_speed_mmpm = header.retract_speed_mmps.get() * 60.;

        properties.bottom.count = header.bot_layer_count.get().max(0.) as u32;
        properties.bottom.exposure = crate::Exposure {
            light_on: secs(header.bot_exposure_s.get()),
            ..properties.exposure
        };

        let (offset, len) =
            section(&data, filemark.preview_offset.get(), PREVIEW_MARK, self.name)?;
        let info = input::parse_type_prefix::<PreviewInfo>(&data, offset, len)?;
        let (width, height) = (info.width.get(), info.height.get());
        if width != 0 && height != 0 {
            let info_len = size_of::<PreviewInfo>() as u32;
            let pixels = input::parse_bytes(&data, offset + info_len, len - info_len)?;
            let image = decode_rgb565(width, height, pixels).map_err(|source| {
                Error::CorruptPayload {
                    payload: Payload::Preview(PreviewKind::Tiny),
                    source,
                }
            })?;
            properties.previews.insert(PreviewKind::Tiny, image);
        }

        let (offset, len) = section(
            &data,
            filemark.layer_def_offset.get(),
            LAYER_DEF_MARK,
            self.name,
        )?;
        let count = input::parse_type_prefix::<U32LE>(&data, offset, len)?.get();
        let table = input::parse_slice::<PwsLayer>(&data, offset + 4, count)?;

        let per_layer = header.per_layer_override.get() != 0;
        let mut z_mm = 0.;
        let layers = table
            .iter()
            .enumerate()
            .map(|(n, entry)| {
                let mut exposure = properties.layer_exposure(n as u32);
                if per_layer {
                    exposure.light_on = secs(entry.exposure_s.get());
                    exposure.lift_height_mm = entry.lift_dist_mm.get();
                    exposure.lift_speed_mmpm = entry.lift_speed_mmps.get() * 60.;
                }
                z_mm += entry.layer_height_mm.get();
                Ok(LayerRecord {
                    z_mm,
                    exposure,
                    payloads: vec![input::payload_range(
                        &data,
                        entry.data_offset.get(),
                        entry.data_len.get(),
                    )?],
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "{}: {} layers, {}x{}, antialias {}",
            self.name,
            layers.len(),
            properties.size.resolution[0],
            properties.size.resolution[1],
            levels
        );
        let codec = SliceCodec::new(self.encoding(levels), None);
        Ok(Box::new(Slices::new(data, properties, layers, codec)))
    }

    fn encode(&self, printable: &dyn Printable, sink: &mut dyn Write) -> Result<()> {
        let properties = printable.properties();
        let size = &properties.size;
        let exposure = &properties.exposure;
        let bottom = &properties.bottom;

        let codec = SliceCodec::new(self.encoding(self.levels), None);
        let layers = super::compress_layers(printable, &codec)?;

        if bottom.exposure.light_off != exposure.light_off
            || bottom.exposure.lift_height_mm != exposure.lift_height_mm
        {
            log::warn!("{}: bottom layers will use the normal motion settings", self.name);
        }

        let preview = properties
            .previews
            .get(&PreviewKind::Tiny)
            .or_else(|| properties.previews.get(&PreviewKind::Huge))
            .map(|image| super::rescale_preview(image, PREVIEW_SIZE[0], PREVIEW_SIZE[1]));
        let (preview_info, preview_data) = match &preview {
            Some(image) => (
                PreviewInfo {
                    width: U32LE::new(image.width()),
                    resolution_dpi: U32LE::new(PREVIEW_DPI),
                    height: U32LE::new(image.height()),
                },
                encode_rgb565(image),
            ),
            None => (PreviewInfo::default(), vec![]),
        };

        let header_offset = size_of::<FileMark>() as u32;
        let preview_offset =
            header_offset + (size_of::<Section>() + size_of::<PwsHeader>()) as u32;
        let preview_section =
            write_section(PREVIEW_MARK, &[preview_info.as_bytes(), &preview_data]);
        let layer_def_offset = preview_offset + preview_section.len() as u32;
        let table_len = 4 + size_of::<PwsLayer>() * layers.len();
        let layer_data_offset =
            layer_def_offset + (size_of::<Section>() + table_len) as u32;

        let mut file = FileImage::new(layer_data_offset, false);
        let mut table = Vec::with_capacity(layers.len());
        let mut bits_on = 0;
        let mut prev_z = 0.;
        for layer in layers {
            let thickness = if layer.z_mm > prev_z {
                layer.z_mm - prev_z
            } else {
                size.layer_height_mm
            };
            prev_z = layer.z_mm;
            bits_on += layer.slice.bits_on;

            let mut payloads = layer.slice.payloads;
            let payload = payloads.pop().unwrap_or_default();
            let len = payload.len() as u32;
            let offset = file.alloc(CompressedBlock::new(payload))?;
            table.push(PwsLayer {
                data_offset: U32LE::new(offset),
                data_len: U32LE::new(len),
                lift_dist_mm: F32LE::new(layer.exposure.lift_height_mm),
                lift_speed_mmps: F32LE::new(layer.exposure.lift_speed_mmpm / 60.),
                exposure_s: F32LE::new(super::seconds(layer.exposure.light_on)),
                layer_height_mm: F32LE::new(thickness),
                ..PwsLayer::default()
            });
        }

        let pixel_size_um = if size.resolution[0] == 0 {
            0.
        } else {
            size.bed_mm[0] / size.resolution[0] as f32 * 1000.
        };
        let header = PwsHeader {
            pixel_size_um: F32LE::new(pixel_size_um),
            layer_height_mm: F32LE::new(size.layer_height_mm),
            exposure_s: F32LE::new(super::seconds(exposure.light_on)),
            light_off_time_s: F32LE::new(super::seconds(exposure.light_off)),
            bot_exposure_s: F32LE::new(super::seconds(bottom.exposure.light_on)),
            bot_layer_count: F32LE::new(bottom.count as f32),
            lift_dist_mm: F32LE::new(exposure.lift_height_mm),
            lift_speed_mmps: F32LE::new(exposure.lift_speed_mmpm / 60.),
            retract_speed_mmps: F32LE::new(exposure.retract_speed_mmpm / 60.),
            print_volume_ml: F32LE::new(super::resin_volume_ml(bits_on, size)),
            antialias_level: U32LE::new(self.levels),
            resolution: [U32LE::new(size.resolution[0]), U32LE::new(size.resolution[1])],
            per_layer_override: U32LE::new(1),
            ..PwsHeader::default()
        };
        let filemark = FileMark {
            mark: mark(ANYCUBIC_MARK),
            version: U32LE::new(FILE_VERSION),
            section_count: U32LE::new(SECTION_COUNT),
            header_offset: U32LE::new(header_offset),
            preview_offset: U32LE::new(preview_offset),
            layer_def_offset: U32LE::new(layer_def_offset),
            layer_data_offset: U32LE::new(layer_data_offset),
            ..FileMark::default()
        };

        let count = U32LE::new(table.len() as u32);
        let mut table_bytes = count.as_bytes().to_vec();
        for entry in &table {
            table_bytes.extend_from_slice(entry.as_bytes());
        }

        file.put(0, filemark.as_bytes());
        file.put(header_offset, write_section(HEADER_MARK, &[header.as_bytes()]));
        file.put(preview_offset, preview_section);
        file.put(layer_def_offset, write_section(LAYER_DEF_MARK, &[&table_bytes]));

        let hits = file.dedup_hits();
        let written = file.finish(sink)?;
        log::info!(
            "{}: wrote {} layers in {} bytes ({} deduplicated)",
            self.name,
            table.len(),
            written,
            hits
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bottom, Exposure, Print, Size};
    use image::{GrayImage, Luma};

    #[test]
    fn record_sizes() {
        assert_eq!(size_of::<FileMark>(), 48);
        assert_eq!(size_of::<Section>(), 16);
        assert_eq!(size_of::<PwsHeader>(), 80);
        assert_eq!(size_of::<PwsLayer>(), 32);
    }

    #[test]
    fn rgb565() {
        let image = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => Rgb([0xff, 0xff, 0xff]),
            1 => Rgb([0xff, 0, 0]),
            _ => Rgb([0, 0x0c, 0]),
        });
        let data = encode_rgb565(&image);
        assert_eq!(data, &[0xff, 0xff, 0x00, 0xf8, 0x60, 0x00]);
        let back = decode_rgb565(3, 1, &data).unwrap();
        assert_eq!(back.get_pixel(0, 0), &Rgb([0xff, 0xff, 0xff]));
        assert_eq!(back.get_pixel(1, 0), &Rgb([0xff, 0, 0]));
        assert_eq!(back.get_pixel(2, 0), &Rgb([0, 0x0f, 0]));
        assert_eq!(decode_rgb565(3, 1, &data[..4]), Err(RleError::TooFewPixels));
    }

    fn sample() -> Print {
        let exposure = Exposure {
            light_on: secs(3.),
            light_off: secs(1.),
            light_pwm: 255,
            lift_height_mm: 6.,
            lift_speed_mmpm: 120.,
            retract_height_mm: super::super::DEFAULT_RETRACT_HEIGHT_MM,
            retract_speed_mmpm: 180.,
        };
        let mut properties = Properties {
            size: Size {
                resolution: [20, 8],
                bed_mm: [10., 4.],
                layers: 3,
                layer_height_mm: 0.05,
            },
            exposure,
            bottom: Bottom {
                exposure: Exposure {
                    light_on: secs(35.),
                    ..exposure
                },
                count: 1,
                ..Bottom::default()
            },
            ..Properties::default()
        };
        properties
            .previews
            .insert(PreviewKind::Tiny, RgbImage::from_pixel(112, 84, Rgb([0xff, 0, 0])));
        let mut print = Print::empty(properties);
        for (i, layer) in print.layers_mut().iter_mut().enumerate() {
            layer.mask = GrayImage::from_fn(20, 8, |x, _| {
                Luma([if x < 10 { 0 } else { (i as u8 + 1) * 0x55 }])
            });
        }
        print
    }

    #[test]
    fn pws_round_trip() {
        let print = sample();
        let pws = Pws::new(
            Kind::Pws,
            &Options {
                anti_alias: Some(4),
                ..Options::default()
            },
        )
        .unwrap();
        let mut out = vec![];
        pws.encode(&print, &mut out).unwrap();
        assert_eq!(&out[..8], ANYCUBIC_MARK);
        assert_eq!(Kind::detect(&out), Some(Kind::Pws));

        let decoded = pws.decode(out).unwrap();
        let props = decoded.properties();
        assert_eq!(props.size.resolution, [20, 8]);
        assert_eq!(props.size.layers, 3);
        assert!((props.size.bed_mm[0] - 10.).abs() < 1e-3);
        assert_eq!(props.exposure, print.properties().exposure);
        assert_eq!(props.bottom, print.properties().bottom);

        let preview = &props.previews[&PreviewKind::Tiny];
        assert_eq!(preview.dimensions(), (224, 168));
        assert_eq!(preview.get_pixel(100, 100), &Rgb([0xff, 0, 0]));

        // Four levels: 0x55 and 0xaa land on 63 and 127, 0xff stays 255.
        let expected = [63, 127, 255];
        for i in 0..3 {
            let layer = decoded.layer(i).unwrap();
            assert_eq!(layer.mask.get_pixel(0, 0)[0], 0);
            assert_eq!(layer.mask.get_pixel(19, 7)[0], expected[i as usize]);
            assert!((layer.z_mm - 0.05 * (i + 1) as f32).abs() < 1e-4);
        }
        assert_eq!(
            decoded.layer(0).unwrap().exposure.light_on,
            std::time::Duration::from_secs(35)
        );
    }

    #[test]
    fn pw0_round_trip() {
        let mut print = sample();
        print.layers_mut()[2].mask = GrayImage::from_pixel(20, 8, Luma([0x3c]));
        let pw0 = Pws::new(Kind::Pw0, &Options::default()).unwrap();
        let mut out = vec![];
        pw0.encode(&print, &mut out).unwrap();
        let decoded = pw0.decode(out).unwrap();
        // Nibble quantization: 0x3c keeps its high nibble, replicated.
        assert!(decoded.layer(2).unwrap().mask.pixels().all(|p| p[0] == 0x33));
        assert_eq!(decoded.layer(1).unwrap().mask.get_pixel(15, 0)[0], 0xaa);
    }

    #[test]
    fn pw0_is_monochrome_only() {
        let options = Options {
            anti_alias: Some(2),
            ..Options::default()
        };
        assert!(Pws::new(Kind::Pw0, &options).is_err());
        assert!(Pws::new(Kind::Pws, &options).is_ok());
    }

    #[test]
    fn bad_section_mark() {
        let print = sample();
        let pws = Pws::new(Kind::Pws, &Options::default()).unwrap();
        let mut out = vec![];
        pws.encode(&print, &mut out).unwrap();
        out[48] = b'X';
        assert!(matches!(
            pws.decode(out),
            Err(Error::FormatMismatch { format: "pws", .. })
        ));
    }
}
