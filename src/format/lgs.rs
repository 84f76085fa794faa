//! Longer `lgs` files, for the Orange 10 and Orange 30.
//!
//! These have the simplest layout of the lot: a fixed header, one raw RGB15
//! preview, and then each layer as a length-prefixed RLE4n payload, in order.
//! Since nothing refers to a layer by offset, identical layers can't share
//! storage, and a reader has to walk every record to find the last one.
//!
//! Most of the header is constants whose meaning nobody has worked out. We
//! write the values the vendor's slicer writes and ignore them on read.

use std::io::Write;
use std::mem::size_of;

use image::{Rgb, RgbImage};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use super::{Format, Kind, Options};
use crate::codec::{self, SliceCodec, SliceEncoding};
use crate::error::{Error, Payload, Result};
use crate::input::{self, LayerRecord, Slices};
use crate::model::{secs, Exposure, Printable, Properties};
use crate::rle;
use crate::{PreviewKind, F32LE, U32LE};

/// Mark at the start of every `lgs` file.
pub const MARK: &[u8; 8] = b"Longer3D";

const FILE_VERSION: u32 = 1;

#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct LgsHeader {
    /// `Longer3D`.
    pub mark: [u8; 8],
    /// Always `0xff000001`.
    pub _unknown_08: U32LE,
    /// Always 1.
    pub version: U32LE,
    /// 10 for the Orange 10, 30 for the Orange 30.
    pub model: U32LE,
    pub _unknown_14: U32LE,
    /// Always 34.
    pub _unknown_18: U32LE,
    pub pixels_per_mm_y: F32LE,
    pub pixels_per_mm_x: F32LE,
    /// Resolution, stored as floats for some reason.
    pub resolution_y: F32LE,
    pub resolution_x: F32LE,
    pub layer_height_mm: F32LE,
    pub exposure_ms: F32LE,
    pub bot_exposure_ms: F32LE,
    /// Always 10.
    pub _unknown_38: F32LE,
    pub light_off_time_ms: F32LE,
    pub bot_light_off_time_ms: F32LE,
    /// Thickness of the bottom layers taken together.
    pub bot_height_mm: F32LE,
    /// Always 0.6.
    pub _unknown_48: F32LE,
    pub bot_lift_height_mm: F32LE,
    pub lift_height_mm: F32LE,
    pub lift_speed_mmpm: F32LE,
    /// Copy of `lift_speed_mmpm`.
    pub lift_speed_mmpm_again: F32LE,
    pub bot_lift_speed_mmpm: F32LE,
    pub bot_lift_speed_mmpm_again: F32LE,
    /// See `UNKNOWN_64`.
    pub _unknown_64: [F32LE; 12],
    /// Height of the build volume.
    pub machine_z_mm: F32LE,
    pub _unknown_98: [U32LE; 3],
    pub layer_count: U32LE,
    /// Always 4.
    pub _unknown_a8: U32LE,
    pub preview_size: [U32LE; 2],
}

/// What the vendor's slicer writes at 0x64.
const UNKNOWN_64: [f32; 12] = [
    5., 60., 10., 600., 600., 2., 0.2, 60., 1., 6., 150., 1001.,
];

/// Tells the two printers apart by the model number in the header.
pub(crate) fn detect(data: &[u8]) -> Kind {
    match input::parse_type::<LgsHeader>(data, 0) {
        Ok(header) if header.model.get() == 30 => Kind::Lgs30,
        _ => Kind::Lgs,
    }
}

/// Packs a preview as big-endian RGB15.
fn encode_rgb15(image: &RgbImage) -> Vec<u8> {
    image
        .pixels()
        .flat_map(|p| rle::pack_rgb15((p[0], p[1], p[2])).to_be_bytes().to_vec())
        .collect()
}

fn decode_rgb15(width: u32, height: u32, data: &[u8]) -> RgbImage {
    let mut image = RgbImage::new(width, height);
    for (pixel, bytes) in image.pixels_mut().zip(data.chunks_exact(2)) {
        let (r, g, b) = rle::unpack_rgb15(u16::from_be_bytes([bytes[0], bytes[1]]));
        *pixel = Rgb([r, g, b]);
    }
    image
}

/// Longer format, for either printer.
#[derive(Clone, Debug)]
pub struct Lgs {
    name: &'static str,
    model: u32,
    machine_z_mm: f32,
}

impl Lgs {
    /// Configures a writer for `kind`, which must be `Lgs` or `Lgs30`.
    pub fn new(kind: Kind, options: &Options) -> Result<Self> {
        let (name, model, machine_z_mm) = if kind == Kind::Lgs30 {
            ("lgs30", 30, 170.)
        } else {
            ("lgs", 10, 140.)
        };
        options.version(name, &[FILE_VERSION])?;
        options.ignore_anti_alias(name);
        options.ignore_seed(name);
        Ok(Self {
            name,
            model,
            machine_z_mm,
        })
    }
}

impl Format for Lgs {
    fn name(&self) -> &'static str {
        self.name
    }

    fn header_size(&self) -> usize {
        size_of::<LgsHeader>()
    }

    fn decode(&self, data: Vec<u8>) -> Result<Box<dyn Printable>> {
        let header = input::parse_type::<LgsHeader>(&data, 0)?;
        if &header.mark != MARK {
            let mut found = [0; 4];
            found.copy_from_slice(&header.mark[..4]);
            return Err(Error::FormatMismatch {
                format: self.name,
                found: u32::from_le_bytes(found),
            });
        }
        if header.model.get() != self.model {
            log::debug!(
                "{}: file is for model {}, not {}",
                self.name,
                header.model.get(),
                self.model
            );
        }

        let mut properties = Properties::default();
        let size = &mut properties.size;
        size.resolution = [
            header.resolution_x.get() as u32,
            header.resolution_y.get() as u32,
        ];
        let mm = |pixels: u32, per_mm: f32| {
            if per_mm > 0. {
                pixels as f32 / per_mm
            } else {
                0.
            }
        };
        size.bed_mm = [
            mm(size.resolution[0], header.pixels_per_mm_x.get()),
            mm(size.resolution[1], header.pixels_per_mm_y.get()),
        ];
        size.layer_height_mm = header.layer_height_mm.get();

        let exposure = Exposure {
            light_on: secs(header.exposure_ms.get() / 1000.),
            light_off: secs(header.light_off_time_ms.get() / 1000.),
            light_pwm: 255,
            lift_height_mm: header.lift_height_mm.get(),
            lift_speed_mmpm: header.lift_speed_mmpm.get(),
            retract_height_mm: super::DEFAULT_RETRACT_HEIGHT_MM,
            retract_speed_mmpm: super::DEFAULT_RETRACT_SPEED_MMPM,
        };
        properties.exposure = exposure;
        properties.bottom.exposure = Exposure {
            light_on: secs(header.bot_exposure_ms.get() / 1000.),
            light_off: secs(header.bot_light_off_time_ms.get() / 1000.),
            lift_height_mm: header.bot_lift_height_mm.get(),
            lift_speed_mmpm: header.bot_lift_speed_mmpm.get(),
            ..exposure
        };
        let layer_height = properties.size.layer_height_mm;
        if layer_height > 0. {
            let count = header.bot_height_mm.get() / layer_height;
            properties.bottom.count = count.round().max(0.) as u32;
        }

        let mut offset = size_of::<LgsHeader>() as u32;
        let (width, height) = (header.preview_size[0].get(), header.preview_size[1].get());
        if width != 0 && height != 0 {
            let pixels = codec::pixel_count(width, height).map_err(|source| {
                Error::CorruptPayload {
                    payload: Payload::Preview(PreviewKind::Tiny),
                    source,
                }
            })?;
            let len = pixels as u32 * 2;
            let raw = input::parse_bytes(&data, offset, len)?;
            properties
                .previews
                .insert(PreviewKind::Tiny, decode_rgb15(width, height, raw));
            offset += len;
        }

        let count = header.layer_count.get();
        let mut layers = Vec::new();
        for n in 0..count {
            let len = input::parse_type::<U32LE>(&data, offset)?.get();
            let range = input::payload_range(&data, offset + 4, len)?;
            offset = range.end as u32;
            layers.push(LayerRecord {
                z_mm: (n + 1) as f32 * properties.size.layer_height_mm,
                exposure: properties.layer_exposure(n),
                payloads: vec![range],
            });
        }
        if (offset as usize) < data.len() {
            log::warn!(
                "{}: ignoring {} bytes after the last layer",
                self.name,
                data.len() - offset as usize
            );
        }

        log::info!(
            "{}: {} layers, {}x{}",
            self.name,
            layers.len(),
            properties.size.resolution[0],
            properties.size.resolution[1]
        );
        let codec = SliceCodec::new(SliceEncoding::Rle4n, None);
        Ok(Box::new(Slices::new(data, properties, layers, codec)))
    }

    fn encode(&self, printable: &dyn Printable, sink: &mut dyn Write) -> Result<()> {
        let properties = printable.properties();
        let size = &properties.size;
        let exposure = &properties.exposure;
        let bottom = &properties.bottom;

        let codec = SliceCodec::new(SliceEncoding::Rle4n, None);
        let layers = super::compress_layers(printable, &codec)?;

        let preview = properties
            .previews
            .get(&PreviewKind::Tiny)
            .or_else(|| properties.previews.get(&PreviewKind::Huge));
        let preview_size = preview.map_or([0, 0], |image| [image.width(), image.height()]);

        let per_mm = |pixels: u32, mm: f32| if mm > 0. { pixels as f32 / mm } else { 0. };
        let ms = |d| super::seconds(d) * 1000.;
        let mut header = LgsHeader {
            mark: *MARK,
            _unknown_08: U32LE::new(0xff00_0001),
            version: U32LE::new(FILE_VERSION),
            model: U32LE::new(self.model),
            _unknown_18: U32LE::new(34),
            pixels_per_mm_y: F32LE::new(per_mm(size.resolution[1], size.bed_mm[1])),
            pixels_per_mm_x: F32LE::new(per_mm(size.resolution[0], size.bed_mm[0])),
            resolution_y: F32LE::new(size.resolution[1] as f32),
            resolution_x: F32LE::new(size.resolution[0] as f32),
            layer_height_mm: F32LE::new(size.layer_height_mm),
            exposure_ms: F32LE::new(ms(exposure.light_on)),
            bot_exposure_ms: F32LE::new(ms(bottom.exposure.light_on)),
            _unknown_38: F32LE::new(10.),
            light_off_time_ms: F32LE::new(ms(exposure.light_off)),
            bot_light_off_time_ms: F32LE::new(ms(bottom.exposure.light_off)),
            bot_height_mm: F32LE::new(bottom.count as f32 * size.layer_height_mm),
            _unknown_48: F32LE::new(0.6),
            bot_lift_height_mm: F32LE::new(bottom.exposure.lift_height_mm),
            lift_height_mm: F32LE::new(exposure.lift_height_mm),
            lift_speed_mmpm: F32LE::new(exposure.lift_speed_mmpm),
            lift_speed_mmpm_again: F32LE::new(exposure.lift_speed_mmpm),
            bot_lift_speed_mmpm: F32LE::new(bottom.exposure.lift_speed_mmpm),
            bot_lift_speed_mmpm_again: F32LE::new(bottom.exposure.lift_speed_mmpm),
            machine_z_mm: F32LE::new(self.machine_z_mm),
            layer_count: U32LE::new(layers.len() as u32),
            _unknown_a8: U32LE::new(4),
            preview_size: [U32LE::new(preview_size[0]), U32LE::new(preview_size[1])],
            ..LgsHeader::default()
        };
        for (field, &value) in header._unknown_64.iter_mut().zip(&UNKNOWN_64) {
            *field = F32LE::new(value);
        }

        sink.write_all(header.as_bytes())?;
        let mut written = size_of::<LgsHeader>();
        if let Some(image) = preview {
            let pixels = encode_rgb15(image);
            sink.write_all(&pixels)?;
            written += pixels.len();
        }
        for layer in &layers {
            for payload in &layer.slice.payloads {
                sink.write_all(&(payload.len() as u32).to_le_bytes())?;
                sink.write_all(payload)?;
                written += 4 + payload.len();
            }
        }

        log::info!(
            "{}: wrote {} layers in {} bytes",
            self.name,
            layers.len(),
            written
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bottom, Print, Size};
    use crate::rle::RleError;
    use image::{GrayImage, Luma};

    #[test]
    fn header_layout() {
        assert_eq!(size_of::<LgsHeader>(), 0xb4);
        let header = LgsHeader {
            layer_count: U32LE::new(0x1234),
            machine_z_mm: F32LE::new(1.),
            ..LgsHeader::default()
        };
        let bytes = header.as_bytes();
        assert_eq!(&bytes[0xa4..0xa8], &[0x34, 0x12, 0, 0]);
        assert_eq!(&bytes[0x94..0x98], &1f32.to_le_bytes());
    }

    #[test]
    fn rgb15_is_big_endian() {
        let image = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => Rgb([0xff, 0xff, 0xff]),
            1 => Rgb([0xff, 0, 0]),
            _ => Rgb([0, 0, 0]),
        });
        let data = encode_rgb15(&image);
        assert_eq!(data, &[0xff, 0xdf, 0xf8, 0x00, 0x00, 0x00]);
        assert_eq!(decode_rgb15(3, 1, &data), image);
    }

    fn sample() -> Print {
        let exposure = Exposure {
            light_on: secs(8.),
            light_off: secs(1.),
            light_pwm: 255,
            lift_height_mm: 5.,
            lift_speed_mmpm: 65.,
            retract_height_mm: super::super::DEFAULT_RETRACT_HEIGHT_MM,
            retract_speed_mmpm: super::super::DEFAULT_RETRACT_SPEED_MMPM,
        };
        let mut properties = Properties {
            size: Size {
                resolution: [48, 20],
                bed_mm: [5.544, 2.31],
                layers: 4,
                layer_height_mm: 0.05,
            },
            exposure,
            bottom: Bottom {
                exposure: Exposure {
                    light_on: secs(60.),
                    lift_height_mm: 7.,
                    lift_speed_mmpm: 40.,
                    ..exposure
                },
                count: 3,
                ..Bottom::default()
            },
            ..Properties::default()
        };
        properties
            .previews
            .insert(PreviewKind::Tiny, RgbImage::from_pixel(30, 20, Rgb([0, 0xff, 0])));
        let mut print = Print::empty(properties);
        for (i, layer) in print.layers_mut().iter_mut().enumerate() {
            layer.mask = GrayImage::from_fn(48, 20, |x, y| {
                Luma([if (x + y) as usize % 4 == i { 0xff } else { 0x44 }])
            });
        }
        print
    }

    #[test]
    fn round_trip() {
        let print = sample();
        let lgs = Lgs::new(Kind::Lgs, &Options::default()).unwrap();
        let mut out = vec![];
        lgs.encode(&print, &mut out).unwrap();
        assert_eq!(&out[..8], MARK);
        assert_eq!(Kind::detect(&out), Some(Kind::Lgs));

        let decoded = lgs.decode(out).unwrap();
        let props = decoded.properties();
        assert_eq!(props.size.resolution, [48, 20]);
        assert_eq!(props.size.layers, 4);
        assert!((props.size.bed_mm[0] - 5.544).abs() < 1e-3);
        assert_eq!(props.exposure, print.properties().exposure);
        assert_eq!(props.bottom, print.properties().bottom);
        assert_eq!(
            props.previews[&PreviewKind::Tiny],
            RgbImage::from_pixel(30, 20, Rgb([0, 0xff, 0]))
        );

        for i in 0..4 {
            let layer = decoded.layer(i).unwrap();
            assert_eq!(layer.mask, print.layer(i).unwrap().mask, "layer {}", i);
            assert!((layer.z_mm - 0.05 * (i + 1) as f32).abs() < 1e-4);
        }
        assert_eq!(decoded.layer(3).unwrap().exposure.light_on, secs(8.));
    }

    #[test]
    fn orange30_is_detected_by_model() {
        let print = sample();
        let lgs30 = Lgs::new(Kind::Lgs30, &Options::default()).unwrap();
        let mut out = vec![];
        lgs30.encode(&print, &mut out).unwrap();
        let header = input::parse_type::<LgsHeader>(&out, 0).unwrap();
        assert_eq!(header.model.get(), 30);
        assert_eq!(header.machine_z_mm.get(), 170.);
        assert_eq!(Kind::detect(&out), Some(Kind::Lgs30));
    }

    #[test]
    fn every_layer_is_stored() {
        // Unlike the offset-based formats, identical layers are written out
        // again each time.
        let mut print = sample();
        for layer in print.layers_mut() {
            layer.mask = GrayImage::from_pixel(48, 20, Luma([0xff]));
        }
        let mut out = vec![];
        Lgs::new(Kind::Lgs, &Options::default())
            .unwrap()
            .encode(&print, &mut out)
            .unwrap();
        // Header, 30x20 preview, then four 4-byte lengths of one 3-nibble run.
        assert_eq!(out.len(), 0xb4 + 30 * 20 * 2 + 4 * (4 + 3));
    }

    #[test]
    fn layer_count_must_match_records() {
        let print = sample();
        let lgs = Lgs::new(Kind::Lgs, &Options::default()).unwrap();
        let mut out = vec![];
        lgs.encode(&print, &mut out).unwrap();
        out[0xa4] = 5;
        assert!(matches!(lgs.decode(out), Err(Error::Truncated { .. })));
    }

    #[test]
    fn damaged_layer_is_reported() {
        let print = sample();
        let lgs = Lgs::new(Kind::Lgs, &Options::default()).unwrap();
        let mut out = vec![];
        lgs.encode(&print, &mut out).unwrap();
        // First byte of layer 0: its level now matches the next run's.
        let first = 0xb4 + 30 * 20 * 2 + 4;
        out[first] = 0x41;
        let decoded = lgs.decode(out).unwrap();
        assert!(matches!(
            decoded.layer(0),
            Err(Error::CorruptPayload {
                payload: Payload::Layer(0),
                source: RleError::TooFewPixels | RleError::TooManyPixels,
            })
        ));
    }

    #[test]
    fn wrong_mark() {
        let lgs = Lgs::new(Kind::Lgs, &Options::default()).unwrap();
        assert!(matches!(
            lgs.decode(vec![0; 0x100]),
            Err(Error::FormatMismatch { format: "lgs", found: 0 })
        ));
        let v2 = Options {
            version: Some(2),
            ..Options::default()
        };
        assert!(matches!(
            Lgs::new(Kind::Lgs, &v2),
            Err(Error::InvalidParameter(_))
        ));
    }
}
