//! ChiTu PHZ files.
//!
//! PHZ keeps all of its settings in one large header rather than CTB's chain
//! of records. Layers are RLE7a-encoded and optionally scrambled with the PHZ
//! key schedule. Payloads are packed with no alignment.

use std::io::Write;
use std::mem::size_of;

use zerocopy::{AsBytes, FromBytes, Unaligned};

use super::{Format, Options, PreviewBlock};
use crate::codec::{SliceCodec, SliceEncoding};
use crate::crypto::{Cipher, Schedule};
use crate::error::Result;
use crate::input::{self, Slices};
use crate::model::{secs, Printable, Properties, MACHINE_KEY};
use crate::output::FileImage;
use crate::{Magic, PreviewKind, F32LE, U16LE, U32LE};

/// Longest preview run PHZ writes.
pub const PREVIEW_MAX_RUN: usize = 0xfff;

const ENCRYPTION_MODE: u32 = 0x1c;
const SLICER_VERSION: [u8; 4] = [0, 3, 6, 1];

#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct PhzHeader {
    pub magic: U32LE,
    pub version: U32LE,
    pub layer_height_mm: F32LE,
    pub exposure_s: F32LE,
    pub bot_exposure_s: F32LE,
    pub bot_layer_count: U32LE,
    pub resolution: [U32LE; 2],
    pub large_preview_offset: U32LE,
    pub layer_table_offset: U32LE,
    pub layer_table_count: U32LE,
    pub small_preview_offset: U32LE,
    pub print_time_s: U32LE,
    pub mirror: U32LE,
    pub level_set_count: U32LE,
    pub pwm_level: U16LE,
    pub bot_pwm_level: U16LE,
    pub _reserved0: [U32LE; 2],
    pub overall_height_mm: F32LE,
    pub printer_out_mm: [F32LE; 3],
    pub encryption_key: U32LE,
    pub bot_light_off_time_s: F32LE,
    pub light_off_time_s: F32LE,
    /// Repeats `bot_layer_count`.
    pub bot_layer_count2: U32LE,
    pub _reserved1: U32LE,
    pub bot_lift_dist_mm: F32LE,
    pub bot_lift_speed_mmpm: F32LE,
    pub lift_dist_mm: F32LE,
    pub lift_speed_mmpm: F32LE,
    pub retract_speed_mmpm: F32LE,
    pub print_volume_ml: F32LE,
    pub print_mass_g: F32LE,
    pub print_price: F32LE,
    pub _reserved2: U32LE,
    pub machine_type_offset: U32LE,
    pub machine_type_len: U32LE,
    pub _reserved3: [U32LE; 6],
    pub encryption_mode: U32LE,
    pub _reserved4: [U32LE; 2],
    /// Slicer version: release, patch, minor, major.
    pub slicer_version: [u8; 4],
    pub _reserved5: [U32LE; 6],
}

/// PHZ writes a zero PWM as full power.
fn pwm(level: u8) -> U16LE {
    U16LE::new(if level == 0 { 255 } else { u16::from(level) })
}

#[derive(Clone, Debug)]
pub struct Phz {
    seed: u32,
}

impl Phz {
    pub fn new(options: &Options) -> Result<Self> {
        options.version("phz", &[2])?;
        options.ignore_anti_alias("phz");
        // Unscrambled files can share identical layers, so that's the default.
        Ok(Self {
            seed: options.encryption_seed.unwrap_or(0),
        })
    }
}

impl Format for Phz {
    fn name(&self) -> &'static str {
        "phz"
    }

    fn header_size(&self) -> usize {
        size_of::<PhzHeader>()
    }

    fn decode(&self, data: Vec<u8>) -> Result<Box<dyn Printable>> {
        super::check_magic(&data, "phz", Magic::Phz, &[2])?;
        let header = input::parse_type::<PhzHeader>(&data, 0)?;

        let mut properties = Properties::default();
        let size = &mut properties.size;
        size.resolution = [header.resolution[0].get(), header.resolution[1].get()];
        size.bed_mm = [header.printer_out_mm[0].get(), header.printer_out_mm[1].get()];
        size.layers = header.layer_table_count.get();
        size.layer_height_mm = header.layer_height_mm.get();

        let exposure = &mut properties.exposure;
        exposure.light_on = secs(header.exposure_s.get());
        exposure.light_off = secs(header.light_off_time_s.get());
        exposure.light_pwm = super::pwm_level(f32::from(header.pwm_level.get()));
        super::motion_defaults(exposure);
        exposure.lift_height_mm = header.lift_dist_mm.get();
        exposure.lift_speed_mmpm = header.lift_speed_mmpm.get();
        exposure.retract_speed_mmpm = header.retract_speed_mmpm.get();

        let bottom = &mut properties.bottom;
        bottom.count = header.bot_layer_count.get();
        bottom.exposure.light_on = secs(header.bot_exposure_s.get());
        bottom.exposure.light_off = secs(header.bot_light_off_time_s.get());
        bottom.exposure.light_pwm =
            super::pwm_level(f32::from(header.bot_pwm_level.get()));
        super::motion_defaults(&mut bottom.exposure);
        bottom.exposure.lift_height_mm = header.bot_lift_dist_mm.get();
        bottom.exposure.lift_speed_mmpm = header.bot_lift_speed_mmpm.get();
        bottom.exposure.retract_speed_mmpm = header.retract_speed_mmpm.get();

        let machine = input::parse_bytes(
            &data,
            header.machine_type_offset.get(),
            header.machine_type_len.get(),
        )?;
        if !machine.is_empty() {
            properties
                .metadata
                .insert(MACHINE_KEY.into(), input::c_string(machine));
        }

        super::read_previews(
            &data,
            header.large_preview_offset.get(),
            header.small_preview_offset.get(),
            &mut properties,
        )?;

        let layers = super::read_layers(
            &data,
            header.layer_table_offset.get(),
            header.layer_table_count.get(),
            1,
            &properties,
        )?;
        log::info!(
            "phz: {} layers, {}x{}",
            layers.len(),
            properties.size.resolution[0],
            properties.size.resolution[1]
        );
        let codec = SliceCodec::new(
            SliceEncoding::Rle7a,
            Cipher::for_seed(Schedule::Phz, header.encryption_key.get()),
        );
        Ok(Box::new(Slices::new(data, properties, layers, codec)))
    }

    fn encode(&self, printable: &dyn Printable, sink: &mut dyn Write) -> Result<()> {
        let properties = printable.properties();
        let codec = SliceCodec::new(
            SliceEncoding::Rle7a,
            Cipher::for_seed(Schedule::Phz, self.seed),
        );
        let layers = super::compress_layers(printable, &codec)?;

        let huge = PreviewBlock::encode(properties, PreviewKind::Huge, PREVIEW_MAX_RUN);
        let tiny = PreviewBlock::encode(properties, PreviewKind::Tiny, PREVIEW_MAX_RUN);
        let (huge_offset, next) =
            super::place_preview(&huge, size_of::<PhzHeader>() as u32, false);
        let (tiny_offset, next) = super::place_preview(&tiny, next, false);

        let machine_offset = next;
        let machine = properties.machine().as_bytes().to_vec();
        let table_offset = machine_offset + machine.len() as u32;
        let count = layers.len();

        let mut file =
            FileImage::new(table_offset + super::layer_table_size(count), false);
        let bits_on = super::place_layers(&mut file, table_offset, layers, false)?;

        let size = &properties.size;
        let exposure = &properties.exposure;
        let bottom = &properties.bottom;
        let or_default = super::or_default;
        let header = PhzHeader {
            magic: U32LE::new(Magic::Phz as u32),
            version: U32LE::new(2),
            layer_height_mm: F32LE::new(size.layer_height_mm),
            exposure_s: F32LE::new(super::seconds(exposure.light_on)),
            bot_exposure_s: F32LE::new(super::seconds(bottom.exposure.light_on)),
            bot_layer_count: U32LE::new(bottom.count),
            resolution: [U32LE::new(size.resolution[0]), U32LE::new(size.resolution[1])],
            large_preview_offset: U32LE::new(huge_offset),
            layer_table_offset: U32LE::new(table_offset),
            layer_table_count: U32LE::new(count as u32),
            small_preview_offset: U32LE::new(tiny_offset),
            print_time_s: U32LE::new(properties.duration().as_secs() as u32),
            mirror: U32LE::new(1),
            level_set_count: U32LE::new(1),
            pwm_level: pwm(exposure.light_pwm),
            bot_pwm_level: pwm(bottom.exposure.light_pwm),
            overall_height_mm: F32LE::new(size.layer_height_mm * count as f32),
            printer_out_mm: [
                F32LE::new(size.bed_mm[0]),
                F32LE::new(size.bed_mm[1]),
                F32LE::new(super::BED_Z_MM),
            ],
            encryption_key: U32LE::new(self.seed),
            bot_light_off_time_s: F32LE::new(super::seconds(bottom.exposure.light_off)),
            light_off_time_s: F32LE::new(super::seconds(exposure.light_off)),
            bot_layer_count2: U32LE::new(bottom.count),
            bot_lift_dist_mm: F32LE::new(or_default(
                bottom.exposure.lift_height_mm,
                super::DEFAULT_LIFT_HEIGHT_MM,
            )),
            bot_lift_speed_mmpm: F32LE::new(or_default(
                bottom.exposure.lift_speed_mmpm,
                super::DEFAULT_LIFT_SPEED_MMPM,
            )),
            lift_dist_mm: F32LE::new(or_default(
                exposure.lift_height_mm,
                super::DEFAULT_LIFT_HEIGHT_MM,
            )),
            lift_speed_mmpm: F32LE::new(or_default(
                exposure.lift_speed_mmpm,
                super::DEFAULT_LIFT_SPEED_MMPM,
            )),
            retract_speed_mmpm: F32LE::new(or_default(
                exposure.retract_speed_mmpm,
                super::DEFAULT_RETRACT_SPEED_MMPM,
            )),
            print_volume_ml: F32LE::new(super::resin_volume_ml(bits_on, size)),
            machine_type_offset: U32LE::new(machine_offset),
            machine_type_len: U32LE::new(machine.len() as u32),
            encryption_mode: U32LE::new(ENCRYPTION_MODE),
            slicer_version: SLICER_VERSION,
            ..PhzHeader::default()
        };

        file.put(0, header.as_bytes());
        if let Some(p) = huge {
            p.put(&mut file, huge_offset);
        }
        if let Some(p) = tiny {
            p.put(&mut file, tiny_offset);
        }
        file.put(machine_offset, machine);

        let hits = file.dedup_hits();
        let written = file.finish(sink)?;
        log::info!(
            "phz: wrote {} layers in {} bytes ({} deduplicated)",
            count,
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
    use crate::LayerHeader;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    #[test]
    fn header_size() {
        assert_eq!(size_of::<PhzHeader>(), 0xd8);
    }

    fn sample() -> Print {
        let exposure = Exposure {
            light_on: secs(6.),
            light_off: secs(2.),
            light_pwm: 200,
            lift_height_mm: 7.,
            lift_speed_mmpm: 120.,
            retract_height_mm: super::super::DEFAULT_RETRACT_HEIGHT_MM,
            retract_speed_mmpm: 180.,
        };
        let mut properties = Properties {
            size: Size {
                resolution: [10, 6],
                bed_mm: [20., 12.],
                layers: 4,
                layer_height_mm: 0.025,
            },
            exposure,
            bottom: Bottom {
                exposure: Exposure {
                    light_on: secs(40.),
                    light_off: secs(3.),
                    lift_height_mm: 9.,
                    ..exposure
                },
                count: 2,
                ..Bottom::default()
            },
            ..Properties::default()
        };
        properties
            .previews
            .insert(PreviewKind::Tiny, RgbImage::from_pixel(4, 3, Rgb([0xff, 0, 0xff])));
        properties.metadata.insert(MACHINE_KEY.into(), "Sonic".into());
        let mut print = Print::empty(properties);
        for (i, layer) in print.layers_mut().iter_mut().enumerate() {
            // Layers 1 and 3 are the same.
            let level = if i % 2 == 1 { 0xff } else { (i * 40) as u8 };
            layer.mask = GrayImage::from_pixel(10, 6, Luma([level]));
        }
        print
    }

    #[test]
    fn round_trip() {
        let print = sample();
        let phz = Phz::new(&Options::default()).unwrap();
        let mut out = vec![];
        phz.encode(&print, &mut out).unwrap();

        let header = input::parse_type::<PhzHeader>(&out, 0).unwrap();
        assert_eq!(header.encryption_key.get(), 0);
        assert_eq!(header.large_preview_offset.get(), 0);
        assert_eq!(header.small_preview_offset.get(), 0xd8);
        let table = input::parse_slice::<LayerHeader>(
            &out,
            header.layer_table_offset.get(),
            4,
        )
        .unwrap();
        assert_eq!(table[1].data_offset.get(), table[3].data_offset.get());

        let decoded = phz.decode(out).unwrap();
        let props = decoded.properties();
        assert_eq!(props.size, print.properties().size);
        assert_eq!(props.exposure, print.properties().exposure);
        assert_eq!(props.bottom, print.properties().bottom);
        assert_eq!(props.machine(), "Sonic");
        assert_eq!(
            props.previews.get(&PreviewKind::Tiny),
            print.properties().previews.get(&PreviewKind::Tiny)
        );
        for i in 0..4 {
            assert_eq!(decoded.layer(i).unwrap().mask, print.layer(i).unwrap().mask);
        }
    }

    #[test]
    fn scrambled_round_trip() {
        let print = sample();
        let phz = Phz::new(&Options {
            encryption_seed: Some(0xdcbe_9950),
            ..Options::default()
        })
        .unwrap();
        let mut out = vec![];
        phz.encode(&print, &mut out).unwrap();
        let decoded = phz.decode(out).unwrap();
        assert_eq!(decoded.layer(3).unwrap().mask, print.layer(3).unwrap().mask);
    }
}
