//! Voxelab FDG files.
//!
//! FDG is a CTB derivative with the settings rearranged into a single header
//! (like PHZ) and its own key schedule. Version 3 files put an `ImageInfo`
//! record in front of every layer.

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

/// Longest preview run FDG writes.
pub const PREVIEW_MAX_RUN: usize = 0xfff;

/// The only machine FDG files are made for.
pub const MACHINE: &str = "Voxelab Polaris";

const ENCRYPTION_MODE: u32 = 0x4c;
const ANTI_ALIAS_DEPTH: u32 = 4;
const SLICER_VERSION: [u8; 4] = [0, 0, 7, 1];

/// The Voxelab slicer's volume figures come out this much larger than the
/// lit pixel volume; match it so printers show the same estimate.
const VOLUME_SCALE: f32 = 200.;
const RESIN_G_PER_ML: f32 = 1.1;
const RESIN_PRICE_PER_G: f32 = 0.1;

#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct FdgHeader {
    pub magic: U32LE,
    pub version: U32LE,
    pub layer_table_count: U32LE,
    pub bot_layer_count: U32LE,
    pub mirror: U32LE,
    /// Repeats `bot_layer_count`.
    pub bot_layer_count2: U32LE,
    pub resolution: [U32LE; 2],
    pub layer_height_mm: F32LE,
    pub exposure_s: F32LE,
    pub bot_exposure_s: F32LE,
    pub large_preview_offset: U32LE,
    pub small_preview_offset: U32LE,
    pub layer_table_offset: U32LE,
    pub print_time_s: U32LE,
    pub level_set_count: U32LE,
    pub pwm_level: U16LE,
    pub bot_pwm_level: U16LE,
    pub _reserved0: [U32LE; 2],
    pub overall_height_mm: F32LE,
    pub printer_out_mm: [F32LE; 3],
    pub encryption_key: U32LE,
    pub antialias_depth: U32LE,
    pub encryption_mode: U32LE,
    pub print_volume_ml: F32LE,
    pub print_mass_g: F32LE,
    pub print_price: F32LE,
    pub machine_type_offset: U32LE,
    pub machine_type_len: U32LE,
    pub bot_light_off_time_s: F32LE,
    pub light_off_time_s: F32LE,
    pub _reserved1: U32LE,
    pub bot_lift_dist_mm: F32LE,
    pub bot_lift_speed_mmpm: F32LE,
    pub lift_dist_mm: F32LE,
    pub lift_speed_mmpm: F32LE,
    pub retract_speed_mmpm: F32LE,
    pub _reserved2: [U32LE; 7],
    /// Minutes since the Unix epoch.
    pub timestamp_min: U32LE,
    /// Slicer version: major, minor, patch, release.
    pub slicer_version: [u8; 4],
    pub _reserved3: [U32LE; 6],
}

#[derive(Clone, Debug)]
pub struct Fdg {
    version: u32,
    seed: Option<u32>,
}

impl Fdg {
    pub fn new(options: &Options) -> Result<Self> {
        let version = options.version("fdg", &[2, 3])?;
        options.ignore_anti_alias("fdg");
        Ok(Self {
            version,
            seed: options.encryption_seed,
        })
    }
}

impl Format for Fdg {
    fn name(&self) -> &'static str {
        "fdg"
    }

    fn header_size(&self) -> usize {
        size_of::<FdgHeader>()
    }

    fn decode(&self, data: Vec<u8>) -> Result<Box<dyn Printable>> {
        super::check_magic(&data, "fdg", Magic::Fdg, &[2, 3])?;
        let header = input::parse_type::<FdgHeader>(&data, 0)?;

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
            "fdg v{}: {} layers, {}x{}",
            header.version.get(),
            layers.len(),
            properties.size.resolution[0],
            properties.size.resolution[1]
        );
        let codec = SliceCodec::new(
            SliceEncoding::Rle7,
            Cipher::for_seed(Schedule::Fdg, header.encryption_key.get()),
        );
        Ok(Box::new(Slices::new(data, properties, layers, codec)))
    }

    fn encode(&self, printable: &dyn Printable, sink: &mut dyn Write) -> Result<()> {
        let properties = printable.properties();
        let seed = super::seed_or_random("fdg", self.seed);
        let codec = SliceCodec::new(
            SliceEncoding::Rle7,
            Cipher::for_seed(Schedule::Fdg, seed),
        );
        let layers = super::compress_layers(printable, &codec)?;

        let huge = PreviewBlock::encode(properties, PreviewKind::Huge, PREVIEW_MAX_RUN);
        let tiny = PreviewBlock::encode(properties, PreviewKind::Tiny, PREVIEW_MAX_RUN);
        let (huge_offset, next) =
            super::place_preview(&huge, size_of::<FdgHeader>() as u32, false);
        let (tiny_offset, next) = super::place_preview(&tiny, next, false);

        if properties.machine() != MACHINE
            && properties.metadata.contains_key(MACHINE_KEY)
        {
            log::warn!(
                "fdg: machine {:?} replaced with {:?}",
                properties.machine(),
                MACHINE
            );
        }
        let machine_offset = next;
        let table_offset = machine_offset + MACHINE.len() as u32;
        let count = layers.len();

        let mut file =
            FileImage::new(table_offset + super::layer_table_size(count), false);
        let bits_on =
            super::place_layers(&mut file, table_offset, layers, self.version >= 3)?;

        let size = &properties.size;
        let exposure = &properties.exposure;
        let bottom = &properties.bottom;
        let or_default = super::or_default;
        let volume_ml = super::resin_volume_ml(bits_on, size) * VOLUME_SCALE;
        let mass_g = volume_ml * RESIN_G_PER_ML;
        let timestamp_min = chrono::Utc::now().timestamp() / 60;

        let header = FdgHeader {
            magic: U32LE::new(Magic::Fdg as u32),
            version: U32LE::new(self.version),
            layer_table_count: U32LE::new(count as u32),
            bot_layer_count: U32LE::new(bottom.count),
            mirror: U32LE::new(1),
            bot_layer_count2: U32LE::new(bottom.count),
            resolution: [U32LE::new(size.resolution[0]), U32LE::new(size.resolution[1])],
            layer_height_mm: F32LE::new(size.layer_height_mm),
            exposure_s: F32LE::new(super::seconds(exposure.light_on)),
            bot_exposure_s: F32LE::new(super::seconds(bottom.exposure.light_on)),
            large_preview_offset: U32LE::new(huge_offset),
            small_preview_offset: U32LE::new(tiny_offset),
            layer_table_offset: U32LE::new(table_offset),
            print_time_s: U32LE::new(properties.duration().as_secs() as u32),
            level_set_count: U32LE::new(1),
            pwm_level: U16LE::new(u16::from(exposure.light_pwm)),
            bot_pwm_level: U16LE::new(u16::from(bottom.exposure.light_pwm)),
            overall_height_mm: F32LE::new(size.layer_height_mm * count as f32),
            printer_out_mm: [
                F32LE::new(size.bed_mm[0]),
                F32LE::new(size.bed_mm[1]),
                F32LE::new(super::BED_Z_MM),
            ],
            encryption_key: U32LE::new(seed),
            antialias_depth: U32LE::new(ANTI_ALIAS_DEPTH),
            encryption_mode: U32LE::new(ENCRYPTION_MODE),
            print_volume_ml: F32LE::new(volume_ml),
            print_mass_g: F32LE::new(mass_g),
            print_price: F32LE::new(mass_g * RESIN_PRICE_PER_G),
            machine_type_offset: U32LE::new(machine_offset),
            machine_type_len: U32LE::new(MACHINE.len() as u32),
            bot_light_off_time_s: F32LE::new(super::seconds(bottom.exposure.light_off)),
            light_off_time_s: F32LE::new(super::seconds(exposure.light_off)),
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
            timestamp_min: U32LE::new(timestamp_min as u32),
            slicer_version: SLICER_VERSION,
            ..FdgHeader::default()
        };

        file.put(0, header.as_bytes());
        if let Some(p) = huge {
            p.put(&mut file, huge_offset);
        }
        if let Some(p) = tiny {
            p.put(&mut file, tiny_offset);
        }
        file.put(machine_offset, MACHINE.as_bytes());

        let hits = file.dedup_hits();
        let written = file.finish(sink)?;
        log::info!(
            "fdg v{}: wrote {} layers in {} bytes ({} deduplicated)",
            self.version,
            count,
            written,
            hits
        );
        Ok(())
    }
}
