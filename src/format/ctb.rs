//! ChiTu CTB files.
//!
//! A CTB file splits its settings across three records: the header at offset
//! zero, an "ext config" block of motion parameters, and an "ext config 2"
//! block that locates the machine name and describes the slicer. Layers are
//! RLE7-encoded and scrambled with the CTB key schedule.
//!
//! The header and ext config block are shared with `cbddlp`, which is the
//! same container with bit-plane layers and no scrambling.

use std::io::Write;
use std::mem::size_of;

use zerocopy::{AsBytes, FromBytes, Unaligned};

use super::{Format, Options, PreviewBlock};
use crate::codec::{SliceCodec, SliceEncoding};
use crate::crypto::{Cipher, Schedule};
use crate::error::Result;
use crate::input::{self, Slices};
use crate::model::{Printable, Properties, MACHINE_KEY};
use crate::output::FileImage;
use crate::{Magic, PreviewKind, F32LE, U16LE, U32LE};

/// Longest preview run the CTB family writes.
pub const PREVIEW_MAX_RUN: usize = 0x1000;

/// Header shared by CTB and CBDDLP files.
#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct CtbHeader {
    pub magic: U32LE,
    pub version: U32LE,
    /// Build volume in mm, `[x, y, z]`.
    pub printer_out_mm: [F32LE; 3],
    pub _reserved0: [U32LE; 2],
    pub overall_height_mm: F32LE,
    pub layer_height_mm: F32LE,
    pub exposure_s: F32LE,
    pub bot_exposure_s: F32LE,
    pub light_off_time_s: F32LE,
    pub bot_layer_count: U32LE,
    pub resolution: [U32LE; 2],
    pub large_preview_offset: U32LE,
    pub layer_table_offset: U32LE,
    pub layer_table_count: U32LE,
    pub small_preview_offset: U32LE,
    pub print_time_s: U32LE,
    /// 0 for CAST projectors, 1 for mirrored LCDs.
    pub mirror: U32LE,
    pub ext_config_offset: U32LE,
    pub ext_config_size: U32LE,
    /// Number of bit planes per layer (`cbddlp`); 1 for CTB.
    pub level_set_count: U32LE,
    pub pwm_level: U16LE,
    pub bot_pwm_level: U16LE,
    pub encryption_key: U32LE,
    pub ext_config2_offset: U32LE,
    pub ext_config2_size: U32LE,
}

/// Motion parameters and resin estimates.
#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct ExtConfig {
    pub bot_lift_dist_mm: F32LE,
    pub bot_lift_speed_mmpm: F32LE,
    pub lift_dist_mm: F32LE,
    pub lift_speed_mmpm: F32LE,
    pub retract_speed_mmpm: F32LE,
    pub print_volume_ml: F32LE,
    pub print_mass_g: F32LE,
    pub print_price: F32LE,
    pub bot_light_off_time_s: F32LE,
    pub light_off_time_s: F32LE,
    pub bot_layer_count: U32LE,
    pub _reserved0: [U32LE; 3],
    /// Always 0x1234 in files from the vendor slicer.
    pub _unknown38: U32LE,
}

/// Slicer description and machine name location (CTB only).
#[derive(Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct ExtConfig2 {
    pub _reserved0: [U32LE; 7],
    pub machine_type_offset: U32LE,
    pub machine_type_len: U32LE,
    pub encryption_mode: U32LE,
    pub mysterious_id: U32LE,
    pub antialias_level: U32LE,
    /// Slicer version: major, minor, patch, release.
    pub slicer_version: [u8; 4],
    pub _reserved1: [U32LE; 6],
}

/// Encryption mode recorded by CTB writers.
const ENCRYPTION_MODE: u32 = 7;
const MYSTERIOUS_ID: u32 = 0x1234_5678;
const SLICER_VERSION: [u8; 4] = [1, 6, 3, 0];
const EXT_CONFIG_MARKER: u32 = 0x1234;

/// Fills in the header fields common to CTB and CBDDLP from `properties`.
/// Offsets, counts and format-specific fields are left for the caller.
pub(crate) fn common_header(
    magic: Magic,
    version: u32,
    properties: &Properties,
) -> CtbHeader {
    let size = &properties.size;
    let exposure = &properties.exposure;
    let bottom = &properties.bottom;
    CtbHeader {
        magic: U32LE::new(magic as u32),
        version: U32LE::new(version),
        printer_out_mm: [
            F32LE::new(size.bed_mm[0]),
            F32LE::new(size.bed_mm[1]),
            F32LE::new(super::BED_Z_MM),
        ],
        overall_height_mm: F32LE::new(size.layer_height_mm * size.layers as f32),
        layer_height_mm: F32LE::new(size.layer_height_mm),
        exposure_s: F32LE::new(super::seconds(exposure.light_on)),
        bot_exposure_s: F32LE::new(super::seconds(bottom.exposure.light_on)),
        light_off_time_s: F32LE::new(super::seconds(exposure.light_off)),
        bot_layer_count: U32LE::new(bottom.count),
        resolution: [U32LE::new(size.resolution[0]), U32LE::new(size.resolution[1])],
        layer_table_count: U32LE::new(size.layers),
        print_time_s: U32LE::new(properties.duration().as_secs() as u32),
        mirror: U32LE::new(1),
        level_set_count: U32LE::new(1),
        pwm_level: U16LE::new(u16::from(exposure.light_pwm)),
        bot_pwm_level: U16LE::new(u16::from(bottom.exposure.light_pwm)),
        ..CtbHeader::default()
    }
}

/// Builds the ext config block for `properties`, given the total lit pixel
/// count.
pub(crate) fn ext_config(properties: &Properties, bits_on: u64) -> ExtConfig {
    use super::or_default;

    let exposure = &properties.exposure;
    let bottom = &properties.bottom;
    ExtConfig {
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
        print_volume_ml: F32LE::new(super::resin_volume_ml(
            bits_on,
            &properties.size,
        )),
        bot_light_off_time_s: F32LE::new(super::seconds(bottom.exposure.light_off)),
        light_off_time_s: F32LE::new(super::seconds(exposure.light_off)),
        bot_layer_count: U32LE::new(bottom.count),
        _unknown38: U32LE::new(EXT_CONFIG_MARKER),
        ..ExtConfig::default()
    }
}

/// Reads the properties described by a CTB/CBDDLP header and, if present, its
/// ext config block.
pub(crate) fn read_properties(data: &[u8], header: &CtbHeader) -> Result<Properties> {
    let mut properties = Properties::default();

    let size = &mut properties.size;
    size.resolution = [header.resolution[0].get(), header.resolution[1].get()];
    size.bed_mm = [header.printer_out_mm[0].get(), header.printer_out_mm[1].get()];
    size.layers = header.layer_table_count.get();
    size.layer_height_mm = header.layer_height_mm.get();

    let exposure = &mut properties.exposure;
    exposure.light_on = crate::model::secs(header.exposure_s.get());
    exposure.light_off = crate::model::secs(header.light_off_time_s.get());
    exposure.light_pwm = super::pwm_level(f32::from(header.pwm_level.get()));
    super::motion_defaults(exposure);

    let bottom = &mut properties.bottom;
    bottom.count = header.bot_layer_count.get();
    bottom.exposure.light_on = crate::model::secs(header.bot_exposure_s.get());
    bottom.exposure.light_off = crate::model::secs(header.light_off_time_s.get());
    bottom.exposure.light_pwm =
        super::pwm_level(f32::from(header.bot_pwm_level.get()));
    super::motion_defaults(&mut bottom.exposure);

    let ext_offset = header.ext_config_offset.get();
    let ext_size = header.ext_config_size.get();
    if ext_offset != 0 && ext_size != 0 {
        let ext = input::parse_type_prefix::<ExtConfig>(data, ext_offset, ext_size)?;

        let bottom = &mut properties.bottom;
        bottom.count = ext.bot_layer_count.get();
        bottom.exposure.lift_height_mm = ext.bot_lift_dist_mm.get();
        bottom.exposure.lift_speed_mmpm = ext.bot_lift_speed_mmpm.get();
        bottom.exposure.light_off = crate::model::secs(ext.bot_light_off_time_s.get());
        bottom.exposure.retract_speed_mmpm = ext.retract_speed_mmpm.get();

        let exposure = &mut properties.exposure;
        exposure.lift_height_mm = ext.lift_dist_mm.get();
        exposure.lift_speed_mmpm = ext.lift_speed_mmpm.get();
        exposure.light_off = crate::model::secs(ext.light_off_time_s.get());
        exposure.retract_speed_mmpm = ext.retract_speed_mmpm.get();
    }

    super::read_previews(
        data,
        header.large_preview_offset.get(),
        header.small_preview_offset.get(),
        &mut properties,
    )?;
    Ok(properties)
}

/// CTB format, version 2 or 3. Version 3 adds a per-layer `ImageInfo` record.
#[derive(Clone, Debug)]
pub struct Ctb {
    version: u32,
    seed: Option<u32>,
}

impl Ctb {
    pub fn new(options: &Options) -> Result<Self> {
        let version = options.version("ctb", &[2, 3])?;
        options.ignore_anti_alias("ctb");
        Ok(Self {
            version,
            seed: options.encryption_seed,
        })
    }
}

impl Format for Ctb {
    fn name(&self) -> &'static str {
        "ctb"
    }

    fn header_size(&self) -> usize {
        size_of::<CtbHeader>()
    }

    fn decode(&self, data: Vec<u8>) -> Result<Box<dyn Printable>> {
        super::check_magic(&data, "ctb", Magic::Ctb, &[2, 3])?;
        let header = input::parse_type::<CtbHeader>(&data, 0)?;
        let mut properties = read_properties(&data, header)?;

        let ext2_offset = header.ext_config2_offset.get();
        let ext2_size = header.ext_config2_size.get();
        if ext2_offset != 0 && ext2_size != 0 {
            let ext2 =
                input::parse_type_prefix::<ExtConfig2>(&data, ext2_offset, ext2_size)?;
            let machine = input::parse_bytes(
                &data,
                ext2.machine_type_offset.get(),
                ext2.machine_type_len.get(),
            )?;
            properties
                .metadata
                .insert(MACHINE_KEY.into(), input::c_string(machine));
        }

        let layers = super::read_layers(
            &data,
            header.layer_table_offset.get(),
            header.layer_table_count.get(),
            1,
            &properties,
        )?;
        let codec = SliceCodec::new(
            SliceEncoding::Rle7,
            Cipher::for_seed(Schedule::Ctb, header.encryption_key.get()),
        );
        log::info!(
            "ctb v{}: {} layers, {}x{}",
            header.version.get(),
            layers.len(),
            properties.size.resolution[0],
            properties.size.resolution[1],
        );
        Ok(Box::new(Slices::new(data, properties, layers, codec)))
    }

    fn encode(&self, printable: &dyn Printable, sink: &mut dyn Write) -> Result<()> {
        let properties = printable.properties();
        let seed = super::seed_or_random("ctb", self.seed);
        let codec = SliceCodec::new(
            SliceEncoding::Rle7,
            Cipher::for_seed(Schedule::Ctb, seed),
        );
        let layers = super::compress_layers(printable, &codec)?;

        let huge = PreviewBlock::encode(properties, PreviewKind::Huge, PREVIEW_MAX_RUN);
        let tiny = PreviewBlock::encode(properties, PreviewKind::Tiny, PREVIEW_MAX_RUN);
        let (huge_offset, next) =
            super::place_preview(&huge, size_of::<CtbHeader>() as u32, false);
        let (tiny_offset, next) = super::place_preview(&tiny, next, false);

        let ext_offset = next;
        let ext2_offset = ext_offset + size_of::<ExtConfig>() as u32;
        let machine_offset = ext2_offset + size_of::<ExtConfig2>() as u32;
        let machine = properties.machine().as_bytes().to_vec();
        let table_offset = machine_offset + machine.len() as u32;
        let count = layers.len();

        let mut file =
            FileImage::new(table_offset + super::layer_table_size(count), true);
        let bits_on =
            super::place_layers(&mut file, table_offset, layers, self.version >= 3)?;

        let header = CtbHeader {
            large_preview_offset: U32LE::new(huge_offset),
            small_preview_offset: U32LE::new(tiny_offset),
            layer_table_offset: U32LE::new(table_offset),
            layer_table_count: U32LE::new(count as u32),
            ext_config_offset: U32LE::new(ext_offset),
            ext_config_size: U32LE::new(size_of::<ExtConfig>() as u32),
            ext_config2_offset: U32LE::new(ext2_offset),
            ext_config2_size: U32LE::new(size_of::<ExtConfig2>() as u32),
            encryption_key: U32LE::new(seed),
            ..common_header(Magic::Ctb, self.version, properties)
        };
        let ext2 = ExtConfig2 {
            machine_type_offset: U32LE::new(machine_offset),
            machine_type_len: U32LE::new(machine.len() as u32),
            encryption_mode: U32LE::new(ENCRYPTION_MODE),
            mysterious_id: U32LE::new(MYSTERIOUS_ID),
            antialias_level: U32LE::new(1),
            slicer_version: SLICER_VERSION,
            ..ExtConfig2::default()
        };

        file.put(0, header.as_bytes());
        if let Some(p) = huge {
            p.put(&mut file, huge_offset);
        }
        if let Some(p) = tiny {
            p.put(&mut file, tiny_offset);
        }
        file.put(ext_offset, ext_config(properties, bits_on).as_bytes());
        file.put(ext2_offset, ext2.as_bytes());
        file.put(machine_offset, machine);

        let hits = file.dedup_hits();
        let written = file.finish(sink)?;
        log::info!(
            "ctb v{}: wrote {} layers in {} bytes ({} deduplicated)",
            self.version,
            count,
            written,
            hits
        );
        Ok(())
    }
}
