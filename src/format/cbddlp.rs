//! ChiTu CBDDLP files, and their older `.photon` incarnation.
//!
//! These use the CTB header, but store each layer as up to eight
//! independently compressed bit planes. The layer table holds one entry per
//! plane: all layers' plane 0, then all layers' plane 1, and so on. Version 1
//! files (`.photon`) predate the ext config block and antialiasing.

use std::io::Write;
use std::mem::size_of;

use zerocopy::AsBytes;

use super::ctb::{self, CtbHeader, ExtConfig, PREVIEW_MAX_RUN};
use super::{Format, Kind, Options, PreviewBlock};
use crate::codec::{SliceCodec, SliceEncoding};
use crate::error::{Error, Result};
use crate::input::{self, Slices};
use crate::model::Printable;
use crate::output::FileImage;
use crate::{Magic, PreviewKind, U32LE};

const ANTI_ALIAS_LEVELS: &[u32] = &[1, 2, 4, 8];

#[derive(Clone, Debug)]
pub struct Cbddlp {
    name: &'static str,
    version: u32,
    levels: u32,
}

impl Cbddlp {
    /// Configures a writer for `kind`, which must be `Cbddlp` or `Photon`.
    pub fn new(kind: Kind, options: &Options) -> Result<Self> {
        let (name, versions): (_, &[u32]) = if kind == Kind::Photon {
            ("photon", &[1, 2])
        } else {
            ("cbddlp", &[2, 1])
        };
        let version = options.version(name, versions)?;
        let levels = options.anti_alias(name, ANTI_ALIAS_LEVELS)?;
        if version < 2 && levels != 1 {
            return Err(Error::invalid(format!(
                "{} version 1 can't store antialiasing (requested level {})",
                name, levels
            )));
        }
        options.ignore_seed(name);
        Ok(Self {
            name,
            version,
            levels,
        })
    }
}

impl Format for Cbddlp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn header_size(&self) -> usize {
        size_of::<CtbHeader>()
    }

    fn decode(&self, data: Vec<u8>) -> Result<Box<dyn Printable>> {
        super::check_magic(&data, self.name, Magic::Cbddlp, &[1, 2])?;
        let header = input::parse_type::<CtbHeader>(&data, 0)?;
        let properties = ctb::read_properties(&data, header)?;

        let levels = header.level_set_count.get().max(1);
        if !ANTI_ALIAS_LEVELS.contains(&levels) {
            return Err(Error::invalid(format!(
                "{}: unsupported antialias level {}",
                self.name, levels
            )));
        }
        let layers = super::read_layers(
            &data,
            header.layer_table_offset.get(),
            header.layer_table_count.get(),
            levels,
            &properties,
        )?;
        log::info!(
            "{} v{}: {} layers, {} bit planes",
            self.name,
            header.version.get(),
            layers.len(),
            levels
        );
        let codec = SliceCodec::new(SliceEncoding::Planes { levels }, None);
        Ok(Box::new(Slices::new(data, properties, layers, codec)))
    }

    fn encode(&self, printable: &dyn Printable, sink: &mut dyn Write) -> Result<()> {
        let properties = printable.properties();
        let codec =
            SliceCodec::new(SliceEncoding::Planes { levels: self.levels }, None);
        let layers = super::compress_layers(printable, &codec)?;

        let huge = PreviewBlock::encode(properties, PreviewKind::Huge, PREVIEW_MAX_RUN);
        let tiny = PreviewBlock::encode(properties, PreviewKind::Tiny, PREVIEW_MAX_RUN);
        let (huge_offset, next) =
            super::place_preview(&huge, size_of::<CtbHeader>() as u32, true);
        let (tiny_offset, next) = super::place_preview(&tiny, next, true);

        let ext_offset = next;
        let table_offset = if self.version >= 2 {
            ext_offset + size_of::<ExtConfig>() as u32
        } else {
            ext_offset
        };
        let count = layers.len();
        let entries = count * self.levels as usize;

        let mut file =
            FileImage::new(table_offset + super::layer_table_size(entries), true);
        let bits_on = super::place_layers(&mut file, table_offset, layers, false)?;

        let mut header = CtbHeader {
            large_preview_offset: U32LE::new(huge_offset),
            small_preview_offset: U32LE::new(tiny_offset),
            layer_table_offset: U32LE::new(table_offset),
            layer_table_count: U32LE::new(count as u32),
            ..ctb::common_header(Magic::Cbddlp, self.version, properties)
        };
        if self.version >= 2 {
            header.ext_config_offset = U32LE::new(ext_offset);
            header.ext_config_size = U32LE::new(size_of::<ExtConfig>() as u32);
            header.level_set_count = U32LE::new(self.levels);
            file.put(ext_offset, ctb::ext_config(properties, bits_on).as_bytes());
        } else {
            // Version 1 has no PWM control.
            header.pwm_level = Default::default();
            header.bot_pwm_level = Default::default();
            let lossy = |e: &crate::Exposure| e.light_pwm != 255;
            if lossy(&properties.exposure) || lossy(&properties.bottom.exposure) {
                log::warn!("{}: version 1 can't store light PWM, dropping it", self.name);
            }
        }

        file.put(0, header.as_bytes());
        if let Some(p) = huge {
            p.put(&mut file, huge_offset);
        }
        if let Some(p) = tiny {
            p.put(&mut file, tiny_offset);
        }

        let hits = file.dedup_hits();
        let written = file.finish(sink)?;
        log::info!(
            "{} v{}: wrote {} layers x {} planes in {} bytes ({} deduplicated)",
            self.name,
            self.version,
            count,
            self.levels,
            written,
            hits
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Print, Properties, Size};
    use crate::LayerHeader;
    use image::{GrayImage, Luma};

    fn sample(layers: u32) -> Print {
        let properties = Properties {
            size: Size {
                resolution: [16, 4],
                bed_mm: [8., 2.],
                layers,
                layer_height_mm: 0.1,
            },
            ..Properties::default()
        };
        let mut print = Print::empty(properties);
        for layer in print.layers_mut() {
            layer.mask = GrayImage::from_fn(16, 4, |x, _| Luma([(x * 16) as u8]));
        }
        print
    }

    #[test]
    fn plane_entries_are_grouped_by_plane() {
        let options = Options {
            anti_alias: Some(4),
            ..Options::default()
        };
        let cbddlp = Cbddlp::new(Kind::Cbddlp, &options).unwrap();
        let mut out = vec![];
        cbddlp.encode(&sample(2), &mut out).unwrap();

        let header = input::parse_type::<CtbHeader>(&out, 0).unwrap();
        assert_eq!(header.version.get(), 2);
        assert_eq!(header.level_set_count.get(), 4);
        assert_eq!(header.layer_table_count.get(), 2);
        let table = input::parse_slice::<LayerHeader>(
            &out,
            header.layer_table_offset.get(),
            8,
        )
        .unwrap();
        // Both layers are identical, so each plane is stored once and shared.
        for k in 0..4 {
            assert_eq!(
                table[k * 2].data_offset.get(),
                table[k * 2 + 1].data_offset.get()
            );
            assert_eq!(table[k * 2].data_offset.get() % 4, 0);
        }
        assert_ne!(table[0].data_offset.get(), table[2].data_offset.get());

        let decoded = cbddlp.decode(out).unwrap();
        let layer = decoded.layer(1).unwrap();
        // Four planes, at thresholds 255, 63, 127 and 191.
        assert_eq!(layer.mask.get_pixel(0, 0)[0], 0);
        assert_eq!(layer.mask.get_pixel(4, 0)[0], 63);
        assert_eq!(layer.mask.get_pixel(15, 3)[0], 191);
    }

    #[test]
    fn photon_is_version_one() {
        let photon = Cbddlp::new(Kind::Photon, &Options::default()).unwrap();
        assert_eq!(photon.name(), "photon");
        let mut out = vec![];
        photon.encode(&sample(3), &mut out).unwrap();
        assert_eq!(super::super::Kind::detect(&out), Some(Kind::Photon));

        let header = input::parse_type::<CtbHeader>(&out, 0).unwrap();
        assert_eq!(header.ext_config_offset.get(), 0);
        assert_eq!(header.level_set_count.get(), 1);

        let decoded = photon.decode(out).unwrap();
        assert_eq!(decoded.layer_count(), 3);
        let mask = decoded.layer(0).unwrap().mask;
        assert!(mask.pixels().all(|p| p[0] == 0 || p[0] == 255));
        // Without an ext config block, motion settings fall back to defaults.
        assert_eq!(
            decoded.properties().exposure.lift_speed_mmpm,
            super::super::DEFAULT_LIFT_SPEED_MMPM
        );
    }

    #[test]
    fn version_one_rejects_antialiasing() {
        let options = Options {
            anti_alias: Some(2),
            ..Options::default()
        };
        assert!(Cbddlp::new(Kind::Photon, &options).is_err());
        let options = Options {
            version: Some(1),
            anti_alias: Some(8),
            ..Options::default()
        };
        assert!(Cbddlp::new(Kind::Cbddlp, &options).is_err());
    }
}
