//! Format-independent description of a print.
//!
//! Every format adapter decodes into, and encodes from, the `Printable` trait.
//! The header fields each format happens to store are mapped onto
//! `Properties`; layer masks are always 8-bit grayscale, whatever the format's
//! native depth.

use std::collections::BTreeMap;
use std::time::Duration;

use image::{GrayImage, RgbImage};

use crate::error::{Error, Result};

/// Metadata key holding the machine name, in formats that record one.
pub const MACHINE_KEY: &str = "Machine";

/// Machine name written when the input doesn't provide one.
pub const DEFAULT_MACHINE: &str = "default";

/// Converts a seconds field from a file into a `Duration`. Negative and
/// non-finite values, which turn up in damaged files, become zero.
pub fn secs(s: f32) -> Duration {
    Duration::try_from_secs_f32(s).unwrap_or_default()
}

fn secs_f64(s: f64) -> Duration {
    Duration::try_from_secs_f64(s).unwrap_or_default()
}

/// Printable area and layer geometry.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Size {
    /// Mask resolution in pixels, `[x, y]`.
    pub resolution: [u32; 2],
    /// Printable area in mm, `[x, y]`.
    pub bed_mm: [f32; 2],
    /// Number of printed layers.
    pub layers: u32,
    /// Nominal layer height in mm.
    pub layer_height_mm: f32,
}

impl Size {
    /// Number of pixels in one layer mask.
    pub fn pixels(&self) -> usize {
        self.resolution[0] as usize * self.resolution[1] as usize
    }
}

/// Settings for exposing one layer and moving on to the next.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Exposure {
    pub light_on: Duration,
    pub light_off: Duration,
    /// Backlight intensity, 0-255.
    pub light_pwm: u8,
    pub lift_height_mm: f32,
    pub lift_speed_mmpm: f32,
    pub retract_height_mm: f32,
    pub retract_speed_mmpm: f32,
}

impl Default for Exposure {
    fn default() -> Self {
        Self {
            light_on: Duration::default(),
            light_off: Duration::default(),
            light_pwm: 255,
            lift_height_mm: 0.,
            lift_speed_mmpm: 0.,
            retract_height_mm: 0.,
            retract_speed_mmpm: 0.,
        }
    }
}

impl Exposure {
    /// Total time spent on one layer: light on, light off, and platform
    /// motion. The platform lifts at the lift speed, then covers the lift plus
    /// twice the retract height at the retract speed on the way back, the
    /// same estimate the printers' slicers report. Zero speeds contribute no
    /// motion time.
    pub fn duration(&self) -> Duration {
        fn travel(mm: f32, mmpm: f32) -> Duration {
            if mmpm > 0. {
                secs_f64(f64::from(mm) * 60. / f64::from(mmpm))
            } else {
                Duration::default()
            }
        }
        self.light_on
            + self.light_off
            + travel(self.lift_height_mm, self.lift_speed_mmpm)
            + travel(
                self.lift_height_mm + 2. * self.retract_height_mm,
                self.retract_speed_mmpm,
            )
    }

    /// Blends every setting linearly from `self` (at `scale == 0`) toward
    /// `target` (at `scale == 1`).
    pub fn interpolate(&self, target: &Exposure, scale: f32) -> Exposure {
        let s = f64::from(scale);
        let dur = |a: Duration, b: Duration| {
            let a = a.as_secs_f64();
            secs_f64(a + (b.as_secs_f64() - a) * s)
        };
        let lerp = |a: f32, b: f32| a + (b - a) * scale;
        Exposure {
            light_on: dur(self.light_on, target.light_on),
            light_off: dur(self.light_off, target.light_off),
            light_pwm: lerp(f32::from(self.light_pwm), f32::from(target.light_pwm))
                .round()
                .max(0.)
                .min(255.) as u8,
            lift_height_mm: lerp(self.lift_height_mm, target.lift_height_mm),
            lift_speed_mmpm: lerp(self.lift_speed_mmpm, target.lift_speed_mmpm),
            retract_height_mm: lerp(
                self.retract_height_mm,
                target.retract_height_mm,
            ),
            retract_speed_mmpm: lerp(
                self.retract_speed_mmpm,
                target.retract_speed_mmpm,
            ),
        }
    }
}

/// How bottom layers give way to normal ones.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BottomStyle {
    /// Switch abruptly to the normal exposure after the last bottom layer.
    Slow,
    /// Blend linearly from bottom exposure to normal exposure.
    Fade,
}

impl Default for BottomStyle {
    fn default() -> Self {
        BottomStyle::Slow
    }
}

/// Settings for the first few layers, which stick the print to the platform.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Bottom {
    pub exposure: Exposure,
    pub count: u32,
    pub style: BottomStyle,
}

/// The two preview thumbnails most formats carry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum PreviewKind {
    Tiny,
    Huge,
}

/// Everything about a print except the layer masks.
#[derive(Clone, Debug, Default)]
pub struct Properties {
    pub size: Size,
    pub exposure: Exposure,
    pub bottom: Bottom,
    pub previews: BTreeMap<PreviewKind, RgbImage>,
    /// Free-form string metadata. See `MACHINE_KEY`.
    pub metadata: BTreeMap<String, String>,
}

impl Properties {
    /// Exposure settings for layer `index`, before any per-layer override.
    pub fn layer_exposure(&self, index: u32) -> Exposure {
        let bottom = &self.bottom;
        if index >= bottom.count {
            return self.exposure;
        }
        match bottom.style {
            BottomStyle::Slow => bottom.exposure,
            BottomStyle::Fade => bottom
                .exposure
                .interpolate(&self.exposure, index as f32 / bottom.count as f32),
        }
    }

    /// Estimated time to print every layer.
    pub fn duration(&self) -> Duration {
        let bottom_count = self.bottom.count.min(self.size.layers);
        let rest = self.size.layers - bottom_count;
        self.bottom.exposure.duration() * bottom_count
            + self.exposure.duration() * rest
    }

    /// The machine name, or `DEFAULT_MACHINE`.
    pub fn machine(&self) -> &str {
        self.metadata
            .get(MACHINE_KEY)
            .map(String::as_str)
            .unwrap_or(DEFAULT_MACHINE)
    }
}

/// One printed layer.
#[derive(Clone, Debug)]
pub struct Layer {
    /// Height of the build platform above the vat, in mm.
    pub z_mm: f32,
    pub exposure: Exposure,
    pub mask: GrayImage,
}

/// Anything that can be written out as a print file.
///
/// Implementations are immutable once constructed. Layers are produced on
/// request, which lets decoders defer decompression until a layer is actually
/// needed. The `Sync` bound lets encoders fetch layers from several threads.
pub trait Printable: Sync {
    fn properties(&self) -> &Properties;

    /// Produces layer `index`, which must be less than `layer_count()`.
    fn layer(&self, index: u32) -> Result<Layer>;

    fn layer_count(&self) -> u32 {
        self.properties().size.layers
    }
}

/// An in-memory print.
#[derive(Clone, Debug)]
pub struct Print {
    properties: Properties,
    layers: Vec<Layer>,
}

impl Print {
    /// Wraps up a set of layers. The layer count in `properties` is updated to
    /// match.
    pub fn new(mut properties: Properties, layers: Vec<Layer>) -> Self {
        properties.size.layers = layers.len() as u32;
        Self { properties, layers }
    }

    /// Creates a print with blank layers, evenly spaced at the nominal layer
    /// height and exposed per `Properties::layer_exposure`.
    pub fn empty(properties: Properties) -> Self {
        let [w, h] = properties.size.resolution;
        let layers = (0..properties.size.layers)
            .map(|i| Layer {
                z_mm: (i + 1) as f32 * properties.size.layer_height_mm,
                exposure: properties.layer_exposure(i),
                mask: GrayImage::new(w, h),
            })
            .collect();
        Self { properties, layers }
    }

    /// Mutable access to the layers, for building up test prints.
    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }
}

impl Printable for Print {
    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn layer(&self, index: u32) -> Result<Layer> {
        self.layers.get(index as usize).cloned().ok_or_else(|| {
            Error::invalid(format!(
                "layer {} requested from a {}-layer print",
                index,
                self.layers.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposure(on: f32) -> Exposure {
        Exposure {
            light_on: secs(on),
            light_off: secs(1.),
            lift_height_mm: 5.,
            lift_speed_mmpm: 60.,
            retract_height_mm: 2.5,
            retract_speed_mmpm: 300.,
            ..Exposure::default()
        }
    }

    fn properties() -> Properties {
        Properties {
            size: Size {
                resolution: [4, 3],
                bed_mm: [1., 1.],
                layers: 10,
                layer_height_mm: 0.05,
            },
            exposure: exposure(2.),
            bottom: Bottom {
                exposure: exposure(12.),
                count: 4,
                style: BottomStyle::Slow,
            },
            ..Properties::default()
        }
    }

    #[test]
    fn secs_rejects_garbage() {
        assert_eq!(secs(-1.), Duration::default());
        assert_eq!(secs(f32::NAN), Duration::default());
        assert_eq!(secs(2.5), Duration::from_millis(2500));
    }

    #[test]
    fn exposure_duration() {
        // 2s + 1s + 5mm at 60mm/min (5s) + (5 + 2 * 2.5)mm at 300mm/min (2s)
        assert_eq!(exposure(2.).duration(), Duration::from_secs(10));

        let no_retract = Exposure {
            retract_height_mm: 0.,
            ..exposure(2.)
        };
        assert_eq!(no_retract.duration(), Duration::from_secs(9));

        let still = Exposure {
            light_on: secs(3.),
            ..Exposure::default()
        };
        assert_eq!(still.duration(), Duration::from_secs(3));
    }

    #[test]
    fn interpolate_endpoints() {
        let a = exposure(12.);
        let b = Exposure {
            light_pwm: 55,
            ..exposure(2.)
        };
        assert_eq!(a.interpolate(&b, 0.), a);
        assert_eq!(a.interpolate(&b, 1.), b);
        let mid = a.interpolate(&b, 0.5);
        assert_eq!(mid.light_on, Duration::from_secs(7));
        assert_eq!(mid.light_pwm, 155);
    }

    #[test]
    fn layer_exposure_slow() {
        let p = properties();
        assert_eq!(p.layer_exposure(3).light_on, Duration::from_secs(12));
        assert_eq!(p.layer_exposure(4).light_on, Duration::from_secs(2));
    }

    #[test]
    fn layer_exposure_fade() {
        let mut p = properties();
        p.bottom.style = BottomStyle::Fade;
        assert_eq!(p.layer_exposure(0).light_on, Duration::from_secs(12));
        assert_eq!(p.layer_exposure(2).light_on, Duration::from_secs(7));
        assert_eq!(p.layer_exposure(4).light_on, Duration::from_secs(2));
    }

    #[test]
    fn total_duration() {
        let p = properties();
        // 4 bottom layers at 20s, 6 normal layers at 10s
        assert_eq!(p.duration(), Duration::from_secs(4 * 20 + 6 * 10));
    }

    #[test]
    fn empty_print() {
        let print = Print::empty(properties());
        assert_eq!(print.layer_count(), 10);
        let layer = print.layer(1).unwrap();
        assert!((layer.z_mm - 0.1).abs() < 1e-6);
        assert_eq!(layer.mask.dimensions(), (4, 3));
        assert!(layer.mask.pixels().all(|p| p[0] == 0));
        assert!(print.layer(10).is_err());
    }

    #[test]
    fn machine_default() {
        let mut p = properties();
        assert_eq!(p.machine(), DEFAULT_MACHINE);
        p.metadata.insert(MACHINE_KEY.into(), "Mars".into());
        assert_eq!(p.machine(), "Mars");
    }
}
