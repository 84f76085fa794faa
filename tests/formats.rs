//! Whole-file round trips through every supported format.

use std::io::{Read, Seek, SeekFrom};

use image::{GrayImage, Luma, Rgb, RgbImage};
use uvslice::model::secs;
use uvslice::{
    Bottom, Exposure, Kind, Options, PreviewKind, Print, Printable, Properties,
    Size,
};

fn sample(layers: u32) -> Print {
    let exposure = Exposure {
        light_on: secs(2.5),
        light_off: secs(1.),
        lift_height_mm: 5.,
        lift_speed_mmpm: 60.,
        retract_height_mm: 6.,
        retract_speed_mmpm: 180.,
        ..Exposure::default()
    };
    let mut properties = Properties {
        size: Size {
            resolution: [64, 32],
            bed_mm: [32., 16.],
            layers,
            layer_height_mm: 0.05,
        },
        exposure,
        bottom: Bottom {
            exposure: Exposure {
                light_on: secs(30.),
                ..exposure
            },
            count: 2,
            ..Bottom::default()
        },
        ..Properties::default()
    };
    properties.previews.insert(
        PreviewKind::Tiny,
        RgbImage::from_fn(224, 168, |x, _| {
            if x < 112 {
                Rgb([0xff, 0, 0])
            } else {
                Rgb([0, 0, 0xff])
            }
        }),
    );
    properties
        .previews
        .insert(PreviewKind::Huge, RgbImage::from_pixel(400, 300, Rgb([0, 0xff, 0])));

    let mut print = Print::empty(properties);
    for (i, layer) in print.layers_mut().iter_mut().enumerate() {
        // A growing square, so that no two layers match.
        let edge = 4 + 2 * i as u32;
        layer.mask = GrayImage::from_fn(64, 32, |x, y| {
            Luma([if x < edge && y < edge { 0xff } else { 0 }])
        });
    }
    print
}

fn write_read(kind: Kind, options: &Options, print: &Print) -> Box<dyn Printable> {
    let writer = kind.formatter(options).unwrap();
    let mut file = tempfile::tempfile().unwrap();
    writer.encode(print, &mut file).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut data = vec![];
    file.read_to_end(&mut data).unwrap();
    assert!(data.len() > writer.header_size());

    let reader = kind.formatter(&Options::default()).unwrap();
    reader.decode(data).unwrap()
}

const ALL: &[Kind] = &[
    Kind::Ctb,
    Kind::Cbddlp,
    Kind::Photon,
    Kind::Phz,
    Kind::Fdg,
    Kind::Pws,
    Kind::Pw0,
    Kind::Lgs,
    Kind::Lgs30,
];

#[test]
fn bilevel_masks_survive_every_format() {
    let print = sample(5);
    for &kind in ALL {
        let decoded = write_read(kind, &Options::default(), &print);
        let props = decoded.properties();
        assert_eq!(props.size.resolution, [64, 32], "{:?}", kind);
        assert_eq!(decoded.layer_count(), 5, "{:?}", kind);
        assert_eq!(props.bottom.count, 2, "{:?}", kind);
        assert_eq!(props.exposure.light_on, secs(2.5), "{:?}", kind);
        assert!(
            (props.size.bed_mm[0] - 32.).abs() < 1e-3,
            "{:?}: bed {:?}",
            kind,
            props.size.bed_mm
        );

        for i in 0..5 {
            let original = print.layer(i).unwrap();
            let layer = decoded.layer(i).unwrap();
            assert_eq!(layer.mask, original.mask, "{:?} layer {}", kind, i);
            assert!(
                (layer.z_mm - original.z_mm).abs() < 1e-4,
                "{:?} layer {}: z {} != {}",
                kind,
                i,
                layer.z_mm,
                original.z_mm
            );
            assert_eq!(layer.exposure.light_on, original.exposure.light_on);
        }
    }
}

#[test]
fn previews_survive() {
    let print = sample(1);
    for &kind in ALL {
        let decoded = write_read(kind, &Options::default(), &print);
        let tiny = &decoded.properties().previews[&PreviewKind::Tiny];
        assert_eq!(tiny.dimensions(), (224, 168), "{:?}", kind);
        assert_eq!(tiny.get_pixel(0, 0), &Rgb([0xff, 0, 0]), "{:?}", kind);
        assert_eq!(tiny.get_pixel(223, 167), &Rgb([0, 0, 0xff]), "{:?}", kind);
    }
}

#[test]
fn scrambled_formats_round_trip() {
    let print = sample(3);
    for &kind in &[Kind::Ctb, Kind::Phz, Kind::Fdg] {
        for &seed in &[None, Some(0), Some(0xdcbe_9950)] {
            let options = Options {
                encryption_seed: seed,
                ..Options::default()
            };
            let decoded = write_read(kind, &options, &print);
            for i in 0..3 {
                assert_eq!(
                    decoded.layer(i).unwrap().mask,
                    print.layer(i).unwrap().mask,
                    "{:?} seed {:?}",
                    kind,
                    seed
                );
            }
        }
    }
}

#[test]
fn antialiased_formats_keep_gray_levels() {
    let mut print = sample(2);
    for layer in print.layers_mut() {
        layer.mask = GrayImage::from_fn(64, 32, |x, _| Luma([(x * 4 + 3) as u8]));
    }
    for &kind in &[Kind::Cbddlp, Kind::Pws] {
        for &levels in &[2, 4, 8] {
            let options = Options {
                anti_alias: Some(levels),
                ..Options::default()
            };
            let decoded = write_read(kind, &options, &print);
            let mask = decoded.layer(1).unwrap().mask;
            let mut seen: Vec<u8> = mask.pixels().map(|p| p[0]).collect();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len() as u32, levels + 1, "{:?} x{}", kind, levels);
            assert_eq!(seen[0], 0);
        }
    }
}

#[test]
fn versions() {
    let print = sample(2);
    for &(kind, version) in &[
        (Kind::Ctb, 2),
        (Kind::Ctb, 3),
        (Kind::Fdg, 2),
        (Kind::Fdg, 3),
        (Kind::Cbddlp, 1),
    ] {
        let options = Options {
            version: Some(version),
            ..Options::default()
        };
        let decoded = write_read(kind, &options, &print);
        assert_eq!(
            decoded.layer(1).unwrap().mask,
            print.layer(1).unwrap().mask,
            "{:?} v{}",
            kind,
            version
        );
    }
    let options = Options {
        version: Some(7),
        ..Options::default()
    };
    for &kind in ALL {
        assert!(kind.formatter(&options).is_err(), "{:?}", kind);
    }
}

#[test]
fn written_files_are_detected() {
    let print = sample(1);
    for &kind in ALL {
        let mut out = vec![];
        kind.formatter(&Options::default())
            .unwrap()
            .encode(&print, &mut out)
            .unwrap();
        let expected = if kind == Kind::Pw0 { Kind::Pws } else { kind };
        assert_eq!(Kind::detect(&out), Some(expected));
    }
}

#[test]
fn wrong_decoder_is_a_format_mismatch() {
    let print = sample(1);
    let mut out = vec![];
    Kind::Phz
        .formatter(&Options::default())
        .unwrap()
        .encode(&print, &mut out)
        .unwrap();
    for &kind in &[Kind::Ctb, Kind::Fdg, Kind::Pws] {
        let err = kind
            .formatter(&Options::default())
            .unwrap()
            .decode(out.clone())
            .err()
            .unwrap();
        assert!(
            matches!(err, uvslice::Error::FormatMismatch { .. }),
            "{:?}: {}",
            kind,
            err
        );
    }
}

#[test]
fn truncated_files_are_rejected() {
    let print = sample(3);
    for &kind in ALL {
        let mut out = vec![];
        let format = kind.formatter(&Options::default()).unwrap();
        format.encode(&print, &mut out).unwrap();
        out.truncate(out.len() - 8);
        let result = format
            .decode(out)
            .and_then(|p| (0..p.layer_count()).try_for_each(|i| p.layer(i).map(drop)));
        assert!(result.is_err(), "{:?}", kind);
    }
}
