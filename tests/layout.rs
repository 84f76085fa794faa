//! Byte-level properties of encoded files: known vectors, deduplication and
//! alignment.

use image::{GrayImage, Luma};
use uvslice::codec::{SliceCodec, SliceEncoding};
use uvslice::crypto::{Cipher, KeyStream, Schedule};
use uvslice::format::ctb::CtbHeader;
use uvslice::format::fdg::FdgHeader;
use uvslice::{
    input, ImageInfo, Kind, LayerHeader, Options, Print, Printable, Properties,
    Size,
};

#[test]
fn bilevel_rows() {
    let mask = GrayImage::from_fn(8, 2, |_, y| Luma([if y == 0 { 0 } else { 0xff }]));
    for &encoding in &[SliceEncoding::Planes { levels: 1 }, SliceEncoding::Rle1 { levels: 1 }] {
        let codec = SliceCodec::new(encoding, None);
        let slice = codec.encode(&mask, 0);
        assert_eq!(slice.payloads, vec![vec![0x08, 0x88]]);
        assert_eq!(slice.bits_on, 8);

        let decoded = codec.decode(&[&[0x08, 0x88][..]], 0, [8, 2]).unwrap();
        assert_eq!(decoded, mask);
    }
}

#[test]
fn cipher_vectors() {
    let cases = [
        (Schedule::Ctb, 0x4d6c_45e3, 0xa2bb_7353),
        (Schedule::Fdg, 0x9b8d_06bc, 0x4749_bbec),
        (Schedule::Phz, 0xe701_2f20, 0xafa1_abc0),
    ];
    for &(schedule, increment, key) in &cases {
        let ks = KeyStream::new(schedule, 0xdcbe_9950, 20);
        assert_eq!(ks.increment(), increment, "{:?}", schedule);
        assert_eq!(ks.key(), key, "{:?}", schedule);

        let cipher = Cipher::for_seed(schedule, 0xdcbe_9950).unwrap();
        let mut data = [0u8; 4];
        cipher.apply(20, &mut data);
        assert_eq!(u32::from_le_bytes(data), key);
    }
}

fn print_with(masks: Vec<GrayImage>) -> Print {
    let properties = Properties {
        size: Size {
            resolution: [32, 16],
            bed_mm: [16., 8.],
            layers: masks.len() as u32,
            layer_height_mm: 0.05,
        },
        ..Properties::default()
    };
    let mut print = Print::empty(properties);
    for (layer, mask) in print.layers_mut().iter_mut().zip(masks) {
        layer.mask = mask;
    }
    print
}

fn stripe(width: u32) -> GrayImage {
    GrayImage::from_fn(32, 16, |x, _| Luma([if x < width { 0xff } else { 0 }]))
}

fn encode(kind: Kind, options: &Options, print: &dyn Printable) -> Vec<u8> {
    let mut out = vec![];
    kind.formatter(options)
        .unwrap()
        .encode(print, &mut out)
        .unwrap();
    out
}

fn layer_table(kind: Kind, data: &[u8]) -> Vec<LayerHeader> {
    let (offset, count) = if kind == Kind::Fdg {
        let header = input::parse_type::<FdgHeader>(data, 0).unwrap();
        (header.layer_table_offset.get(), header.layer_table_count.get())
    } else {
        let header = input::parse_type::<CtbHeader>(data, 0).unwrap();
        (header.layer_table_offset.get(), header.layer_table_count.get())
    };
    input::parse_slice::<LayerHeader>(data, offset, count)
        .unwrap()
        .to_vec()
}

fn unscrambled(version: u32) -> Options {
    Options {
        version: Some(version),
        encryption_seed: Some(0),
        ..Options::default()
    }
}

#[test]
fn repeated_layers_share_storage() {
    let print = print_with(vec![stripe(3), stripe(17), stripe(3)]);
    let cases = [(Kind::Ctb, 2), (Kind::Ctb, 3), (Kind::Fdg, 2), (Kind::Fdg, 3)];
    for &(kind, version) in &cases {
        let data = encode(kind, &unscrambled(version), &print);
        let table = layer_table(kind, &data);
        assert_eq!(table.len(), 3);
        assert_eq!(
            table[0].data_offset.get(),
            table[2].data_offset.get(),
            "{:?} v{}",
            kind,
            version
        );
        assert_ne!(table[0].data_offset.get(), table[1].data_offset.get());
        assert_eq!(table[0].data_len.get(), table[2].data_len.get());
        if kind == Kind::Ctb {
            for entry in &table {
                assert_eq!(entry.data_offset.get() % 4, 0);
            }
        }

        // The shared copy decodes to both layers.
        let decoded = kind
            .formatter(&Options::default())
            .unwrap()
            .decode(data)
            .unwrap();
        assert_eq!(decoded.layer(2).unwrap().mask, stripe(3));
        assert_eq!(decoded.layer(1).unwrap().mask, stripe(17));
    }
}

#[test]
fn shared_payload_keeps_one_info_record() {
    let print = print_with(vec![stripe(3), stripe(17), stripe(3)]);
    for &kind in &[Kind::Ctb, Kind::Fdg] {
        let data = encode(kind, &unscrambled(3), &print);
        for entry in layer_table(kind, &data) {
            assert_eq!(entry.info_size.get(), 0x54);
            let info = input::parse_type::<ImageInfo>(
                &data,
                entry.data_offset.get() - 0x54,
            )
            .unwrap();
            assert_eq!(info.layer.data_offset.get(), entry.data_offset.get());
            assert_eq!(info.total_size.get(), 0x54 + entry.data_len.get());
        }
    }
}

#[test]
fn scrambled_layers_are_not_shared() {
    // Each layer has its own key stream, so identical masks encode
    // differently.
    let print = print_with(vec![stripe(3), stripe(3)]);
    let options = Options {
        encryption_seed: Some(0x1234_5678),
        ..Options::default()
    };
    let table = layer_table(Kind::Ctb, &encode(Kind::Ctb, &options, &print));
    assert_ne!(table[0].data_offset.get(), table[1].data_offset.get());
}

#[test]
fn deduplication_shrinks_files() {
    let same = print_with(vec![stripe(5); 6]);
    let different = print_with((0..6).map(|i| stripe(5 + i)).collect());
    let cases = [
        (Kind::Ctb, Some(2)),
        (Kind::Ctb, Some(3)),
        (Kind::Fdg, Some(2)),
        (Kind::Fdg, Some(3)),
        (Kind::Cbddlp, None),
        (Kind::Phz, None),
        (Kind::Pws, None),
        (Kind::Pw0, None),
    ];
    for &(kind, version) in &cases {
        let options = Options {
            version,
            encryption_seed: match kind {
                Kind::Ctb | Kind::Fdg => Some(0),
                _ => None,
            },
            ..Options::default()
        };
        let small = encode(kind, &options, &same);
        let large = encode(kind, &options, &different);
        assert!(small.len() < large.len(), "{:?} {:?}", kind, version);
    }
}

#[test]
fn encoding_is_deterministic() {
    let print = print_with(vec![stripe(1), stripe(9), stripe(1), stripe(30)]);
    let options = Options {
        encryption_seed: Some(0xdcbe_9950),
        ..Options::default()
    };
    for &kind in &[Kind::Ctb, Kind::Cbddlp, Kind::Phz, Kind::Pws] {
        let first = encode(kind, &options, &print);
        let again = encode(kind, &options, &print);
        assert_eq!(first, again, "{:?}", kind);
    }
}

#[test]
fn cbddlp_offsets_are_aligned() {
    let print = print_with(vec![stripe(2), stripe(7), stripe(2)]);
    let options = Options {
        anti_alias: Some(2),
        ..Options::default()
    };
    let data = encode(Kind::Cbddlp, &options, &print);
    let header = input::parse_type::<CtbHeader>(&data, 0).unwrap();
    assert_eq!(header.large_preview_offset.get(), 0);
    let table = input::parse_slice::<LayerHeader>(
        &data,
        header.layer_table_offset.get(),
        header.layer_table_count.get() * 2,
    )
    .unwrap();
    for entry in table {
        assert_eq!(entry.data_offset.get() % 4, 0);
    }
    assert_eq!(table[0].data_offset.get(), table[2].data_offset.get());
}
