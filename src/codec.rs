//! Whole-image encoding and decoding.
//!
//! The `rle` module works a run at a time and knows nothing about image
//! geometry or scrambling. This module takes it from there: a `SliceCodec`
//! turns a grayscale layer mask into the exact bytes a format stores for it
//! (and back), and the preview functions do the same for RGB thumbnails.

use byteorder::{BigEndian, ByteOrder};
use image::{GrayImage, Rgb, RgbImage};

use crate::crypto::Cipher;
use crate::rle::{self, RleError, Run12};

/// Layer compression schemes. See the `rle` module for the gory details.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SliceEncoding {
    /// Variable-length 7-bit runs (`ctb`, `fdg`).
    Rle7,
    /// Literal-and-repeat 7-bit runs, split at each half scanline (`phz`).
    Rle7a,
    /// Bit planes stored as separate payloads (`cbddlp`).
    Planes { levels: u32 },
    /// Bit planes concatenated into one payload (`pws`).
    Rle1 { levels: u32 },
    /// 4-bit runs with a trailing checksum (`pw0`).
    Rle4,
    /// 4-bit runs with nibble-spelled lengths (`lgs`).
    Rle4n,
}

/// The encoded form of one layer.
#[derive(Clone, Debug, Default)]
pub struct EncodedSlice {
    /// Payloads as stored in the file. This has one entry per bit plane for
    /// `Planes`, and exactly one entry otherwise.
    pub payloads: Vec<Vec<u8>>,
    /// Number of pixels that will be lit, for resin estimates. For bit planes
    /// this is the average across planes.
    pub bits_on: u64,
}

/// Encodes and decodes the layers of one file.
#[derive(Copy, Clone, Debug)]
pub struct SliceCodec {
    pub encoding: SliceEncoding,
    /// Layer scrambling, if the file uses it.
    pub cipher: Option<Cipher>,
}

impl SliceCodec {
    pub fn new(encoding: SliceEncoding, cipher: Option<Cipher>) -> Self {
        Self { encoding, cipher }
    }

    /// Encodes `mask` as layer number `index`.
    pub fn encode(&self, mask: &GrayImage, index: u32) -> EncodedSlice {
        let pixels = mask.as_raw();
        let mut out = vec![];
        let mut slice = match self.encoding {
            SliceEncoding::Rle7 => {
                let bits_on = encode_rle7_slice(pixels, &mut out);
                EncodedSlice {
                    payloads: vec![out],
                    bits_on,
                }
            }
            SliceEncoding::Rle7a => {
                let bits_on = encode_rle7a_slice(pixels, mask.width(), &mut out);
                EncodedSlice {
                    payloads: vec![out],
                    bits_on,
                }
            }
            SliceEncoding::Planes { levels } => {
                let mut bits_on = 0;
                let payloads = (0..levels)
                    .map(|level| {
                        let mut plane = vec![];
                        bits_on += rle::encode_rle1_plane(
                            pixels,
                            rle::plane_threshold(level, levels),
                            &mut plane,
                        );
                        plane
                    })
                    .collect();
                EncodedSlice {
                    payloads,
                    bits_on: bits_on / u64::from(levels),
                }
            }
            SliceEncoding::Rle1 { levels } => {
                let mut bits_on = 0;
                for level in 0..levels {
                    bits_on += rle::encode_rle1_plane(
                        pixels,
                        rle::plane_threshold(level, levels),
                        &mut out,
                    );
                }
                EncodedSlice {
                    payloads: vec![out],
                    bits_on: bits_on / u64::from(levels),
                }
            }
            SliceEncoding::Rle4 => {
                let bits_on = encode_rle4_slice(pixels, &mut out);
                EncodedSlice {
                    payloads: vec![out],
                    bits_on,
                }
            }
            SliceEncoding::Rle4n => {
                let bits_on = encode_rle4n_slice(pixels, &mut out);
                EncodedSlice {
                    payloads: vec![out],
                    bits_on,
                }
            }
        };

        if let Some(cipher) = &self.cipher {
            for payload in &mut slice.payloads {
                cipher.apply(index, payload);
            }
        }
        slice
    }

    /// Decodes layer number `index` from its stored payloads. The decoded
    /// image must cover `resolution` exactly.
    pub fn decode(
        &self,
        payloads: &[&[u8]],
        index: u32,
        resolution: [u32; 2],
    ) -> Result<GrayImage, RleError> {
        let [width, height] = resolution;
        let mut pixels = vec![0u8; pixel_count(width, height)?];

        match self.encoding {
            SliceEncoding::Planes { levels } => {
                for plane in payloads {
                    let data = self.unscramble(plane, index);
                    let rest = rle::decode_rle1_plane(&data, &mut pixels)?;
                    if !rest.is_empty() {
                        return Err(RleError::ExtraData);
                    }
                }
                rle::levels_from_counts(&mut pixels, levels);
            }
            SliceEncoding::Rle1 { levels } => {
                let data = self.unscramble(&payloads.concat(), index);
                let mut rest = &data[..];
                for _ in 0..levels {
                    rest = rle::decode_rle1_plane(rest, &mut pixels)?;
                }
                if !rest.is_empty() {
                    return Err(RleError::ExtraData);
                }
                rle::levels_from_counts(&mut pixels, levels);
            }
            SliceEncoding::Rle7 => {
                let data = self.unscramble(&payloads.concat(), index);
                let mut cursor = data.iter().cloned();
                let mut runs = std::iter::from_fn(|| {
                    rle::decode_rle7(&mut cursor).transpose()
                });
                fill(&mut pixels, &mut runs)?;
            }
            SliceEncoding::Rle7a => {
                let data = self.unscramble(&payloads.concat(), index);
                let mut runs = rle::decode_rle7a(data.iter().cloned());
                fill(&mut pixels, &mut runs)?;
            }
            SliceEncoding::Rle4 => {
                let data = self.unscramble(&payloads.concat(), index);
                decode_rle4_slice(&data, &mut pixels)?;
            }
            SliceEncoding::Rle4n => {
                let data = self.unscramble(&payloads.concat(), index);
                let mut runs = rle::decode_rle4n(data.iter().cloned());
                fill(&mut pixels, &mut runs)?;
            }
        }

        GrayImage::from_raw(width, height, pixels).ok_or(RleError::TooFewPixels)
    }

    fn unscramble(&self, data: &[u8], index: u32) -> Vec<u8> {
        let mut data = data.to_vec();
        if let Some(cipher) = &self.cipher {
            cipher.apply(index, &mut data);
        }
        data
    }
}

/// Largest image we are willing to allocate for, in pixels. The biggest
/// masks in use are around 15360x8640.
pub const MAX_PIXELS: u64 = 1 << 30;

/// Number of pixels in a `width` x `height` image, refusing sizes over
/// `MAX_PIXELS`.
pub fn pixel_count(width: u32, height: u32) -> Result<usize, RleError> {
    let count = u64::from(width) * u64::from(height);
    if count > MAX_PIXELS {
        return Err(RleError::TooLarge { width, height });
    }
    Ok(count as usize)
}

/// Writes runs into `pixels` in order, requiring that they cover it exactly.
fn fill(
    pixels: &mut [u8],
    runs: &mut impl Iterator<Item = Result<rle::Run, RleError>>,
) -> Result<(), RleError> {
    let mut n = 0;
    for run in runs {
        let (level, len) = run?;
        let end = n + len;
        if end > pixels.len() {
            return Err(RleError::TooManyPixels);
        }
        for p in &mut pixels[n..end] {
            *p = level;
        }
        n = end;
    }
    if n != pixels.len() {
        return Err(RleError::TooFewPixels);
    }
    Ok(())
}

/// Encodes 8bpp pixels in RLE7, returning the count of lit pixels.
pub fn encode_rle7_slice(pixels: &[u8], out: &mut Vec<u8>) -> u64 {
    let mut bits_on = 0;
    let mut iter = pixels.iter().cloned().peekable();
    while let Some((run, (level, len))) = rle::encode_rle7(&mut iter) {
        out.extend_from_slice(run.as_slice());
        if level != 0 {
            bits_on += len as u64;
        }
    }
    bits_on
}

/// Encodes 8bpp pixels in RLE7a, returning the count of lit pixels.
///
/// Runs never cross the end of a scanline, and are broken in the middle of
/// each scanline too. Printer firmware in the wild expects this.
pub fn encode_rle7a_slice(pixels: &[u8], width: u32, out: &mut Vec<u8>) -> u64 {
    let width = width as usize;
    if width == 0 {
        return 0;
    }
    let half = width / 2;
    let mut bits_on = 0;

    for scanline in pixels.chunks(width) {
        let (left, right) = scanline.split_at(half.min(scanline.len()));
        for segment in [left, right].iter() {
            let mut iter = segment
                .iter()
                .map(|&p| (p >> 1).min(rle::RLE7A_MAX_LEVEL))
                .peekable();
            while let Some(level) = iter.next() {
                let mut len = 1;
                while iter.peek() == Some(&level) {
                    iter.next();
                    len += 1;
                }
                rle::encode_rle7a_run(level, len, out);
                if level != 0 {
                    bits_on += len as u64;
                }
            }
        }
    }
    bits_on
}

/// Encodes 8bpp pixels in RLE4 and appends the checksum, returning the count
/// of lit pixels.
pub fn encode_rle4_slice(pixels: &[u8], out: &mut Vec<u8>) -> u64 {
    let start = out.len();
    let mut bits_on = 0;
    let mut iter = pixels.iter().map(|&p| p >> 4).peekable();
    while let Some(nibble) = iter.next() {
        let mut len = 1;
        while iter.peek() == Some(&nibble) {
            iter.next();
            len += 1;
        }
        rle::encode_rle4_run(nibble, len, out);
        if nibble != 0 {
            bits_on += len as u64;
        }
    }
    let crc = rle::crc16(&out[start..]);
    out.extend_from_slice(&crc.to_be_bytes());
    bits_on
}

/// Encodes 8bpp pixels in RLE4n, returning the count of lit pixels.
pub fn encode_rle4n_slice(pixels: &[u8], out: &mut Vec<u8>) -> u64 {
    let mut bits_on = 0;
    let mut iter = pixels.iter().map(|&p| p >> 4).peekable();
    while let Some(nibble) = iter.next() {
        let mut len = 1;
        while iter.peek() == Some(&nibble) {
            iter.next();
            len += 1;
        }
        rle::encode_rle4n_run(nibble, len, out);
        if nibble != 0 {
            bits_on += len as u64;
        }
    }
    bits_on
}

fn decode_rle4_slice(data: &[u8], pixels: &mut [u8]) -> Result<(), RleError> {
    let mut n = 0;
    let mut cursor = data.iter().cloned();
    while n < pixels.len() {
        let (level, len) =
            rle::decode_rle4(&mut cursor)?.ok_or(RleError::TooFewPixels)?;
        let end = n + len;
        if end > pixels.len() {
            return Err(RleError::TooManyPixels);
        }
        for p in &mut pixels[n..end] {
            *p = level;
        }
        n = end;
    }

    let body = data.len() - cursor.len();
    let trailer = &data[body..];
    if trailer.len() < 2 {
        return Err(RleError::Truncated);
    }
    if trailer.len() > 2 {
        return Err(RleError::ExtraData);
    }
    let found = BigEndian::read_u16(trailer);
    let expected = rle::crc16(&data[..body]);
    if found != expected {
        return Err(RleError::Checksum { expected, found });
    }
    Ok(())
}

/// Encodes a preview image in RLE15, with runs of at most `max_run` pixels.
pub fn encode_preview(image: &RgbImage, max_run: usize) -> Vec<u8> {
    let mut pixels = image.pixels().map(|p| (p[0], p[1], p[2])).peekable();
    let mut encoded = vec![];
    while let Some(run) = rle::encode_rle15(max_run, &mut pixels) {
        match run {
            Run12::Single(val) => {
                encoded.extend_from_slice(&val.to_le_bytes());
            }
            Run12::Double(val0, val1) => {
                encoded.extend_from_slice(&val0.to_le_bytes());
                encoded.extend_from_slice(&val1.to_le_bytes());
            }
        }
    }
    encoded
}

/// Decodes an RLE15 preview image of the given size.
pub fn decode_preview(
    width: u32,
    height: u32,
    data: &[u8],
) -> Result<RgbImage, RleError> {
    let expected = pixel_count(width, height)?;
    let mut image = RgbImage::new(width, height);
    let mut cursor = data.iter().cloned();
    let mut putpix = image.pixels_mut();
    let mut pixels_total = 0;

    while let Some((color, len)) = rle::decode_rle15(&mut cursor)? {
        pixels_total += len;
        let pixel = Rgb([color.0, color.1, color.2]);
        for _ in 0..len {
            let dest = putpix.next().ok_or(RleError::TooManyPixels)?;
            *dest = pixel;
        }
    }

    if pixels_total != expected {
        return Err(RleError::TooFewPixels);
    }

    Ok(image)
}
