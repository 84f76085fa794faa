//! Run-Length Encoding algorithms.
//!
//! This module implements the run-length encoding compression methods that
//! appear in supported file types. These particular algorithms appear to be
//! unique to the file formats, and so I have had to make up names for them.
//!
//! The names are based on the number of bits in each sample of the compressed
//! data: `RLE1`, `RLE4`, `RLE7`, and `RLE15`. The printer manufacturer screwed
//! this scheme up a bit by introducing a *second* 7-bit RLE scheme, which I'm
//! calling `RLE7a`.
//!
//! The functions here work a run at a time. Whole-slice encoding, which is
//! where image geometry and encryption come in, lives in `codec`.
//!
//! # `RLE1`
//!
//! `RLE1` encodes single-bit samples (i.e. a bilevel or monochrome image) into
//! runs of up to 125 pixels. (The format could express 127, but firmware in
//! the wild chokes on runs over 125, so we never emit them.)
//!
//! The encoding is simple and operates in terms of single bytes. In each byte,
//! the 1-bit sample is in the MSB, while the 7-bit run length is in the low 7
//! bits. Thus, the byte `0x84` encodes 4 pixels containing 1s.
//!
//! Antialiased images are expressed as a stack of bilevel *planes*, each the
//! same image thresholded at a different level (see `plane_threshold`). The
//! decoder counts how many planes have each pixel set and scales the count
//! back into the 8-bit range.
//!
//! This scheme is used by `cbddlp` (one table entry per plane) and `pws` (all
//! planes concatenated into one payload).
//!
//! # `RLE4`
//!
//! `RLE4` encodes 4-bit samples. Runs of black (`0x0`) or white (`0xF`) get a
//! 12-bit length in a big-endian `u16`, `0xCLLL`; all other levels get a 4-bit
//! length in a single byte, `0xCL`. The compressed stream is followed by a
//! big-endian CRC16 (see `crc16`).
//!
//! This scheme is used by `pw0` files.
//!
//! # `RLE4n`
//!
//! `RLE4n` also encodes 4-bit samples, but spells each run length out in
//! nibbles. Every byte carries the level in its high nibble and one nibble of
//! the length in its low nibble, most significant nibble first, so a run of
//! `0x123` white pixels is `0xF1 0xF2 0xF3`. Consecutive bytes with the same
//! level belong to the same run, which means adjacent runs must differ in
//! level. There is no run limit and no checksum.
//!
//! This scheme is used by `lgs` files.
//!
//! # `RLE7`
//!
//! `RLE7` encodes 7-bit samples (i.e. a grayscale image) into runs of up to
//! 256Mi pixels using a variable-length encoding scheme that vaguely resembles
//! UTF-8 (but is not UTF-8).
//!
//! This scheme is used by `ctb` and `fdg` files.
//!
//! The encoding works as follows:
//!
//! - 7-bit sample is stored in the 7 LSBs of the first byte.
//! - MSB clear means a run of 1 with no further encoding.
//! - MSB set means an encoded run length follows.
//! - The length (in bytes) of the encoded run length is indicated by the MSBs
//!   of the following byte.
//!   - `0b0xxx_xxxx` encodes a run of 0-127 bytes in the 7 LSBs.
//!   - `0b10xx_xxxx` encodes a 14-bit run length using the 6 LSBs and the
//!     following byte.
//!   - `0b110x_xxxx` encodes a 21-bit run length using the 5 LSBs and the
//!     following *two* bytes.
//!   - `0b1110_xxxx` encodes a 28-bit run length using the 4 LSBs and the
//!     following *three* bytes.
//!
//! When an encoded run spans multiple bytes, they appear in *big-endian order*
//! -- that is, the most significant bits of the encoded run appear in the
//! *first* byte.
//!
//! # `RLE7a`
//!
//! `RLE7a` encodes 7-bit samples using an unusual encoding scheme based on
//! repeating previously generated pixels.
//!
//! This scheme is used by `phz` files.
//!
//! The encoding works as follows:
//!
//! - A byte with the MSB set encodes a pixel in its low 7 bits.
//! - A byte with the MSB clear encodes a repetition count in its low 7 bits.
//!
//! Repetitions simply repeat the last literal pixel that was encoded.
//! Repetitions can, themselves, be repeated: `0x80 0x7d 0x7d` encodes 251
//! zero-valued pixels. We never emit levels above `0x7C` or repetitions above
//! `0x7D`, matching the vendor's encoder.
//!
//! Note that RLE7a is *stateful* -- it's not enough to simply decode bytes, one
//! must also remember the last pixel encoded. This causes its API to be pretty
//! different.
//!
//! # `RLE15`
//!
//! `RLE15` encodes 15-bit RGB555 encoded samples into runs of up to 4096
//! pixels.
//!
//! This scheme is used in the ChiTu-derived formats to encode RGB preview
//! images.
//!
//! The encoding works as follows:
//!
//! - Pixels are packed as `0bRRRRR_GGGGG_x_BBBBB` into little-endian `u16s`.
//! - The `x` bit (bit 5) indicates whether a run follows (set) or if this
//!   `u16` encodes a single pixel (clear).
//! - If a run follows, it has the form `0b0011_xxxx_xxxx_xxxx` -- that is, a
//!   12-bit run encoded in the 12 LSBs of a little-endian `u16`, with the four
//!   MSBs set to `0x3`/`0b0011`. The encoded value is one less than the run
//!   length.

use thiserror::Error;

/// Common type for describing runs of 8-bit samples.
pub type Run = (u8, usize);

/// Equivalent to `Run` for RGB images.
pub type RgbRun = ((u8, u8, u8), usize);

/// Describes an error during RLE processing.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum RleError {
    /// A run was encoded using multiple bytes, but the input ended before it
    /// completed.
    #[error("truncated")]
    Truncated,
    /// A run's encoding was invalid for this scheme.
    #[error("bad encoding")]
    BadRunEncoding,
    /// RLE-encoded data kept going past the end of the expected image. This is
    /// often a sign that you've decoded the wrong or invalid data.
    #[error("too many pixels")]
    TooManyPixels,
    /// RLE-encoded data ended before the end of the expected image. This is
    /// often a sign that you've decoded the wrong or invalid data.
    #[error("too few pixels")]
    TooFewPixels,
    /// Bytes were left over after the image was complete.
    #[error("extra data after image")]
    ExtraData,
    /// The trailing checksum did not match the data.
    #[error("checksum 0x{found:04x}, expected 0x{expected:04x}")]
    Checksum { expected: u16, found: u16 },
    /// The claimed image size is beyond anything a printer uses, and most
    /// likely comes from a damaged header.
    #[error("{width}x{height} image is too large")]
    TooLarge { width: u32, height: u32 },
}

////////////////////////////////////////////////////////////////////////////////
// RLE1

/// Longest run we will emit in RLE1.
pub const RLE1_MAX_RUN: usize = 0x7D;

/// Computes the threshold used for bit-plane `level` (counting from zero) of
/// an image split into `levels` planes.
///
/// Plane zero is the most selective, taking only full-intensity pixels:
///
/// - 1 level: 255
/// - 2 levels: 255 127
/// - 4 levels: 255 63 127 191
/// - 8 levels: 255 31 63 95 127 159 191 223
pub fn plane_threshold(level: u32, levels: u32) -> u8 {
    (256 / levels * level).wrapping_sub(1) as u8
}

/// Decodes a single byte of the RLE1 scheme into a run of 8-bit gray pixels.
///
/// RLE1 is a bilevel scheme, so "on" pixels are translated to level `0xFF`, and
/// "off" pixels to 0.
pub fn decode_rle1(byte: u8) -> Run {
    // Level is given by MSB.
    let level = if byte < 0x80 { 0x00 } else { 0xFF };
    // Length is given by bits 6:0.
    let len = (byte & 0x7F) as usize;
    (level, len)
}

/// Collects a run of matching pixels from `bytes` and encodes them into a run
/// in the RLE1 scheme.
///
/// RLE1 runs can only be up to `RLE1_MAX_RUN` bytes in length, so if there are
/// more matching pixels than that at the start of `bytes`, only a prefix gets
/// taken.
///
/// RLE1 is a bilevel scheme, while `bytes` provides 8-bit intensity levels. To
/// translate, any 8-bit level at `threshold` or above is treated as on, and any
/// level below is treated as off.
///
/// If `bytes` is exhausted, returns `None`, otherwise always succeeds.
pub fn encode_rle1<I>(
    threshold: u8,
    bytes: &mut std::iter::Peekable<I>,
) -> Option<u8>
where
    I: Iterator<Item = u8>,
{
    let first = bytes.next()? >= threshold;
    let mut run_length = 1;
    while run_length < RLE1_MAX_RUN {
        if let Some(&next) = bytes.peek() {
            if (next >= threshold) == first {
                // The run can continue. Consume that byte.
                bytes.next();
                run_length += 1;
            } else {
                // The run ends here.
                break;
            }
        } else {
            // The buffer has ended; truncate the run now.
            break;
        }
    }
    Some(run_length as u8 | if first { 0x80 } else { 0x00 })
}

/// Encodes one bit plane of `pixels`, appending to `out`. Returns the number
/// of pixels that were on in this plane.
pub fn encode_rle1_plane(pixels: &[u8], threshold: u8, out: &mut Vec<u8>) -> u64 {
    let mut bits_on = 0;
    let mut iter = pixels.iter().cloned().peekable();
    while let Some(run) = encode_rle1(threshold, &mut iter) {
        if run & 0x80 != 0 {
            bits_on += u64::from(run & 0x7F);
        }
        out.push(run);
    }
    bits_on
}

/// Decodes one bit plane from the front of `data`, incrementing `counts` for
/// every pixel that is on.
///
/// Decoding stops as soon as every pixel in `counts` is covered, and whatever
/// follows is returned -- in formats that pack all planes into one payload,
/// that's the next plane.
pub fn decode_rle1_plane<'a>(
    data: &'a [u8],
    counts: &mut [u8],
) -> Result<&'a [u8], RleError> {
    let mut n = 0;
    let mut consumed = 0;
    for &byte in data {
        if n == counts.len() {
            break;
        }
        consumed += 1;

        let (level, len) = decode_rle1(byte);
        let end = n + len;
        if end > counts.len() {
            return Err(RleError::TooManyPixels);
        }
        if level != 0 {
            for c in &mut counts[n..end] {
                *c += 1;
            }
        }
        n = end;
    }

    if n != counts.len() {
        return Err(RleError::TooFewPixels);
    }
    Ok(&data[consumed..])
}

/// Converts per-pixel plane counts, as accumulated by `decode_rle1_plane`, into
/// 8-bit gray levels.
pub fn levels_from_counts(counts: &mut [u8], levels: u32) {
    let step = 256 / levels;
    for c in counts {
        if *c != 0 {
            *c = (u32::from(*c) * step - 1) as u8;
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// RLE4

/// Longest run of black or white in RLE4.
pub const RLE4_MAX_LONG_RUN: usize = 0xFFF;
/// Longest run of any other level in RLE4.
pub const RLE4_MAX_SHORT_RUN: usize = 0xF;

/// Lookup table for CRC-16/ARC (reflected polynomial `0xA001`).
pub const CRC16_TABLE: [u16; 256] = crc16_table();

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the checksum trailing RLE4 data.
///
/// This uses the CRC-16/ARC table, but feeds each input byte through the
/// table before mixing it in, and folds the result through the table again
/// with its bytes swapped. It is not a standard CRC, but it is what the
/// printers check.
pub fn crc16(data: &[u8]) -> u16 {
    let t = &CRC16_TABLE;
    let mut crc = 0u16;
    for &b in data {
        let index = ((crc >> 8) ^ t[usize::from(b)]) & 0xFF;
        crc = (crc << 8) ^ t[usize::from(index)];
    }
    t[usize::from(crc & 0xFF)]
        .wrapping_mul(0x100)
        .wrapping_add(t[usize::from(crc >> 8)])
}

/// Encodes `len` pixels of 4-bit level `nibble` in RLE4, splitting the run as
/// required.
pub fn encode_rle4_run(nibble: u8, mut len: usize, out: &mut Vec<u8>) {
    debug_assert!(nibble < 0x10);
    while len > 0 {
        if nibble == 0x0 || nibble == 0xF {
            let done = len.min(RLE4_MAX_LONG_RUN);
            let word = u16::from(nibble) << 12 | done as u16;
            out.extend_from_slice(&word.to_be_bytes());
            len -= done;
        } else {
            let done = len.min(RLE4_MAX_SHORT_RUN);
            out.push(nibble << 4 | done as u8);
            len -= done;
        }
    }
}

/// Decodes a run of pixels in the RLE4 scheme.
///
/// If the iterator is empty, returns `Ok(None)`. If it runs out in the middle
/// of a two-byte run, returns `Err(Truncated)`.
pub fn decode_rle4(
    mut bytes: impl Iterator<Item = u8>,
) -> Result<Option<Run>, RleError> {
    let head = match bytes.next() {
        None => return Ok(None),
        Some(x) => x,
    };
    let nibble = head >> 4;
    let short = usize::from(head & 0xF);
    let len = if nibble == 0x0 || nibble == 0xF {
        let low = bytes.next().ok_or(RleError::Truncated)?;
        short << 8 | usize::from(low)
    } else {
        short
    };
    Ok(Some((nibble << 4 | nibble, len)))
}

////////////////////////////////////////////////////////////////////////////////
// RLE4n

/// Encodes `len` pixels of 4-bit level `nibble` in RLE4n. The caller must not
/// emit two runs of the same level back to back.
pub fn encode_rle4n_run(nibble: u8, len: usize, out: &mut Vec<u8>) {
    debug_assert!(nibble < 0x10);
    let level = nibble << 4;
    let digits = (usize::BITS - len.leading_zeros() + 3) / 4;
    for d in (0..digits).rev() {
        out.push(level | (len >> (d * 4)) as u8 & 0xF);
    }
}

/// Returns an iterator that yields runs of pixels in the RLE4n scheme until
/// `bytes` is exhausted.
///
/// A run too long to count in a `usize` gives `Err(BadRunEncoding)`.
pub fn decode_rle4n(
    bytes: impl Iterator<Item = u8>,
) -> impl Iterator<Item = Result<Run, RleError>> {
    let mut bytes = bytes.peekable();
    std::iter::from_fn(move || {
        let head = bytes.next()?;
        let nibble = head >> 4;
        let mut len = usize::from(head & 0xF);
        while let Some(b) = bytes.next_if(|b| b >> 4 == nibble) {
            if len >> (usize::BITS - 4) != 0 {
                return Some(Err(RleError::BadRunEncoding));
            }
            len = len << 4 | usize::from(b & 0xF);
        }
        Some(Ok((nibble << 4 | nibble, len)))
    })
}

////////////////////////////////////////////////////////////////////////////////
// RLE7

/// Decodes a run of pixels in the RLE7 scheme.
///
/// Runs can be encoded as anywhere between 1 and 5 bytes. This function will
/// draw bytes from the `bytes` iterator as required.
///
/// If the iterator is empty, returns `Ok(None)`.
///
/// If the iterator peters out before the run encoding completes, returns
/// `Err(Truncated)`.
///
/// There are illegal encodings in this scheme. If one is encountered, returns
/// `Err(BadRunEncoding)`.
///
/// Otherwise, returns `Ok(run)`.
pub fn decode_rle7(
    mut bytes: impl Iterator<Item = u8>,
) -> Result<Option<Run>, RleError> {
    let head = match bytes.next() {
        // Distinguish end-of-stream from truncation.
        None => return Ok(None),
        Some(x) => x,
    };

    // head[6:0] is a 7-bit intensity level. Map this to the 8-bit space by
    // replicating the LSB, so that 0x7F becomes 0xFF and 0 stays 0.
    let level = expand_7bit(head & 0x7F);

    fn next_byte_as_usize(
        bytes: &mut impl Iterator<Item = u8>,
    ) -> Result<usize, RleError> {
        Ok(usize::from(bytes.next().ok_or(RleError::Truncated)?))
    }

    if head < 0x80 {
        // MSB clear encodes a single pixel.
        Ok(Some((level, 1)))
    } else {
        // MSB set encodes a run. More bytes are required. We don't know how
        // many yet.
        let run_start = bytes.next().ok_or(RleError::Truncated)?;
        let len = if run_start < 0x80 {
            // Initial MSB clear: 7-bit run length.
            usize::from(run_start)
        } else if run_start < 0xC0 {
            // bits 7:6 == 0b10: 14-bit run length
            let x = usize::from(run_start & 0x3f);
            x << 8 | next_byte_as_usize(&mut bytes)?
        } else if run_start < 0xE0 {
            // bits 7:5 == 0b110: 21-bit run length
            let x = usize::from(run_start & 0x1f);
            let x = x << 8 | next_byte_as_usize(&mut bytes)?;
            x << 8 | next_byte_as_usize(&mut bytes)?
        } else if run_start < 0xF0 {
            // bits 7:4 == 0b1110: 28-bit run length
            let x = usize::from(run_start & 0xf);
            let x = x << 8 | next_byte_as_usize(&mut bytes)?;
            let x = x << 8 | next_byte_as_usize(&mut bytes)?;
            x << 8 | next_byte_as_usize(&mut bytes)?
        } else {
            // bits 7:4 == 0b1111 doesn't appear to be a thing.
            return Err(RleError::BadRunEncoding);
        };
        Ok(Some((level, len)))
    }
}

/// Longest run expressible in RLE7.
pub const RLE7_MAX_RUN: usize = (1 << 28) - 1;

/// Encodes a run of identical-ish pixels into the RLE7 scheme.
///
/// RLE7 is a 7-bit scheme, so the LSB of pixels is ignored.
///
/// Any encoded pixels are consumed from `bytes`. If the run happens to cross
/// the maximum length for RLE7, it will be split, though this is pretty
/// unlikely.
///
/// Returns `None` if `bytes` is exhausted, otherwise returns the encoded run
/// along with its 7-bit level and length.
pub fn encode_rle7<I>(bytes: &mut std::iter::Peekable<I>) -> Option<(Run7, Run)>
where
    I: Iterator<Item = u8>,
{
    let first = bytes.next()? >> 1;
    let mut run_length = 1usize;
    while run_length < RLE7_MAX_RUN {
        if let Some(&next) = bytes.peek() {
            if (next >> 1) == first {
                // The run can continue. Consume that byte.
                bytes.next();
                run_length += 1;
            } else {
                // The run ends here.
                break;
            }
        } else {
            // The buffer has ended; truncate the run now.
            break;
        }
    }
    let encoded = match run_length {
        1 => Run7::R1(first),
        2..=0x7f => Run7::R2([first | 0x80, run_length as u8]),
        0x80..=0x3fff => Run7::R3([
            first | 0x80,
            (run_length >> 8) as u8 | 0x80,
            run_length as u8,
        ]),
        0x4000..=0x1f_ffff => Run7::R4([
            first | 0x80,
            (run_length >> 16) as u8 | 0xc0,
            (run_length >> 8) as u8,
            run_length as u8,
        ]),
        _ => Run7::R5([
            first | 0x80,
            (run_length >> 24) as u8 | 0xe0,
            (run_length >> 16) as u8,
            (run_length >> 8) as u8,
            run_length as u8,
        ]),
    };
    Some((encoded, (first, run_length)))
}

/// RLE7 run encoding of one to five bytes.
///
/// This type exists so that we can return a 1-5 byte slice without allocating.
#[derive(Copy, Clone, Debug)]
pub enum Run7 {
    /// One byte encoding.
    R1(u8),
    /// Two byte encoding.
    R2([u8; 2]),
    /// Three byte encoding.
    R3([u8; 3]),
    /// Four byte encoding.
    R4([u8; 4]),
    /// Five byte encoding.
    R5([u8; 5]),
}

impl Run7 {
    /// Views this run as a slice for I/O purposes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Run7::R1(x) => std::slice::from_ref(x),
            Run7::R2(bs) => &bs[..],
            Run7::R3(bs) => &bs[..],
            Run7::R4(bs) => &bs[..],
            Run7::R5(bs) => &bs[..],
        }
    }
}

/// Maps a 7-bit level to 8 bits, doubling it and replicating the LSB.
pub fn expand_7bit(level: u8) -> u8 {
    level << 1 | level & 1
}

////////////////////////////////////////////////////////////////////////////////
// RLE7a

/// Highest 7-bit level emitted in RLE7a. Decoders treat it as full white.
pub const RLE7A_MAX_LEVEL: u8 = 0x7C;
/// Longest repetition emitted in a single RLE7a byte.
pub const RLE7A_MAX_REPEAT: usize = 0x7D;

/// Returns an iterator that yields runs of pixels in the RLE7a scheme until
/// `bytes` is exhausted.
pub fn decode_rle7a(
    mut bytes: impl Iterator<Item = u8>,
) -> impl Iterator<Item = Result<Run, RleError>> {
    let mut last = None;
    std::iter::from_fn(move || {
        let b = bytes.next()?;
        if b & 0x80 != 0 {
            // new pixel value
            let level = b & 0x7F;
            let level = if level >= RLE7A_MAX_LEVEL {
                0xFF
            } else {
                expand_7bit(level)
            };
            last = Some(level);
            Some(Ok((level, 1)))
        } else {
            // run
            match last {
                None => Some(Err(RleError::BadRunEncoding)),
                Some(v) => Some(Ok((v, usize::from(b)))),
            }
        }
    })
}

/// Encodes `len` pixels at 7-bit `level` in RLE7a: one literal, then as many
/// repetition bytes as it takes.
pub fn encode_rle7a_run(level: u8, len: usize, out: &mut Vec<u8>) {
    debug_assert!(len > 0);
    debug_assert!(level <= RLE7A_MAX_LEVEL);
    out.push(level | 0x80);
    let mut remaining = len - 1;
    while remaining > 0 {
        let todo = remaining.min(RLE7A_MAX_REPEAT);
        out.push(todo as u8);
        remaining -= todo;
    }
}

////////////////////////////////////////////////////////////////////////////////
// RLE15

/// Expands a 5-bit color channel to 8 bits.
fn expand_5bit(c5: u16) -> u8 {
    let c5 = (c5 & 0x1F) as u8;
    c5 << 3 | c5 >> 2
}

/// Packs an 8-bit RGB pixel into the 15-bit form used by RLE15.
pub fn pack_rgb15(p: (u8, u8, u8)) -> u16 {
    u16::from(p.0 >> 3) << 11 | u16::from(p.1 >> 3) << 6 | u16::from(p.2 >> 3)
}

/// Unpacks a 15-bit RLE15 color into 8-bit RGB.
pub fn unpack_rgb15(value: u16) -> (u8, u8, u8) {
    (
        expand_5bit(value >> 11),
        expand_5bit(value >> 6),
        expand_5bit(value),
    )
}

/// Decodes pixels encoded in RLE15 format.
///
/// This will pull bytes from `bytes` as needed to decode a single run.
///
/// If `bytes` is exhausted at entry to this function, returns `Ok(None)`. If it
/// becomes exhausted during the decoding of the run, returns `Err(Truncated)`.
///
/// If the most significant nibble of the final byte of an encoded run is not
/// `0x3`, returns `Err(BadRunEncoding)` to warn of data corruption.
pub fn decode_rle15(
    mut bytes: impl Iterator<Item = u8>,
) -> Result<Option<RgbRun>, RleError> {
    let head_lsb = match bytes.next() {
        // Distinguish end-of-stream from truncation.
        None => return Ok(None),
        Some(x) => x,
    };
    let head_msb = bytes.next().ok_or(RleError::Truncated)?;
    let head = u16::from_le_bytes([head_lsb, head_msb]);

    if head & 0x20 == 0 {
        return Ok(Some((unpack_rgb15(head), 1)));
    }

    // We are expecting a run count. Run counts are encoded strangely: it's a
    // 12-bit number encoded as 16 bits with the top nibble set to 3.
    let run_lsb = bytes.next().ok_or(RleError::Truncated)?;
    let run_msb = bytes.next().ok_or(RleError::Truncated)?;
    let run = u16::from_le_bytes([run_lsb, run_msb]);

    if run & 0xF000 != 0x3000 {
        return Err(RleError::BadRunEncoding);
    }

    let length = usize::from(run & 0xFFF) + 1;

    Ok(Some((unpack_rgb15(head), length)))
}

/// Encodes a run of identical-ish pixels in the RLE15 scheme.
///
/// RLE15 encodes RGB555 pixels, while our input is 24-bit, so the input will
/// get quantized before compression.
///
/// Runs are capped at `max_run` pixels, which differs between formats
/// (`0x1000` or `0xFFF`).
///
/// Consumes pixels as needed from `pixels`, producing a `Run12` unless the
/// input is exhausted.
pub fn encode_rle15<I>(
    max_run: usize,
    pixels: &mut std::iter::Peekable<I>,
) -> Option<Run12>
where
    I: Iterator<Item = (u8, u8, u8)>,
{
    debug_assert!(max_run >= 1 && max_run <= 0x1000);
    let first = pack_rgb15(pixels.next()?);

    let mut run_length = 1usize;
    while run_length < max_run {
        if let Some(&next) = pixels.peek() {
            if pack_rgb15(next) == first {
                // The run can continue. Consume that pixel.
                pixels.next();
                run_length += 1;
            } else {
                // The run ends here.
                break;
            }
        } else {
            // The buffer has ended; truncate the run now.
            break;
        }
    }
    match run_length {
        1 => Some(Run12::Single(first)),
        2 => Some(Run12::Double(first, first)),
        _ => Some(Run12::Double(
            first | 0x20,
            (run_length - 1) as u16 | 0x3000,
        )),
    }
}

/// A description of the encoding of a single run in the RLE15 scheme.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Run12 {
    /// One little-endian `u16` is required.
    Single(u16),
    /// Two little-endian `u16`s are required.
    Double(u16, u16),
}
