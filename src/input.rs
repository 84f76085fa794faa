//! Support for reading file formats implemented by this library.
//!
//! Parsing is zero-copy where it can be: fixed records are borrowed straight
//! out of the file image with `zerocopy`, after checking that the file is long
//! enough to hold them. Nothing is decompressed until a layer is asked for.

use std::mem::size_of;
use std::ops::Range;

use image::RgbImage;
use zerocopy::{FromBytes, LayoutVerified, Unaligned};

use crate::codec::{self, SliceCodec};
use crate::error::{Error, Payload, Result};
use crate::model::{Exposure, Layer, PreviewKind, Printable, Properties};
use crate::PreviewHeader;

/// Borrows a `T` from `buf` at `offset`.
pub fn parse_type<T: FromBytes + Unaligned>(
    buf: &[u8],
    offset: u32,
) -> Result<&T> {
    let bytes = parse_bytes(buf, offset, size_of::<T>() as u32)?;
    LayoutVerified::<_, T>::new_unaligned(bytes)
        .map(|record| record.into_ref())
        .ok_or_else(|| truncated(buf, offset, size_of::<T>() as u64))
}

/// Borrows `count` consecutive `T`s from `buf` at `offset`.
pub fn parse_slice<T: FromBytes + Unaligned>(
    buf: &[u8],
    offset: u32,
    count: u32,
) -> Result<&[T]> {
    let len = size_of::<T>() as u64 * u64::from(count);
    if len > u64::from(u32::MAX) {
        return Err(truncated(buf, offset, len));
    }
    let bytes = parse_bytes(buf, offset, len as u32)?;
    LayoutVerified::<_, [T]>::new_slice_unaligned(bytes)
        .map(|records| records.into_slice())
        .ok_or_else(|| truncated(buf, offset, len))
}

/// Borrows a `T` from the start of a `len`-byte record at `offset`. Records
/// declared longer than `T` are accepted, so that newer writers can extend
/// them.
pub fn parse_type_prefix<T: FromBytes + Unaligned>(
    buf: &[u8],
    offset: u32,
    len: u32,
) -> Result<&T> {
    let bytes = parse_bytes(buf, offset, len)?;
    LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .map(|(record, _)| record.into_ref())
        .ok_or_else(|| truncated(buf, offset, size_of::<T>() as u64))
}

/// Borrows `len` bytes from `buf` at `offset`.
pub fn parse_bytes(buf: &[u8], offset: u32, len: u32) -> Result<&[u8]> {
    let range = payload_range(buf, offset, len)?;
    Ok(&buf[range])
}

/// Checks that `len` bytes at `offset` lie within `buf`, and returns their
/// range.
pub fn payload_range(buf: &[u8], offset: u32, len: u32) -> Result<Range<usize>> {
    let start = offset as usize;
    match start.checked_add(len as usize) {
        Some(end) if end <= buf.len() => Ok(start..end),
        _ => Err(truncated(buf, offset, u64::from(len))),
    }
}

fn truncated(buf: &[u8], offset: u32, len: u64) -> Error {
    Error::Truncated {
        offset: u64::from(offset),
        len,
        available: buf.len(),
    }
}

/// Interprets a fixed-size or length-delimited string field, dropping any NUL
/// padding.
pub fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Reads an RLE15 preview image through the `PreviewHeader` at `offset`.
///
/// Returns `None` if the file doesn't have this preview: a zero offset, or a
/// zero-sized image.
pub fn parse_preview(
    buf: &[u8],
    offset: u32,
    kind: PreviewKind,
) -> Result<Option<RgbImage>> {
    if offset == 0 {
        return Ok(None);
    }
    let header = parse_type::<PreviewHeader>(buf, offset)?;
    let (width, height) = (header.size[0].get(), header.size[1].get());
    if width == 0 || height == 0 {
        return Ok(None);
    }
    let data = parse_bytes(buf, header.data_offset.get(), header.data_len.get())?;
    codec::decode_preview(width, height, data)
        .map(Some)
        .map_err(|source| Error::CorruptPayload {
            payload: Payload::Preview(kind),
            source,
        })
}

/// Where to find one layer in a file, and how to print it.
#[derive(Clone, Debug)]
pub struct LayerRecord {
    pub z_mm: f32,
    /// Exposure with any per-layer overrides applied.
    pub exposure: Exposure,
    /// Byte ranges of the layer's payloads in the file image. Bit-plane
    /// formats that store planes separately have one range per plane.
    pub payloads: Vec<Range<usize>>,
}

/// A decoded file: properties, a layer table, and the raw file image that
/// layers are decompressed from on request.
#[derive(Clone, Debug)]
pub struct Slices {
    data: Vec<u8>,
    properties: Properties,
    layers: Vec<LayerRecord>,
    codec: SliceCodec,
}

impl Slices {
    /// Assembles a decoded file. The layer count in `properties` is updated to
    /// match `layers`.
    pub fn new(
        data: Vec<u8>,
        mut properties: Properties,
        layers: Vec<LayerRecord>,
        codec: SliceCodec,
    ) -> Self {
        properties.size.layers = layers.len() as u32;
        Self {
            data,
            properties,
            layers,
            codec,
        }
    }

    pub fn records(&self) -> &[LayerRecord] {
        &self.layers
    }

    pub fn codec(&self) -> &SliceCodec {
        &self.codec
    }
}

impl Printable for Slices {
    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn layer(&self, index: u32) -> Result<Layer> {
        let record = self.layers.get(index as usize).ok_or_else(|| {
            Error::invalid(format!(
                "layer {} requested from a {}-layer file",
                index,
                self.layers.len()
            ))
        })?;
        let payloads: Vec<&[u8]> = record
            .payloads
            .iter()
            .map(|range| &self.data[range.clone()])
            .collect();
        let mask = self
            .codec
            .decode(&payloads, index, self.properties.size.resolution)
            .map_err(|source| Error::CorruptPayload {
                payload: Payload::Layer(index),
                source,
            })?;
        Ok(Layer {
            z_mm: record.z_mm,
            exposure: record.exposure,
            mask,
        })
    }
}
