//! SENC / S57 chart cells: record codec, shared topology and feature conversion.
//!
//! A cell file is a flat sequence of records (little-endian):
//!   00  : u16  type
//!   02  : u32  length (header included)
//!   06  : body
//!
//! Written order:
//!   cell header   (1..=9: version, name, dates, edition, update, scale, datum)
//!   cell extent   (100: sw, nw, ne, se corners as f64 lat/lon)
//!   coverage      (98 covered / 99 not covered: f32 lat/lon ring)
//!   per feature   (64 id, 65 attributes, one of 80 point, 81 line, 82 area, 83 multipoint)
//!   node table    (97: id, f32 x, f32 y)
//!   edge table    (96: id, n, n × f32 x/y)
//!
//! Strings (names, dates, text attributes) fill the rest of their record and
//! end in a NUL; older files without the NUL are read too.
//!
//! Version 200 is plain S57: edge references are `node0, edge, node1`.
//! Version 201 (SENC) adds a fourth `flip` word, the sounding datum, free text,
//! server status, and the extended area/node/edge records (84, 86, 85) that
//! carry a `scale:f64` after their count.
//!
//! Line and area geometry is never stored inline. Each contour becomes one
//! edge reference whose endpoints live in the node table and whose interior
//! lives in the edge table; node, edge and triangle coordinates are metres on
//! a spherical Mercator grid centred on the cell (see [`grid`]).

use std::path::Path;

pub mod convert;
pub mod error;
pub mod grid;
pub mod model;
pub mod record;
pub mod topology;
pub mod triangulate;

pub use convert::{decode_cell, encode_cell, senc_to_s57, DecodedCell};
pub use error::{Result, SencError, Table, TriangulationFailure};
pub use model::{
    Attribute, AttributeValue, BoundingBox, Cell, CellExtent, ChartFeature, Coverage, Dialect,
    Primitive, Shape,
};
pub use record::{
    read_records, write_records, Record, RecordKind, RecordReader, RecordStream, RecordWriter,
    StringEncoding,
};

/// Decode a cell file. The extension picks the dialect assumed until the
/// version record is seen.
#[cfg(feature = "mmap")]
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<DecodedCell> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
    decode_cell(&map, Dialect::from_path(path))
}

#[cfg(not(feature = "mmap"))]
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<DecodedCell> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    decode_cell(&bytes, Dialect::from_path(path))
}

/// Encode `features` into a cell file of the given dialect.
pub fn write_file<P: AsRef<Path>>(
    path: P,
    cell: &Cell,
    features: &[ChartFeature],
    dialect: Dialect,
) -> Result<usize> {
    let bytes = encode_cell(cell, features, dialect)?;
    std::fs::write(path, &bytes)?;
    Ok(bytes.len())
}
