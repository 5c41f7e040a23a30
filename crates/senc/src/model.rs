//! In-memory chart model shared by the codec, the topology builder and the converter.
//!
//! Positions in the feature model are `[lon, lat]` degrees. Positions inside
//! records (nodes, edges, triangles, soundings) are local grid metres.

use std::path::Path;

use crate::error::{Result, SencError};

/// The two binary variants, selected by the cell-version record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Version 200: edge stride 3, no flip bit, no extended records.
    S57,
    /// Version 201: edge stride 4 (flip bit), extended records permitted.
    Senc,
}

impl Dialect {
    pub fn version(self) -> u16 {
        match self {
            Dialect::S57 => 200,
            Dialect::Senc => 201,
        }
    }

    pub fn from_version(version: u16) -> Result<Self> {
        match version {
            200 => Ok(Dialect::S57),
            201 => Ok(Dialect::Senc),
            other => Err(SencError::UnsupportedVersion(other)),
        }
    }

    /// Integers per edge reference tuple.
    pub fn stride(self) -> usize {
        match self {
            Dialect::S57 => 3,
            Dialect::Senc => 4,
        }
    }

    /// Guess from a file name: `.senc` is SENC, anything else S57.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let is_senc = path
            .as_ref()
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.eq_ignore_ascii_case("senc"))
            .unwrap_or(false);

        if is_senc {
            Dialect::Senc
        } else {
            Dialect::S57
        }
    }
}

/// Feature primitive as stored in the feature-id record.
/// Sounding clusters use `Point` and are told apart by their geometry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Primitive {
    Point = 0,
    Line = 1,
    Area = 2,
}

impl Primitive {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Primitive::Point),
            1 => Some(Primitive::Line),
            2 => Some(Primitive::Area),
            _ => None,
        }
    }
}

/// Geographic bounds in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Bounds of `[lon, lat]` positions; `None` when there are no finite ones.
    pub fn from_positions<'a, I>(positions: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a [f64; 2]>,
    {
        let mut bbox: Option<BoundingBox> = None;

        for &[lon, lat] in positions {
            if !(lon.is_finite() && lat.is_finite()) {
                continue;
            }

            let b = bbox.get_or_insert(BoundingBox {
                south: lat,
                north: lat,
                west: lon,
                east: lon,
            });

            b.south = b.south.min(lat);
            b.north = b.north.max(lat);
            b.west = b.west.min(lon);
            b.east = b.east.max(lon);
        }

        bbox
    }

    pub fn union(self, other: BoundingBox) -> BoundingBox {
        BoundingBox {
            south: self.south.min(other.south),
            north: self.north.max(other.north),
            west: self.west.min(other.west),
            east: self.east.max(other.east),
        }
    }

    /// Centre as `[lon, lat]`.
    pub fn center(&self) -> [f64; 2] {
        [
            (self.west + self.east) * 0.5,
            (self.south + self.north) * 0.5,
        ]
    }

    pub fn contains(&self, lonlat: [f64; 2]) -> bool {
        (self.west..=self.east).contains(&lonlat[0])
            && (self.south..=self.north).contains(&lonlat[1])
    }
}

/// Four-corner cell extent; each corner is `[lat, lon]` as stored on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellExtent {
    pub sw: [f64; 2],
    pub nw: [f64; 2],
    pub ne: [f64; 2],
    pub se: [f64; 2],
}

impl CellExtent {
    pub fn from_bounds(b: BoundingBox) -> Self {
        Self {
            sw: [b.south, b.west],
            nw: [b.north, b.west],
            ne: [b.north, b.east],
            se: [b.south, b.east],
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        let corners = [self.sw, self.nw, self.ne, self.se];
        let lat = corners.iter().map(|c| c[0]);
        let lon = corners.iter().map(|c| c[1]);

        BoundingBox {
            south: lat.clone().fold(f64::INFINITY, f64::min),
            north: lat.fold(f64::NEG_INFINITY, f64::max),
            west: lon.clone().fold(f64::INFINITY, f64::min),
            east: lon.fold(f64::NEG_INFINITY, f64::max),
        }
    }

    /// Cell centre as `[lon, lat]`.
    pub fn center(&self) -> [f64; 2] {
        self.bounds().center()
    }
}

/// Cell coverage polygon; `points` are `[lat, lon]` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Coverage {
    pub covered: bool,
    pub points: Vec<[f32; 2]>,
}

impl Coverage {
    /// Covered polygon from a `[lon, lat]` ring.
    pub fn from_ring(covered: bool, ring: &[[f64; 2]]) -> Self {
        Self {
            covered,
            points: ring
                .iter()
                .map(|&[lon, lat]| [lat as f32, lon as f32])
                .collect(),
        }
    }

    /// Ring as `[lon, lat]`.
    pub fn ring(&self) -> Vec<[f64; 2]> {
        self.points
            .iter()
            .map(|&[lat, lon]| [lon as f64, lat as f64])
            .collect()
    }
}

/// One chart unit's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub name: String,
    pub edition: u16,
    pub update: u16,
    pub publish_date: String,
    pub update_date: String,
    pub create_date: String,
    pub native_scale: u32,
    pub sounding_datum: Option<String>,
    pub extent: CellExtent,
    pub coverage: Vec<Coverage>,
}

impl Cell {
    /// A first-edition cell whose extent is the bounds of `features`.
    pub fn from_features(name: &str, features: &[ChartFeature]) -> Result<Self> {
        let bounds = features
            .iter()
            .filter_map(ChartFeature::bounds)
            .reduce(BoundingBox::union)
            .ok_or_else(|| SencError::InvalidCell(format!("{name}: no positioned features")))?;

        Ok(Self {
            name: name.to_owned(),
            edition: 1,
            update: 0,
            publish_date: String::new(),
            update_date: String::new(),
            create_date: String::new(),
            native_scale: 0,
            sounding_datum: None,
            extent: CellExtent::from_bounds(bounds),
            coverage: Vec::new(),
        })
    }
}

/// Attribute value; the wire `vtype` is derived from the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    pub fn vtype(&self) -> u8 {
        match self {
            AttributeValue::Int(_) => 0,
            AttributeValue::Float(_) => 2,
            AttributeValue::Text(_) => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub code: u16,
    pub value: AttributeValue,
}

/// Shared endpoint, local grid metres (stored as f32).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Node {
    pub id: u32,
    pub xy: [f64; 2],
}

/// Interior vertices of a shared polyline chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: u32,
    pub points: Vec<[f32; 2]>,
}

/// `node0 -> edge -> node1`; `edge == 0` is a direct segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeRef {
    pub node0: u32,
    pub edge: u32,
    pub node1: u32,
    pub flip: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriangleKind {
    List = 4,
    Strip = 5,
    Fan = 6,
}

impl TriangleKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            4 => Some(TriangleKind::List),
            5 => Some(TriangleKind::Strip),
            6 => Some(TriangleKind::Fan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriangleBatch {
    pub kind: TriangleKind,
    pub bbox: BoundingBox,
    pub vertices: Vec<[f32; 2]>,
}

impl TriangleBatch {
    /// Vertices as a plain triangle list, three per triangle.
    pub fn triangle_list(&self) -> Vec<[f32; 2]> {
        let v = &self.vertices;

        match self.kind {
            TriangleKind::List => v[..v.len() - v.len() % 3].to_vec(),
            TriangleKind::Strip => {
                let mut out = Vec::with_capacity(v.len().saturating_sub(2) * 3);
                for i in 0..v.len().saturating_sub(2) {
                    // Every other strip triangle is wound backwards.
                    if i % 2 == 0 {
                        out.extend_from_slice(&[v[i], v[i + 1], v[i + 2]]);
                    } else {
                        out.extend_from_slice(&[v[i + 1], v[i], v[i + 2]]);
                    }
                }
                out
            }
            TriangleKind::Fan => {
                let mut out = Vec::with_capacity(v.len().saturating_sub(2) * 3);
                for i in 1..v.len().saturating_sub(1) {
                    out.extend_from_slice(&[v[0], v[i], v[i + 1]]);
                }
                out
            }
        }
    }
}

/// Geometry of a decoded or to-be-encoded feature, in `[lon, lat]` degrees.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Point([f64; 2]),
    /// `[lon, lat, depth]` sounding cluster.
    Soundings(Vec<[f64; 3]>),
    /// One polyline per contour.
    Line(Vec<Vec<[f64; 2]>>),
    /// Closed outer contours plus the fill as a flat triangle list.
    Area {
        contours: Vec<Vec<[f64; 2]>>,
        triangles: Vec<[f64; 2]>,
    },
}

impl Shape {
    pub fn primitive(&self) -> Primitive {
        match self {
            Shape::Point(_) | Shape::Soundings(_) => Primitive::Point,
            Shape::Line(_) => Primitive::Line,
            Shape::Area { .. } => Primitive::Area,
        }
    }
}

/// One chart object: S-57 object class code, attributes and geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartFeature {
    pub ftype: u16,
    pub id: u16,
    pub attributes: Vec<Attribute>,
    pub shape: Shape,
}

impl ChartFeature {
    pub fn new(ftype: u16, shape: Shape) -> Self {
        Self {
            ftype,
            id: 0,
            attributes: Vec::new(),
            shape,
        }
    }

    pub fn with_attribute(mut self, code: u16, value: AttributeValue) -> Self {
        self.attributes.push(Attribute { code, value });
        self
    }

    pub fn attribute(&self, code: u16) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|a| a.code == code)
            .map(|a| &a.value)
    }

    pub fn bounds(&self) -> Option<BoundingBox> {
        match &self.shape {
            Shape::Point(p) => BoundingBox::from_positions(std::iter::once(p)),
            Shape::Soundings(points) => {
                let flat: Vec<[f64; 2]> = points.iter().map(|p| [p[0], p[1]]).collect();
                BoundingBox::from_positions(&flat)
            }
            Shape::Line(contours) | Shape::Area { contours, .. } => {
                BoundingBox::from_positions(contours.iter().flatten())
            }
        }
    }
}
