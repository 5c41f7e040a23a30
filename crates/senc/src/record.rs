//! Length-prefixed, type-tagged record stream.
//!
//! Every record (little-endian):
//!   00  : u16  type
//!   02  : u32  length (header included, so `6 + body`)
//!   06  : body, laid out per type (see [`RecordKind`])
//!
//! Strings in cell-header and attribute records are zero-terminated once a
//! version 201 record has been seen, and take the whole remaining body otherwise.
//! Edge references are `u32 × stride` (3 in S57, 4 in SENC with the flip flag).

use log::debug;

use crate::error::{Result, SencError};
use crate::model::{
    Attribute, AttributeValue, BoundingBox, CellExtent, Coverage, Dialect, Edge, EdgeRef, Node,
    Primitive, TriangleBatch, TriangleKind,
};

/// Header size: `u16 type + u32 length`.
pub const HEADER_LEN: usize = 6;

/// Closed set of record type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RecordKind {
    CellVersion = 1,
    CellName = 2,
    CellPublishDate = 3,
    CellEdition = 4,
    CellUpdateDate = 5,
    CellUpdate = 6,
    CellNativeScale = 7,
    CellCreateDate = 8,
    CellSoundingDatum = 9,
    FeatureId = 64,
    FeatureAttribute = 65,
    GeometryPoint = 80,
    GeometryLine = 81,
    GeometryArea = 82,
    GeometryMultipoint = 83,
    GeometryAreaExt = 84,
    EdgeTableExt = 85,
    NodeTableExt = 86,
    EdgeTable = 96,
    NodeTable = 97,
    Coverage = 98,
    NoCoverage = 99,
    CellExtent = 100,
    TextAttachment = 101,
    ServerStatus = 200,
}

impl RecordKind {
    pub fn from_code(code: u16) -> Option<Self> {
        use RecordKind::*;

        let kind = match code {
            1 => CellVersion,
            2 => CellName,
            3 => CellPublishDate,
            4 => CellEdition,
            5 => CellUpdateDate,
            6 => CellUpdate,
            7 => CellNativeScale,
            8 => CellCreateDate,
            9 => CellSoundingDatum,
            64 => FeatureId,
            65 => FeatureAttribute,
            80 => GeometryPoint,
            81 => GeometryLine,
            82 => GeometryArea,
            83 => GeometryMultipoint,
            84 => GeometryAreaExt,
            85 => EdgeTableExt,
            86 => NodeTableExt,
            96 => EdgeTable,
            97 => NodeTable,
            98 => Coverage,
            99 => NoCoverage,
            100 => CellExtent,
            101 => TextAttachment,
            200 => ServerStatus,
            _ => return None,
        };

        Some(kind)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        use RecordKind::*;

        match self {
            CellVersion => "cell_version",
            CellName => "cell_name",
            CellPublishDate => "cell_publish_date",
            CellEdition => "cell_edition",
            CellUpdateDate => "cell_update_date",
            CellUpdate => "cell_update",
            CellNativeScale => "cell_native_scale",
            CellCreateDate => "cell_create_date",
            CellSoundingDatum => "cell_sounding_datum",
            FeatureId => "feature_id",
            FeatureAttribute => "feature_attribute",
            GeometryPoint => "point",
            GeometryLine => "line",
            GeometryArea => "area",
            GeometryMultipoint => "multipoint",
            GeometryAreaExt => "area_ext",
            EdgeTableExt => "edge_table_ext",
            NodeTableExt => "node_table_ext",
            EdgeTable => "edge_table",
            NodeTable => "node_table",
            Coverage => "coverage",
            NoCoverage => "no_coverage",
            CellExtent => "cell_extent",
            TextAttachment => "text",
            ServerStatus => "server_status",
        }
    }

    /// Extended variants carry an extra `scale:f64` after their count.
    pub fn is_extended(self) -> bool {
        matches!(
            self,
            RecordKind::GeometryAreaExt | RecordKind::EdgeTableExt | RecordKind::NodeTableExt
        )
    }

    pub fn allowed_in(self, dialect: Dialect) -> bool {
        match dialect {
            Dialect::Senc => true,
            Dialect::S57 => !(self.is_extended()
                || matches!(
                    self,
                    RecordKind::CellSoundingDatum
                        | RecordKind::TextAttachment
                        | RecordKind::ServerStatus
                )),
        }
    }
}

/// How header and attribute strings are delimited.
///
/// Current writers terminate every string in both dialects; some older files
/// store the bare remainder. A reader settles on one form per stream from the
/// first non-empty string it meets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StringEncoding {
    /// Body remainder is the string.
    Remainder,
    /// Body remainder is the string plus one trailing NUL.
    #[default]
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureId {
    pub ftype: u16,
    pub id: u16,
    pub primitive: Primitive,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointGeometry {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiPointGeometry {
    pub bbox: BoundingBox,
    /// `x, y` local grid metres around the bbox centre, `z` depth.
    pub points: Vec<[f32; 3]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineGeometry {
    pub bbox: BoundingBox,
    pub edges: Vec<EdgeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AreaGeometry {
    pub bbox: BoundingBox,
    /// Present only on the extended record type.
    pub scale: Option<f64>,
    /// One entry per contour; its length is the record's contour count.
    pub pointcount: Vec<u32>,
    pub triangles: Vec<TriangleBatch>,
    pub edges: Vec<EdgeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeTable {
    pub scale: Option<f64>,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeTable {
    pub scale: Option<f64>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextAttachment {
    pub file: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStatus {
    pub server: u16,
    pub decrypt: u16,
    pub expire: u16,
    pub expire_days_remaining: u16,
    pub grace_days_allowed: u16,
    pub grace_days_remaining: u16,
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    CellVersion(u16),
    CellName(String),
    CellPublishDate(String),
    CellEdition(u16),
    CellUpdateDate(String),
    CellUpdate(u16),
    CellNativeScale(u32),
    CellCreateDate(String),
    CellSoundingDatum(String),
    CellExtent(CellExtent),
    FeatureId(FeatureId),
    Attribute(Attribute),
    Point(PointGeometry),
    MultiPoint(MultiPointGeometry),
    Line(LineGeometry),
    Area(AreaGeometry),
    NodeTable(NodeTable),
    EdgeTable(EdgeTable),
    Coverage(Coverage),
    Text(TextAttachment),
    ServerStatus(ServerStatus),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        use RecordKind as K;

        match self {
            Record::CellVersion(_) => K::CellVersion,
            Record::CellName(_) => K::CellName,
            Record::CellPublishDate(_) => K::CellPublishDate,
            Record::CellEdition(_) => K::CellEdition,
            Record::CellUpdateDate(_) => K::CellUpdateDate,
            Record::CellUpdate(_) => K::CellUpdate,
            Record::CellNativeScale(_) => K::CellNativeScale,
            Record::CellCreateDate(_) => K::CellCreateDate,
            Record::CellSoundingDatum(_) => K::CellSoundingDatum,
            Record::CellExtent(_) => K::CellExtent,
            Record::FeatureId(_) => K::FeatureId,
            Record::Attribute(_) => K::FeatureAttribute,
            Record::Point(_) => K::GeometryPoint,
            Record::MultiPoint(_) => K::GeometryMultipoint,
            Record::Line(_) => K::GeometryLine,
            Record::Area(a) if a.scale.is_some() => K::GeometryAreaExt,
            Record::Area(_) => K::GeometryArea,
            Record::NodeTable(t) if t.scale.is_some() => K::NodeTableExt,
            Record::NodeTable(_) => K::NodeTable,
            Record::EdgeTable(t) if t.scale.is_some() => K::EdgeTableExt,
            Record::EdgeTable(_) => K::EdgeTable,
            Record::Coverage(c) if c.covered => K::Coverage,
            Record::Coverage(_) => K::NoCoverage,
            Record::Text(_) => K::TextAttachment,
            Record::ServerStatus(_) => K::ServerStatus,
        }
    }

    /// Edge references of a line or area record.
    pub fn edge_refs(&self) -> Option<&[EdgeRef]> {
        match self {
            Record::Line(l) => Some(&l.edges),
            Record::Area(a) => Some(&a.edges),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------
// Field readers over a record body. Errors name the field and what was left.
// ------------------------------------------------------------------

type Field<T> = std::result::Result<T, String>;

#[inline(always)]
fn need(buf: &[u8], want: usize, field: &str) -> Field<()> {
    if buf.len() < want {
        Err(format!(
            "field `{field}` needs {want} bytes, {} left",
            buf.len()
        ))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize, field: &str) -> Field<&'a [u8]> {
    need(buf, n, field)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u8(buf: &mut &[u8], field: &str) -> Field<u8> {
    Ok(take(buf, 1, field)?[0])
}

#[inline(always)]
fn le_u16(buf: &mut &[u8], field: &str) -> Field<u16> {
    let b = take(buf, 2, field)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

#[inline(always)]
fn le_u32(buf: &mut &[u8], field: &str) -> Field<u32> {
    let b = take(buf, 4, field)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_f32(buf: &mut &[u8], field: &str) -> Field<f32> {
    let b = take(buf, 4, field)?;
    Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_f64(buf: &mut &[u8], field: &str) -> Field<f64> {
    let b = take(buf, 8, field)?;
    Ok(f64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

/// Checks that `count` entries of `entry_len` bytes can still be present
/// before anything is allocated for them.
fn need_entries(buf: &[u8], count: usize, entry_len: usize, field: &str) -> Field<()> {
    let bytes = count
        .checked_mul(entry_len)
        .ok_or_else(|| format!("field `{field}`: count {count} overflows"))?;
    need(buf, bytes, field)
}

fn utf8(bytes: &[u8], field: &str) -> Field<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| format!("field `{field}` is not valid UTF-8"))
}

fn read_string(
    buf: &mut &[u8],
    strings: &mut Option<StringEncoding>,
    field: &str,
) -> Field<String> {
    let rest = take(buf, buf.len(), field)?;
    let terminated = rest.last() == Some(&0);

    let encoding = match *strings {
        Some(e) => e,
        None if rest.is_empty() => return Ok(String::new()),
        None => {
            let e = if terminated {
                StringEncoding::Terminated
            } else {
                StringEncoding::Remainder
            };
            *strings = Some(e);
            e
        }
    };

    match (encoding, terminated) {
        (StringEncoding::Terminated, true) => utf8(&rest[..rest.len() - 1], field),
        (StringEncoding::Terminated, false) => {
            Err(format!("field `{field}` is missing its NUL terminator"))
        }
        (StringEncoding::Remainder, false) => utf8(rest, field),
        (StringEncoding::Remainder, true) => {
            Err(format!("field `{field}` is NUL-terminated in an unterminated stream"))
        }
    }
}

fn read_bbox(buf: &mut &[u8]) -> Field<BoundingBox> {
    Ok(BoundingBox {
        south: le_f64(buf, "south")?,
        north: le_f64(buf, "north")?,
        west: le_f64(buf, "west")?,
        east: le_f64(buf, "east")?,
    })
}

/// Triangle batches store their bounds west, east, south, north.
fn read_bbox_wesn(buf: &mut &[u8]) -> Field<BoundingBox> {
    let west = le_f64(buf, "tri_west")?;
    let east = le_f64(buf, "tri_east")?;
    let south = le_f64(buf, "tri_south")?;
    let north = le_f64(buf, "tri_north")?;

    Ok(BoundingBox {
        south,
        north,
        west,
        east,
    })
}

fn read_edge_refs(buf: &mut &[u8], count: usize, stride: usize) -> Field<Vec<EdgeRef>> {
    need_entries(buf, count, 4 * stride, "edgerefs")?;
    let mut edges = Vec::with_capacity(count);

    for _ in 0..count {
        let node0 = le_u32(buf, "node0")?;
        let edge = le_u32(buf, "edge")?;
        let node1 = le_u32(buf, "node1")?;

        let flip = if stride == 4 {
            match le_u32(buf, "flip")? {
                0 => false,
                1 => true,
                other => return Err(format!("flip flag must be 0 or 1, found {other}")),
            }
        } else {
            false
        };

        edges.push(EdgeRef {
            node0,
            edge,
            node1,
            flip,
        });
    }

    Ok(edges)
}

fn read_xy_f32(buf: &mut &[u8], count: usize, field: &str) -> Field<Vec<[f32; 2]>> {
    need_entries(buf, count, 8, field)?;
    let mut out = Vec::with_capacity(count);

    for _ in 0..count {
        out.push([le_f32(buf, field)?, le_f32(buf, field)?]);
    }

    Ok(out)
}

fn read_u16_record(buf: &mut &[u8], field: &str) -> Field<u16> {
    le_u16(buf, field)
}

fn decode_body(
    kind: RecordKind,
    buf: &mut &[u8],
    dialect: Dialect,
    strings: &mut Option<StringEncoding>,
) -> Field<Record> {
    use RecordKind as K;

    let record = match kind {
        K::CellVersion => Record::CellVersion(read_u16_record(buf, "version")?),
        K::CellName => Record::CellName(read_string(buf, strings, "cellname")?),
        K::CellPublishDate => Record::CellPublishDate(read_string(buf, strings, "published")?),
        K::CellEdition => Record::CellEdition(read_u16_record(buf, "edition")?),
        K::CellUpdateDate => Record::CellUpdateDate(read_string(buf, strings, "updated")?),
        K::CellUpdate => Record::CellUpdate(read_u16_record(buf, "update")?),
        K::CellNativeScale => Record::CellNativeScale(le_u32(buf, "scale")?),
        K::CellCreateDate => Record::CellCreateDate(read_string(buf, strings, "created")?),
        K::CellSoundingDatum => Record::CellSoundingDatum(read_string(buf, strings, "datum")?),

        K::CellExtent => {
            let mut corner = |lat: &str, lon: &str| -> Field<[f64; 2]> {
                Ok([le_f64(buf, lat)?, le_f64(buf, lon)?])
            };

            Record::CellExtent(CellExtent {
                sw: corner("sw_lat", "sw_lon")?,
                nw: corner("nw_lat", "nw_lon")?,
                ne: corner("ne_lat", "ne_lon")?,
                se: corner("se_lat", "se_lon")?,
            })
        }

        K::FeatureId => {
            let ftype = le_u16(buf, "ftype")?;
            let id = le_u16(buf, "id")?;
            let raw = le_u8(buf, "primitive")?;
            let primitive = Primitive::from_u8(raw)
                .ok_or_else(|| format!("feature {id} (ftype {ftype}): unknown primitive {raw}"))?;

            Record::FeatureId(FeatureId {
                ftype,
                id,
                primitive,
            })
        }

        K::FeatureAttribute => {
            let code = le_u16(buf, "atype")?;
            let vtype = le_u8(buf, "vtype")?;

            let value = match vtype {
                0 => AttributeValue::Int(le_u32(buf, "value")? as i64),
                2 => AttributeValue::Float(le_f64(buf, "value")?),
                4 => AttributeValue::Text(read_string(buf, strings, "value")?),
                other => return Err(format!("attribute {code}: unknown vtype {other}")),
            };

            Record::Attribute(Attribute { code, value })
        }

        K::GeometryPoint => Record::Point(PointGeometry {
            lat: le_f64(buf, "lat")?,
            lon: le_f64(buf, "lon")?,
        }),

        K::GeometryMultipoint => {
            let bbox = read_bbox(buf)?;
            let count = le_u32(buf, "count")? as usize;
            need_entries(buf, count, 12, "points")?;

            let mut points = Vec::with_capacity(count);
            for _ in 0..count {
                points.push([
                    le_f32(buf, "x")?,
                    le_f32(buf, "y")?,
                    le_f32(buf, "z")?,
                ]);
            }

            Record::MultiPoint(MultiPointGeometry { bbox, points })
        }

        K::GeometryLine => {
            let bbox = read_bbox(buf)?;
            let count = le_u32(buf, "count")? as usize;
            let edges = read_edge_refs(buf, count, dialect.stride())?;

            Record::Line(LineGeometry { bbox, edges })
        }

        K::GeometryArea | K::GeometryAreaExt => {
            let bbox = read_bbox(buf)?;
            let contours = le_u32(buf, "contours")? as usize;
            let triprim = le_u32(buf, "triprim")? as usize;
            let count = le_u32(buf, "count")? as usize;
            let scale = if kind.is_extended() {
                Some(le_f64(buf, "scale")?)
            } else {
                None
            };

            need_entries(buf, contours, 4, "pointcount")?;
            let mut pointcount = Vec::with_capacity(contours);
            for _ in 0..contours {
                pointcount.push(le_u32(buf, "pointcount")?);
            }

            // Smallest batch: u8 kind + u32 count + 4 × f64 bbox.
            need_entries(buf, triprim, 37, "triangles")?;
            let mut triangles = Vec::with_capacity(triprim);
            for t in 0..triprim {
                let raw = le_u8(buf, "ttype")?;
                let kind = TriangleKind::from_u8(raw)
                    .ok_or_else(|| format!("triangle batch {t}: unknown ttype {raw}"))?;
                let nvert = le_u32(buf, "nvert")? as usize;
                let bbox = read_bbox_wesn(buf)?;
                let vertices = read_xy_f32(buf, nvert, "vertices")?;

                triangles.push(TriangleBatch {
                    kind,
                    bbox,
                    vertices,
                });
            }

            let edges = read_edge_refs(buf, count, dialect.stride())?;

            Record::Area(AreaGeometry {
                bbox,
                scale,
                pointcount,
                triangles,
                edges,
            })
        }

        K::NodeTable | K::NodeTableExt => {
            let count = le_u32(buf, "count")? as usize;
            let scale = if kind.is_extended() {
                Some(le_f64(buf, "scale")?)
            } else {
                None
            };

            need_entries(buf, count, 12, "nodes")?;
            let mut nodes = Vec::with_capacity(count);
            for i in 0..count {
                let id = le_u32(buf, "node_id")?;
                if id == 0 {
                    return Err(format!("node entry {i} of {count} has id 0"));
                }
                let x = le_f32(buf, "x")?;
                let y = le_f32(buf, "y")?;
                nodes.push(Node {
                    id,
                    xy: [x as f64, y as f64],
                });
            }

            Record::NodeTable(NodeTable { scale, nodes })
        }

        K::EdgeTable | K::EdgeTableExt => {
            let count = le_u32(buf, "count")? as usize;
            let scale = if kind.is_extended() {
                Some(le_f64(buf, "scale")?)
            } else {
                None
            };

            need_entries(buf, count, 8, "edges")?;
            let mut edges = Vec::with_capacity(count);
            for i in 0..count {
                let id = le_u32(buf, "edge_id")?;
                if id == 0 {
                    return Err(format!("edge entry {i} of {count} has id 0"));
                }
                let n = le_u32(buf, "points")? as usize;
                let points = read_xy_f32(buf, n, "edge_points")?;
                edges.push(Edge { id, points });
            }

            Record::EdgeTable(EdgeTable { scale, edges })
        }

        K::Coverage | K::NoCoverage => {
            let count = le_u32(buf, "count")? as usize;
            let points = read_xy_f32(buf, count, "array")?;

            Record::Coverage(Coverage {
                covered: kind == K::Coverage,
                points,
            })
        }

        K::TextAttachment => {
            let flength = le_u32(buf, "flength")? as usize;
            let clength = le_u32(buf, "clength")? as usize;
            let file = utf8(take(buf, flength, "file")?, "file")?;

            if buf.len() != clength {
                return Err(format!(
                    "text `{file}`: clength {clength} but {} bytes of text",
                    buf.len()
                ));
            }
            let text = utf8(take(buf, clength, "text")?, "text")?;

            Record::Text(TextAttachment { file, text })
        }

        K::ServerStatus => Record::ServerStatus(ServerStatus {
            server: le_u16(buf, "server")?,
            decrypt: le_u16(buf, "decrypt")?,
            expire: le_u16(buf, "expire")?,
            expire_days_remaining: le_u16(buf, "expire_days_remaining")?,
            grace_days_allowed: le_u16(buf, "grace_days_allowed")?,
            grace_days_remaining: le_u16(buf, "grace_days_remaining")?,
        }),
    };

    Ok(record)
}

/// Position and stream context, so a second pass can replay a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderState {
    pos: usize,
    dialect: Dialect,
    strings: Option<StringEncoding>,
}

/// Sequential reader over a whole cell held in memory.
pub struct RecordReader<'a> {
    buf: &'a [u8],
    state: ReaderState,
}

impl<'a> RecordReader<'a> {
    /// `fallback` applies until a cell-version record says otherwise.
    pub fn new(buf: &'a [u8], fallback: Dialect) -> Self {
        Self {
            buf,
            state: ReaderState {
                pos: 0,
                dialect: fallback,
                strings: None,
            },
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.state.dialect
    }

    pub fn offset(&self) -> usize {
        self.state.pos
    }

    /// String form seen so far; `None` until a non-empty string was read.
    pub fn strings(&self) -> Option<StringEncoding> {
        self.state.strings
    }

    pub fn snapshot(&self) -> ReaderState {
        self.state
    }

    pub fn restore(&mut self, state: ReaderState) {
        self.state = state;
    }

    fn malformed(&self, offset: usize, kind: u16, reason: String) -> SencError {
        SencError::MalformedRecord {
            offset,
            kind,
            reason,
        }
    }

    /// Next record, or `None` at a clean end of stream.
    ///
    /// The body is cut to exactly `length - 6` bytes before decoding, so a
    /// short or long declared length can never spill into the next record.
    pub fn read_record(&mut self) -> Result<Option<Record>> {
        let offset = self.state.pos;
        let mut p = &self.buf[offset..];

        if p.is_empty() {
            return Ok(None);
        }

        let kind = le_u16(&mut p, "type").map_err(|r| self.malformed(offset, 0, r))?;
        let length =
            le_u32(&mut p, "length").map_err(|r| self.malformed(offset, kind, r))? as usize;

        if length < HEADER_LEN {
            return Err(self.malformed(
                offset,
                kind,
                format!("declared length {length} is shorter than the header"),
            ));
        }

        let body_len = length - HEADER_LEN;
        if body_len > p.len() {
            return Err(self.malformed(
                offset,
                kind,
                format!("declared length {length} exceeds the {} bytes left", p.len() + HEADER_LEN),
            ));
        }

        let record_kind = RecordKind::from_code(kind)
            .ok_or(SencError::UnknownRecordType { offset, kind })?;

        if !record_kind.allowed_in(self.state.dialect) {
            return Err(SencError::DialectViolation(format!(
                "{} record (type {kind}) at offset {offset} in an S57 stream",
                record_kind.name()
            )));
        }

        let mut body = &p[..body_len];
        let mut strings = self.state.strings;
        let record = decode_body(record_kind, &mut body, self.state.dialect, &mut strings)
            .map_err(|r| self.malformed(offset, kind, format!("{}: {r}", record_kind.name())))?;

        if !body.is_empty() {
            return Err(self.malformed(
                offset,
                kind,
                format!(
                    "{}: {} bytes left after the last field",
                    record_kind.name(),
                    body.len()
                ),
            ));
        }

        self.state.pos = offset + length;

        if strings != self.state.strings {
            debug!("strings at offset {offset}: {strings:?}");
            self.state.strings = strings;
        }

        if let Record::CellVersion(v) = record {
            let dialect = Dialect::from_version(v)?;
            debug!("cell version {v} at offset {offset}: {dialect:?}");
            self.state.dialect = dialect;
        }

        Ok(Some(record))
    }
}

impl Iterator for RecordReader<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_record() {
            Ok(r) => r.map(Ok),
            Err(e) => {
                // Stop at the first error; nothing after it can be trusted.
                self.state.pos = self.buf.len();
                Some(Err(e))
            }
        }
    }
}

/// Decode every record of a cell.
pub fn read_records(buf: &[u8], fallback: Dialect) -> Result<Vec<Record>> {
    RecordReader::new(buf, fallback).collect()
}

/// A decoded record stream together with the framing choices needed to
/// write it back byte for byte.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordStream {
    pub dialect: Dialect,
    pub strings: StringEncoding,
    pub records: Vec<Record>,
}

impl RecordStream {
    pub fn read(buf: &[u8], fallback: Dialect) -> Result<Self> {
        let mut reader = RecordReader::new(buf, fallback);
        let records = reader.by_ref().collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dialect: reader.dialect(),
            strings: reader.strings().unwrap_or_default(),
            records,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = RecordWriter::with_strings(self.dialect, self.strings);
        for r in &self.records {
            w.write(r)?;
        }
        Ok(w.into_bytes())
    }
}

// ------------------------------------------------------------------
// Writing
// ------------------------------------------------------------------

#[inline]
fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn write_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn write_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_len(out: &mut Vec<u8>, len: usize, what: &str) -> Result<()> {
    let n = u32::try_from(len)
        .map_err(|_| SencError::InvalidCell(format!("{what}: {len} entries do not fit a u32")))?;
    write_u32(out, n);
    Ok(())
}

fn write_string(out: &mut Vec<u8>, s: &str, strings: StringEncoding) {
    out.extend_from_slice(s.as_bytes());
    if strings == StringEncoding::Terminated {
        out.push(0);
    }
}

fn write_bbox(out: &mut Vec<u8>, b: &BoundingBox) {
    write_f64(out, b.south);
    write_f64(out, b.north);
    write_f64(out, b.west);
    write_f64(out, b.east);
}

fn write_edge_refs(out: &mut Vec<u8>, edges: &[EdgeRef], dialect: Dialect) -> Result<()> {
    for e in edges {
        write_u32(out, e.node0);
        write_u32(out, e.edge);
        write_u32(out, e.node1);

        match dialect {
            Dialect::Senc => write_u32(out, e.flip as u32),
            Dialect::S57 if e.flip => {
                return Err(SencError::DialectViolation(format!(
                    "flipped reference to edge {} cannot be stored in S57",
                    e.edge
                )))
            }
            Dialect::S57 => {}
        }
    }

    Ok(())
}

fn encode_body(
    record: &Record,
    out: &mut Vec<u8>,
    dialect: Dialect,
    strings: StringEncoding,
) -> Result<()> {
    match record {
        Record::CellVersion(v)
        | Record::CellEdition(v)
        | Record::CellUpdate(v) => write_u16(out, *v),
        Record::CellNativeScale(v) => write_u32(out, *v),
        Record::CellName(s)
        | Record::CellPublishDate(s)
        | Record::CellUpdateDate(s)
        | Record::CellCreateDate(s)
        | Record::CellSoundingDatum(s) => write_string(out, s, strings),

        Record::CellExtent(e) => {
            for corner in [e.sw, e.nw, e.ne, e.se] {
                write_f64(out, corner[0]);
                write_f64(out, corner[1]);
            }
        }

        Record::FeatureId(f) => {
            write_u16(out, f.ftype);
            write_u16(out, f.id);
            out.push(f.primitive as u8);
        }

        Record::Attribute(a) => {
            write_u16(out, a.code);
            out.push(a.value.vtype());

            match &a.value {
                AttributeValue::Int(v) => {
                    let wire = u32::try_from(*v).map_err(|_| SencError::ValueOutOfRange {
                        code: a.code,
                        value: *v,
                    })?;
                    write_u32(out, wire);
                }
                AttributeValue::Float(v) => write_f64(out, *v),
                AttributeValue::Text(s) => write_string(out, s, strings),
            }
        }

        Record::Point(p) => {
            write_f64(out, p.lat);
            write_f64(out, p.lon);
        }

        Record::MultiPoint(m) => {
            write_bbox(out, &m.bbox);
            write_len(out, m.points.len(), "multipoint")?;
            for p in &m.points {
                write_f32(out, p[0]);
                write_f32(out, p[1]);
                write_f32(out, p[2]);
            }
        }

        Record::Line(l) => {
            write_bbox(out, &l.bbox);
            write_len(out, l.edges.len(), "line")?;
            write_edge_refs(out, &l.edges, dialect)?;
        }

        Record::Area(a) => {
            write_bbox(out, &a.bbox);
            write_len(out, a.pointcount.len(), "area contours")?;
            write_len(out, a.triangles.len(), "area triangles")?;
            write_len(out, a.edges.len(), "area edges")?;
            if let Some(scale) = a.scale {
                write_f64(out, scale);
            }

            for &n in &a.pointcount {
                write_u32(out, n);
            }

            for t in &a.triangles {
                out.push(t.kind as u8);
                write_len(out, t.vertices.len(), "triangle vertices")?;
                write_f64(out, t.bbox.west);
                write_f64(out, t.bbox.east);
                write_f64(out, t.bbox.south);
                write_f64(out, t.bbox.north);
                for v in &t.vertices {
                    write_f32(out, v[0]);
                    write_f32(out, v[1]);
                }
            }

            write_edge_refs(out, &a.edges, dialect)?;
        }

        Record::NodeTable(t) => {
            write_len(out, t.nodes.len(), "node table")?;
            if let Some(scale) = t.scale {
                write_f64(out, scale);
            }
            for n in &t.nodes {
                write_u32(out, n.id);
                write_f32(out, n.xy[0] as f32);
                write_f32(out, n.xy[1] as f32);
            }
        }

        Record::EdgeTable(t) => {
            write_len(out, t.edges.len(), "edge table")?;
            if let Some(scale) = t.scale {
                write_f64(out, scale);
            }
            for e in &t.edges {
                write_u32(out, e.id);
                write_len(out, e.points.len(), "edge points")?;
                for p in &e.points {
                    write_f32(out, p[0]);
                    write_f32(out, p[1]);
                }
            }
        }

        Record::Coverage(c) => {
            write_len(out, c.points.len(), "coverage")?;
            for p in &c.points {
                write_f32(out, p[0]);
                write_f32(out, p[1]);
            }
        }

        Record::Text(t) => {
            write_len(out, t.file.len(), "text file name")?;
            write_len(out, t.text.len(), "text body")?;
            out.extend_from_slice(t.file.as_bytes());
            out.extend_from_slice(t.text.as_bytes());
        }

        Record::ServerStatus(s) => {
            for v in [
                s.server,
                s.decrypt,
                s.expire,
                s.expire_days_remaining,
                s.grace_days_allowed,
                s.grace_days_remaining,
            ] {
                write_u16(out, v);
            }
        }
    }

    Ok(())
}

/// Frame `body` as a record of type `kind`: `type`, `6 + len(body)`, body.
pub fn frame_record(out: &mut Vec<u8>, kind: u16, body: &[u8]) -> Result<()> {
    let length = u32::try_from(HEADER_LEN + body.len()).map_err(|_| {
        SencError::InvalidCell(format!("record type {kind}: body of {} bytes", body.len()))
    })?;

    write_u16(out, kind);
    write_u32(out, length);
    out.extend_from_slice(body);

    Ok(())
}

/// Sequential writer for one cell.
pub struct RecordWriter {
    out: Vec<u8>,
    dialect: Dialect,
    strings: StringEncoding,
    body: Vec<u8>,
}

impl RecordWriter {
    /// Strings are NUL-terminated, as chart plotters expect in both dialects.
    pub fn new(dialect: Dialect) -> Self {
        Self::with_strings(dialect, StringEncoding::Terminated)
    }

    pub fn with_strings(dialect: Dialect, strings: StringEncoding) -> Self {
        Self {
            out: Vec::new(),
            dialect,
            strings,
            body: Vec::new(),
        }
    }

    /// Serialize one record; refuses kinds and flip bits the dialect cannot hold.
    pub fn write(&mut self, record: &Record) -> Result<()> {
        let kind = record.kind();

        if !kind.allowed_in(self.dialect) {
            return Err(SencError::DialectViolation(format!(
                "{} record (type {}) is not legal in S57",
                kind.name(),
                kind.code()
            )));
        }

        if let Record::CellVersion(v) = record {
            if *v != self.dialect.version() {
                return Err(SencError::DialectViolation(format!(
                    "version {v} written into a {:?} stream",
                    self.dialect
                )));
            }
        }

        self.body.clear();
        encode_body(record, &mut self.body, self.dialect, self.strings)?;
        frame_record(&mut self.out, kind.code(), &self.body)?;

        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }
}

/// Serialize a whole record list.
pub fn write_records(dialect: Dialect, records: &[Record]) -> Result<Vec<u8>> {
    let mut w = RecordWriter::new(dialect);
    for r in records {
        w.write(r)?;
    }
    Ok(w.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox() -> BoundingBox {
        BoundingBox {
            south: 54.0,
            north: 54.5,
            west: 8.0,
            east: 8.5,
        }
    }

    fn one(dialect: Dialect, record: &Record) -> Vec<u8> {
        let mut w = RecordWriter::new(dialect);
        w.write(&Record::CellVersion(dialect.version())).unwrap();
        w.write(record).unwrap();
        w.into_bytes()
    }

    /// Walk the framing and return `(type, length, body_len)` per record.
    fn frames(bytes: &[u8]) -> Vec<(u16, u32, usize)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let kind = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
            let len = u32::from_le_bytes(bytes[pos + 2..pos + 6].try_into().unwrap());
            out.push((kind, len, len as usize - HEADER_LEN));
            pos += len as usize;
        }
        assert_eq!(pos, bytes.len());
        out
    }

    #[test]
    fn length_field_counts_the_header() {
        let bytes = one(
            Dialect::Senc,
            &Record::Point(PointGeometry { lat: 54.1, lon: 8.2 }),
        );
        let f = frames(&bytes);
        assert_eq!(f, vec![(1, 8, 2), (80, 22, 16)]);
    }

    #[test]
    fn strings_are_terminated_in_both_dialects() {
        for dialect in [Dialect::Senc, Dialect::S57] {
            let bytes = one(dialect, &Record::CellName("DE521010".into()));
            assert_eq!(*bytes.last().unwrap(), 0);
            assert_eq!(frames(&bytes)[1].2, 9);

            let records = read_records(&bytes, dialect).unwrap();
            assert_eq!(records[1], Record::CellName("DE521010".into()));
        }
    }

    /// A version 200 stream as the legacy converter wrote it.
    fn legacy_s57(strings: StringEncoding) -> Vec<u8> {
        let nul: &[u8] = match strings {
            StringEncoding::Terminated => b"\0",
            StringEncoding::Remainder => b"",
        };

        let mut bytes = Vec::new();
        frame_record(&mut bytes, 1, &200u16.to_le_bytes()).unwrap();
        frame_record(&mut bytes, 2, &[b"DE521010".as_slice(), nul].concat()).unwrap();
        frame_record(&mut bytes, 64, &[30, 0, 1, 0, 0]).unwrap();
        let attribute = [&[116u8, 0, 4][..], b"Elbe".as_slice(), nul].concat();
        frame_record(&mut bytes, 65, &attribute).unwrap();
        bytes
    }

    #[test]
    fn legacy_terminated_strings_lose_their_nul() {
        let bytes = legacy_s57(StringEncoding::Terminated);
        let records = read_records(&bytes, Dialect::S57).unwrap();
        assert_eq!(records[1], Record::CellName("DE521010".into()));
        assert_eq!(
            records[3],
            Record::Attribute(Attribute {
                code: 116,
                value: AttributeValue::Text("Elbe".into()),
            })
        );
    }

    #[test]
    fn stream_keeps_the_string_form_it_was_read_with() {
        for strings in [StringEncoding::Terminated, StringEncoding::Remainder] {
            let bytes = legacy_s57(strings);
            let stream = RecordStream::read(&bytes, Dialect::S57).unwrap();

            assert_eq!(stream.dialect, Dialect::S57);
            assert_eq!(stream.strings, strings);
            assert_eq!(
                stream.records[3],
                Record::Attribute(Attribute {
                    code: 116,
                    value: AttributeValue::Text("Elbe".into()),
                })
            );
            assert_eq!(stream.to_bytes().unwrap(), bytes);
        }
    }

    #[test]
    fn string_form_must_not_change_mid_stream() {
        let mut bytes = one(Dialect::Senc, &Record::CellName("DE521010".into()));
        let offset = bytes.len();
        frame_record(&mut bytes, RecordKind::CellPublishDate.code(), b"20240101").unwrap();

        let err = read_records(&bytes, Dialect::Senc).unwrap_err();
        assert!(matches!(
            err,
            SencError::MalformedRecord { offset: o, kind: 3, .. } if o == offset
        ));
    }

    #[test]
    fn attribute_width_follows_vtype() {
        for (value, body_len) in [
            (AttributeValue::Int(7), 2 + 1 + 4),
            (AttributeValue::Float(1.5), 2 + 1 + 8),
            (AttributeValue::Text("red".into()), 2 + 1 + 3 + 1),
        ] {
            let rec = Record::Attribute(Attribute { code: 75, value });
            let bytes = one(Dialect::Senc, &rec);
            assert_eq!(frames(&bytes)[1].2, body_len);
            assert_eq!(read_records(&bytes, Dialect::Senc).unwrap()[1], rec);
        }
    }

    #[test]
    fn negative_int_attribute_is_rejected() {
        let mut w = RecordWriter::new(Dialect::Senc);
        let err = w
            .write(&Record::Attribute(Attribute {
                code: 3,
                value: AttributeValue::Int(-1),
            }))
            .unwrap_err();
        assert!(matches!(err, SencError::ValueOutOfRange { code: 3, value: -1 }));
    }

    #[test]
    fn edge_stride_follows_dialect() {
        let line = Record::Line(LineGeometry {
            bbox: bbox(),
            edges: vec![EdgeRef {
                node0: 1,
                edge: 2,
                node1: 3,
                flip: false,
            }],
        });

        assert_eq!(frames(&one(Dialect::Senc, &line))[1].2, 32 + 4 + 16);
        assert_eq!(frames(&one(Dialect::S57, &line))[1].2, 32 + 4 + 12);

        for dialect in [Dialect::Senc, Dialect::S57] {
            let back = read_records(&one(dialect, &line), dialect).unwrap();
            assert_eq!(back[1], line);
        }
    }

    #[test]
    fn s57_rejects_flip_and_extended_records() {
        let mut w = RecordWriter::new(Dialect::S57);
        let flipped = Record::Line(LineGeometry {
            bbox: bbox(),
            edges: vec![EdgeRef {
                node0: 1,
                edge: 2,
                node1: 1,
                flip: true,
            }],
        });
        assert!(matches!(w.write(&flipped), Err(SencError::DialectViolation(_))));

        let ext = Record::NodeTable(NodeTable {
            scale: Some(10.0),
            nodes: vec![],
        });
        assert!(matches!(w.write(&ext), Err(SencError::DialectViolation(_))));
        assert!(matches!(
            w.write(&Record::CellVersion(201)),
            Err(SencError::DialectViolation(_))
        ));
    }

    #[test]
    fn s57_stream_with_senc_only_record_is_a_dialect_violation() {
        let mut bytes = one(Dialect::S57, &Record::CellEdition(1));
        let mut body = Vec::new();
        write_u32(&mut body, 0);
        write_f64(&mut body, 100.0);
        frame_record(&mut bytes, RecordKind::NodeTableExt.code(), &body).unwrap();

        let err = read_records(&bytes, Dialect::Senc).unwrap_err();
        assert!(matches!(err, SencError::DialectViolation(_)));
    }

    #[test]
    fn extended_tables_carry_scale() {
        let rec = Record::EdgeTable(EdgeTable {
            scale: Some(100.0),
            edges: vec![Edge {
                id: 4,
                points: vec![[1.0, 2.0], [3.0, 4.0]],
            }],
        });
        assert_eq!(rec.kind(), RecordKind::EdgeTableExt);

        let bytes = one(Dialect::Senc, &rec);
        assert_eq!(frames(&bytes)[1], (85, 6 + 4 + 8 + 8 + 16, 4 + 8 + 8 + 16));
        assert_eq!(read_records(&bytes, Dialect::Senc).unwrap()[1], rec);
    }

    #[test]
    fn area_layout_round_trips() {
        let area = Record::Area(AreaGeometry {
            bbox: bbox(),
            scale: None,
            pointcount: vec![4],
            triangles: vec![TriangleBatch {
                kind: TriangleKind::List,
                bbox: bbox(),
                vertices: vec![[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]],
            }],
            edges: vec![EdgeRef {
                node0: 1,
                edge: 1,
                node1: 1,
                flip: false,
            }],
        });

        let bytes = one(Dialect::Senc, &area);
        let body = 32 + 12 + 4 + (1 + 4 + 32 + 24) + 16;
        assert_eq!(frames(&bytes)[1].2, body);
        assert_eq!(read_records(&bytes, Dialect::Senc).unwrap()[1], area);
    }

    #[test]
    fn unknown_type_is_reported_with_offset() {
        let mut bytes = one(Dialect::Senc, &Record::CellEdition(3));
        frame_record(&mut bytes, 77, &[1, 2, 3]).unwrap();

        let err = read_records(&bytes, Dialect::Senc).unwrap_err();
        assert!(matches!(
            err,
            SencError::UnknownRecordType { offset: 16, kind: 77 }
        ));
    }

    #[test]
    fn short_declared_length_does_not_read_into_next_record() {
        // Point record claiming 12 body bytes instead of 16, followed by a valid record.
        let mut bytes = Vec::new();
        frame_record(&mut bytes, 80, &[0u8; 12]).unwrap();
        frame_record(&mut bytes, 4, &1u16.to_le_bytes()).unwrap();

        let mut reader = RecordReader::new(&bytes, Dialect::Senc);
        let err = reader.read_record().unwrap_err();
        assert!(matches!(err, SencError::MalformedRecord { offset: 0, kind: 80, .. }));
        assert_eq!(reader.offset(), 0);
    }

    #[test]
    fn long_declared_length_leaves_bytes_over() {
        let mut bytes = Vec::new();
        frame_record(&mut bytes, 4, &[1, 0, 0xAA]).unwrap();

        let err = read_records(&bytes, Dialect::Senc).unwrap_err();
        match err {
            SencError::MalformedRecord { reason, .. } => assert!(reason.contains("1 bytes left")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn length_past_end_of_stream_is_malformed() {
        let mut bytes = Vec::new();
        write_u16(&mut bytes, 4);
        write_u32(&mut bytes, 100);
        bytes.extend_from_slice(&[1, 0]);

        assert!(matches!(
            read_records(&bytes, Dialect::Senc),
            Err(SencError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn iterator_stops_after_first_error() {
        let mut bytes = Vec::new();
        frame_record(&mut bytes, 77, &[]).unwrap();
        frame_record(&mut bytes, 4, &1u16.to_le_bytes()).unwrap();

        let mut reader = RecordReader::new(&bytes, Dialect::Senc);
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }

    #[test]
    fn snapshot_replays_the_same_records() {
        let bytes = write_records(
            Dialect::Senc,
            &[
                Record::CellVersion(201),
                Record::CellName("X".into()),
                Record::CellEdition(2),
            ],
        )
        .unwrap();

        let mut reader = RecordReader::new(&bytes, Dialect::S57);
        reader.read_record().unwrap();
        let mark = reader.snapshot();
        let first: Vec<Record> = reader.by_ref().collect::<Result<_>>().unwrap();

        reader.restore(mark);
        let again: Vec<Record> = reader.collect::<Result<_>>().unwrap();
        assert_eq!(first, again);
        assert_eq!(first[0], Record::CellName("X".into()));
    }

    #[test]
    fn text_attachment_checks_clength() {
        let rec = Record::Text(TextAttachment {
            file: "DE521010.TXT".into(),
            text: "Notes".into(),
        });
        let bytes = one(Dialect::Senc, &rec);
        assert_eq!(read_records(&bytes, Dialect::Senc).unwrap()[1], rec);

        let mut body = Vec::new();
        write_u32(&mut body, 1);
        write_u32(&mut body, 9);
        body.extend_from_slice(b"ab");
        let mut bad = Vec::new();
        frame_record(&mut bad, 101, &body).unwrap();
        assert!(matches!(
            read_records(&bad, Dialect::Senc),
            Err(SencError::MalformedRecord { kind: 101, .. })
        ));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut bytes = Vec::new();
        frame_record(&mut bytes, 1, &202u16.to_le_bytes()).unwrap();
        assert!(matches!(
            read_records(&bytes, Dialect::Senc),
            Err(SencError::UnsupportedVersion(202))
        ));
    }
}
