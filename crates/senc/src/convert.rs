//! Whole-cell conversion between the record stream and the feature model.

use hashbrown::HashMap;
use log::{debug, warn};

use crate::error::{Result, SencError, Table};
use crate::grid::GridFrame;
use crate::model::{
    Attribute, BoundingBox, Cell, CellExtent, ChartFeature, Coverage, Dialect, Edge, EdgeRef,
    Shape, TriangleBatch, TriangleKind,
};
use crate::record::{
    read_records, write_records, AreaGeometry, EdgeTable as EdgeTableRecord, FeatureId,
    LineGeometry, MultiPointGeometry, NodeTable, PointGeometry, Record, RecordReader,
    RecordWriter, TextAttachment,
};
use crate::topology::{check_ring, TopologyBuilder, TopologyTables};
use crate::triangulate::{ring_area, triangulate};

/// Everything recovered from one cell file.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCell {
    pub dialect: Dialect,
    pub cell: Cell,
    pub features: Vec<ChartFeature>,
    /// Free-text attachments, passed through untouched.
    pub texts: Vec<TextAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DecodePhase {
    Start,
    ReadingHeader,
    ReadingTables,
    ReadingFeatures,
    Done,
}

struct PhaseTracker {
    phase: DecodePhase,
}

impl PhaseTracker {
    /// Phases only move forward.
    fn advance(&mut self, next: DecodePhase) {
        if next > self.phase {
            debug!("decode: {:?} -> {:?}", self.phase, next);
            self.phase = next;
        }
    }
}

fn cell_string(s: String) -> String {
    s.trim_end_matches('\0').to_owned()
}

fn is_header(record: &Record) -> bool {
    matches!(
        record,
        Record::CellVersion(_)
            | Record::CellName(_)
            | Record::CellPublishDate(_)
            | Record::CellEdition(_)
            | Record::CellUpdateDate(_)
            | Record::CellUpdate(_)
            | Record::CellNativeScale(_)
            | Record::CellCreateDate(_)
            | Record::CellSoundingDatum(_)
            | Record::CellExtent(_)
    )
}

/// Feature being collected in pass 2.
struct Pending {
    id: FeatureId,
    attributes: Vec<Attribute>,
    shape: Option<Shape>,
    rejected: Option<String>,
}

impl Pending {
    fn new(id: FeatureId) -> Self {
        Self {
            id,
            attributes: Vec::new(),
            shape: None,
            rejected: None,
        }
    }

    fn add_shape(&mut self, shape: Shape) {
        if self.rejected.is_some() {
            return;
        }

        if shape.primitive() != self.id.primitive {
            self.rejected = Some(format!(
                "{:?} geometry on a {:?} feature",
                shape.primitive(),
                self.id.primitive
            ));
            return;
        }

        self.shape = match (self.shape.take(), shape) {
            (None, s) => Some(s),
            (Some(Shape::Line(mut a)), Shape::Line(b)) => {
                a.extend(b);
                Some(Shape::Line(a))
            }
            (
                Some(Shape::Area {
                    mut contours,
                    mut triangles,
                }),
                Shape::Area {
                    contours: c,
                    triangles: t,
                },
            ) => {
                contours.extend(c);
                triangles.extend(t);
                Some(Shape::Area {
                    contours,
                    triangles,
                })
            }
            (Some(Shape::Soundings(mut a)), Shape::Soundings(b)) => {
                a.extend(b);
                Some(Shape::Soundings(a))
            }
            (Some(_), _) => {
                self.rejected = Some("geometry records of different kinds".into());
                None
            }
        };
    }

    fn finish(self, out: &mut Vec<ChartFeature>) {
        let FeatureId { ftype, id, .. } = self.id;

        if let Some(reason) = self.rejected {
            let err = SencError::UnsupportedGeometry(reason);
            warn!("feature {id} (class {ftype}) skipped: {err}");
            return;
        }

        match self.shape {
            Some(shape) => out.push(ChartFeature {
                ftype,
                id,
                attributes: self.attributes,
                shape,
            }),
            None => debug!("feature {id} (class {ftype}) has no geometry"),
        }
    }
}

/// Cell frame, required by every record that refers to the node/edge tables.
fn cell_frame(frame: Option<GridFrame>, what: &str) -> Result<GridFrame> {
    frame.ok_or_else(|| SencError::InvalidCell(format!("{what} geometry in a cell without extent")))
}

fn decode_shape(
    record: &Record,
    frame: Option<GridFrame>,
    tables: &TopologyTables,
) -> Result<Option<Shape>> {
    let shape = match record {
        Record::Point(p) => Shape::Point([p.lon, p.lat]),

        Record::MultiPoint(m) => {
            let [lon, lat] = m.bbox.center();
            let local = GridFrame::centered_at(lon, lat);
            Shape::Soundings(
                m.points
                    .iter()
                    .map(|p| {
                        let [lon, lat] = local.to_geo([p[0] as f64, p[1] as f64]);
                        [lon, lat, p[2] as f64]
                    })
                    .collect(),
            )
        }

        Record::Line(l) => {
            let frame = cell_frame(frame, "line")?;
            let lines = tables.resolve_line(&l.edges)?;
            Shape::Line(
                lines
                    .into_iter()
                    .map(|c| c.into_iter().map(|p| frame.to_geo(p)).collect())
                    .collect(),
            )
        }

        Record::Area(a) => {
            let frame = cell_frame(frame, "area")?;
            let scale = a.scale.unwrap_or(1.0);
            let contours: Vec<Vec<[f64; 2]>> = tables
                .resolve_area(&a.edges, &a.pointcount)?
                .into_iter()
                .map(|c| c.into_iter().map(|p| frame.to_geo(p)).collect())
                .collect();
            let triangles: Vec<[f64; 2]> = a
                .triangles
                .iter()
                .flat_map(TriangleBatch::triangle_list)
                .map(|v| frame.scaled_to_geo([v[0] as f64, v[1] as f64], scale))
                .collect();

            Shape::Area {
                contours,
                triangles,
            }
        }

        _ => return Ok(None),
    };

    Ok(Some(shape))
}

/// Decode one cell.
///
/// Pass 1 gathers metadata, coverage and the node/edge tables; pass 2 replays
/// the same bytes to build features, so geometry may reference table entries
/// stored anywhere in the file.
pub fn decode_cell(bytes: &[u8], fallback: Dialect) -> Result<DecodedCell> {
    let mut reader = RecordReader::new(bytes, fallback);
    let start = reader.snapshot();
    let mut phase = PhaseTracker {
        phase: DecodePhase::Start,
    };

    let mut cell = Cell {
        name: String::new(),
        edition: 0,
        update: 0,
        publish_date: String::new(),
        update_date: String::new(),
        create_date: String::new(),
        native_scale: 0,
        sounding_datum: None,
        extent: CellExtent::from_bounds(BoundingBox {
            south: 0.0,
            north: 0.0,
            west: 0.0,
            east: 0.0,
        }),
        coverage: Vec::new(),
    };
    let mut extent_seen = false;
    let mut tables = TopologyTables::default();
    let mut texts = Vec::new();

    while let Some(record) = reader.read_record()? {
        if is_header(&record) {
            phase.advance(DecodePhase::ReadingHeader);
        } else {
            phase.advance(DecodePhase::ReadingTables);
        }

        match record {
            Record::CellName(s) => cell.name = cell_string(s),
            Record::CellPublishDate(s) => cell.publish_date = cell_string(s),
            Record::CellEdition(v) => cell.edition = v,
            Record::CellUpdateDate(s) => cell.update_date = cell_string(s),
            Record::CellUpdate(v) => cell.update = v,
            Record::CellNativeScale(v) => cell.native_scale = v,
            Record::CellCreateDate(s) => cell.create_date = cell_string(s),
            Record::CellSoundingDatum(s) => cell.sounding_datum = Some(cell_string(s)),
            Record::CellExtent(e) => {
                cell.extent = e;
                extent_seen = true;
            }
            Record::NodeTable(t) => tables.insert_nodes(&t.nodes, t.scale)?,
            Record::EdgeTable(t) => tables.insert_edges(&t.edges, t.scale)?,
            Record::Coverage(c) => cell.coverage.push(c),
            Record::Text(t) => texts.push(t),
            _ => {}
        }
    }

    let dialect = reader.dialect();
    debug!(
        "cell {}: {:?}, {} bytes, {} nodes, {} edges, {} coverage polygons",
        cell.name,
        dialect,
        reader.offset(),
        tables.node_count(),
        tables.edge_count(),
        cell.coverage.len()
    );

    let frame = extent_seen.then(|| {
        let [lon, lat] = cell.extent.center();
        GridFrame::centered_at(lon, lat)
    });

    reader.restore(start);
    phase.advance(DecodePhase::ReadingFeatures);

    let mut features = Vec::new();
    let mut pending: Option<Pending> = None;

    while let Some(record) = reader.read_record()? {
        match record {
            Record::FeatureId(id) => {
                if let Some(p) = pending.replace(Pending::new(id)) {
                    p.finish(&mut features);
                }
            }
            Record::Attribute(a) => match pending.as_mut() {
                Some(p) => p.attributes.push(a),
                None => warn!("attribute {} before the first feature ignored", a.code),
            },
            other => {
                if let Some(shape) = decode_shape(&other, frame, &tables)? {
                    match pending.as_mut() {
                        Some(p) => p.add_shape(shape),
                        None => warn!(
                            "{} record before the first feature ignored",
                            other.kind().name()
                        ),
                    }
                }
            }
        }
    }

    if let Some(p) = pending.take() {
        p.finish(&mut features);
    }
    phase.advance(DecodePhase::Done);

    Ok(DecodedCell {
        dialect,
        cell,
        features,
        texts,
    })
}

/// Even-odd containment of `p` in `ring`.
fn point_in_ring(p: [f64; 2], ring: &[[f64; 2]]) -> bool {
    let mut inside = false;
    let mut j = match ring.len() {
        0 => return false,
        n => n - 1,
    };

    for i in 0..ring.len() {
        let (a, b) = (ring[i], ring[j]);
        if (a[1] > p[1]) != (b[1] > p[1])
            && p[0] < (b[0] - a[0]) * (p[1] - a[1]) / (b[1] - a[1]) + a[0]
        {
            inside = !inside;
        }
        j = i;
    }

    inside
}

/// Contours that are not inside a larger one.
fn outer_contours(contours: &[Vec<[f64; 2]>]) -> Vec<&Vec<[f64; 2]>> {
    let areas: Vec<f64> = contours.iter().map(|c| ring_area(c)).collect();

    contours
        .iter()
        .enumerate()
        .filter(|(i, c)| {
            let Some(&first) = c.first() else {
                return true;
            };
            !contours
                .iter()
                .enumerate()
                .any(|(j, other)| j != *i && areas[j] > areas[*i] && point_in_ring(first, other))
        })
        .map(|(_, c)| c)
        .collect()
}

fn bounds_of<'a>(contours: impl IntoIterator<Item = &'a Vec<[f64; 2]>>) -> Result<BoundingBox> {
    BoundingBox::from_positions(contours.into_iter().flatten())
        .ok_or_else(|| SencError::UnsupportedGeometry("no finite coordinates".into()))
}

/// Build the geometry record of one feature, adding its outline to `topology`.
/// Everything is validated before the builder is touched, so a rejected
/// feature leaves no orphan nodes or edges behind.
fn encode_shape(
    feature: &ChartFeature,
    frame: &GridFrame,
    topology: &mut TopologyBuilder,
) -> Result<Record> {
    let record = match &feature.shape {
        Shape::Point([lon, lat]) => {
            if !(lon.is_finite() && lat.is_finite()) {
                return Err(SencError::UnsupportedGeometry("non-finite point".into()));
            }
            Record::Point(PointGeometry {
                lat: *lat,
                lon: *lon,
            })
        }

        Shape::Soundings(points) => {
            let bbox = feature
                .bounds()
                .ok_or_else(|| SencError::UnsupportedGeometry("empty sounding cluster".into()))?;
            let [clon, clat] = bbox.center();
            let local = GridFrame::centered_at(clon, clat);

            Record::MultiPoint(MultiPointGeometry {
                bbox,
                points: points
                    .iter()
                    .map(|p| {
                        let [x, y] = local.to_local([p[0], p[1]]);
                        [x as f32, y as f32, p[2] as f32]
                    })
                    .collect(),
            })
        }

        Shape::Line(contours) => {
            if contours.is_empty() {
                return Err(SencError::UnsupportedGeometry("line without contours".into()));
            }
            if let Some(c) = contours.iter().find(|c| c.len() < 2) {
                return Err(SencError::UnsupportedGeometry(format!(
                    "polyline with {} point(s)",
                    c.len()
                )));
            }
            let bbox = bounds_of(contours)?;

            let mut edges = Vec::with_capacity(contours.len());
            for c in contours {
                let local: Vec<[f64; 2]> = c.iter().map(|&p| frame.to_local(p)).collect();
                edges.push(topology.add_line(&local)?);
            }

            Record::Line(LineGeometry { bbox, edges })
        }

        Shape::Area { contours, .. } => {
            if contours.is_empty() {
                return Err(SencError::UnsupportedGeometry("area without contours".into()));
            }
            for c in contours {
                check_ring(c)?;
            }

            let outer = outer_contours(contours);
            if outer.len() < contours.len() {
                warn!(
                    "feature class {}: {} hole(s) dropped, keeping {} outer contour(s)",
                    feature.ftype,
                    contours.len() - outer.len(),
                    outer.len()
                );
            }
            let bbox = bounds_of(outer.iter().copied())?;

            let mut pointcount = Vec::with_capacity(outer.len());
            let mut edges = Vec::with_capacity(outer.len());
            let mut fill: Vec<[f32; 2]> = Vec::new();

            for ring in outer {
                let local: Vec<[f64; 2]> = ring.iter().map(|&p| frame.to_local(p)).collect();

                match triangulate(&local) {
                    Ok(tris) => fill.extend(tris.iter().map(|v| [v[0] as f32, v[1] as f32])),
                    Err(e) => warn!(
                        "feature class {}: contour of {} points left unfilled: {e}",
                        feature.ftype,
                        ring.len()
                    ),
                }

                pointcount.push(ring.len() as u32);
                edges.push(topology.add_ring(&local)?);
            }

            let triangles = if fill.is_empty() {
                Vec::new()
            } else {
                vec![TriangleBatch {
                    kind: TriangleKind::List,
                    bbox,
                    vertices: fill,
                }]
            };

            Record::Area(AreaGeometry {
                bbox,
                scale: None,
                pointcount,
                triangles,
                edges,
            })
        }
    };

    Ok(record)
}

/// Areas first (largest first), then lines, then points.
fn render_order(features: &[ChartFeature]) -> Vec<&ChartFeature> {
    let rank = |f: &ChartFeature| -> (u8, f64) {
        match &f.shape {
            Shape::Area { contours, .. } => {
                (0, -contours.first().map(|c| ring_area(c)).unwrap_or(0.0))
            }
            Shape::Line(_) => (1, 0.0),
            Shape::Point(_) | Shape::Soundings(_) => (2, 0.0),
        }
    };

    let mut ordered: Vec<&ChartFeature> = features.iter().collect();
    ordered.sort_by(|a, b| {
        let (ra, aa) = rank(a);
        let (rb, ab) = rank(b);
        ra.cmp(&rb).then(aa.total_cmp(&ab))
    });
    ordered
}

/// Rectangle ring around the extent, as `[lon, lat]`.
fn extent_ring(extent: &CellExtent) -> Vec<[f64; 2]> {
    let b = extent.bounds();
    vec![
        [b.west, b.south],
        [b.east, b.south],
        [b.east, b.north],
        [b.west, b.north],
        [b.west, b.south],
    ]
}

/// Encode one cell: header, coverage, features, then the node and edge tables.
///
/// Features whose geometry cannot be stored are logged and left out; every
/// other failure aborts the cell.
pub fn encode_cell(cell: &Cell, features: &[ChartFeature], dialect: Dialect) -> Result<Vec<u8>> {
    if cell.edition == 0 {
        return Err(SencError::InvalidCell(format!(
            "cell {}: edition must be at least 1",
            cell.name
        )));
    }
    if features.len() > u16::MAX as usize {
        return Err(SencError::InvalidCell(format!(
            "cell {}: {} features exceed the u16 feature id",
            cell.name,
            features.len()
        )));
    }

    let mut w = RecordWriter::new(dialect);

    w.write(&Record::CellVersion(dialect.version()))?;
    w.write(&Record::CellName(cell.name.clone()))?;
    w.write(&Record::CellPublishDate(cell.publish_date.clone()))?;
    w.write(&Record::CellEdition(cell.edition))?;
    w.write(&Record::CellUpdateDate(cell.update_date.clone()))?;
    w.write(&Record::CellUpdate(cell.update))?;
    w.write(&Record::CellNativeScale(cell.native_scale))?;
    w.write(&Record::CellCreateDate(cell.create_date.clone()))?;
    if let (Dialect::Senc, Some(datum)) = (dialect, &cell.sounding_datum) {
        w.write(&Record::CellSoundingDatum(datum.clone()))?;
    }
    w.write(&Record::CellExtent(cell.extent))?;

    if cell.coverage.is_empty() {
        w.write(&Record::Coverage(Coverage::from_ring(
            true,
            &extent_ring(&cell.extent),
        )))?;
    } else {
        for c in &cell.coverage {
            w.write(&Record::Coverage(c.clone()))?;
        }
    }

    let [lon, lat] = cell.extent.center();
    let frame = GridFrame::centered_at(lon, lat);
    let mut topology = TopologyBuilder::new(dialect);
    let mut next_id: u16 = 1;
    let mut skipped = 0usize;

    for feature in render_order(features) {
        let geometry = match encode_shape(feature, &frame, &mut topology) {
            Ok(r) => r,
            Err(e) if e.is_recoverable() => {
                warn!("cell {}: feature class {} skipped: {e}", cell.name, feature.ftype);
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        w.write(&Record::FeatureId(FeatureId {
            ftype: feature.ftype,
            id: next_id,
            primitive: feature.shape.primitive(),
        }))?;
        for a in &feature.attributes {
            w.write(&Record::Attribute(a.clone()))?;
        }
        w.write(&geometry)?;

        next_id += 1;
    }

    debug!(
        "cell {}: {} nodes, {} edges",
        cell.name,
        topology.node_count(),
        topology.edge_count()
    );
    let (nodes, edges) = topology.into_tables();
    if !nodes.is_empty() {
        w.write(&Record::NodeTable(NodeTable { scale: None, nodes }))?;
    }
    if !edges.is_empty() {
        w.write(&Record::EdgeTable(EdgeTableRecord { scale: None, edges }))?;
    }

    let bytes = w.into_bytes();
    debug!(
        "cell {}: {} features written, {} skipped, {} bytes",
        cell.name,
        next_id - 1,
        skipped,
        bytes.len()
    );

    Ok(bytes)
}

/// Rewrites flipped references as references to new forward-only edges.
struct FlipResolver<'a> {
    edges: HashMap<u32, &'a [[f32; 2]]>,
    reversed: HashMap<u32, u32>,
    added: Vec<Edge>,
    next_id: u32,
}

impl<'a> FlipResolver<'a> {
    fn new(records: &'a [Record]) -> Self {
        let mut edges = HashMap::new();
        for r in records {
            if let Record::EdgeTable(t) = r {
                for e in &t.edges {
                    edges.insert(e.id, e.points.as_slice());
                }
            }
        }

        let next_id = edges.keys().copied().max().unwrap_or(0) + 1;

        Self {
            edges,
            reversed: HashMap::new(),
            added: Vec::new(),
            next_id,
        }
    }

    fn rewrite(&mut self, refs: &[EdgeRef]) -> Result<Vec<EdgeRef>> {
        refs.iter()
            .map(|r| {
                if !r.flip {
                    return Ok(*r);
                }
                if r.edge == 0 {
                    return Ok(EdgeRef { flip: false, ..*r });
                }

                let edge = match self.reversed.get(&r.edge) {
                    Some(&id) => id,
                    None => {
                        let points = self.edges.get(&r.edge).ok_or(SencError::UnresolvedReference {
                            table: Table::Edge,
                            id: r.edge,
                        })?;
                        let id = self.next_id;
                        self.next_id += 1;
                        self.added.push(Edge {
                            id,
                            points: points.iter().rev().copied().collect(),
                        });
                        self.reversed.insert(r.edge, id);
                        id
                    }
                };

                Ok(EdgeRef {
                    node0: r.node0,
                    edge,
                    node1: r.node1,
                    flip: false,
                })
            })
            .collect()
    }
}

/// Transcode a SENC cell to S57.
///
/// Flipped edge references get their own reversed copy of the edge, appended
/// to the last edge table. Records with no S57 counterpart and no geometry are
/// dropped; extended records are refused.
pub fn senc_to_s57(bytes: &[u8]) -> Result<Vec<u8>> {
    let records = read_records(bytes, Dialect::Senc)?;

    if let Some(r) = records.iter().find(|r| r.kind().is_extended()) {
        return Err(SencError::DialectViolation(format!(
            "{} record has no S57 form",
            r.kind().name()
        )));
    }

    let mut flips = FlipResolver::new(&records);
    let mut out: Vec<Record> = Vec::with_capacity(records.len());
    let mut last_edge_table = None;

    for record in &records {
        let rewritten = match record {
            Record::CellVersion(_) => Record::CellVersion(Dialect::S57.version()),
            Record::CellSoundingDatum(_) | Record::Text(_) | Record::ServerStatus(_) => {
                warn!("{} record dropped: not representable in S57", record.kind().name());
                continue;
            }
            Record::Line(l) => Record::Line(LineGeometry {
                bbox: l.bbox,
                edges: flips.rewrite(&l.edges)?,
            }),
            Record::Area(a) => Record::Area(AreaGeometry {
                edges: flips.rewrite(&a.edges)?,
                ..a.clone()
            }),
            Record::EdgeTable(_) => {
                last_edge_table = Some(out.len());
                record.clone()
            }
            other => other.clone(),
        };

        out.push(rewritten);
    }

    let added = std::mem::take(&mut flips.added);
    if !added.is_empty() {
        debug!("{} reversed edges added for S57", added.len());
        match last_edge_table.and_then(|i| out.get_mut(i)) {
            Some(Record::EdgeTable(t)) => t.edges.extend(added),
            _ => out.push(Record::EdgeTable(EdgeTableRecord {
                scale: None,
                edges: added,
            })),
        }
    }

    write_records(Dialect::S57, &out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeValue, Primitive};
    use approx::assert_abs_diff_eq;

    fn square(x: f64, y: f64, d: f64) -> Vec<[f64; 2]> {
        vec![[x, y], [x + d, y], [x + d, y + d], [x, y + d], [x, y]]
    }

    fn cell(features: &[ChartFeature]) -> Cell {
        Cell::from_features("DE421010", features).unwrap()
    }

    #[test]
    fn point_and_attributes_round_trip() {
        let features = vec![ChartFeature::new(75, Shape::Point([8.25, 54.1]))
            .with_attribute(116, AttributeValue::Text("Red".into()))
            .with_attribute(75, AttributeValue::Int(3))];

        let mut c = cell(&features);
        c.sounding_datum = Some("MLLW".into());
        let bytes = encode_cell(&c, &features, Dialect::Senc).unwrap();
        let decoded = decode_cell(&bytes, Dialect::S57).unwrap();

        assert_eq!(decoded.dialect, Dialect::Senc);
        assert_eq!(decoded.cell.name, "DE421010");
        assert_eq!(decoded.cell.sounding_datum.as_deref(), Some("MLLW"));
        assert_eq!(decoded.cell.coverage.len(), 1);
        assert_eq!(decoded.features.len(), 1);

        let f = &decoded.features[0];
        assert_eq!(f.id, 1);
        assert_eq!(f.shape, Shape::Point([8.25, 54.1]));
        assert_eq!(f.attribute(75), Some(&AttributeValue::Int(3)));
    }

    #[test]
    fn s57_cell_omits_sounding_datum() {
        let features = vec![ChartFeature::new(75, Shape::Point([8.25, 54.1]))];
        let mut c = cell(&features);
        c.sounding_datum = Some("MLLW".into());

        let bytes = encode_cell(&c, &features, Dialect::S57).unwrap();
        let decoded = decode_cell(&bytes, Dialect::Senc).unwrap();
        assert_eq!(decoded.dialect, Dialect::S57);
        assert_eq!(decoded.cell.sounding_datum, None);
    }

    #[test]
    fn line_round_trip_within_f32_precision() {
        let line = vec![[8.0, 54.0], [8.01, 54.02], [8.03, 54.01]];
        let features = vec![ChartFeature::new(30, Shape::Line(vec![line.clone()]))];
        let bytes = encode_cell(&cell(&features), &features, Dialect::Senc).unwrap();

        let decoded = decode_cell(&bytes, Dialect::Senc).unwrap();
        let Shape::Line(contours) = &decoded.features[0].shape else {
            panic!("expected a line");
        };
        assert_eq!(contours.len(), 1);
        for (a, b) in contours[0].iter().zip(&line) {
            assert_abs_diff_eq!(a[0], b[0], epsilon = 1e-6);
            assert_abs_diff_eq!(a[1], b[1], epsilon = 1e-6);
        }
    }

    #[test]
    fn soundings_are_centred_on_their_cluster() {
        let pts = vec![[8.1, 54.1, 3.5], [8.2, 54.15, 12.0], [8.15, 54.2, 7.25]];
        let features = vec![ChartFeature::new(129, Shape::Soundings(pts.clone()))];
        let bytes = encode_cell(&cell(&features), &features, Dialect::Senc).unwrap();

        let records = read_records(&bytes, Dialect::Senc).unwrap();
        let mp = records
            .iter()
            .find_map(|r| match r {
                Record::MultiPoint(m) => Some(m.clone()),
                _ => None,
            })
            .unwrap();
        let (sx, sy) = mp
            .points
            .iter()
            .fold((0.0f32, 0.0f32), |(x, y), p| (x.min(p[0]), y.min(p[1])));
        assert!(sx < 0.0 && sy < 0.0);

        let decoded = decode_cell(&bytes, Dialect::Senc).unwrap();
        let Shape::Soundings(back) = &decoded.features[0].shape else {
            panic!("expected soundings");
        };
        for (a, b) in back.iter().zip(&pts) {
            assert_abs_diff_eq!(a[0], b[0], epsilon = 1e-6);
            assert_abs_diff_eq!(a[1], b[1], epsilon = 1e-6);
            assert_eq!(a[2], b[2]);
        }
    }

    #[test]
    fn areas_come_first_largest_first() {
        let features = vec![
            ChartFeature::new(1, Shape::Point([8.0, 54.0])),
            ChartFeature::new(2, Shape::Line(vec![vec![[8.0, 54.0], [8.1, 54.1]]])),
            ChartFeature::new(
                3,
                Shape::Area {
                    contours: vec![square(8.0, 54.0, 0.01)],
                    triangles: vec![],
                },
            ),
            ChartFeature::new(
                4,
                Shape::Area {
                    contours: vec![square(8.0, 54.0, 0.1)],
                    triangles: vec![],
                },
            ),
        ];

        let order: Vec<u16> = render_order(&features).iter().map(|f| f.ftype).collect();
        assert_eq!(order, vec![4, 3, 2, 1]);
    }

    #[test]
    fn open_ring_feature_is_skipped_not_fatal() {
        let features = vec![
            ChartFeature::new(
                42,
                Shape::Area {
                    contours: vec![vec![[8.0, 54.0], [8.1, 54.0], [8.1, 54.1], [8.0, 54.1]]],
                    triangles: vec![],
                },
            ),
            ChartFeature::new(75, Shape::Point([8.05, 54.05])),
        ];
        let bytes = encode_cell(&cell(&features), &features, Dialect::Senc).unwrap();
        let decoded = decode_cell(&bytes, Dialect::Senc).unwrap();

        assert_eq!(decoded.features.len(), 1);
        assert_eq!(decoded.features[0].ftype, 75);

        let records = read_records(&bytes, Dialect::Senc).unwrap();
        assert!(!records.iter().any(|r| matches!(r, Record::NodeTable(_))));
    }

    #[test]
    fn edition_zero_is_invalid() {
        let features = vec![ChartFeature::new(75, Shape::Point([8.0, 54.0]))];
        let mut c = cell(&features);
        c.edition = 0;
        assert!(matches!(
            encode_cell(&c, &features, Dialect::Senc),
            Err(SencError::InvalidCell(_))
        ));
    }

    #[test]
    fn geometry_of_the_wrong_primitive_skips_the_feature() {
        let records = vec![
            Record::CellVersion(201),
            Record::CellEdition(1),
            Record::FeatureId(FeatureId {
                ftype: 30,
                id: 1,
                primitive: Primitive::Line,
            }),
            Record::Point(PointGeometry { lat: 54.0, lon: 8.0 }),
            Record::FeatureId(FeatureId {
                ftype: 75,
                id: 2,
                primitive: Primitive::Point,
            }),
            Record::Point(PointGeometry { lat: 54.0, lon: 8.0 }),
        ];
        let bytes = write_records(Dialect::Senc, &records).unwrap();
        let decoded = decode_cell(&bytes, Dialect::Senc).unwrap();

        assert_eq!(decoded.features.len(), 1);
        assert_eq!(decoded.features[0].id, 2);
    }

    #[test]
    fn line_without_extent_is_invalid() {
        let records = vec![
            Record::CellVersion(201),
            Record::FeatureId(FeatureId {
                ftype: 30,
                id: 1,
                primitive: Primitive::Line,
            }),
            Record::Line(LineGeometry {
                bbox: BoundingBox {
                    south: 0.0,
                    north: 0.0,
                    west: 0.0,
                    east: 0.0,
                },
                edges: vec![],
            }),
        ];
        let bytes = write_records(Dialect::Senc, &records).unwrap();
        assert!(matches!(
            decode_cell(&bytes, Dialect::Senc),
            Err(SencError::InvalidCell(_))
        ));
    }

    #[test]
    fn tables_after_features_still_resolve() {
        let line = vec![[8.0, 54.0], [8.01, 54.02], [8.03, 54.01]];
        let features = vec![ChartFeature::new(30, Shape::Line(vec![line]))];
        let bytes = encode_cell(&cell(&features), &features, Dialect::Senc).unwrap();

        // Tables are written last, so this only works through the second pass.
        let records = read_records(&bytes, Dialect::Senc).unwrap();
        let first_table = records
            .iter()
            .position(|r| matches!(r, Record::NodeTable(_)))
            .unwrap();
        let first_line = records
            .iter()
            .position(|r| matches!(r, Record::Line(_)))
            .unwrap();
        assert!(first_line < first_table);
        assert_eq!(decode_cell(&bytes, Dialect::Senc).unwrap().features.len(), 1);
    }

    #[test]
    fn transcoding_refuses_extended_records() {
        let records = vec![
            Record::CellVersion(201),
            Record::NodeTable(NodeTable {
                scale: Some(10.0),
                nodes: vec![],
            }),
        ];
        let bytes = write_records(Dialect::Senc, &records).unwrap();
        assert!(matches!(
            senc_to_s57(&bytes),
            Err(SencError::DialectViolation(_))
        ));
    }

    #[test]
    fn transcoding_drops_senc_only_metadata() {
        let records = vec![
            Record::CellVersion(201),
            Record::CellName("X".into()),
            Record::CellSoundingDatum("LAT".into()),
            Record::Text(TextAttachment {
                file: "a.txt".into(),
                text: "b".into(),
            }),
        ];
        let bytes = write_records(Dialect::Senc, &records).unwrap();
        let s57 = senc_to_s57(&bytes).unwrap();
        let back = read_records(&s57, Dialect::Senc).unwrap();

        assert_eq!(
            back,
            vec![Record::CellVersion(200), Record::CellName("X".into())]
        );
        assert_eq!(&s57[8..], &[2, 0, 8, 0, 0, 0, b'X', 0]);
    }

    #[test]
    fn point_in_ring_even_odd() {
        let ring = square(0.0, 0.0, 10.0);
        assert!(point_in_ring([5.0, 5.0], &ring));
        assert!(!point_in_ring([15.0, 5.0], &ring));
        assert!(!point_in_ring([5.0, 5.0], &[]));
    }
}
