//! GeoJSON side of the converter: per-layer FeatureCollections in and out.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use senc::{
    Attribute, BoundingBox, Cell, ChartFeature, Coverage, DecodedCell, Primitive, Shape,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    catalog::Catalog,
    codes::{attribute_json, CodeTables},
};

pub type Properties = Map<String, Value>;

/// Native scale by usage band.
pub const BAND_SCALES: [(u64, u32); 6] = [
    (1, 1_500_000),
    (2, 180_000),
    (3, 90_000),
    (4, 22_000),
    (5, 12_000),
    (6, 4_000),
];

const SOUNDG: &str = "SOUNDG";
const M_COVR: &str = "M_COVR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    /// `[lon, lat]` or `[lon, lat, depth]`.
    Point(Vec<f64>),
    MultiPoint(Vec<Vec<f64>>),
    LineString(Vec<[f64; 2]>),
    MultiLineString(Vec<Vec<[f64; 2]>>),
    Polygon(Vec<Vec<[f64; 2]>>),
    MultiPolygon(Vec<Vec<Vec<[f64; 2]>>>),
}

impl Geometry {
    pub fn positions(&self) -> Vec<[f64; 2]> {
        let xy = |p: &Vec<f64>| match p.as_slice() {
            [x, y, ..] => Some([*x, *y]),
            _ => None,
        };

        match self {
            Geometry::Point(p) => xy(p).into_iter().collect(),
            Geometry::MultiPoint(ps) => ps.iter().filter_map(xy).collect(),
            Geometry::LineString(l) => l.clone(),
            Geometry::MultiLineString(ls) | Geometry::Polygon(ls) => ls.concat(),
            Geometry::MultiPolygon(ps) => ps.iter().flatten().flatten().copied().collect(),
        }
    }

    pub fn primitive(&self) -> Primitive {
        match self {
            Geometry::Point(_) | Geometry::MultiPoint(_) => Primitive::Point,
            Geometry::LineString(_) | Geometry::MultiLineString(_) => Primitive::Line,
            Geometry::Polygon(_) | Geometry::MultiPolygon(_) => Primitive::Area,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_type")]
    pub kind: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: Properties,
}

fn feature_type() -> String {
    "Feature".to_owned()
}

impl Feature {
    pub fn new(geometry: Geometry, properties: Properties) -> Self {
        Self {
            kind: feature_type(),
            geometry,
            properties,
        }
    }

    pub fn layer(&self) -> &str {
        self.properties
            .get("layer")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn chart(&self) -> Option<&str> {
        self.properties
            .get("chart")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
    }

    pub fn uband(&self) -> Option<u64> {
        self.properties.get("uband").and_then(Value::as_u64)
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

/// Read one layer file. Features without a `layer` property get the file stem.
pub fn read_collection(path: &Path) -> Result<Vec<Feature>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let root: FeatureCollection = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;

    let layer = path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned();

    let mut features = root.features;
    for f in &mut features {
        f.properties
            .entry("layer")
            .or_insert_with(|| Value::from(layer.as_str()));
    }

    Ok(features)
}

/// Write a FeatureCollection with one feature per line.
pub fn write_collection(path: &Path, features: &[&Feature]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);

    out.write_all(b"{\"type\":\"FeatureCollection\",\"features\":[\n")?;
    for (i, f) in features.iter().enumerate() {
        serde_json::to_writer(&mut out, f)?;
        if i + 1 < features.len() {
            out.write_all(b",")?;
        }
        out.write_all(b"\n")?;
    }
    out.write_all(b"]}\n")?;
    out.flush()?;

    Ok(())
}

/// Usage band: the last digit of the cell name.
pub fn usage_band(chart: &str) -> u64 {
    chart
        .chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .map(u64::from)
        .unwrap_or(0)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ------------------------------------------------------------------
// Cell -> GeoJSON
// ------------------------------------------------------------------

/// Features of one decoded cell, properties keyed by attribute acronym.
///
/// Sounding clusters become one `Point` per sounding with a `VALSOU`
/// property, or a single 3D `MultiPoint` when `multipoints` is set.
pub fn cell_to_features(
    decoded: &DecodedCell,
    fallback_name: &str,
    codes: &CodeTables,
    multipoints: bool,
) -> Vec<Feature> {
    let chart = if decoded.cell.name.is_empty() {
        fallback_name
    } else {
        decoded.cell.name.as_str()
    };

    let mut base = Properties::new();
    base.insert("chart".into(), Value::from(chart));
    base.insert("uband".into(), Value::from(usage_band(chart)));
    base.insert("scale".into(), Value::from(decoded.cell.native_scale));

    let mut out = Vec::with_capacity(decoded.features.len());

    for f in &decoded.features {
        let mut props = base.clone();
        props.insert("layer".into(), Value::from(codes.layer_name(f.ftype)));
        for a in &f.attributes {
            props.insert(codes.attribute_name(a.code), attribute_json(&a.value));
        }

        match &f.shape {
            Shape::Point([lon, lat]) => {
                out.push(Feature::new(Geometry::Point(vec![*lon, *lat]), props));
            }
            Shape::Soundings(points) if multipoints => {
                let coords = points
                    .iter()
                    .map(|p| vec![p[0], p[1], round1(p[2])])
                    .collect();
                out.push(Feature::new(Geometry::MultiPoint(coords), props));
            }
            Shape::Soundings(points) => {
                for p in points {
                    let mut props = props.clone();
                    props.insert("VALSOU".into(), Value::from(round1(p[2])));
                    out.push(Feature::new(Geometry::Point(vec![p[0], p[1]]), props));
                }
            }
            Shape::Line(lines) if lines.len() == 1 => {
                out.push(Feature::new(Geometry::LineString(lines[0].clone()), props));
            }
            Shape::Line(lines) => {
                out.push(Feature::new(Geometry::MultiLineString(lines.clone()), props));
            }
            // Every stored contour is an outer ring.
            Shape::Area { contours, .. } if contours.len() == 1 => {
                out.push(Feature::new(Geometry::Polygon(contours.clone()), props));
            }
            Shape::Area { contours, .. } => {
                let polygons = contours.iter().map(|c| vec![c.clone()]).collect();
                out.push(Feature::new(Geometry::MultiPolygon(polygons), props));
            }
        }
    }

    out
}

// ------------------------------------------------------------------
// GeoJSON -> cell
// ------------------------------------------------------------------

/// Bounds `(south, north, west, east)` of a feature set.
fn bounds_of(features: &[Feature]) -> Option<BoundingBox> {
    let positions: Vec<[f64; 2]> = features
        .iter()
        .flat_map(|f| f.geometry.positions())
        .collect();
    BoundingBox::from_positions(&positions)
}

/// Group features by their `chart` property. Uncharted points of a chart's
/// usage band that fall inside its bounds are added to it as well.
pub fn group_charts(features: &[Feature]) -> BTreeMap<String, Vec<Feature>> {
    let mut charts: BTreeMap<String, Vec<Feature>> = BTreeMap::new();
    for f in features {
        if let Some(chart) = f.chart() {
            charts.entry(chart.to_owned()).or_default().push(f.clone());
        }
    }

    for members in charts.values_mut() {
        let Some(bbox) = bounds_of(members) else {
            continue;
        };
        let uband = members.iter().filter_map(Feature::uband).min();

        let extra: Vec<Feature> = features
            .iter()
            .filter(|f| {
                !f.properties.contains_key("chart")
                    && f.uband() == uband
                    && matches!(
                        &f.geometry,
                        Geometry::Point(p) if p.len() >= 2 && bbox.contains([p[0], p[1]])
                    )
            })
            .cloned()
            .collect();

        members.extend(extra);
    }

    charts
}

fn attributes(props: &Properties, codes: &CodeTables) -> Vec<Attribute> {
    props
        .iter()
        .filter_map(|(key, value)| {
            let class = codes.attribute_by_acronym(key)?;
            let Some(value) = class.coerce(value) else {
                if !value.is_null() {
                    debug!("{key} ({}): cannot use value {value}", class.name);
                }
                return None;
            };
            Some(Attribute {
                code: class.code,
                value,
            })
        })
        .collect()
}

fn depth(props: &Properties) -> Option<f64> {
    ["VALSOU", "DEPTH", "depth"]
        .iter()
        .find_map(|k| props.get(*k).and_then(Value::as_f64))
}

fn shape(geometry: &Geometry) -> Option<Shape> {
    let shape = match geometry {
        Geometry::Point(p) => match p.as_slice() {
            [lon, lat, ..] => Shape::Point([*lon, *lat]),
            _ => return None,
        },
        Geometry::MultiPoint(_) => return None,
        Geometry::LineString(l) => Shape::Line(vec![l.clone()]),
        Geometry::MultiLineString(ls) => Shape::Line(ls.clone()),
        Geometry::Polygon(rings) => Shape::Area {
            contours: rings.clone(),
            triangles: Vec::new(),
        },
        Geometry::MultiPolygon(polygons) => Shape::Area {
            contours: polygons.concat(),
            triangles: Vec::new(),
        },
    };

    Some(shape)
}

/// A chart ready for encoding.
#[derive(Debug)]
pub struct ChartInput {
    pub cell: Cell,
    pub features: Vec<ChartFeature>,
}

/// Turn the features of one chart into a cell and its chart features.
///
/// `M_COVR` areas also become coverage polygons; `SOUNDG` points are grouped
/// by their non-depth properties into sounding clusters.
pub fn features_to_chart(
    chart: &str,
    features: &[Feature],
    codes: &CodeTables,
    catalog: Option<&Catalog>,
    created: &str,
) -> Result<ChartInput> {
    let mut out: Vec<ChartFeature> = Vec::new();
    let mut coverage: Vec<Coverage> = Vec::new();
    let mut soundings: BTreeMap<String, (Properties, Vec<[f64; 3]>)> = BTreeMap::new();

    for f in features {
        let layer = f.layer();

        if layer.eq_ignore_ascii_case(SOUNDG) {
            let mut props = f.properties.clone();
            let points: Vec<[f64; 3]> = match &f.geometry {
                Geometry::Point(p) if p.len() >= 2 => match depth(&props) {
                    Some(d) => vec![[p[0], p[1], d]],
                    None => Vec::new(),
                },
                Geometry::MultiPoint(ps) => ps
                    .iter()
                    .filter_map(|p| match p.as_slice() {
                        [lon, lat, d, ..] => Some([*lon, *lat, *d]),
                        _ => None,
                    })
                    .collect(),
                other => {
                    warn!("{chart}: SOUNDG with {:?} geometry skipped", other.primitive());
                    continue;
                }
            };

            for k in ["VALSOU", "DEPTH", "depth"] {
                props.remove(k);
            }
            let key = serde_json::to_string(&props)?;
            soundings
                .entry(key)
                .or_insert_with(|| (props, Vec::new()))
                .1
                .extend(points);
            continue;
        }

        if layer.eq_ignore_ascii_case(M_COVR) {
            match &f.geometry {
                Geometry::Polygon(rings) if !rings.is_empty() => {
                    if rings.len() > 1 {
                        warn!("{chart}: holes in coverage ignored");
                    }
                    let covered = f
                        .properties
                        .get("CATCOV")
                        .map(|v| v.as_i64() == Some(1) || v.as_str() == Some("1"))
                        .unwrap_or(true);
                    coverage.push(Coverage::from_ring(covered, &rings[0]));
                }
                other => warn!("{chart}: M_COVR with {:?} geometry ignored", other.primitive()),
            }
        }

        if layer.len() != 6 {
            debug!("{chart}: layer `{layer}` is not an object class");
            continue;
        }

        let Some(class) = codes.object_by_acronym(layer) else {
            warn!("{chart}: unknown object class `{layer}` skipped");
            continue;
        };

        let Some(shape) = shape(&f.geometry) else {
            warn!("{chart}: {layer} with unsupported geometry skipped");
            continue;
        };

        if !class.allows(shape.primitive()) {
            warn!(
                "{chart}: {layer} ({}) cannot be a {:?}, skipped",
                class.name,
                shape.primitive()
            );
            continue;
        }

        out.push(ChartFeature {
            ftype: class.code,
            id: 0,
            attributes: attributes(&f.properties, codes),
            shape,
        });
    }

    if !soundings.is_empty() {
        match codes.object_by_acronym(SOUNDG) {
            Some(class) => {
                for (props, points) in soundings.into_values() {
                    if points.is_empty() {
                        continue;
                    }
                    out.push(ChartFeature {
                        ftype: class.code,
                        id: 0,
                        attributes: attributes(&props, codes),
                        shape: Shape::Soundings(points),
                    });
                }
            }
            None => warn!("{chart}: no SOUNDG class in the code table, soundings skipped"),
        }
    }

    if out.is_empty() {
        bail!("{chart}: no encodable features");
    }

    let mut cell = Cell::from_features(chart, &out)?;
    cell.create_date = created.to_owned();
    cell.coverage = coverage;

    let uband = features.iter().filter_map(Feature::uband).min().unwrap_or(0);
    let max_prop = |key: &str| {
        features
            .iter()
            .filter_map(|f| f.properties.get(key).and_then(Value::as_f64))
            .fold(0.0f64, f64::max) as u32
    };

    let band_scale = BAND_SCALES
        .iter()
        .find(|(band, _)| *band == uband)
        .map(|(_, scale)| *scale)
        .unwrap_or(0);

    cell.native_scale = match max_prop("scale") {
        0 if band_scale > 0 => band_scale,
        0 => max_prop("SCAMIN"),
        s => s,
    };

    if let Some(entry) = catalog.and_then(|c| c.get(chart)) {
        entry.apply(&mut cell);
    }

    debug!(
        "{chart}: u{uband} 1:{} ed{} up{} {} features",
        cell.native_scale,
        cell.edition,
        cell.update,
        out.len()
    );

    Ok(ChartInput {
        cell,
        features: out,
    })
}
