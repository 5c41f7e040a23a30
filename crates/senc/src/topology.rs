//! Shared node/edge graph of one cell.
//!
//! Encoding turns each polyline or ring into a single `EdgeRef`: its first and
//! last point become nodes, everything in between becomes an edge. Decoding
//! walks the refs back into contours.

use hashbrown::HashMap;

use crate::error::{Result, SencError, Table};
use crate::model::{Dialect, Edge, EdgeRef, Node};

/// Hands out `1, 2, 3, ...`; zero is never issued.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdAllocator {
    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Exact coordinate identity; `-0.0` and `0.0` are the same point.
#[inline]
fn point_key(p: [f64; 2]) -> [u64; 2] {
    [(p[0] + 0.0).to_bits(), (p[1] + 0.0).to_bits()]
}

type EdgeKey = (u32, Vec<[u64; 2]>, u32);

/// Per-cell builder of node and edge tables.
pub struct TopologyBuilder {
    dialect: Dialect,
    node_ids: IdAllocator,
    edge_ids: IdAllocator,
    node_index: HashMap<[u64; 2], u32>,
    edge_index: HashMap<EdgeKey, u32>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl TopologyBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            node_ids: IdAllocator::default(),
            edge_ids: IdAllocator::default(),
            node_index: HashMap::new(),
            edge_index: HashMap::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    fn node(&mut self, p: [f64; 2]) -> u32 {
        let key = point_key(p);
        if let Some(&id) = self.node_index.get(&key) {
            return id;
        }

        let id = self.node_ids.next_id();
        self.node_index.insert(key, id);
        self.nodes.push(Node { id, xy: p });
        id
    }

    fn edge_ref(&mut self, node0: u32, interior: &[[f64; 2]], node1: u32) -> EdgeRef {
        if interior.is_empty() {
            return EdgeRef {
                node0,
                edge: 0,
                node1,
                flip: false,
            };
        }

        let seq: Vec<[u64; 2]> = interior.iter().copied().map(point_key).collect();
        let forward = (node0, seq, node1);

        if let Some(&edge) = self.edge_index.get(&forward) {
            return EdgeRef {
                node0,
                edge,
                node1,
                flip: false,
            };
        }

        if self.dialect == Dialect::Senc {
            let reversed = (node1, forward.1.iter().rev().copied().collect(), node0);
            if let Some(&edge) = self.edge_index.get(&reversed) {
                return EdgeRef {
                    node0,
                    edge,
                    node1,
                    flip: true,
                };
            }
        }

        let id = self.edge_ids.next_id();
        self.edge_index.insert(forward, id);
        self.edges.push(Edge {
            id,
            points: interior.iter().map(|p| [p[0] as f32, p[1] as f32]).collect(),
        });

        EdgeRef {
            node0,
            edge: id,
            node1,
            flip: false,
        }
    }

    /// One open polyline in local grid metres.
    pub fn add_line(&mut self, points: &[[f64; 2]]) -> Result<EdgeRef> {
        if points.len() < 2 {
            return Err(SencError::UnsupportedGeometry(format!(
                "polyline with {} point(s)",
                points.len()
            )));
        }

        let n = points.len();
        let node0 = self.node(points[0]);
        let node1 = self.node(points[n - 1]);

        Ok(self.edge_ref(node0, &points[1..n - 1], node1))
    }

    /// One closed ring (`first == last`) in local grid metres.
    pub fn add_ring(&mut self, ring: &[[f64; 2]]) -> Result<EdgeRef> {
        check_ring(ring)?;

        let n = ring.len();
        let node = self.node(ring[0]);

        Ok(self.edge_ref(node, &ring[1..n - 1], node))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Finished tables, in id order.
    pub fn into_tables(self) -> (Vec<Node>, Vec<Edge>) {
        (self.nodes, self.edges)
    }
}

/// A ring must repeat its first point at the end and enclose at least a triangle.
pub fn check_ring(ring: &[[f64; 2]]) -> Result<()> {
    match (ring.first(), ring.last()) {
        (Some(a), Some(b)) if ring.len() >= 4 && point_key(*a) == point_key(*b) => Ok(()),
        (Some(_), Some(_)) if ring.len() >= 4 => Err(SencError::UnsupportedGeometry(
            "polygon ring is not closed".into(),
        )),
        _ => Err(SencError::UnsupportedGeometry(format!(
            "polygon ring with {} point(s)",
            ring.len()
        ))),
    }
}

/// Node and edge tables of a cell being decoded, unscaled to local grid metres.
#[derive(Debug, Default)]
pub struct TopologyTables {
    nodes: HashMap<u32, [f64; 2]>,
    edges: HashMap<u32, Vec<[f64; 2]>>,
}

impl TopologyTables {
    pub fn insert_nodes(&mut self, nodes: &[Node], scale: Option<f64>) -> Result<()> {
        let s = scale.unwrap_or(1.0);

        for n in nodes {
            if self.nodes.insert(n.id, [n.xy[0] / s, n.xy[1] / s]).is_some() {
                return Err(SencError::DuplicateId {
                    table: Table::Node,
                    id: n.id,
                });
            }
        }

        Ok(())
    }

    pub fn insert_edges(&mut self, edges: &[Edge], scale: Option<f64>) -> Result<()> {
        let s = scale.unwrap_or(1.0);

        for e in edges {
            let points = e
                .points
                .iter()
                .map(|p| [p[0] as f64 / s, p[1] as f64 / s])
                .collect();

            if self.edges.insert(e.id, points).is_some() {
                return Err(SencError::DuplicateId {
                    table: Table::Edge,
                    id: e.id,
                });
            }
        }

        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn node(&self, id: u32) -> Result<[f64; 2]> {
        self.nodes
            .get(&id)
            .copied()
            .ok_or(SencError::UnresolvedReference {
                table: Table::Node,
                id,
            })
    }

    /// `[node0] + edge points (reversed when flipped) + [node1]`.
    pub fn segment(&self, r: &EdgeRef) -> Result<Vec<[f64; 2]>> {
        let mut out = vec![self.node(r.node0)?];

        if r.edge != 0 {
            let points = self
                .edges
                .get(&r.edge)
                .ok_or(SencError::UnresolvedReference {
                    table: Table::Edge,
                    id: r.edge,
                })?;

            if r.flip {
                out.extend(points.iter().rev());
            } else {
                out.extend(points.iter());
            }
        }

        out.push(self.node(r.node1)?);
        Ok(out)
    }

    /// Open polylines. A ref continues the running line when it starts at the
    /// node the line ended on; a closed line always ends its contour.
    pub fn resolve_line(&self, refs: &[EdgeRef]) -> Result<Vec<Vec<[f64; 2]>>> {
        let mut contours: Vec<Vec<[f64; 2]>> = Vec::new();
        let mut last: Option<(u32, u32)> = None;

        for r in refs {
            let segment = self.segment(r)?;

            match (last, contours.last_mut()) {
                (Some((first, end)), Some(line)) if end == r.node0 && first != end => {
                    line.extend_from_slice(&segment[1..]);
                    last = Some((first, r.node1));
                }
                _ => {
                    contours.push(segment);
                    last = Some((r.node0, r.node1));
                }
            }
        }

        Ok(contours)
    }

    /// Closed contours, checked against the declared points per contour.
    pub fn resolve_area(&self, refs: &[EdgeRef], pointcount: &[u32]) -> Result<Vec<Vec<[f64; 2]>>> {
        let mut contours: Vec<Vec<[f64; 2]>> = Vec::with_capacity(pointcount.len());
        let mut current: Vec<[f64; 2]> = Vec::new();
        let mut end_node = 0u32;

        for (i, r) in refs.iter().enumerate() {
            let k = contours.len();
            let Some(&expected) = pointcount.get(k) else {
                return Err(SencError::InconsistentContours(format!(
                    "edge ref {i} follows the last of {} declared contours",
                    pointcount.len()
                )));
            };

            let segment = self.segment(r)?;

            if current.is_empty() {
                current = segment;
            } else if r.node0 == end_node {
                current.extend_from_slice(&segment[1..]);
            } else {
                return Err(SencError::InconsistentContours(format!(
                    "contour {k} stops after {} of {expected} points \
                     (edge ref {i} starts at node {})",
                    current.len(),
                    r.node0
                )));
            }
            end_node = r.node1;

            let have = current.len();
            if have > expected as usize {
                return Err(SencError::InconsistentContours(format!(
                    "contour {k} runs to {have} points, {expected} declared"
                )));
            }

            if have == expected as usize {
                if current.first() != current.last() {
                    return Err(SencError::InconsistentContours(format!(
                        "contour {k} is not closed"
                    )));
                }
                contours.push(std::mem::take(&mut current));
            }
        }

        if !current.is_empty() {
            return Err(SencError::InconsistentContours(format!(
                "contour {} truncated at {} of {} points",
                contours.len(),
                current.len(),
                pointcount[contours.len()]
            )));
        }

        if contours.len() != pointcount.len() {
            return Err(SencError::InconsistentContours(format!(
                "{} contours declared, {} found",
                pointcount.len(),
                contours.len()
            )));
        }

        Ok(contours)
    }
}
