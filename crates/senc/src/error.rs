use std::fmt;

/// Which shared-geometry table a reference points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Node,
    Edge,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Table::Node => "node",
            Table::Edge => "edge",
        };

        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SencError {
    /// Declared record length disagrees with the bytes its fields consume.
    #[error("malformed record type {kind} at offset {offset}: {reason}")]
    MalformedRecord {
        offset: usize,
        kind: u16,
        reason: String,
    },

    #[error("unknown record type {kind} at offset {offset}")]
    UnknownRecordType { offset: usize, kind: u16 },

    #[error("unresolved {table} reference {id}")]
    UnresolvedReference { table: Table, id: u32 },

    #[error("duplicate {table} id {id}")]
    DuplicateId { table: Table, id: u32 },

    /// Feature-level problem; the caller drops the feature and continues the cell.
    #[error("unsupported geometry: {0}")]
    UnsupportedGeometry(String),

    #[error("dialect violation: {0}")]
    DialectViolation(String),

    #[error("unsupported file version {0}")]
    UnsupportedVersion(u16),

    #[error("inconsistent contours: {0}")]
    InconsistentContours(String),

    #[error("attribute {code} value {value} does not fit a u32 slot")]
    ValueOutOfRange { code: u16, value: i64 },

    #[error("invalid cell: {0}")]
    InvalidCell(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SencError {
    /// `true` when the failure is confined to one feature and the cell can go on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SencError::UnsupportedGeometry(_))
    }
}

pub type Result<T> = std::result::Result<T, SencError>;

/// A contour could not be triangulated. Never fatal: the outline is still written.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TriangulationFailure {
    #[error("contour has {0} distinct vertices, need at least 3")]
    TooFewVertices(usize),

    #[error("contour has non-finite coordinates")]
    NonFinite,

    #[error("contour encloses no area")]
    ZeroArea,

    #[error("ear clipping failed")]
    Earcut,

    #[error("triangles cover {covered:.3} of {expected:.3} (self-intersecting contour?)")]
    AreaMismatch { covered: f64, expected: f64 },
}
