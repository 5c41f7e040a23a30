//! S-57 object class and attribute code tables (the OpenCPN `s57data` CSVs).

use std::{fs, path::Path};

use anyhow::{Context, Result};
use hashbrown::HashMap;
use log::debug;
use senc::{AttributeValue, Primitive};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectClass {
    pub code: u16,
    pub name: String,
    pub acronym: String,
    /// Geometry kinds the class may carry; empty means unrestricted.
    pub primitives: Vec<Primitive>,
}

impl ObjectClass {
    pub fn allows(&self, primitive: Primitive) -> bool {
        self.primitives.is_empty() || self.primitives.contains(&primitive)
    }
}

/// Attribute type letter from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// `E`
    Enumerated,
    /// `I`
    Integer,
    /// `F`
    Float,
    /// `L`, a comma separated list of enumerants
    List,
    /// `A` / `S`
    Text,
}

impl AttributeKind {
    fn from_letter(s: &str) -> Self {
        match s.trim() {
            "E" => AttributeKind::Enumerated,
            "I" => AttributeKind::Integer,
            "F" => AttributeKind::Float,
            "L" => AttributeKind::List,
            _ => AttributeKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeClass {
    pub code: u16,
    pub name: String,
    pub acronym: String,
    pub kind: AttributeKind,
}

impl AttributeClass {
    /// JSON property value to the typed wire value; `None` for nulls and
    /// values that do not fit the attribute's type.
    pub fn coerce(&self, value: &Value) -> Option<AttributeValue> {
        match (self.kind, value) {
            (_, Value::Null) => None,
            (AttributeKind::Enumerated | AttributeKind::Integer, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(AttributeValue::Int),
            (AttributeKind::Enumerated | AttributeKind::Integer, Value::String(s)) => {
                s.trim().parse().ok().map(AttributeValue::Int)
            }
            (AttributeKind::Float, Value::Number(n)) => n.as_f64().map(AttributeValue::Float),
            (AttributeKind::Float, Value::String(s)) => {
                s.trim().parse().ok().map(AttributeValue::Float)
            }
            (_, Value::String(s)) => Some(AttributeValue::Text(s.clone())),
            (_, Value::Bool(b)) => Some(AttributeValue::Text(b.to_string())),
            (_, other) => Some(AttributeValue::Text(other.to_string())),
        }
    }
}

/// Typed attribute value back to JSON.
pub fn attribute_json(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Int(v) => Value::from(*v),
        AttributeValue::Float(v) => Value::from(*v),
        AttributeValue::Text(s) => Value::from(s.as_str()),
    }
}

/// Split one CSV line; double quotes group commas and `""` is a literal quote.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', _) => quoted = !quoted,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);

    fields
}

/// Rows keyed by a numeric first column; header and malformed rows are skipped.
/// The first row for a code wins.
fn read_rows(path: &Path) -> Result<Vec<(u16, Vec<String>)>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    let mut seen = hashbrown::HashSet::new();
    let mut rows = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let mut fields = split_csv_line(line);
        let Ok(code) = fields[0].trim().parse::<u16>() else {
            continue;
        };
        if seen.insert(code) {
            fields.remove(0);
            rows.push((code, fields));
        }
    }

    debug!("{}: {} rows", path.display(), rows.len());
    Ok(rows)
}

fn primitive_list(s: &str) -> Vec<Primitive> {
    s.split(';')
        .filter_map(|p| match p.trim() {
            "Point" => Some(Primitive::Point),
            "Line" => Some(Primitive::Line),
            "Area" => Some(Primitive::Area),
            _ => None,
        })
        .collect()
}

/// Both code tables, shared read-only by all cell conversions.
#[derive(Debug, Default)]
pub struct CodeTables {
    objects: HashMap<u16, ObjectClass>,
    attributes: HashMap<u16, AttributeClass>,
    object_acronyms: HashMap<String, u16>,
    attribute_acronyms: HashMap<String, u16>,
}

impl CodeTables {
    pub fn load(objects: &Path, attributes: &Path) -> Result<Self> {
        let mut tables = CodeTables::default();

        // code, name, acronym, attr_a, attr_b, attr_c, class, primitives
        for (code, row) in read_rows(objects)? {
            let field = |i: usize| row.get(i).map(|s| s.trim()).unwrap_or_default();
            tables.add_object(ObjectClass {
                code,
                name: field(0).to_owned(),
                acronym: field(1).to_owned(),
                primitives: primitive_list(field(6)),
            });
        }

        // code, name, acronym, type, class
        for (code, row) in read_rows(attributes)? {
            let field = |i: usize| row.get(i).map(|s| s.trim()).unwrap_or_default();
            tables.add_attribute(AttributeClass {
                code,
                name: field(0).to_owned(),
                acronym: field(1).to_owned(),
                kind: AttributeKind::from_letter(field(2)),
            });
        }

        Ok(tables)
    }

    pub fn add_object(&mut self, class: ObjectClass) {
        self.object_acronyms
            .entry(class.acronym.to_ascii_uppercase())
            .or_insert(class.code);
        self.objects.insert(class.code, class);
    }

    pub fn add_attribute(&mut self, class: AttributeClass) {
        self.attribute_acronyms
            .entry(class.acronym.to_ascii_uppercase())
            .or_insert(class.code);
        self.attributes.insert(class.code, class);
    }

    pub fn object(&self, code: u16) -> Option<&ObjectClass> {
        self.objects.get(&code)
    }

    pub fn attribute(&self, code: u16) -> Option<&AttributeClass> {
        self.attributes.get(&code)
    }

    /// Case-insensitive acronym lookup.
    pub fn object_by_acronym(&self, acronym: &str) -> Option<&ObjectClass> {
        self.object_acronyms
            .get(&acronym.to_ascii_uppercase())
            .and_then(|c| self.objects.get(c))
    }

    pub fn attribute_by_acronym(&self, acronym: &str) -> Option<&AttributeClass> {
        self.attribute_acronyms
            .get(&acronym.to_ascii_uppercase())
            .and_then(|c| self.attributes.get(c))
    }

    /// Layer name for a class code; unknown codes keep their number.
    pub fn layer_name(&self, code: u16) -> String {
        self.object(code)
            .map(|o| o.acronym.clone())
            .unwrap_or_else(|| code.to_string())
    }

    /// Property key for an attribute code.
    pub fn attribute_name(&self, code: u16) -> String {
        self.attribute(code)
            .map(|a| a.acronym.clone())
            .unwrap_or_else(|| code.to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const OBJECTS: &str = "\
Code,ObjectClass,Acronym,Attribute_A,Attribute_B,Attribute_C,Class,Primitives
42,Depth area,DEPARE,\"DRVAL1;DRVAL2;QUASOU;\",\"INFORM;\",\"RECDAT;\",G,Line;Area;
75,Light,LIGHTS,\"CATLIT;COLOUR;\",\"INFORM;\",\"SCAMIN;\",G,Point;
129,Sounding,SOUNDG,\"EXPSOU;\",\"SORDAT;\",\"SCAMIN;\",G,Point;
302,Coverage,M_COVR,\"CATCOV;\",\"INFORM;\",\"RECDAT;\",M,Area;
";

    pub(crate) const ATTRIBUTES: &str = "\
Code,Attribute,Acronym,Attributetype,Class
18,Category of coverage,CATCOV,E,F
75,Colour,COLOUR,L,F
87,Depth range value 1,DRVAL1,F,F
116,Object name,OBJNAM,S,F
133,Scale minimum,SCAMIN,I,F
179,Value of sounding,VALSOU,F,F
";

    pub(crate) fn sample() -> CodeTables {
        let dir = tempfile::tempdir().unwrap();
        let objects = dir.path().join("s57objectclasses.csv");
        let attributes = dir.path().join("s57attributes.csv");
        fs::File::create(&objects)
            .unwrap()
            .write_all(OBJECTS.as_bytes())
            .unwrap();
        fs::write(&attributes, ATTRIBUTES).unwrap();

        CodeTables::load(&objects, &attributes).unwrap()
    }

    #[test]
    fn quoted_fields_keep_their_commas() {
        assert_eq!(
            split_csv_line(r#"1,"a,b","say ""hi""",,x"#),
            vec!["1", "a,b", r#"say "hi""#, "", "x"]
        );
    }

    #[test]
    fn loads_both_tables_skipping_headers() {
        let t = sample();

        let depare = t.object_by_acronym("depare").unwrap();
        assert_eq!(depare.code, 42);
        assert!(depare.allows(Primitive::Area));
        assert!(!depare.allows(Primitive::Point));

        assert_eq!(t.layer_name(75), "LIGHTS");
        assert_eq!(t.layer_name(9999), "9999");
        assert_eq!(t.attribute_by_acronym("VALSOU").unwrap().code, 179);
        assert_eq!(t.attribute_name(116), "OBJNAM");
    }

    #[test]
    fn values_are_coerced_by_attribute_type() {
        let t = sample();
        let catcov = t.attribute_by_acronym("CATCOV").unwrap();
        let drval = t.attribute_by_acronym("DRVAL1").unwrap();
        let colour = t.attribute_by_acronym("COLOUR").unwrap();

        assert_eq!(catcov.coerce(&Value::from("2")), Some(AttributeValue::Int(2)));
        assert_eq!(catcov.coerce(&Value::from(1)), Some(AttributeValue::Int(1)));
        assert_eq!(drval.coerce(&Value::from(5)), Some(AttributeValue::Float(5.0)));
        assert_eq!(
            colour.coerce(&Value::from("1,3")),
            Some(AttributeValue::Text("1,3".into()))
        );
        assert_eq!(drval.coerce(&Value::Null), None);
        assert_eq!(catcov.coerce(&Value::from("n/a")), None);
    }
}
