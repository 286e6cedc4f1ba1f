//! Index schemas and row-key extraction.
//!
//! A schema string names the JSON fields an index is keyed on:
//!
//! - `chromosome:position` - a point locus (SNP)
//! - `chromosome:start-end` - an interval locus (region)
//! - `field` - a categorical value
//!
//! [`SchemaDescriptor::extract`] pulls the corresponding key out of a parsed
//! record during an index build.

use crate::{Error, Result};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaDescriptor {
    SnpLocus {
        chromosome: String,
        position: String,
    },
    RegionLocus {
        chromosome: String,
        start: String,
        end: String,
    },
    ValueIndex {
        field: String,
    },
}

/// The key an index row is ordered and matched by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKey {
    Locus {
        chromosome: String,
        start: i64,
        end: i64,
    },
    Value(String),
}

/// Why a single record could not be indexed. Never fatal to a build.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("record is not valid JSON: {0}")]
    Json(String),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("invalid value for field `{0}`")]
    InvalidField(String),
}

impl SchemaDescriptor {
    pub fn parse(schema: &str) -> Result<Self> {
        let schema = schema.trim();

        let Some((chromosome, locus)) = schema.split_once(':') else {
            if schema.contains('-') {
                return Err(Error::InvalidSchema(format!(
                    "`{schema}`: a range requires a chromosome field"
                )));
            }
            return Ok(SchemaDescriptor::ValueIndex {
                field: field_name(schema, schema)?,
            });
        };

        if locus.contains(':') {
            return Err(Error::InvalidSchema(format!(
                "`{schema}`: at most one chromosome field is allowed"
            )));
        }

        let chromosome = field_name(chromosome, schema)?;
        match locus.split_once('-') {
            None => Ok(SchemaDescriptor::SnpLocus {
                chromosome,
                position: field_name(locus, schema)?,
            }),
            Some((_, end)) if end.contains('-') => Err(Error::InvalidSchema(format!(
                "`{schema}`: a region has exactly one start and one end field"
            ))),
            Some((start, end)) => Ok(SchemaDescriptor::RegionLocus {
                chromosome,
                start: field_name(start, schema)?,
                end: field_name(end, schema)?,
            }),
        }
    }

    pub fn is_locus(&self) -> bool {
        !matches!(self, SchemaDescriptor::ValueIndex { .. })
    }

    /// Extract the row key from a record.
    pub fn extract(&self, record: &Map<String, Value>) -> std::result::Result<RowKey, ExtractError> {
        match self {
            SchemaDescriptor::SnpLocus {
                chromosome,
                position,
            } => {
                let pos = position_field(record, position)?;
                Ok(RowKey::Locus {
                    chromosome: chromosome_field(record, chromosome)?,
                    start: pos,
                    end: pos,
                })
            }
            SchemaDescriptor::RegionLocus {
                chromosome,
                start,
                end,
            } => {
                let chromosome = chromosome_field(record, chromosome)?;
                let start_pos = position_field(record, start)?;
                let end_pos = position_field(record, end)?;
                if end_pos < start_pos {
                    return Err(ExtractError::InvalidField(end.clone()));
                }
                Ok(RowKey::Locus {
                    chromosome,
                    start: start_pos,
                    end: end_pos,
                })
            }
            SchemaDescriptor::ValueIndex { field } => {
                let value = match record.get(field) {
                    None | Some(Value::Null) => {
                        return Err(ExtractError::MissingField(field.clone()));
                    }
                    Some(Value::String(s)) => s.clone(),
                    Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
                    Some(_) => return Err(ExtractError::InvalidField(field.clone())),
                };
                Ok(RowKey::Value(value))
            }
        }
    }

    /// Parse a line of JSON and extract its row key.
    pub fn extract_line(&self, line: &[u8]) -> std::result::Result<RowKey, ExtractError> {
        let value: Value =
            serde_json::from_slice(line).map_err(|e| ExtractError::Json(e.to_string()))?;
        match value {
            Value::Object(record) => self.extract(&record),
            _ => Err(ExtractError::NotAnObject),
        }
    }
}

impl FromStr for SchemaDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SchemaDescriptor::parse(s)
    }
}

impl fmt::Display for SchemaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaDescriptor::SnpLocus {
                chromosome,
                position,
            } => write!(f, "{chromosome}:{position}"),
            SchemaDescriptor::RegionLocus {
                chromosome,
                start,
                end,
            } => write!(f, "{chromosome}:{start}-{end}"),
            SchemaDescriptor::ValueIndex { field } => write!(f, "{field}"),
        }
    }
}

/// Canonical chromosome name: no `chr` prefix, upper case, `M` as `MT`.
pub fn normalize_chromosome(name: &str) -> String {
    let name = name.trim();
    let name = match name.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("chr") => &name[3..],
        _ => name,
    };
    let name = name.to_ascii_uppercase();
    if name == "M" { "MT".to_string() } else { name }
}

fn field_name(name: &str, schema: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidSchema(format!("`{schema}`: empty field name")));
    }
    if name.chars().any(|c| c.is_whitespace() || c == ',') {
        return Err(Error::InvalidSchema(format!(
            "`{schema}`: invalid field name `{name}`"
        )));
    }
    Ok(name.to_string())
}

fn chromosome_field(
    record: &Map<String, Value>,
    field: &str,
) -> std::result::Result<String, ExtractError> {
    let chromosome = match record.get(field) {
        None | Some(Value::Null) => return Err(ExtractError::MissingField(field.to_string())),
        Some(Value::String(s)) => normalize_chromosome(s),
        Some(Value::Number(n)) if n.is_u64() => n.to_string(),
        Some(_) => return Err(ExtractError::InvalidField(field.to_string())),
    };
    if chromosome.is_empty() {
        return Err(ExtractError::InvalidField(field.to_string()));
    }
    Ok(chromosome)
}

fn position_field(
    record: &Map<String, Value>,
    field: &str,
) -> std::result::Result<i64, ExtractError> {
    let invalid = || ExtractError::InvalidField(field.to_string());
    let position: i64 = match record.get(field) {
        None | Some(Value::Null) => return Err(ExtractError::MissingField(field.to_string())),
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i,
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => f as i64,
            _ => return Err(invalid()),
        },
        Some(Value::String(s)) => s.trim().parse().map_err(|_| invalid())?,
        Some(_) => return Err(invalid()),
    };
    // Non-negative positions keep every interval span within i64.
    if position < 0 {
        return Err(invalid());
    }
    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_parse_snp_schema() {
        let schema = SchemaDescriptor::parse("chr:pos").unwrap();
        assert_eq!(
            schema,
            SchemaDescriptor::SnpLocus {
                chromosome: "chr".to_string(),
                position: "pos".to_string(),
            }
        );
        assert!(schema.is_locus());
    }

    #[test]
    fn test_parse_region_schema() {
        let schema: SchemaDescriptor = "chromosome:start-end".parse().unwrap();
        assert_eq!(
            schema,
            SchemaDescriptor::RegionLocus {
                chromosome: "chromosome".to_string(),
                start: "start".to_string(),
                end: "end".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_value_schema() {
        let schema = SchemaDescriptor::parse("phenotype").unwrap();
        assert_eq!(
            schema,
            SchemaDescriptor::ValueIndex {
                field: "phenotype".to_string()
            }
        );
        assert!(!schema.is_locus());
    }

    #[test]
    fn test_parse_rejects_malformed_schemas() {
        for bad in [
            "",
            "a:b:c",
            "a:b-c-d",
            "a-b",
            ":pos",
            "chr:",
            "chr:-end",
            "chr:start-",
            "phenotype,chr:pos",
            "two words",
        ] {
            let err = SchemaDescriptor::parse(bad).unwrap_err();
            assert!(
                matches!(err, Error::InvalidSchema(_)),
                "`{bad}` should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn test_display_round_trips() {
        for schema in ["chr:pos", "chromosome:start-end", "gene"] {
            assert_eq!(SchemaDescriptor::parse(schema).unwrap().to_string(), schema);
        }
    }

    #[test]
    fn test_normalize_chromosome() {
        assert_eq!(normalize_chromosome("chr12"), "12");
        assert_eq!(normalize_chromosome("CHRx"), "X");
        assert_eq!(normalize_chromosome(" 8 "), "8");
        assert_eq!(normalize_chromosome("chrM"), "MT");
        assert_eq!(normalize_chromosome("MT"), "MT");
    }

    #[test]
    fn test_extract_snp() {
        let schema = SchemaDescriptor::parse("chr:pos").unwrap();
        let record = object(json!({"chr": "12", "pos": 104152227, "beta": 0.1}));
        assert_eq!(
            schema.extract(&record).unwrap(),
            RowKey::Locus {
                chromosome: "12".to_string(),
                start: 104152227,
                end: 104152227,
            }
        );
    }

    #[test]
    fn test_extract_region_accepts_numeric_chromosome_and_string_positions() {
        let schema = SchemaDescriptor::parse("chromosome:start-end").unwrap();
        let record = object(json!({"chromosome": 8, "start": "100584", "end": 100728.0}));
        assert_eq!(
            schema.extract(&record).unwrap(),
            RowKey::Locus {
                chromosome: "8".to_string(),
                start: 100584,
                end: 100728,
            }
        );
    }

    #[test]
    fn test_extract_region_rejects_inverted_interval() {
        let schema = SchemaDescriptor::parse("chromosome:start-end").unwrap();
        let record = object(json!({"chromosome": "1", "start": 10, "end": 5}));
        assert_eq!(
            schema.extract(&record).unwrap_err(),
            ExtractError::InvalidField("end".to_string())
        );
    }

    #[test]
    fn test_extract_rejects_negative_positions() {
        let schema = SchemaDescriptor::parse("chromosome:start-end").unwrap();
        let record = object(json!({
            "chromosome": "1",
            "start": -9_000_000_000_000_000_000i64,
            "end": 9_000_000_000_000_000_000i64
        }));
        assert_eq!(
            schema.extract(&record).unwrap_err(),
            ExtractError::InvalidField("start".to_string())
        );

        let schema = SchemaDescriptor::parse("chr:pos").unwrap();
        assert_eq!(
            schema
                .extract(&object(json!({"chr": "1", "pos": "-5"})))
                .unwrap_err(),
            ExtractError::InvalidField("pos".to_string())
        );
        assert!(schema.extract(&object(json!({"chr": "1", "pos": 0}))).is_ok());
    }

    #[test]
    fn test_extract_value() {
        let schema = SchemaDescriptor::parse("phenotype").unwrap();
        assert_eq!(
            schema
                .extract(&object(json!({"phenotype": "T2D"})))
                .unwrap(),
            RowKey::Value("T2D".to_string())
        );
        assert_eq!(
            schema.extract(&object(json!({"phenotype": 42}))).unwrap(),
            RowKey::Value("42".to_string())
        );
    }

    #[test]
    fn test_extract_missing_and_invalid_fields() {
        let schema = SchemaDescriptor::parse("chr:pos").unwrap();
        assert_eq!(
            schema.extract(&object(json!({"chr": "1"}))).unwrap_err(),
            ExtractError::MissingField("pos".to_string())
        );
        assert_eq!(
            schema
                .extract(&object(json!({"chr": "1", "pos": "abc"})))
                .unwrap_err(),
            ExtractError::InvalidField("pos".to_string())
        );
        assert_eq!(
            schema
                .extract(&object(json!({"chr": null, "pos": 1})))
                .unwrap_err(),
            ExtractError::MissingField("chr".to_string())
        );
    }

    #[test]
    fn test_extract_line() {
        let schema = SchemaDescriptor::parse("gene").unwrap();
        assert_eq!(
            schema.extract_line(br#"{"gene":"PCSK9"}"#).unwrap(),
            RowKey::Value("PCSK9".to_string())
        );
        assert_eq!(
            schema.extract_line(b"[1,2]").unwrap_err(),
            ExtractError::NotAnObject
        );
        assert!(matches!(
            schema.extract_line(b"{\"gene\": ").unwrap_err(),
            ExtractError::Json(_)
        ));
    }
}
