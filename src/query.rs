//! Query strings bound to an index schema.
//!
//! Locus indexes accept `chrom:pos` (a single base, matched as `pos..pos`) or
//! `chrom:start-end`. Value indexes treat the whole query string as the value.

use crate::schema::{SchemaDescriptor, normalize_chromosome};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QuerySpec {
    Locus {
        chromosome: String,
        start: i64,
        end: i64,
    },
    Value {
        value: String,
    },
    /// Every row of the index.
    All,
}

impl QuerySpec {
    pub fn parse(schema: &SchemaDescriptor, q: &str) -> Result<Self> {
        let q = q.trim();
        if q.is_empty() {
            return Err(Error::InvalidQuerySyntax("empty query".to_string()));
        }

        if !schema.is_locus() {
            return Ok(QuerySpec::Value {
                value: q.to_string(),
            });
        }

        let (chromosome, locus) = q.split_once(':').ok_or_else(|| {
            Error::InvalidQuerySyntax(format!("`{q}`: expected chrom:pos or chrom:start-end"))
        })?;
        let chromosome = normalize_chromosome(chromosome);
        if chromosome.is_empty() {
            return Err(Error::InvalidQuerySyntax(format!("`{q}`: missing chromosome")));
        }

        let (start, end) = match locus.split_once('-') {
            Some((start, end)) => (parse_position(start, q)?, parse_position(end, q)?),
            None => {
                let pos = parse_position(locus, q)?;
                (pos, pos)
            }
        };
        if start > end {
            return Err(Error::InvalidQuerySyntax(format!(
                "`{q}`: start is after end"
            )));
        }

        Ok(QuerySpec::Locus {
            chromosome,
            start,
            end,
        })
    }

    /// Whether this query can run against an index with the given schema.
    pub fn matches(&self, schema: &SchemaDescriptor) -> bool {
        match self {
            QuerySpec::Locus { .. } => schema.is_locus(),
            QuerySpec::Value { .. } => !schema.is_locus(),
            QuerySpec::All => true,
        }
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuerySpec::Locus {
                chromosome,
                start,
                end,
            } if start == end => write!(f, "{chromosome}:{start}"),
            QuerySpec::Locus {
                chromosome,
                start,
                end,
            } => write!(f, "{chromosome}:{start}-{end}"),
            QuerySpec::Value { value } => write!(f, "{value}"),
            QuerySpec::All => write!(f, "*"),
        }
    }
}

fn parse_position(s: &str, q: &str) -> Result<i64> {
    let digits: String = s.trim().chars().filter(|&c| c != ',').collect();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidQuerySyntax(format!(
            "`{q}`: invalid position `{}`",
            s.trim()
        )));
    }
    digits
        .parse()
        .map_err(|_| Error::InvalidQuerySyntax(format!("`{q}`: position out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snp() -> SchemaDescriptor {
        SchemaDescriptor::parse("chr:pos").unwrap()
    }

    fn region() -> SchemaDescriptor {
        SchemaDescriptor::parse("chromosome:start-end").unwrap()
    }

    fn value() -> SchemaDescriptor {
        SchemaDescriptor::parse("phenotype").unwrap()
    }

    #[test]
    fn test_snp_query_is_degenerate_region() {
        assert_eq!(
            QuerySpec::parse(&snp(), "chr12:104152227").unwrap(),
            QuerySpec::Locus {
                chromosome: "12".to_string(),
                start: 104152227,
                end: 104152227,
            }
        );
    }

    #[test]
    fn test_region_query_with_separators() {
        assert_eq!(
            QuerySpec::parse(&region(), "chr8:100,000-101,000").unwrap(),
            QuerySpec::Locus {
                chromosome: "8".to_string(),
                start: 100000,
                end: 101000,
            }
        );
    }

    #[test]
    fn test_locus_forms_accepted_by_both_locus_schemas() {
        assert!(QuerySpec::parse(&snp(), "1:10-20").is_ok());
        assert!(QuerySpec::parse(&region(), "1:15").is_ok());
    }

    #[test]
    fn test_value_query_keeps_raw_string() {
        assert_eq!(
            QuerySpec::parse(&value(), " T2D ").unwrap(),
            QuerySpec::Value {
                value: "T2D".to_string()
            }
        );
        assert_eq!(
            QuerySpec::parse(&value(), "a:b").unwrap(),
            QuerySpec::Value {
                value: "a:b".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_locus_queries() {
        for bad in ["", "PCSK9", "chr1:", ":100", "1:abc", "1:10-", "1:20-10", "1:-5", "1:1-2-3"] {
            let err = QuerySpec::parse(&region(), bad).unwrap_err();
            assert!(
                matches!(err, Error::InvalidQuerySyntax(_)),
                "`{bad}` should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn test_matches_schema_shape() {
        let locus = QuerySpec::parse(&snp(), "1:5").unwrap();
        let val = QuerySpec::parse(&value(), "x").unwrap();
        assert!(locus.matches(&region()));
        assert!(!locus.matches(&value()));
        assert!(val.matches(&value()));
        assert!(!val.matches(&snp()));
        assert!(QuerySpec::All.matches(&snp()));
    }

    #[test]
    fn test_display() {
        assert_eq!(QuerySpec::parse(&snp(), "chr1:5").unwrap().to_string(), "1:5");
        assert_eq!(
            QuerySpec::parse(&region(), "X:5-9").unwrap().to_string(),
            "X:5-9"
        );
        assert_eq!(QuerySpec::All.to_string(), "*");
    }
}
