//! Ties a Postgres unique violation back to the staged row that caused it.
//!
//! Postgres reports the conflicting key in the error detail, e.g.
//! `Key (emailaddress1)=(amy@example.com) already exists.` The key values are
//! matched against the submitted rows. When several rows carry the key, the
//! last one is blamed, the same row a row-by-row upsert would fail on.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::schema::{EntityMapping, ProjectedRow, SqlValue, ID_COLUMN};

/// Splits a unique violation detail into `(column, value)` pairs.
///
/// Returns `None` when the detail does not have the expected shape or the
/// column and value counts disagree (for example when a value contains `, `).
pub fn parse_key_detail(detail: &str) -> Option<Vec<(String, String)>> {
    let rest = detail.trim().strip_prefix("Key (")?;
    let (columns, rest) = rest.split_once(")=(")?;
    let values = rest
        .strip_suffix(") already exists.")
        .or_else(|| rest.strip_suffix(") already exists"))?;

    let columns: Vec<String> = columns
        .split(", ")
        .map(|c| c.trim_matches('"').to_string())
        .collect();
    let values: Vec<String> = values.split(", ").map(str::to_string).collect();
    if columns.len() != values.len() {
        return None;
    }
    Some(columns.into_iter().zip(values).collect())
}

/// Index of the last row whose values match the violated key.
///
/// `None` when the detail cannot be parsed, names a column the mapping does
/// not have, or matches no row.
pub fn find_offending_row(
    mapping: &EntityMapping,
    rows: &[ProjectedRow],
    detail: &str,
) -> Option<usize> {
    let key = parse_key_detail(detail)?;

    // Column positions within a row; `None` marks the id column.
    let mut positions = Vec::with_capacity(key.len());
    for (column, value) in &key {
        let position = if column == ID_COLUMN {
            None
        } else {
            Some(mapping.column_names().position(|c| c == column)?)
        };
        positions.push((position, value.as_str()));
    }

    let (index, _) = rows.iter().enumerate().rev().find(|(_, row)| {
        positions.iter().all(|(position, text)| match position {
            None => matches_key_text(&SqlValue::Uuid(row.id), text),
            Some(i) => row
                .values
                .get(*i)
                .map(|v| matches_key_text(v, text))
                .unwrap_or(false),
        })
    })?;
    Some(index)
}

/// Compares a staged value with the text Postgres printed for it.
fn matches_key_text(value: &SqlValue, text: &str) -> bool {
    match value {
        // Null never conflicts under a unique index.
        SqlValue::Null => false,
        SqlValue::Bool(b) => text == if *b { "t" } else { "f" },
        SqlValue::Int(i) => text.parse::<i32>().map(|t| t == *i).unwrap_or(false),
        SqlValue::BigInt(i) => text.parse::<i64>().map(|t| t == *i).unwrap_or(false),
        SqlValue::Double(f) => text.parse::<f64>().map(|t| t == *f).unwrap_or(false),
        SqlValue::Decimal(d) => Decimal::from_str(text).map(|t| t == *d).unwrap_or(false),
        SqlValue::Text(s) => text == s,
        SqlValue::Uuid(u) => Uuid::parse_str(text).map(|t| t == *u).unwrap_or(false),
        SqlValue::Timestamp(ts) => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .map(|t| t.with_timezone(&Utc) == *ts)
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{AttributeMetadata, AttributeType, EntityMetadata};
    use crate::schema;
    use chrono::TimeZone;

    fn mapping() -> EntityMapping {
        schema::project(&EntityMetadata {
            logical_name: "contact".to_string(),
            entity_set_name: None,
            primary_id_attribute: "contactid".to_string(),
            change_tracking_enabled: true,
            attributes: vec![
                AttributeMetadata::new("contactid", AttributeType::Uniqueidentifier),
                AttributeMetadata::new("emailaddress1", AttributeType::String),
                AttributeMetadata::new("employeeNumber", AttributeType::Integer),
                AttributeMetadata::new("birthdate", AttributeType::DateTime),
            ],
        })
        .unwrap()
    }

    fn row(email: &str, number: i32) -> ProjectedRow {
        ProjectedRow {
            id: Uuid::new_v4(),
            values: vec![
                SqlValue::Text(email.to_string()),
                SqlValue::Int(number),
                SqlValue::Null,
            ],
        }
    }

    #[test]
    fn test_parse_key_detail() {
        assert_eq!(
            parse_key_detail("Key (emailaddress1)=(amy@example.com) already exists."),
            Some(vec![(
                "emailaddress1".to_string(),
                "amy@example.com".to_string()
            )])
        );
        assert_eq!(
            parse_key_detail("Key (\"employeeNumber\", emailaddress1)=(7, a@b.c) already exists."),
            Some(vec![
                ("employeeNumber".to_string(), "7".to_string()),
                ("emailaddress1".to_string(), "a@b.c".to_string()),
            ])
        );
        assert_eq!(parse_key_detail("Failing row contains (...)."), None);
        assert_eq!(
            parse_key_detail("Key (emailaddress1)=(a, b) already exists."),
            None
        );
    }

    #[test]
    fn test_finds_single_matching_row() {
        let rows = vec![row("a@x.com", 1), row("b@x.com", 2), row("c@x.com", 3)];
        let detail = "Key (emailaddress1)=(b@x.com) already exists.";
        assert_eq!(find_offending_row(&mapping(), &rows, detail), Some(1));

        let detail = "Key (\"employeeNumber\")=(3) already exists.";
        assert_eq!(find_offending_row(&mapping(), &rows, detail), Some(2));
    }

    #[test]
    fn test_repeated_key_blames_last_row() {
        let rows = vec![row("a@x.com", 1), row("b@x.com", 2), row("a@x.com", 3)];
        let m = mapping();
        let detail = "Key (emailaddress1)=(a@x.com) already exists.";
        assert_eq!(find_offending_row(&m, &rows, detail), Some(2));

        // After the retry drops it, the earlier row is the only candidate.
        assert_eq!(find_offending_row(&m, &rows[..2], detail), Some(0));
    }

    #[test]
    fn test_missing_match_is_none() {
        let rows = vec![row("a@x.com", 1), row("a@x.com", 2)];
        let m = mapping();
        assert_eq!(
            find_offending_row(&m, &rows, "Key (emailaddress1)=(z@x.com) already exists."),
            None
        );
        assert_eq!(
            find_offending_row(&m, &rows, "Key (lower(emailaddress1))=(a@x.com) already exists."),
            None
        );
    }

    #[test]
    fn test_matches_postgres_renderings() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert!(matches_key_text(&SqlValue::Timestamp(ts), "2024-03-01 12:00:00+00"));
        assert!(matches_key_text(
            &SqlValue::Decimal(Decimal::new(105, 1)),
            "10.5000"
        ));
        assert!(matches_key_text(&SqlValue::Bool(false), "f"));
        assert!(!matches_key_text(&SqlValue::Null, "null"));
    }
}
