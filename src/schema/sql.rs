//! SQL text rendered from an entity mapping's column list.
//!
//! Statements never embed row data; values are always bound as parameters.
//! Identifiers are checked against [`validate_identifier`] when the mapping is
//! built, so they can be quoted and interpolated here.

use super::{EntityMapping, FIRST_SYNCED_COLUMN, ID_COLUMN, LAST_SYNCED_COLUMN};
use crate::error::ProjectionError;

/// Longest identifier accepted (the Postgres limit).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// SQL flavour of the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Bind placeholder for the 1-based parameter `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${}", n),
        }
    }

    /// Expression producing the current time in the format this dialect stores timestamps.
    fn now(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            Dialect::Postgres => "now()",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Postgres => write!(f, "postgres"),
        }
    }
}

/// Checks a table or column name against the identifier allow-list:
/// an ASCII letter or underscore followed by ASCII letters, digits or underscores.
pub fn validate_identifier(name: &str) -> Result<(), ProjectionError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);

    if !valid_start
        || name.len() > MAX_IDENTIFIER_LEN
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ProjectionError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

pub(crate) fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}

/// Quoted target column list: `Id`, data columns, then the sync timestamps.
fn target_columns(mapping: &EntityMapping) -> Vec<String> {
    std::iter::once(ID_COLUMN)
        .chain(mapping.column_names())
        .chain([FIRST_SYNCED_COLUMN, LAST_SYNCED_COLUMN])
        .map(quote)
        .collect()
}

/// `SET` assignments for the conflict branch. `FirstSyncedOn` is never overwritten.
fn update_assignments(mapping: &EntityMapping) -> String {
    mapping
        .column_names()
        .chain(std::iter::once(LAST_SYNCED_COLUMN))
        .map(|c| format!("{} = excluded.{}", quote(c), quote(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn create_table(mapping: &EntityMapping, dialect: Dialect) -> String {
    let mut lines = vec![format!(
        "    {} {} NOT NULL PRIMARY KEY",
        quote(ID_COLUMN),
        super::ValueType::Uuid.sql_type(dialect)
    )];
    for column in mapping.columns() {
        lines.push(format!(
            "    {} {} NULL",
            quote(&column.name),
            column.value_type.sql_type(dialect)
        ));
    }
    let ts = super::ValueType::Timestamp.sql_type(dialect);
    lines.push(format!("    {} {} NOT NULL", quote(FIRST_SYNCED_COLUMN), ts));
    lines.push(format!("    {} {} NOT NULL", quote(LAST_SYNCED_COLUMN), ts));

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        quote(&mapping.table_name),
        lines.join(",\n")
    )
}

pub(crate) fn staging_table(mapping: &EntityMapping, dialect: Dialect, staging: &str) -> String {
    let mut columns = vec![format!(
        "{} {} NOT NULL",
        quote(ID_COLUMN),
        super::ValueType::Uuid.sql_type(dialect)
    )];
    for column in mapping.columns() {
        columns.push(format!(
            "{} {}",
            quote(&column.name),
            column.value_type.sql_type(dialect)
        ));
    }
    let suffix = match dialect {
        Dialect::Postgres => " ON COMMIT DROP",
        Dialect::Sqlite => "",
    };
    format!(
        "CREATE TEMPORARY TABLE {} ({}){}",
        quote(staging),
        columns.join(", "),
        suffix
    )
}

/// Column list for loading the staging table, in projection order.
pub(crate) fn staging_columns(mapping: &EntityMapping) -> String {
    std::iter::once(ID_COLUMN)
        .chain(mapping.column_names())
        .map(quote)
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn merge(mapping: &EntityMapping, dialect: Dialect, staging: &str) -> String {
    let now = dialect.now();
    // `WHERE true` keeps SQLite from parsing ON CONFLICT as a join constraint.
    format!(
        "INSERT INTO {table} ({target}) SELECT {source}, {now}, {now} FROM {staging} WHERE true \
         ON CONFLICT ({id}) DO UPDATE SET {updates}",
        table = quote(&mapping.table_name),
        target = target_columns(mapping).join(", "),
        source = staging_columns(mapping),
        now = now,
        staging = quote(staging),
        id = quote(ID_COLUMN),
        updates = update_assignments(mapping),
    )
}

pub(crate) fn upsert(mapping: &EntityMapping, dialect: Dialect) -> String {
    let columns = target_columns(mapping);
    let placeholders: Vec<String> = (1..=columns.len())
        .map(|n| dialect.placeholder(n))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
        quote(&mapping.table_name),
        columns.join(", "),
        placeholders.join(", "),
        quote(ID_COLUMN),
        update_assignments(mapping)
    )
}

pub(crate) fn delete(mapping: &EntityMapping, dialect: Dialect, id_count: usize) -> String {
    match dialect {
        Dialect::Postgres => format!(
            "DELETE FROM {} WHERE {} = ANY($1)",
            quote(&mapping.table_name),
            quote(ID_COLUMN)
        ),
        Dialect::Sqlite => {
            let placeholders = vec!["?"; id_count.max(1)].join(", ");
            format!(
                "DELETE FROM {} WHERE {} IN ({})",
                quote(&mapping.table_name),
                quote(ID_COLUMN),
                placeholders
            )
        }
    }
}
