//! Table output for the CLI
//!
//! The default table shows ID, installation, state and request time. A
//! custom column list (`HEADER:.Field.Sub,...`) picks fields out of each
//! operation's JSON view instead.

use dbmig_model::{MigrationError, MigrationOperationView};
use serde_json::Value;

const REQUEST_AT_LAYOUT: &str = "%Y-%m-%d %H:%M:%S %z %Z";
const MISSING: &str = "<none>";

/// Header row plus one row per operation
pub type TableData = (Vec<String>, Vec<Vec<String>>);

/// One requested column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Printed header
    pub header: String,
    /// Field path into the JSON view
    pub path: Vec<String>,
}

/// Parse `HEADER:.Path,HEADER:.Path`
///
/// # Errors
/// - `MigrationError::InvalidRequest` on an empty list or a column without
///   `HEADER:.path`
pub fn parse_columns(list: &str) -> Result<Vec<Column>, MigrationError> {
    let columns = list
        .split(',')
        .map(str::trim)
        .filter(|column| !column.is_empty())
        .map(|column| -> Result<Column, MigrationError> {
            let (header, path) = column.split_once(':').ok_or_else(|| {
                MigrationError::InvalidRequest(format!(
                    "column {column:?} is not in HEADER:.path form"
                ))
            })?;
            let path: Vec<String> = path
                .trim_start_matches('.')
                .split('.')
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect();
            if header.is_empty() || path.is_empty() {
                return Err(MigrationError::InvalidRequest(format!(
                    "column {column:?} needs a header and a field path"
                )));
            }
            Ok(Column {
                header: header.to_string(),
                path,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if columns.is_empty() {
        return Err(MigrationError::InvalidRequest("no columns given".into()));
    }
    Ok(columns)
}

/// The default four-column table
#[must_use]
pub fn default_table(views: &[MigrationOperationView]) -> TableData {
    let keys = ["ID", "INSTALLATION ID", "STATE", "REQUEST AT"]
        .map(str::to_string)
        .to_vec();
    let rows = views
        .iter()
        .map(|view| {
            vec![
                view.id.to_string(),
                view.installation_id.to_string(),
                view.state.as_str().to_string(),
                format_request_at(view.request_at),
            ]
        })
        .collect();
    (keys, rows)
}

/// A table of the requested columns
///
/// # Errors
/// - `MigrationError::InvalidRequest` if a view cannot be serialized
pub fn custom_table(
    columns: &[Column],
    views: &[MigrationOperationView],
) -> Result<TableData, MigrationError> {
    let keys = columns.iter().map(|c| c.header.clone()).collect();
    let rows = views
        .iter()
        .map(|view| -> Result<Vec<String>, MigrationError> {
            let value = serde_json::to_value(view)
                .map_err(|e| MigrationError::InvalidRequest(e.to_string()))?;
            Ok(columns.iter().map(|c| cell(&value, &c.path)).collect())
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((keys, rows))
}

/// Left-aligned columns separated by two spaces
#[must_use]
pub fn render(keys: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = keys.iter().map(|k| k.chars().count()).collect();
    for row in rows {
        for (width, value) in widths.iter_mut().zip(row) {
            *width = (*width).max(value.chars().count());
        }
    }

    let line = |cells: &[String]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{cell:<width$}"))
            .collect();
        padded.join("  ").trim_end().to_string()
    };

    let mut out = line(keys);
    out.push('\n');
    for row in rows {
        out.push_str(&line(row));
        out.push('\n');
    }
    out
}

/// Unix millis as `2006-01-02 15:04:05 -0700 MST`, in UTC
#[must_use]
pub fn format_request_at(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis).map_or_else(
        || millis.to_string(),
        |at| at.format(REQUEST_AT_LAYOUT).to_string(),
    )
}

fn cell(value: &Value, path: &[String]) -> String {
    let found = path
        .iter()
        .try_fold(value, |current, key| current.get(key.as_str()));
    match found {
        None | Some(Value::Null) => MISSING.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbmig_model::{BackendDescriptor, DatabaseKind, MigrationState, OperationId};

    fn view() -> MigrationOperationView {
        MigrationOperationView {
            id: OperationId::new(),
            installation_id: "inst-1".into(),
            state: MigrationState::Copying,
            destination: BackendDescriptor::multi_tenant(DatabaseKind::MultiTenantRdsPostgres, "db-1"),
            request_at: 1_700_000_000_000,
            failure_reason: None,
        }
    }

    #[test]
    fn request_time_uses_the_classic_layout() {
        assert_eq!(
            format_request_at(1_700_000_000_000),
            "2023-11-14 22:13:20 +0000 UTC"
        );
    }

    #[test]
    fn default_table_has_four_columns() {
        let view = view();
        let (keys, rows) = default_table(std::slice::from_ref(&view));
        assert_eq!(keys, ["ID", "INSTALLATION ID", "STATE", "REQUEST AT"]);
        assert_eq!(rows[0][1], "inst-1");
        assert_eq!(rows[0][2], "copying");
        assert_eq!(rows[0][3], "2023-11-14 22:13:20 +0000 UTC");
    }

    #[test]
    fn custom_columns_follow_json_paths() {
        let columns = parse_columns("STATE:.State, DB:.Destination.database_id,WHY:.FailureReason").unwrap();
        assert_eq!(columns[1].path, ["Destination", "database_id"]);

        let view = view();
        let (keys, rows) = custom_table(&columns, std::slice::from_ref(&view)).unwrap();
        assert_eq!(keys, ["STATE", "DB", "WHY"]);
        assert_eq!(rows[0], ["copying", "db-1", MISSING]);
    }

    #[test]
    fn malformed_columns_are_rejected() {
        assert!(parse_columns("").is_err());
        assert!(parse_columns("STATE").is_err());
        assert!(parse_columns("STATE:.").is_err());
        assert!(parse_columns(":.State").is_err());
    }

    #[test]
    fn render_pads_to_the_widest_cell() {
        let keys = vec!["ID".to_string(), "STATE".to_string()];
        let rows = vec![vec!["abc".to_string(), "migrated".to_string()]];
        assert_eq!(render(&keys, &rows), "ID   STATE\nabc  migrated\n");
    }
}
