//! Tabular export
//!
//! Writes the entity table as CSV with exactly two columns, `Character` and
//! `Summary`, one row per entity in first-appearance order.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use novelize_core::{EntityTable, NovelizeError, Result};
use tracing::info;

/// Column header
pub const CSV_HEADER: [&str; 2] = ["Character", "Summary"];

fn export_error(e: csv::Error) -> NovelizeError {
    NovelizeError::ExportError(e.to_string())
}

/// Write the table to any writer; returns the number of rows
pub fn write_csv<W: Write>(table: &EntityTable, writer: W) -> Result<usize> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(CSV_HEADER).map_err(export_error)?;

    let mut rows = 0;
    for entity in table {
        csv.write_record([entity.identifier(), entity.text().as_str()])
            .map_err(export_error)?;
        rows += 1;
    }

    csv.flush()?;
    Ok(rows)
}

/// Write the table to a file, replacing it
pub fn export_csv(table: &EntityTable, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let file = File::create(path)?;
    let rows = write_csv(table, file)?;
    info!(path = %path.display(), rows, "Entity table exported");
    Ok(rows)
}

/// Render the table as a CSV string
pub fn to_csv_string(table: &EntityTable) -> Result<String> {
    let mut buf = Vec::new();
    write_csv(table, &mut buf)?;
    String::from_utf8(buf).map_err(|e| NovelizeError::ExportError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use novelize_core::Entity;

    fn table() -> EntityTable {
        let mut table = EntityTable::new();
        table.insert(Entity::new("Bob", "Helped carry the basket", 0));
        table.insert(Entity::new("Alice", "Went to the market", 0));
        table.get_mut("Alice").unwrap().append("Baked a pie");
        table
    }

    #[test]
    fn test_header_and_insertion_order() {
        let csv = to_csv_string(&table()).unwrap();
        assert_eq!(
            csv,
            "Character,Summary\nBob,Helped carry the basket\nAlice,Went to the market; Baked a pie\n"
        );
    }

    #[test]
    fn test_empty_table_has_header_only() {
        assert_eq!(
            to_csv_string(&EntityTable::new()).unwrap(),
            "Character,Summary\n"
        );
    }

    #[test]
    fn test_fields_with_commas_and_quotes_are_escaped() {
        let mut table = EntityTable::new();
        table.insert(Entity::new("Washington, George", "Said \"unity\"", 0));

        let csv = to_csv_string(&table).unwrap();
        assert_eq!(
            csv,
            "Character,Summary\n\"Washington, George\",\"Said \"\"unity\"\"\"\n"
        );
    }

    #[test]
    fn test_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("characters_summary.csv");

        let rows = export_csv(&table(), &path).unwrap();
        assert_eq!(rows, 2);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers, csv::StringRecord::from(vec!["Character", "Summary"]));

        let names: Vec<String> = reader
            .records()
            .map(|r| r.unwrap()[0].to_string())
            .collect();
        assert_eq!(names, vec!["Bob", "Alice"]);
    }

    #[test]
    fn test_unwritable_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no/such/dir/out.csv");
        assert!(matches!(
            export_csv(&table(), missing),
            Err(NovelizeError::Io(_))
        ));
    }
}
