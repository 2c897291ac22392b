use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::{ImportError, Result};
use crate::layout::TableLayout;
use crate::schema::OFFSET_WINDOW;

/// One non-zero numeric entry, zero-based relative to the table's offsets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// Row and column label tuples of one table, in source order.
///
/// Row labels are the leading `col_offset` cells of each data row; column
/// labels are the leading `row_offset` cells of each data column (header
/// rows transposed, ragged rows padded with empty strings). Labels are the
/// only part of a table held wholly in memory.
#[derive(Debug, Clone, Default)]
pub struct TableLabels {
    pub row_labels: Vec<Vec<String>>,
    pub col_labels: Vec<Vec<String>>,
}

/// A CSV reader configured for raw worksheet grids: no header row, ragged
/// records allowed.
pub fn grid_reader<R: Read>(source: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(source)
}

/// Open one converted worksheet under `data_dir`, preferring the
/// gzip-compressed dump and falling back to a plain CSV.
pub fn open_table(data_dir: &Path, layout: &TableLayout) -> Result<csv::Reader<Box<dyn Read>>> {
    let dir = data_dir.join(&layout.filename);
    let gz = dir.join(format!("{}.csv.gz", layout.worksheet));
    let source: Box<dyn Read> = if gz.is_file() {
        Box::new(GzDecoder::new(File::open(&gz)?))
    } else {
        Box::new(File::open(dir.join(format!("{}.csv", layout.worksheet)))?)
    };
    Ok(grid_reader(source))
}

/// Guess (row_offset, col_offset) from the leading window of a grid.
///
/// The dataset convention: header cells in the first row and label cells in
/// the first column are blank, so data begins one past the last blank. A
/// non-empty top-left cell means the grid has no header at all.
///
/// The heuristic inspects at most [`OFFSET_WINDOW`] rows and columns. A
/// boundary at or beyond the window cannot be told apart from a mis-read, so
/// that case fails hard instead of returning a silently wrong offset.
/// Explicit offsets in a [`TableLayout`] always take priority over detection.
pub fn detect_offsets<R: Read>(reader: csv::Reader<R>) -> Result<(usize, usize)> {
    let mut window: Vec<Vec<String>> = Vec::with_capacity(OFFSET_WINDOW);
    for record in reader.into_records().take(OFFSET_WINDOW) {
        let record = record?;
        window.push(
            record
                .iter()
                .take(OFFSET_WINDOW)
                .map(str::to_string)
                .collect(),
        );
    }

    let first = window
        .first()
        .ok_or_else(|| ImportError::OffsetDetection("grid is empty".to_string()))?;
    if !first.first().map(String::as_str).unwrap_or("").is_empty() {
        return Ok((0, 0));
    }

    let col_offset = first
        .iter()
        .enumerate()
        .filter(|(_, value)| value.is_empty())
        .map(|(j, _)| j)
        .max()
        .unwrap_or(0)
        + 1;
    let row_offset = window
        .iter()
        .enumerate()
        .filter(|(_, row)| row.first().map(String::as_str).unwrap_or("").is_empty())
        .map(|(i, _)| i)
        .max()
        .unwrap_or(0)
        + 1;

    if row_offset >= OFFSET_WINDOW || col_offset >= OFFSET_WINDOW {
        return Err(ImportError::OffsetDetection(format!(
            "header boundary not within the {OFFSET_WINDOW}x{OFFSET_WINDOW} heuristic window"
        )));
    }
    Ok((row_offset, col_offset))
}

/// Resolve a table's offsets: explicit descriptor values win, anything left
/// unset is detected from a fresh read of the table.
pub fn resolved_offsets(data_dir: &Path, layout: &TableLayout) -> Result<(usize, usize)> {
    if let (Some(row_offset), Some(col_offset)) = (layout.row_offset, layout.col_offset) {
        return Ok((row_offset, col_offset));
    }
    let (detected_rows, detected_cols) = detect_offsets(open_table(data_dir, layout)?)?;
    let row_offset = layout.row_offset.unwrap_or(detected_rows);
    let col_offset = layout.col_offset.unwrap_or(detected_cols);
    debug!(
        worksheet = %layout.worksheet,
        row_offset,
        col_offset,
        "detected table offsets"
    );
    Ok((row_offset, col_offset))
}

/// Extract the label tuples of one table. Consumes the reader once,
/// front to back.
pub fn read_labels<R: Read>(
    reader: csv::Reader<R>,
    row_offset: usize,
    col_offset: usize,
) -> Result<TableLabels> {
    let mut records = reader.into_records();

    let mut header_rows: Vec<Vec<String>> = Vec::with_capacity(row_offset);
    for _ in 0..row_offset {
        match records.next() {
            Some(record) => header_rows.push(
                record?
                    .iter()
                    .skip(col_offset)
                    .map(str::to_string)
                    .collect(),
            ),
            None => break,
        }
    }
    let width = header_rows.iter().map(Vec::len).max().unwrap_or(0);
    let col_labels = (0..width)
        .map(|j| {
            header_rows
                .iter()
                .map(|row| row.get(j).cloned().unwrap_or_default())
                .collect()
        })
        .collect();

    let mut row_labels = Vec::new();
    for record in records {
        row_labels.push(
            record?
                .iter()
                .take(col_offset)
                .map(str::to_string)
                .collect(),
        );
    }

    Ok(TableLabels {
        row_labels,
        col_labels,
    })
}

/// Lazy stream of non-zero numeric cells past a table's offsets.
///
/// One record is held at a time; the grid is never materialized. Empty
/// fields are skipped; a non-empty field that is not a number is data
/// corruption and fails the stream (distinguishing "no value" from "corrupt
/// value"). Yielded coordinates are offset-relative.
pub struct DataCells<R: Read> {
    records: csv::StringRecordsIntoIter<R>,
    row_offset: usize,
    col_offset: usize,
    next_row: usize,
    current: Option<(usize, csv::StringRecord)>,
    cursor: usize,
    done: bool,
}

impl<R: Read> DataCells<R> {
    pub fn new(reader: csv::Reader<R>, row_offset: usize, col_offset: usize) -> Self {
        Self {
            records: reader.into_records(),
            row_offset,
            col_offset,
            next_row: 0,
            current: None,
            cursor: 0,
            done: false,
        }
    }
}

impl<R: Read> Iterator for DataCells<R> {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some((row, record)) = &self.current {
                while self.cursor < record.len() {
                    let j = self.cursor;
                    self.cursor += 1;
                    let raw = &record[j];
                    if raw.is_empty() {
                        continue;
                    }
                    match raw.trim().parse::<f64>() {
                        Ok(value) if value != 0.0 => {
                            return Some(Ok(Cell {
                                row: row - self.row_offset,
                                col: j - self.col_offset,
                                value,
                            }));
                        }
                        Ok(_) => continue,
                        Err(_) => {
                            self.done = true;
                            return Some(Err(ImportError::MalformedCell {
                                row: *row,
                                col: j,
                                value: raw.to_string(),
                            }));
                        }
                    }
                }
                self.current = None;
            }

            loop {
                match self.records.next() {
                    Some(Ok(record)) => {
                        let row = self.next_row;
                        self.next_row += 1;
                        if row < self.row_offset {
                            continue;
                        }
                        self.cursor = self.col_offset;
                        self.current = Some((row, record));
                        break;
                    }
                    Some(Err(e)) => {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                    None => {
                        self.done = true;
                        return None;
                    }
                }
            }
        }
    }
}

/// Open the streaming cell iterator of one table, offsets resolved.
pub fn table_cells(data_dir: &Path, layout: &TableLayout) -> Result<DataCells<Box<dyn Read>>> {
    let (row_offset, col_offset) = resolved_offsets(data_dir, layout)?;
    Ok(DataCells::new(
        open_table(data_dir, layout)?,
        row_offset,
        col_offset,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(data: &str) -> csv::Reader<&[u8]> {
        grid_reader(data.as_bytes())
    }

    const GRID: &str = "\
,,,h1,h2
,,,h3,h4
a,b,c,1,2
d,e,f,0,3
";

    #[test]
    fn detects_no_header_when_top_left_is_filled() {
        assert_eq!(detect_offsets(reader("7,8\n9,10\n")).unwrap(), (0, 0));
    }

    #[test]
    fn detects_blank_header_complement() {
        assert_eq!(detect_offsets(reader(GRID)).unwrap(), (2, 3));
    }

    #[test]
    fn detection_fails_outside_heuristic_window() {
        // 30 blank-prefixed header rows: the boundary is past the window.
        let mut grid = String::new();
        for _ in 0..30 {
            grid.push_str(",x\n");
        }
        grid.push_str("label,1\n");
        let err = detect_offsets(reader(&grid)).unwrap_err();
        assert!(matches!(err, ImportError::OffsetDetection(_)));
    }

    #[test]
    fn detection_fails_on_empty_grid() {
        assert!(matches!(
            detect_offsets(reader("")).unwrap_err(),
            ImportError::OffsetDetection(_)
        ));
    }

    #[test]
    fn labels_round_trip_known_grid_dimensions() {
        let labels = read_labels(reader(GRID), 2, 3).unwrap();
        assert_eq!(
            labels.row_labels,
            vec![
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
                vec!["d".to_string(), "e".to_string(), "f".to_string()],
            ]
        );
        assert_eq!(
            labels.col_labels,
            vec![
                vec!["h1".to_string(), "h3".to_string()],
                vec!["h2".to_string(), "h4".to_string()],
            ]
        );
    }

    #[test]
    fn ragged_header_rows_pad_column_labels() {
        let labels = read_labels(reader(",x,y,z\n,p\nr,1,2,3\n"), 2, 1).unwrap();
        assert_eq!(labels.col_labels.len(), 3);
        assert_eq!(labels.col_labels[0], vec!["x".to_string(), "p".to_string()]);
        assert_eq!(labels.col_labels[2], vec!["z".to_string(), String::new()]);
    }

    #[test]
    fn cells_skip_blank_and_zero_values() {
        let cells: Vec<Cell> = DataCells::new(reader(GRID), 2, 3)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            cells,
            vec![
                Cell { row: 0, col: 0, value: 1.0 },
                Cell { row: 0, col: 1, value: 2.0 },
                Cell { row: 1, col: 1, value: 3.0 },
            ]
        );
    }

    #[test]
    fn cells_ignore_header_rows_and_label_columns() {
        // Header cells hold text; only the data quadrant is parsed.
        let grid = ",name\nwidget,5\n";
        let cells: Vec<Cell> = DataCells::new(reader(grid), 1, 1)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(cells, vec![Cell { row: 0, col: 0, value: 5.0 }]);
    }

    #[test]
    fn corrupt_cell_fails_instead_of_becoming_zero() {
        let grid = ",h\nlabel,oops\n";
        let err = DataCells::new(reader(grid), 1, 1)
            .collect::<Result<Vec<_>>>()
            .unwrap_err();
        match err {
            ImportError::MalformedCell { row, col, value } => {
                assert_eq!((row, col), (1, 1));
                assert_eq!(value, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
