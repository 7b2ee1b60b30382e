//! CSV reading and staged, atomically committed CSV writing.

use crate::domain::model::{Dataset, OutputRecord, RowRecord};
use crate::utils::error::{EtlError, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Reads the whole input file. Stops after `limit` data rows when given.
///
/// Blank lines are not records: they are skipped, produce no output row and
/// do not count towards `limit`. Row indexes number the records that remain.
/// A line of delimiters only (`,,`) is a record of empty values.
pub fn read_dataset(path: &Path, delimiter: u8, limit: Option<usize>) -> Result<Dataset> {
    let path_label = path.display().to_string();
    let file = File::open(path)?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::Headers)
        .from_reader(BufReader::new(file));

    let headers = reader
        .headers()
        .map_err(|e| read_error(&path_label, e))?
        .clone();
    let columns = validate_header(&path_label, &headers)?;

    let mut rows = Vec::new();
    for (index, result) in reader.records().enumerate() {
        if limit.is_some_and(|max| index >= max) {
            break;
        }
        let record = result.map_err(|e| read_error(&path_label, e))?;
        let values = record.iter().map(str::to_string).collect();
        rows.push(RowRecord::new(index, Arc::clone(&columns), values));
    }

    tracing::debug!(path = %path_label, rows = rows.len(), columns = columns.len(), "input parsed");
    Ok(Dataset { columns, rows })
}

fn validate_header(path: &str, headers: &csv::StringRecord) -> Result<Arc<[String]>> {
    if headers.is_empty() || (headers.len() == 1 && headers[0].is_empty()) {
        return Err(EtlError::format(path, "missing header row"));
    }

    let mut seen = HashSet::new();
    for (position, name) in headers.iter().enumerate() {
        if name.is_empty() {
            return Err(EtlError::format(
                path,
                format!("column {} has an empty name", position + 1),
            ));
        }
        if !seen.insert(name) {
            return Err(EtlError::format(
                path,
                format!("duplicate column name '{}'", name),
            ));
        }
    }

    Ok(headers.iter().map(str::to_string).collect())
}

fn read_error(path: &str, err: csv::Error) -> EtlError {
    let line = |pos: Option<&csv::Position>| {
        pos.map(|p| format!("line {}: ", p.line()))
            .unwrap_or_default()
    };

    match err.into_kind() {
        csv::ErrorKind::Io(e) => EtlError::IoError(e),
        csv::ErrorKind::UnequalLengths {
            pos,
            expected_len,
            len,
        } => EtlError::format(
            path,
            format!(
                "{}expected {} fields, found {}",
                line(pos.as_ref()),
                expected_len,
                len
            ),
        ),
        csv::ErrorKind::Utf8 { pos, err } => EtlError::format(
            path,
            format!("{}invalid UTF-8: {}", line(pos.as_ref()), err),
        ),
        other => EtlError::format(path, format!("{:?}", other)),
    }
}

fn write_error(err: csv::Error) -> EtlError {
    match err.into_kind() {
        csv::ErrorKind::Io(e) => EtlError::IoError(e),
        other => EtlError::ProcessingError {
            message: format!("CSV write failed: {:?}", other),
        },
    }
}

/// Output header: input columns, then generated columns.
pub fn output_header(input_path: &Path, columns: &[String], generated: &[String]) -> Result<Vec<String>> {
    if let Some(clash) = generated.iter().find(|g| columns.contains(g)) {
        return Err(EtlError::format(
            input_path.display().to_string(),
            format!(
                "generated field '{}' collides with an input column of the same name",
                clash
            ),
        ));
    }

    let mut header = Vec::with_capacity(columns.len() + generated.len());
    header.extend(columns.iter().cloned());
    header.extend(generated.iter().cloned());
    Ok(header)
}

/// Streams rows into a temporary file next to the target.
///
/// Nothing is visible at `target` until [`StagedCsvWriter::commit`] renames the
/// temporary file over it. Dropping the writer without committing removes the
/// temporary file and leaves any previous output untouched.
pub struct StagedCsvWriter {
    target: PathBuf,
    writer: csv::Writer<NamedTempFile>,
    width: usize,
    rows_written: usize,
}

impl StagedCsvWriter {
    pub fn create(target: &Path, header: &[String], delimiter: u8) -> Result<Self> {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let staging = tempfile::Builder::new()
            .prefix(".llm-csv-etl-")
            .suffix(".tmp")
            .tempfile_in(&dir)?;

        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(staging);
        writer.write_record(header).map_err(write_error)?;

        Ok(Self {
            target: target.to_path_buf(),
            writer,
            width: header.len(),
            rows_written: 0,
        })
    }

    pub fn append(&mut self, record: &OutputRecord) -> Result<()> {
        if record.values.len() != self.width {
            return Err(EtlError::ProcessingError {
                message: format!(
                    "row {} has {} values, header has {}",
                    record.index,
                    record.values.len(),
                    self.width
                ),
            });
        }
        self.writer.write_record(&record.values).map_err(write_error)?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Flushes and atomically moves the staged file to the target path.
    pub fn commit(self) -> Result<PathBuf> {
        let mut writer = self.writer;
        writer.flush()?;
        let staging = writer.into_inner().map_err(|e| {
            EtlError::IoError(std::io::Error::new(e.error().kind(), e.error().to_string()))
        })?;
        staging.as_file().sync_all()?;
        staging.persist(&self.target)?;
        Ok(self.target)
    }
}

/// Writes a complete output file in one go.
pub fn write_records(
    target: &Path,
    header: &[String],
    records: &[OutputRecord],
    delimiter: u8,
) -> Result<PathBuf> {
    let mut writer = StagedCsvWriter::create(target, header, delimiter)?;
    for record in records {
        writer.append(record)?;
    }
    writer.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_input(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_read_dataset_in_file_order() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "in.csv", "topic,audience\ncats,children\ndogs,\n");

        let dataset = read_dataset(&path, b',', None).unwrap();

        assert_eq!(&*dataset.columns, &["topic".to_string(), "audience".to_string()]);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.rows[0].index, 0);
        assert_eq!(dataset.rows[0].get("topic"), Some("cats"));
        assert_eq!(dataset.rows[1].get("audience"), Some(""));
    }

    #[test]
    fn test_blank_lines_are_not_records() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "in.csv", "topic,audience\ncats,children\n\n\r\ndogs,adults\n,\n");

        let dataset = read_dataset(&path, b',', None).unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.rows[1].index, 1);
        assert_eq!(dataset.rows[1].get("topic"), Some("dogs"));
        assert_eq!(dataset.rows[2].get("topic"), Some(""));

        let limited = read_dataset(&path, b',', Some(2)).unwrap();
        assert_eq!(limited.rows[1].get("topic"), Some("dogs"));
    }

    #[test]
    fn test_read_dataset_trims_header_names() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "in.csv", " topic , audience\ncats,children\n");

        let dataset = read_dataset(&path, b',', None).unwrap();

        assert_eq!(dataset.rows[0].get("audience"), Some("children"));
    }

    #[test]
    fn test_read_dataset_respects_limit() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "in.csv", "a\n1\n2\n3\n");

        let dataset = read_dataset(&path, b',', Some(2)).unwrap();

        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn test_read_dataset_custom_delimiter() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "in.tsv", "a\tb\n1,5\t2\n");

        let dataset = read_dataset(&path, b'\t', None).unwrap();

        assert_eq!(dataset.rows[0].get("a"), Some("1,5"));
    }

    #[test]
    fn test_duplicate_header_is_format_error() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "in.csv", "a,b,a\n1,2,3\n");

        let err = read_dataset(&path, b',', None).unwrap_err();

        assert!(matches!(err, EtlError::FormatError { .. }));
        assert!(err.to_string().contains("duplicate column name 'a'"));
    }

    #[test]
    fn test_empty_file_is_format_error() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "in.csv", "");

        let err = read_dataset(&path, b',', None).unwrap_err();

        assert!(matches!(err, EtlError::FormatError { .. }));
    }

    #[test]
    fn test_ragged_row_is_format_error() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "in.csv", "a,b\n1,2\n3\n");

        let err = read_dataset(&path, b',', None).unwrap_err();

        match err {
            EtlError::FormatError { message, .. } => {
                assert!(message.contains("expected 2 fields, found 1"), "{}", message)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();

        let err = read_dataset(&dir.path().join("nope.csv"), b',', None).unwrap_err();

        assert!(matches!(err, EtlError::IoError(_)));
    }

    #[test]
    fn test_output_header_rejects_collisions() {
        let columns = vec!["topic".to_string(), "title".to_string()];
        let generated = vec!["title".to_string()];

        let err = output_header(Path::new("in.csv"), &columns, &generated).unwrap_err();
        assert!(matches!(err, EtlError::FormatError { .. }));

        let header = output_header(Path::new("in.csv"), &columns[..1], &generated).unwrap();
        assert_eq!(header, vec!["topic", "title"]);
    }

    #[test]
    fn test_uncommitted_writer_leaves_previous_output() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.csv");
        fs::write(&target, "previous\n").unwrap();

        {
            let mut writer =
                StagedCsvWriter::create(&target, &["a".to_string()], b',').unwrap();
            writer
                .append(&OutputRecord {
                    index: 0,
                    values: vec!["new".to_string()],
                })
                .unwrap();
        }

        assert_eq!(fs::read_to_string(&target).unwrap(), "previous\n");
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_commit_replaces_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested").join("out.csv");
        let header = vec!["a".to_string(), "b".to_string()];

        let path = write_records(
            &target,
            &header,
            &[OutputRecord {
                index: 0,
                values: vec!["1".to_string(), "two, with comma".to_string()],
            }],
            b',',
        )
        .unwrap();

        assert_eq!(path, target);
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "a,b\n1,\"two, with comma\"\n"
        );
    }

    #[test]
    fn test_append_rejects_width_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut writer =
            StagedCsvWriter::create(&dir.path().join("out.csv"), &["a".to_string()], b',')
                .unwrap();

        let err = writer
            .append(&OutputRecord {
                index: 4,
                values: vec!["1".to_string(), "2".to_string()],
            })
            .unwrap_err();

        assert!(matches!(err, EtlError::ProcessingError { .. }));
        assert_eq!(writer.rows_written(), 0);
    }
}
