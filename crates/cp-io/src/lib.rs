#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use cp_frame::SummaryFrame;
use cp_types::{Record, TypeError};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tempfile::{Builder, NamedTempFile};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error("failed to move output into place")]
    Persist(#[source] io::Error),
}

/// Lazily yields [`Record`]s from a headed CSV source.
///
/// Rows shorter than the header are kept (their trailing fields are absent);
/// rows longer than the header are truncated to it. Row numbers are 1-based
/// and do not count the header row.
#[derive(Debug)]
pub struct RecordReader<R: Read> {
    reader: csv::Reader<R>,
    headers: Arc<[String]>,
    buffer: StringRecord,
    row_number: usize,
}

impl RecordReader<File> {
    pub fn open(path: &Path) -> Result<Self, IoError> {
        Self::from_reader(File::open(path)?)
    }
}

impl<R: Read> RecordReader<R> {
    pub fn from_reader(input: R) -> Result<Self, IoError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(input);

        let headers = reader.headers()?;
        if headers.is_empty() {
            return Err(IoError::MissingHeaders);
        }
        let headers: Arc<[String]> = headers.iter().map(str::to_owned).collect();

        Ok(Self {
            reader,
            headers,
            buffer: StringRecord::new(),
            row_number: 0,
        })
    }

    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    fn next_record(&mut self) -> Result<Option<Record>, IoError> {
        if !self.reader.read_record(&mut self.buffer)? {
            return Ok(None);
        }
        self.row_number += 1;

        let width = self.headers.len();
        if self.buffer.len() > width {
            debug!(
                row = self.row_number,
                values = self.buffer.len(),
                headers = width,
                "truncating row wider than header"
            );
        }
        let values = self.buffer.iter().take(width).map(str::to_owned).collect();
        Ok(Some(Record::new(
            self.row_number,
            Arc::clone(&self.headers),
            values,
        )?))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record, IoError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Header row of the CSV at `path`, without reading any data rows.
pub fn read_headers(path: &Path) -> Result<Vec<String>, IoError> {
    Ok(RecordReader::open(path)?.headers().to_vec())
}

fn write_frame<W: Write>(frame: &SummaryFrame, out: W) -> Result<W, IoError> {
    let mut writer = WriterBuilder::new().from_writer(out);
    writer.write_record(frame.header())?;
    for row in frame.rows() {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|err| IoError::Io(err.into_error()))
}

pub fn write_summary_string(frame: &SummaryFrame) -> Result<String, IoError> {
    let bytes = write_frame(frame, Vec::new())?;
    String::from_utf8(bytes)
        .map_err(|err| IoError::Io(io::Error::new(io::ErrorKind::InvalidData, err)))
}

/// Temporary sibling of `target` carrying the permissions a plain
/// `File::create(target)` would leave: those of an existing target, else
/// `0o666` less the process umask.
fn staging_file(parent: &Path, target: &Path) -> io::Result<NamedTempFile> {
    let mut builder = Builder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(0o666));
    }
    let staging = builder.tempfile_in(parent)?;
    if let Ok(existing) = fs::metadata(target) {
        staging.as_file().set_permissions(existing.permissions())?;
    }
    Ok(staging)
}

/// Write `frame` to `path` through a temporary file in the same directory,
/// renamed into place only once fully written. A failed run never leaves a
/// partial file at `path`.
pub fn write_summary(path: &Path, frame: &SummaryFrame) -> Result<(), IoError> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let staging = staging_file(parent, path)?;
    let mut staging = write_frame(frame, staging)?;
    staging.flush()?;
    staging
        .persist(path)
        .map_err(|err| IoError::Persist(err.error))?;
    debug!(path = %path.display(), rows = frame.len(), "summary written");
    Ok(())
}
