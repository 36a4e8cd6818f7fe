use thiserror::Error;

/// Everything that can abort a conversion run.
///
/// Nothing is retried or skipped: the first error ends the run, and batches
/// flushed before it stay in the database.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed export XML near byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },

    #[error("malformed export XML near byte {position}: {reason}")]
    Structure { position: u64, reason: &'static str },

    #[error("<{element}> is missing the `{field}` attribute")]
    MissingField {
        element: &'static str,
        field: &'static str,
    },

    #[error("cannot open side-car file {path}: {source}")]
    MissingResource {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse GPX track {path}: {source}")]
    Track {
        path: String,
        #[source]
        source: crate::gpx::TrackError,
    },

    #[error("SQLite error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("table {table}: {reason}")]
    Schema { table: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ZIP error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no export.xml found in {0}")]
    ExportNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
