use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::ZipArchive;

/// Top-level directory of every Apple Health export.
pub const EXPORT_ROOT: &str = "apple_health_export";

const EXPORT_XML: &str = "export.xml";

/// Where side-car GPX files referenced by workouts are read from.
pub trait SidecarSource {
    /// Open `path`, a `/`-separated path relative to the export's parent.
    fn open(&mut self, path: &str) -> io::Result<Box<dyn Read + '_>>;
}

impl<R: Read + Seek> SidecarSource for ZipArchive<R> {
    fn open(&mut self, path: &str) -> io::Result<Box<dyn Read + '_>> {
        let entry = self.by_name(path).map_err(io::Error::from)?;
        Ok(Box::new(entry))
    }
}

/// Side-car files laid out on disk under `root`.
#[derive(Debug, Clone)]
pub struct LooseFiles {
    root: PathBuf,
}

impl LooseFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SidecarSource for LooseFiles {
    fn open(&mut self, path: &str) -> io::Result<Box<dyn Read + '_>> {
        let full = path
            .split('/')
            .filter(|c| !c.is_empty())
            .fold(self.root.clone(), |acc, c| acc.join(c));
        Ok(Box::new(File::open(full)?))
    }
}

/// Map a `FileReference` path (e.g. `/workout-routes/route_1.gpx`) to its
/// location below the export root.
pub fn sidecar_path(reference: &str) -> String {
    std::iter::once(EXPORT_ROOT)
        .chain(reference.split('/').filter(|c| !c.is_empty()))
        .collect::<Vec<_>>()
        .join("/")
}

/// The main export document and where its side-car files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportInput {
    /// `export.zip` as produced by the Health app.
    Zip { path: PathBuf, member: String },
    /// A loose `export.xml`; side-car paths resolve below `sidecar_root`.
    Xml { path: PathBuf, sidecar_root: PathBuf },
}

impl ExportInput {
    /// Accepts:
    /// - a `.zip` export
    /// - an extracted export directory (either `apple_health_export/` or its parent)
    /// - the `export.xml` file itself (always, when `force_xml` is set)
    pub fn open(path: &Path, force_xml: bool) -> Result<Self> {
        if force_xml {
            return Ok(Self::xml(path));
        }

        if path.is_dir() {
            let xml = find_export_xml(path)?;
            tracing::info!(path = %xml.display(), "using export directory");
            return Ok(Self::xml(&xml));
        }

        let is_zip = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.eq_ignore_ascii_case("zip"));
        if !is_zip {
            return Ok(Self::xml(path));
        }

        let zip_file = File::open(path)?;
        let zip = ZipArchive::new(zip_file)?;
        let member = find_export_member(&zip)
            .ok_or_else(|| Error::ExportNotFound(path.display().to_string()))?;
        tracing::info!(zip = %path.display(), member = %member, entries = zip.len(), "using export zip");

        Ok(Self::Zip {
            path: path.to_path_buf(),
            member,
        })
    }

    /// Uncompressed size of the main document, for progress display.
    pub fn size(&self) -> Result<u64> {
        match self {
            Self::Zip { path, member } => {
                let mut zip = ZipArchive::new(File::open(path)?)?;
                let size = zip.by_name(member)?.size();
                Ok(size)
            }
            Self::Xml { path, .. } => Ok(std::fs::metadata(path)?.len()),
        }
    }

    fn xml(path: &Path) -> Self {
        let sidecar_root = path
            .parent()
            .filter(|dir| dir.file_name().is_some_and(|n| n == EXPORT_ROOT))
            .and_then(Path::parent)
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::Xml {
            path: path.to_path_buf(),
            sidecar_root,
        }
    }
}

fn find_export_member<R: Read + Seek>(zip: &ZipArchive<R>) -> Option<String> {
    let preferred = format!("{EXPORT_ROOT}/{EXPORT_XML}");
    if zip.index_for_name(&preferred).is_some() {
        return Some(preferred);
    }
    zip.file_names()
        .find(|name| {
            name.rsplit('/')
                .next()
                .is_some_and(|f| f.eq_ignore_ascii_case(EXPORT_XML))
        })
        .map(str::to_string)
}

fn find_export_xml(dir: &Path) -> Result<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(2)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.eq_ignore_ascii_case(EXPORT_XML))
        })
        .map(walkdir::DirEntry::into_path)
        .collect();
    // Shallowest match first.
    found.sort_by_key(|p| p.components().count());
    found
        .into_iter()
        .next()
        .ok_or_else(|| Error::ExportNotFound(dir.display().to_string()))
}
