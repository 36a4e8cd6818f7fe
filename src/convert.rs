use crate::archive::{ExportInput, LooseFiles, SidecarSource};
use crate::database::{InsertOptions, Store};
use crate::dlog;
use crate::error::Result;
use crate::records::{flatten_element, write_records};
use crate::types::{Element, Progress, Row};
use crate::workouts::workout_to_db;
use crate::xml::TagStream;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use zip::ZipArchive;

/// Elements of the export that end up in the database.
pub const TAGS: [&str; 3] = ["Record", "Workout", "ActivitySummary"];

pub const ACTIVITY_SUMMARY_TABLE: &str = "activity_summary";

/// Buffer thresholds that trigger a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizes {
    pub records: usize,
    pub activity_summaries: usize,
    pub workout_points: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            records: 200,
            activity_summaries: 100,
            workout_points: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertStats {
    pub records: usize,
    pub activity_summaries: usize,
    pub workouts: usize,
    pub workout_points: usize,
    pub record_tables: BTreeSet<String>,
}

/// State of one conversion run: the buffers and the workout counter.
pub struct Converter<'a, S: Store + ?Sized> {
    store: &'a mut S,
    sidecars: &'a mut dyn SidecarSource,
    batches: BatchSizes,
    records: Vec<Row>,
    summaries: Vec<Row>,
    next_seq: i64,
    stats: ConvertStats,
}

impl<'a, S: Store + ?Sized> Converter<'a, S> {
    pub fn new(store: &'a mut S, sidecars: &'a mut dyn SidecarSource) -> Self {
        Self {
            store,
            sidecars,
            batches: BatchSizes::default(),
            records: Vec::new(),
            summaries: Vec::new(),
            next_seq: 1,
            stats: ConvertStats::default(),
        }
    }

    #[must_use]
    pub fn with_batch_sizes(mut self, batches: BatchSizes) -> Self {
        self.batches = batches;
        self
    }

    /// Stream `input` into the store. `progress` receives byte deltas while
    /// parsing and `Progress::Finished` once everything has been flushed.
    pub fn run<R: Read>(
        mut self,
        input: R,
        mut progress: Option<&mut dyn FnMut(Progress)>,
    ) -> Result<ConvertStats> {
        {
            let mut on_bytes = |n: u64| {
                if let Some(cb) = progress.as_mut() {
                    cb(Progress::Advanced(n));
                }
            };
            let stream = TagStream::from_read(input, TAGS).on_progress(&mut on_bytes);
            for el in stream {
                self.handle(el?)?;
            }
        }

        self.flush_records()?;
        self.flush_summaries()?;

        if let Some(cb) = progress {
            cb(Progress::Finished);
        }

        let stats = self.stats;
        tracing::info!(
            records = stats.records,
            record_tables = stats.record_tables.len(),
            activity_summaries = stats.activity_summaries,
            workouts = stats.workouts,
            workout_points = stats.workout_points,
            "conversion done"
        );
        Ok(stats)
    }

    fn handle(&mut self, el: Element) -> Result<()> {
        match el.name.as_str() {
            "Record" => {
                self.records.push(flatten_element(&el)?);
                if self.records.len() >= self.batches.records {
                    self.flush_records()?;
                }
            }
            "ActivitySummary" => {
                self.summaries.push(el.attrs_row());
                if self.summaries.len() >= self.batches.activity_summaries {
                    self.flush_summaries()?;
                }
            }
            "Workout" => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let points = workout_to_db(
                    &mut *self.store,
                    &el,
                    seq,
                    &mut *self.sidecars,
                    self.batches.workout_points,
                )?;
                self.stats.workouts += 1;
                self.stats.workout_points += points;
            }
            other => {
                dlog!("ignoring element {other}");
            }
        }
        Ok(())
    }

    fn flush_records(&mut self) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.records);
        for (table, rows) in write_records(&mut *self.store, batch)? {
            self.stats.records += rows;
            self.stats.record_tables.insert(table);
        }
        Ok(())
    }

    fn flush_summaries(&mut self) -> Result<()> {
        if self.summaries.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.summaries);
        dlog!("flush_activity_summaries rows={}", batch.len());
        self.store.insert_all(
            ACTIVITY_SUMMARY_TABLE,
            &batch,
            &InsertOptions {
                alter: true,
                ..InsertOptions::default()
            },
        )?;
        self.stats.activity_summaries += batch.len();
        Ok(())
    }
}

/// Convert one export document with the default batch sizes.
pub fn convert_xml_to_sqlite<R: Read, S: Store + ?Sized>(
    input: R,
    store: &mut S,
    sidecars: &mut dyn SidecarSource,
    progress: Option<&mut dyn FnMut(Progress)>,
) -> Result<ConvertStats> {
    Converter::new(store, sidecars).run(input, progress)
}

/// Convert an export found by [`ExportInput::open`].
pub fn convert_export<S: Store + ?Sized>(
    input: &ExportInput,
    store: &mut S,
    progress: Option<&mut dyn FnMut(Progress)>,
) -> Result<ConvertStats> {
    match input {
        ExportInput::Zip { path, member } => {
            let mut main = ZipArchive::new(File::open(path)?)?;
            let document = main.by_name(member)?;
            // Second handle: side-car reads happen while the document is open.
            let mut sidecars = ZipArchive::new(File::open(path)?)?;
            convert_xml_to_sqlite(document, store, &mut sidecars, progress)
        }
        ExportInput::Xml { path, sidecar_root } => {
            let document = File::open(path)?;
            let mut sidecars = LooseFiles::new(sidecar_root);
            convert_xml_to_sqlite(document, store, &mut sidecars, progress)
        }
    }
}
