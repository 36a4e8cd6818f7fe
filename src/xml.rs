use crate::error::{Error, Result};
use crate::types::Element;
use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read};

/// Read size for the main document, and the granularity of progress reports.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Forward-only stream of the elements whose tag is in an interesting set.
///
/// Markup outside an interesting element is never materialized. Inside one,
/// the subtree is built up until its closing tag and then handed to the
/// caller, which owns (and drops) it from then on.
pub struct TagStream<'p, R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    tags: HashSet<String>,
    open: Vec<Element>,
    nesting: Nesting,
    reported: u64,
    on_progress: Option<&'p mut dyn FnMut(u64)>,
    finished: bool,
}

enum Step {
    Open(Element),
    Leaf(Element),
    Close,
    Eof,
    Skip,
}

impl<'p, R: Read> TagStream<'p, BufReader<R>> {
    pub fn from_read<I, S>(input: R, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(BufReader::with_capacity(CHUNK_SIZE, input), tags)
    }
}

impl<'p, R: BufRead> TagStream<'p, R> {
    pub fn new<I, S>(input: R, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reader: Reader::from_reader(input),
            buf: Vec::new(),
            tags: tags.into_iter().map(Into::into).collect(),
            open: Vec::new(),
            nesting: Nesting::default(),
            reported: 0,
            on_progress: None,
            finished: false,
        }
    }

    /// Report consumed bytes (a delta, not a running total) roughly once per chunk.
    #[must_use]
    pub fn on_progress(mut self, cb: &'p mut dyn FnMut(u64)) -> Self {
        self.on_progress = Some(cb);
        self
    }

    fn report(&mut self, force: bool) {
        let pos = self.reader.buffer_position();
        let delta = pos.saturating_sub(self.reported);
        if delta == 0 || (!force && delta < CHUNK_SIZE as u64) {
            return;
        }
        if let Some(cb) = self.on_progress.as_mut() {
            cb(delta);
        }
        self.reported = pos;
    }

    fn next_element(&mut self) -> Result<Option<Element>> {
        loop {
            let position = self.reader.buffer_position();
            let step = match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(e)) => {
                    self.nesting.open(position)?;
                    if self.open.is_empty() && !is_interesting(&self.tags, &e) {
                        Step::Skip
                    } else {
                        Step::Open(element_from(&e, self.reader.buffer_position())?)
                    }
                }
                Ok(Event::Empty(e)) => {
                    self.nesting.leaf(position)?;
                    if self.open.is_empty() && !is_interesting(&self.tags, &e) {
                        Step::Skip
                    } else {
                        Step::Leaf(element_from(&e, self.reader.buffer_position())?)
                    }
                }
                Ok(Event::End(_)) => {
                    self.nesting.close();
                    Step::Close
                }
                Ok(Event::Text(t)) => {
                    if t.iter().any(|b| !b.is_ascii_whitespace()) {
                        self.nesting.content(position)?;
                    }
                    Step::Skip
                }
                Ok(Event::CData(_) | Event::GeneralRef(_)) => {
                    self.nesting.content(position)?;
                    Step::Skip
                }
                Ok(Event::Eof) => {
                    self.nesting.eof(self.reader.buffer_position())?;
                    Step::Eof
                }
                Ok(_) => Step::Skip,
                // These only come from EOF in the middle of markup.
                Err(quick_xml::Error::Syntax(err)) if !matches!(err, SyntaxError::InvalidBangMarkup) => {
                    self.nesting.eof(self.reader.error_position())?;
                    tracing::warn!(
                        position = self.reader.error_position(),
                        err = %err,
                        "export document is truncated; stopping"
                    );
                    Step::Eof
                }
                Err(source) => {
                    return Err(Error::Xml {
                        position: self.reader.error_position(),
                        source,
                    });
                }
            };
            self.buf.clear();
            self.report(false);

            match step {
                Step::Open(el) => self.open.push(el),
                Step::Leaf(el) => {
                    if let Some(done) = self.close(el) {
                        return Ok(Some(done));
                    }
                }
                Step::Close => {
                    if let Some(el) = self.open.pop()
                        && let Some(done) = self.close(el)
                    {
                        return Ok(Some(done));
                    }
                }
                Step::Eof => {
                    if !self.open.is_empty() {
                        tracing::warn!(
                            unclosed = self.open.len(),
                            "export document ended inside an element; dropping it"
                        );
                        self.open.clear();
                    }
                    return Ok(None);
                }
                Step::Skip => {}
            }
        }
    }

    /// Attach a closed element to its parent, or hand it out if it is interesting.
    fn close(&mut self, el: Element) -> Option<Element> {
        let interesting = self.tags.contains(&el.name);
        match self.open.last_mut() {
            Some(parent) if interesting => {
                parent.children.push(el.clone());
                Some(el)
            }
            Some(parent) => {
                parent.children.push(el);
                None
            }
            None => Some(el),
        }
    }
}

/// Element depth of the whole document, to enforce a single root element.
#[derive(Debug, Default)]
struct Nesting {
    depth: usize,
    root_seen: bool,
}

impl Nesting {
    fn open(&mut self, position: u64) -> Result<()> {
        self.leaf(position)?;
        self.depth += 1;
        Ok(())
    }

    fn leaf(&mut self, position: u64) -> Result<()> {
        if self.depth == 0 {
            if self.root_seen {
                return Err(Error::Structure {
                    position,
                    reason: "element after the root element",
                });
            }
            self.root_seen = true;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Character data is only allowed inside the root.
    fn content(&self, position: u64) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::Structure {
                position,
                reason: "text outside the root element",
            });
        }
        Ok(())
    }

    fn eof(&self, position: u64) -> Result<()> {
        if !self.root_seen && position > 0 {
            return Err(Error::Structure {
                position,
                reason: "no root element",
            });
        }
        Ok(())
    }
}

fn is_interesting(tags: &HashSet<String>, e: &BytesStart<'_>) -> bool {
    tags.contains(String::from_utf8_lossy(e.name().as_ref()).as_ref())
}

fn element_from(e: &BytesStart<'_>, position: u64) -> Result<Element> {
    let xml_err = |source| Error::Xml { position, source };
    let mut el = Element::new(String::from_utf8_lossy(e.name().as_ref()));
    for attr in e.attributes() {
        let attr = attr.map_err(|err| xml_err(quick_xml::Error::from(err)))?;
        let value = attr
            .unescape_value()
            .map_err(|err| xml_err(quick_xml::Error::from(err)))?;
        el.attrs.insert(
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            value.into_owned(),
        );
    }
    Ok(el)
}

impl<R: BufRead> Iterator for TagStream<'_, R> {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_element() {
            Ok(Some(el)) => Some(Ok(el)),
            Ok(None) => {
                self.finished = true;
                self.report(true);
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAGS: [&str; 3] = ["Record", "Workout", "ActivitySummary"];

    fn collect(doc: &str) -> Vec<Element> {
        TagStream::new(doc.as_bytes(), TAGS)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn yields_interesting_elements_in_document_order() {
        let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
<HealthData locale="en_US">
 <ExportDate value="2020-01-01"/>
 <Me HKCharacteristicTypeIdentifierBiologicalSex="x"/>
 <Record type="HKQuantityTypeIdentifierHeartRate" value="60"/>
 <ActivitySummary dateComponents="2020-01-01" activeEnergyBurned="10"/>
 <Record type="HKQuantityTypeIdentifierStepCount" value="5">
  <MetadataEntry key="HKTimeZone" value="Europe/Paris"/>
 </Record>
</HealthData>"#;
        let els = collect(doc);
        let names: Vec<_> = els.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Record", "ActivitySummary", "Record"]);
        assert_eq!(els[0].attr("value"), Some("60"));
        assert!(els[0].children.is_empty());
        assert_eq!(els[2].children.len(), 1);
        assert_eq!(els[2].children[0].attr("key"), Some("HKTimeZone"));
    }

    #[test]
    fn keeps_nested_structure_of_workouts() {
        let doc = r#"<HealthData>
<Workout workoutActivityType="HKWorkoutActivityTypeRunning">
  <WorkoutEvent type="HKWorkoutEventTypePause"/>
  <WorkoutRoute sourceName="Watch">
    <Location latitude="1.5" longitude="2.5"/>
    <Location latitude="1.6" longitude="2.6"/>
  </WorkoutRoute>
</Workout>
</HealthData>"#;
        let els = collect(doc);
        assert_eq!(els.len(), 1);
        let w = &els[0];
        assert_eq!(w.children.len(), 2);
        assert_eq!(w.find_all("WorkoutRoute", "Location").count(), 2);
    }

    #[test]
    fn unescapes_attribute_values() {
        let els = collect(r#"<r><Record type="a&amp;b" unit="&lt;x&gt;"/></r>"#);
        assert_eq!(els[0].attr("type"), Some("a&b"));
        assert_eq!(els[0].attr("unit"), Some("<x>"));
    }

    #[test]
    fn nested_interesting_tags_are_yielded_on_their_own_close() {
        let els = collect(r#"<r><Workout id="w"><Record type="t"/></Workout></r>"#);
        let names: Vec<_> = els.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Record", "Workout"]);
        assert_eq!(els[1].children[0].attr("type"), Some("t"));
    }

    #[test]
    fn empty_document_yields_nothing() {
        assert!(collect("").is_empty());
    }

    #[test]
    fn truncated_document_stops_without_error() {
        let doc = r#"<HealthData><Record type="a"/><Record type="b"/><Workout x="1"><Workout"#;
        let els = collect(doc);
        assert_eq!(els.len(), 2);

        let doc = r#"<HealthData><Record type="a"/><Workout x="1"><WorkoutEvent/>"#;
        let els = collect(doc);
        assert_eq!(els.len(), 1);
    }

    #[test]
    fn mismatched_tags_are_an_error() {
        let doc = r#"<HealthData><Workout></Record></HealthData>"#;
        let res: Result<Vec<_>> = TagStream::new(doc.as_bytes(), TAGS).collect();
        assert!(matches!(res, Err(Error::Xml { .. })));
    }

    #[test]
    fn plain_text_is_not_an_export() {
        for doc in ["this is not an export at all\n", "<?xml version=\"1.0\"?>\n", "  \n"] {
            let res: Result<Vec<_>> = TagStream::new(doc.as_bytes(), TAGS).collect();
            assert!(matches!(res, Err(Error::Structure { .. })), "{doc:?}");
        }
    }

    #[test]
    fn nothing_is_read_past_the_root_element() {
        let doc = r#"<HealthData><Record type="a"/></HealthData><Record type="b"/> junk"#;
        let mut stream = TagStream::new(doc.as_bytes(), TAGS);
        assert_eq!(stream.next().unwrap().unwrap().attr("type"), Some("a"));
        assert!(matches!(
            stream.next(),
            Some(Err(Error::Structure {
                reason: "element after the root element",
                ..
            }))
        ));
        assert!(stream.next().is_none());

        let doc = "<HealthData><Record type=\"a\"/></HealthData>\ntrailing";
        let res: Result<Vec<_>> = TagStream::new(doc.as_bytes(), TAGS).collect();
        assert!(matches!(res, Err(Error::Structure { .. })));

        let doc = "<?xml version=\"1.0\"?>\n<!-- export -->\n<HealthData/>\n";
        assert!(collect(doc).is_empty());
    }

    #[test]
    fn progress_reports_are_deltas_bounded_by_input() {
        let mut doc = String::from("<HealthData>\n");
        let line = r#"<Record type="HKQuantityTypeIdentifierStepCount" startDate="2020-01-01 10:00:00 +0100" value="12"/>"#;
        while doc.len() < 3 * CHUNK_SIZE {
            doc.push_str(line);
            doc.push('\n');
        }
        doc.push_str("</HealthData>\n");

        let mut calls: Vec<u64> = Vec::new();
        let mut cb = |n: u64| calls.push(n);
        let count = TagStream::from_read(doc.as_bytes(), TAGS)
            .on_progress(&mut cb)
            .filter(Result::is_ok)
            .count();

        assert!(count > 1000);
        assert!(calls.len() >= 3);
        assert!(calls.iter().all(|&n| n > 0));
        let total: u64 = calls.iter().sum();
        assert!(total <= doc.len() as u64);
        assert!(total >= 3 * CHUNK_SIZE as u64);
    }
}
