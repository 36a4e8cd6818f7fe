use crate::archive::{SidecarSource, sidecar_path};
use crate::database::{InsertOptions, Store};
use crate::dlog;
use crate::error::{Error, Result};
use crate::gpx::read_track;
use crate::records::flatten_element;
use crate::types::{Element, Row};
use serde_json::Value as JsonValue;

pub const WORKOUTS_TABLE: &str = "workouts";
pub const POINTS_TABLE: &str = "workout_points";

/// Write one workout, then its route points (embedded `Location`s, or the
/// trackpoints of the GPX files it references). Returns the number of points.
///
/// The workout row goes in first so its id exists before any point refers to it.
pub fn workout_to_db<S: Store + ?Sized>(
    store: &mut S,
    workout: &Element,
    seq: i64,
    sidecars: &mut dyn SidecarSource,
    points_batch: usize,
) -> Result<usize> {
    let mut row = flatten_element(workout)?;
    let events: Vec<JsonValue> = workout
        .children_named("WorkoutEvent")
        .map(|e| JsonValue::Object(e.attrs_row()))
        .collect();
    row.insert("workout_events".to_string(), JsonValue::Array(events));
    row.insert("seq".to_string(), JsonValue::from(seq));

    let key = store.insert(
        WORKOUTS_TABLE,
        &row,
        &InsertOptions {
            alter: true,
            hash_id: Some("id"),
            ..InsertOptions::default()
        },
    )?;
    let workout_id = JsonValue::from(key);

    let mut points: Vec<Row> = workout
        .find_all("WorkoutRoute", "Location")
        .map(|loc| with_workout_id(loc.attrs_row(), &workout_id))
        .collect();

    if points.is_empty() {
        for reference in workout.find_all("WorkoutRoute", "FileReference") {
            let rel = reference.attr("path").ok_or(Error::MissingField {
                element: "FileReference",
                field: "path",
            })?;
            let path = sidecar_path(rel);
            let track = {
                let missing = |source| Error::MissingResource {
                    path: path.clone(),
                    source,
                };
                let file = sidecars.open(&path).map_err(missing)?;
                read_track(file)
                    .map_err(missing)?
                    .map_err(|source| Error::Track {
                        path: path.clone(),
                        source,
                    })?
            };
            dlog!("gpx_loaded path={path} points={}", track.len());
            points.extend(
                track
                    .points()
                    .map(|p| with_workout_id(p.clone(), &workout_id)),
            );
        }
    }

    if points.is_empty() {
        dlog!("workout seq={seq} id={workout_id} points=0");
        return Ok(0);
    }

    let opts = InsertOptions {
        alter: true,
        foreign_keys: &[("workout_id", WORKOUTS_TABLE)],
        batch_size: points_batch,
        ..InsertOptions::default()
    };
    for batch in points.chunks(points_batch.max(1)) {
        store.insert_all(POINTS_TABLE, batch, &opts)?;
    }
    dlog!("workout seq={seq} id={workout_id} points={}", points.len());

    Ok(points.len())
}

fn with_workout_id(mut row: Row, workout_id: &JsonValue) -> Row {
    row.insert("workout_id".to_string(), workout_id.clone());
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::LooseFiles;
    use crate::database::SqliteStore;
    use serde_json::json;

    fn el(name: &str, attrs: &[(&str, &str)]) -> Element {
        let mut e = Element::new(name);
        for (k, v) in attrs {
            e.attrs.insert((*k).to_string(), (*v).to_string());
        }
        e
    }

    fn running() -> Element {
        let mut w = el(
            "Workout",
            &[
                ("workoutActivityType", "HKWorkoutActivityTypeRunning"),
                ("duration", "30.5"),
            ],
        );
        w.children
            .push(el("MetadataEntry", &[("key", "HKIndoorWorkout"), ("value", "0")]));
        w.children
            .push(el("WorkoutEvent", &[("type", "HKWorkoutEventTypePause"), ("date", "d1")]));
        w.children
            .push(el("WorkoutEvent", &[("type", "HKWorkoutEventTypeResume"), ("date", "d2")]));
        w
    }

    #[test]
    fn flattens_metadata_and_events_and_stores_seq() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut files = LooseFiles::new("/nonexistent");
        let n = workout_to_db(&mut store, &running(), 3, &mut files, 50).unwrap();
        assert_eq!(n, 0);
        assert!(store.table_columns(POINTS_TABLE).unwrap().is_empty());

        let (seq, meta, events): (i64, String, String) = store
            .connection()
            .query_row(
                "SELECT seq, metadata_HKIndoorWorkout, workout_events FROM workouts",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(seq, 3);
        assert_eq!(meta, "0");
        let events: JsonValue = serde_json::from_str(&events).unwrap();
        assert_eq!(
            events,
            json!([
                {"type": "HKWorkoutEventTypePause", "date": "d1"},
                {"type": "HKWorkoutEventTypeResume", "date": "d2"}
            ])
        );
    }

    #[test]
    fn embedded_locations_become_points() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut w = running();
        let mut route = el("WorkoutRoute", &[("sourceName", "Watch")]);
        for i in 0..120 {
            let lat = format!("40.{i:03}");
            route
                .children
                .push(el("Location", &[("latitude", lat.as_str()), ("longitude", "-3.7")]));
        }
        w.children.push(route);

        let mut files = LooseFiles::new("/nonexistent");
        let n = workout_to_db(&mut store, &w, 1, &mut files, 50).unwrap();
        assert_eq!(n, 120);

        let id: String = store
            .connection()
            .query_row("SELECT id FROM workouts", [], |r| r.get(0))
            .unwrap();
        let linked: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM workout_points WHERE workout_id = ?1",
                [&id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(linked, 120);
    }

    #[test]
    fn missing_sidecar_is_fatal() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut w = running();
        let mut route = el("WorkoutRoute", &[]);
        route
            .children
            .push(el("FileReference", &[("path", "/workout-routes/missing.gpx")]));
        w.children.push(route);

        let tmp = tempfile::tempdir().unwrap();
        let mut files = LooseFiles::new(tmp.path());
        let err = workout_to_db(&mut store, &w, 1, &mut files, 50).unwrap_err();
        match err {
            Error::MissingResource { path, .. } => {
                assert_eq!(path, "apple_health_export/workout-routes/missing.gpx");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.table_columns(POINTS_TABLE).unwrap().is_empty());
    }

    #[test]
    fn truncated_sidecar_inserts_no_points() {
        let tmp = tempfile::tempdir().unwrap();
        let routes = tmp.path().join("apple_health_export").join("workout-routes");
        std::fs::create_dir_all(&routes).unwrap();
        std::fs::write(
            routes.join("cut.gpx"),
            "<?xml version=\"1.0\"?>\n<gpx><trk><trkseg><trkpt lat=\"1\" lon=\"2\"></trkpt><trkpt lat=\"3\"",
        )
        .unwrap();

        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut w = running();
        let mut route = el("WorkoutRoute", &[]);
        route
            .children
            .push(el("FileReference", &[("path", "/workout-routes/cut.gpx")]));
        w.children.push(route);

        let mut files = LooseFiles::new(tmp.path());
        let err = workout_to_db(&mut store, &w, 1, &mut files, 50).unwrap_err();
        assert!(matches!(err, Error::Track { .. }), "{err}");
        assert!(store.table_columns(POINTS_TABLE).unwrap().is_empty());
    }
}
