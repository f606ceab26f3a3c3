//! Durable checkpoints of trainer progress.
//!
//! Architecture
//! ------------
//!
//! A checkpoint is three objects written under a timestamped virtual
//! directory of the [`crate::storage::ObjectStore`]:
//!
//! ```text
//! <YYYYMMDD>/<HHMMSS>/model
//! <YYYYMMDD>/<HHMMSS>/model.trackback
//! <YYYYMMDD>/<HHMMSS>/state
//! ```
//!
//! plus two singleton pointers which are overwritten by copy once the
//! checkpoint is complete: [`LATEST_STATE`] and [`LATEST_MODEL`].
//! History is never deleted.
//!
//! The [`crate::learner::Learner`] builds a [`CheckpointPayload`]
//! synchronously; the [`writer::CheckpointWriter`] writes it in the
//! background. On startup [`crate::recovery::RecoveryCoordinator`]
//! looks for the newest loadable checkpoint.
//!
//! If two checkpoints are taken within the same second, the later
//! ones are put in `<HHMMSS>-<n>` so history is never overwritten.

use std::fmt::Display;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};

pub mod policy;
pub mod state;
pub mod writer;

pub use policy::CheckpointPolicy;
pub use state::TrainerState;
pub use writer::{CheckpointWriter, CheckpointWriterHandle};

/// Pointer to the state of the newest complete checkpoint.
pub const LATEST_STATE: &str = "state";
/// Pointer to the newest published model.
pub const LATEST_MODEL: &str = "current/model";

const DAY_FORMAT: &str = "%Y%m%d";
const TIME_FORMAT: &str = "%H%M%S";

/// Names the directory of one checkpoint.
///
/// Orders from oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointPath {
    pub day: NaiveDate,
    pub time: NaiveTime,
    /// Disambiguates checkpoints within the same second.
    pub seq: u32,
}

impl CheckpointPath {
    /// Path for a checkpoint taken at `now`, never equal to or before
    /// `previous` as long as the clock doesn't go backwards.
    pub fn new(now: DateTime<Utc>, previous: Option<&CheckpointPath>) -> Self {
        let naive = now.naive_utc();
        let day = naive.date();
        let time = naive.time().with_nanosecond(0).unwrap_or(naive.time());
        let seq = match previous {
            Some(prev) if prev.day == day && prev.time == time => prev.seq + 1,
            _ => 0,
        };
        Self { day, time, seq }
    }

    /// Parse a day directory name.
    pub fn parse_day(s: &str) -> Option<NaiveDate> {
        if s.len() != 8 {
            return None;
        }
        NaiveDate::parse_from_str(s, DAY_FORMAT).ok()
    }

    /// Parse a time directory name, with optional `-<n>` suffix.
    pub fn parse_time(s: &str) -> Option<(NaiveTime, u32)> {
        let (time, seq) = match s.split_once('-') {
            Some((time, seq)) => (time, seq.parse().ok().filter(|seq| *seq > 0)?),
            None => (s, 0),
        };
        if time.len() != 6 {
            return None;
        }
        let time = NaiveTime::parse_from_str(time, TIME_FORMAT).ok()?;
        Some((time, seq))
    }

    /// Parse `<YYYYMMDD>/<HHMMSS>[-<n>]`.
    pub fn parse(s: &str) -> Option<Self> {
        let (day, time) = s.split_once('/')?;
        let day = Self::parse_day(day)?;
        let (time, seq) = Self::parse_time(time)?;
        Some(Self { day, time, seq })
    }

    pub fn model(&self) -> String {
        format!("{self}/model")
    }

    pub fn trackback(&self) -> String {
        format!("{self}/model.trackback")
    }

    pub fn state(&self) -> String {
        format!("{self}/state")
    }
}

impl Display for CheckpointPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            self.day.format(DAY_FORMAT),
            self.time.format(TIME_FORMAT)
        )?;
        if self.seq > 0 {
            write!(f, "-{}", self.seq)?;
        }
        Ok(())
    }
}

/// Event IDs learned into a model since the previous checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trackback {
    pub model_id: String,
    pub event_ids: Vec<String>,
}

const MODEL_ID_HEADER: &str = "modelid: ";

impl Trackback {
    /// `modelid: <id>` then one event ID per line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = format!("{MODEL_ID_HEADER}{}\n", self.model_id);
        for id in &self.event_ids {
            body.push_str(id);
            body.push('\n');
        }
        body.into_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let mut lines = text.lines();
        let model_id = lines.next()?.strip_prefix(MODEL_ID_HEADER)?.to_owned();
        let event_ids = lines.map(str::to_owned).collect();
        Some(Self {
            model_id,
            event_ids,
        })
    }
}

/// Everything a [`CheckpointWriter`] needs to write one checkpoint.
///
/// Built on the learn worker; never changed afterwards.
#[derive(Debug, Clone)]
pub struct CheckpointPayload {
    pub path: CheckpointPath,
    pub model_id: String,
    /// Serialized [`TrainerState`].
    pub state: Vec<u8>,
    pub model: Vec<u8>,
    /// Serialized [`Trackback`].
    pub trackback: Vec<u8>,
    pub trackback_count: usize,
    /// Also advance [`LATEST_MODEL`].
    pub update_latest_model: bool,
}

#[cfg(test)]
fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

#[test]
fn path_format_works() {
    let path = CheckpointPath::new(at("2024-03-05T07:08:09.750Z"), None);
    assert_eq!(path.to_string(), "20240305/070809");
    assert_eq!(path.model(), "20240305/070809/model");
    assert_eq!(path.trackback(), "20240305/070809/model.trackback");
    assert_eq!(path.state(), "20240305/070809/state");
    assert_eq!(CheckpointPath::parse("20240305/070809"), Some(path));
}

#[test]
fn same_second_gets_suffix() {
    let first = CheckpointPath::new(at("2024-03-05T07:08:09.100Z"), None);
    let second = CheckpointPath::new(at("2024-03-05T07:08:09.900Z"), Some(&first));
    let third = CheckpointPath::new(at("2024-03-05T07:08:09.950Z"), Some(&second));
    let later = CheckpointPath::new(at("2024-03-05T07:08:10Z"), Some(&third));
    assert_eq!(second.to_string(), "20240305/070809-1");
    assert_eq!(third.to_string(), "20240305/070809-2");
    assert_eq!(later.to_string(), "20240305/070810");
    assert!(first < second && second < third && third < later);
    assert_eq!(CheckpointPath::parse("20240305/070809-2"), Some(third));
}

#[test]
fn parse_rejects_junk() {
    assert_eq!(CheckpointPath::parse_day("current"), None);
    assert_eq!(CheckpointPath::parse_day("20241340"), None);
    assert_eq!(CheckpointPath::parse_time("0708"), None);
    assert_eq!(CheckpointPath::parse_time("070809-0"), None);
    assert_eq!(CheckpointPath::parse_time("070809-x"), None);
    assert_eq!(CheckpointPath::parse("state"), None);
}

#[test]
fn trackback_format_works() {
    let trackback = Trackback {
        model_id: "m-1".to_owned(),
        event_ids: vec!["e1".to_owned(), "e2".to_owned()],
    };
    let bytes = trackback.to_bytes();
    assert_eq!(bytes, b"modelid: m-1\ne1\ne2\n");
    assert_eq!(Trackback::parse(&bytes), Some(trackback));
    assert_eq!(Trackback::parse(b"e1\ne2\n"), None);
}
