//! Timestamp format shared by project file names and the differential-backup reference time.

use chrono::TimeZone;

/// `YYYYMMDDThhmmss`, e.g. `20240131T235959`.
pub const FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reference time cannot be empty")]
    Empty,
    #[error("failed to parse reference time {value:?}, expected format YYYYMMDDThhmmss: {source}")]
    Parse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("reference time {0:?} does not exist in the local time zone")]
    Nonexistent(String),
    #[error("reference time {0:?} is in the future")]
    InFuture(String),
}

#[must_use]
pub fn format(time: &chrono::DateTime<chrono::Local>) -> String {
    time.format(FORMAT).to_string()
}

/// Timestamp used to name files produced by one command invocation.
#[must_use]
pub fn now_stamp() -> String {
    format(&chrono::Local::now())
}

/// Parses a reference time in local time and checks it lies strictly before `now`.
pub fn parse_reference_time(
    value: &str,
    now: chrono::DateTime<chrono::Local>,
) -> Result<chrono::DateTime<chrono::Local>, Error> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Empty);
    }
    let naive =
        chrono::NaiveDateTime::parse_from_str(value, FORMAT).map_err(|source| Error::Parse {
            value: value.to_string(),
            source,
        })?;
    // on a DST fold pick the earlier instant so nothing modified in the overlap is missed
    let time = chrono::Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| Error::Nonexistent(value.to_string()))?;
    if time >= now {
        return Err(Error::InFuture(value.to_string()));
    }
    Ok(time)
}
