use chrono::{DateTime, Days, Local, NaiveDate, TimeZone, Utc};

use super::record::MeasurementRecord;
use crate::persistence::store::{DocumentStore, StoreError};

/// UTC bounds of one local calendar day, end exclusive
pub fn day_bounds(day: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = Local
        .from_local_datetime(&day.and_hms_opt(0, 0, 0)?)
        .earliest()?;
    let next = day.checked_add_days(Days::new(1))?;
    let end = Local
        .from_local_datetime(&next.and_hms_opt(0, 0, 0)?)
        .earliest()?;
    Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
}

/// Measurements `owner` took on `day`, newest first
pub async fn measurements_on(
    store: &dyn DocumentStore,
    owner: &str,
    day: NaiveDate,
) -> Result<Vec<MeasurementRecord>, StoreError> {
    let Some((from, to)) = day_bounds(day) else {
        return Ok(Vec::new());
    };
    store.measurements_between(owner, from, to).await
}
