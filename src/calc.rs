use chrono::{DateTime, Duration, Utc};

/// Institute-wide minimum attendance ratio. Comparisons use integer
/// arithmetic (`4*attended >= 3*total`) so the exact-75% boundary never
/// depends on float rounding.
pub const REQUIRED_NUM: u64 = 3;
pub const REQUIRED_DEN: u64 = 4;

/// Corrections stay on the student's dashboard for this long after the last
/// status change.
pub const CORRECTION_VISIBILITY_DAYS: i64 = 3;

pub fn meets_required(attended: u64, total: u64) -> bool {
    REQUIRED_DEN * attended >= REQUIRED_NUM * total
}

/// 1-decimal percentage, `None` when no lectures were held yet (rendered as
/// "N/A" upstream).
pub fn percentage(attended: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let pct = 100.0 * attended as f64 / total as f64;
    Some((pct * 10.0).round() / 10.0)
}

/// Smallest x such that attending the next x lectures reaches the required
/// ratio. The ratio increases strictly with each attended lecture, so the
/// linear scan terminates.
pub fn lectures_to_reach_75(attended: u64, total: u64) -> u64 {
    if total == 0 || meets_required(attended, total) {
        return 0;
    }
    let mut x: u64 = 0;
    while !meets_required(attended + x, total + x) {
        x += 1;
    }
    x
}

/// Largest y such that missing the next y lectures keeps the ratio at or
/// above the requirement. 0 when already below it or nothing was held yet.
pub fn lectures_can_skip(attended: u64, total: u64) -> u64 {
    if total == 0 || !meets_required(attended, total) {
        return 0;
    }
    let mut y: u64 = 0;
    while meets_required(attended, total + y) {
        y += 1;
    }
    y - 1
}

/// Overall figures sum raw counts across subjects; a subject with more
/// lectures weighs proportionally more.
pub fn overall_counts<I>(pairs: I) -> (u64, u64)
where
    I: IntoIterator<Item = (u64, u64)>,
{
    let mut attended: u64 = 0;
    let mut total: u64 = 0;
    for (a, t) in pairs {
        attended += a;
        total += t;
    }
    (attended, total)
}

/// The clock a correction's visibility runs on: last adjudication when there
/// was one, submission otherwise.
pub fn pivot_date(
    status_updated_at: Option<DateTime<Utc>>,
    submitted_at: DateTime<Utc>,
) -> DateTime<Utc> {
    status_updated_at.unwrap_or(submitted_at)
}

pub fn visible_to_student(pivot: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(pivot) < Duration::days(CORRECTION_VISIBILITY_DAYS)
}
