use crate::proxy::context::{BoxBody, RequestContext};
use http::header::{HeaderValue, CONNECTION, DATE};
use hyper::Response;
use std::time::{SystemTime, UNIX_EPOCH};

/// The one place every response passes through before it is handed back
/// to the server: stamp `date`, default `connection: close`, record the
/// latency sample, clear the context bag. Header names need no
/// lowercasing pass; `http::HeaderMap` stores them lowercase.
pub fn finalize(ctx: &mut RequestContext, resp: &mut Response<BoxBody>) {
    let headers = resp.headers_mut();

    if !headers.contains_key(CONNECTION) {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    if let Ok(v) = HeaderValue::from_str(&http_date(SystemTime::now())) {
        headers.insert(DATE, v);
    }

    metrics::histogram!("proxy_http_request_duration_seconds")
        .record(ctx.start.elapsed().as_secs_f64());

    ctx.bag.clear();
}

const WEEKDAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// RFC 7231 IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(t: SystemTime) -> String {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    // Day 0 of the epoch was a Thursday.
    let weekday = WEEKDAYS[(days % 7) as usize];
    let (year, month, day) = civil_from_days(days);

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        weekday,
        day,
        MONTHS[(month - 1) as usize],
        year,
        hour,
        minute,
        second
    )
}

/// Days-since-epoch to proleptic Gregorian (y, m, d).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = if month <= 2 { y + 1 } else { y };
    (year, month, day)
}
