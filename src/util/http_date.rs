//! IMF-fixdate formatting and parsing for `Last-Modified`, `Expires` and
//! `If-Modified-Since` headers.

use std::time::SystemTime;

use time::{
    OffsetDateTime, PrimitiveDateTime, format_description::BorrowedFormatItem,
    macros::format_description,
};

const IMF_FIXDATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Format a timestamp as an HTTP date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format(at: OffsetDateTime) -> String {
    at.to_offset(time::UtcOffset::UTC)
        .format(IMF_FIXDATE)
        .unwrap_or_default()
}

pub fn format_system_time(at: SystemTime) -> String {
    format(OffsetDateTime::from(at))
}

/// Parse an HTTP date. Only the IMF-fixdate form is accepted.
pub fn parse(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value.trim(), IMF_FIXDATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn formats_imf_fixdate() {
        let at = datetime!(1994-11-06 08:49:37 UTC);
        assert_eq!(format(at), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn parses_what_it_formats() {
        let at = datetime!(2024-02-29 23:01:02 UTC);
        assert_eq!(parse(&format(at)), Some(at));
    }

    #[test]
    fn rejects_other_date_forms() {
        assert!(parse("Sunday, 06-Nov-94 08:49:37 GMT").is_none());
        assert!(parse("").is_none());
    }
}
