use time::{OffsetDateTime, format_description::well_known::Rfc3339};

pub mod health;
pub mod scan;
pub mod session;
pub mod sse;
pub mod validation;
pub mod ws;

/// Render a timestamp as RFC 3339 for wire payloads.
pub fn format_timestamp(time: OffsetDateTime) -> String {
    time.format(&Rfc3339)
        .unwrap_or_else(|_| "invalid-timestamp".into())
}

/// Current server time rendered as RFC 3339.
pub fn now_timestamp() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}
