//! Parsing and validation of user-supplied configuration values.

use chrono::{NaiveDate, NaiveDateTime};

use crate::config::types::TimeframeFilter;
use crate::error::{DumpError, Result};
use crate::ident;
use crate::schema::TableRef;

/// Parse a timeframe specification.
///
/// Accepted forms:
/// - `table:column:start:end`
/// - `table:start:end` (column defaults to `created_at`)
/// - `column:start:end` with `implied_table` set (seed-table form)
///
/// Date-only bounds expand to the full day: the start to midnight, the end
/// to 23:59:59, so both bounds stay inclusive.
pub fn parse_timeframe(
    spec: &str,
    default_schema: &str,
    implied_table: Option<&str>,
) -> Result<TimeframeFilter> {
    let parts: Vec<&str> = spec.split(':').collect();

    let (table, column, start_str, end_str) = match (parts.as_slice(), implied_table) {
        ([column, start, end], Some(table)) => (table, *column, *start, *end),
        ([table, start, end], None) => (*table, "created_at", *start, *end),
        ([table, column, start, end], _) => (*table, *column, *start, *end),
        _ => {
            return Err(DumpError::Usage(format!(
                "Invalid timeframe format: {}. Expected table:column:start:end or table:start:end",
                spec
            )))
        }
    };

    let start = parse_bound(start_str, false)?;
    let end = parse_bound(end_str, true)?;

    if end < start {
        return Err(DumpError::Usage(format!(
            "Timeframe end {} precedes start {}",
            end_str, start_str
        )));
    }

    ident::validate_identifier(column)?;

    Ok(TimeframeFilter {
        table: TableRef::parse(table, default_schema)?,
        column: column.to_string(),
        start,
        end,
    })
}

/// Parse one timeframe bound. Bounds are ISO dates; the colon-delimited
/// filter syntax cannot carry time-of-day components, so a date expands to
/// the start or end of its day and both bounds stay inclusive.
fn parse_bound(input: &str, is_end: bool) -> Result<NaiveDateTime> {
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        let dt = if is_end {
            date.and_hms_opt(23, 59, 59)
        } else {
            date.and_hms_opt(0, 0, 0)
        };
        if let Some(dt) = dt {
            return Ok(dt);
        }
    }
    Err(DumpError::Usage(format!("Invalid date: {}", input)))
}

/// Split a comma-separated primary key list, rejecting empty entries.
pub fn parse_pk_list(input: &str) -> Result<Vec<String>> {
    let pks: Vec<String> = input
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if pks.is_empty() {
        return Err(DumpError::Usage(format!(
            "No primary key values in {:?}",
            input
        )));
    }
    Ok(pks)
}
