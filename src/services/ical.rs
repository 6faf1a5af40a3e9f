//! Translation between appointments and iCalendar VEVENT payloads.
//!
//! All times leaving or entering this module are UTC.

use chrono::{Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use icalendar::{
    parser::{read_calendar, unfold, Property},
    Calendar, CalendarDateTime, Component, DatePerhapsTime, EventLike,
};

use crate::db::models::AppointmentExport;
use crate::error::{SyncError, SyncResult};

pub const PRODID: &str = "-//calendar-sync//EN";
pub const UNTITLED_EVENT: &str = "Untitled Event";

const ICAL_UTC_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// A remote event reduced to the fields the sync engine cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub uid: String,
    pub summary: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub description: String,
    pub location: String,
    /// Set when `end <= start`; the orchestrator decides what to do with it.
    pub invalid_range: bool,
}

/// Resource name an appointment is stored under in a remote calendar.
pub fn event_filename(appointment_id: &str) -> String {
    format!("{}.ics", appointment_id)
}

pub fn event_summary(appointment: &AppointmentExport) -> String {
    format!(
        "{} - {} {}",
        appointment.service_name, appointment.client_first_name, appointment.client_last_name
    )
}

/// Render an appointment as a VCALENDAR with a single VEVENT.
///
/// `uid` is the appointment id for events created by export, or the remote
/// UID an appointment was mapped onto.
pub fn to_remote_event(appointment: &AppointmentExport, uid: &str) -> String {
    let mut cal = Calendar::new();

    let mut event = icalendar::Event::new();
    event.uid(uid);
    event.summary(&event_summary(appointment));
    event.add_property("DTSTAMP", Utc::now().format(ICAL_UTC_FORMAT).to_string());
    event.add_property(
        "DTSTART",
        appointment.start_time.format(ICAL_UTC_FORMAT).to_string(),
    );
    event.add_property(
        "DTEND",
        appointment.end_time.format(ICAL_UTC_FORMAT).to_string(),
    );
    event.description(appointment.notes.as_deref().unwrap_or(""));
    event.location(appointment.branch_name.as_deref().unwrap_or(""));

    cal.push(event.done());
    let rendered = cal.done().to_string();

    let mut output = String::with_capacity(rendered.len());
    for line in rendered.lines() {
        if line.starts_with("PRODID:") {
            output.push_str("PRODID:");
            output.push_str(PRODID);
        } else {
            output.push_str(line);
        }
        output.push_str("\r\n");
    }
    output
}

/// Parse the first VEVENT of an iCalendar object.
pub fn from_remote_event(ics: &str) -> SyncResult<RemoteEvent> {
    let unfolded = unfold(ics);
    let calendar = read_calendar(&unfolded)
        .map_err(|e| SyncError::Protocol(format!("unparsable iCalendar data: {}", e)))?;

    let vevent = calendar
        .components
        .iter()
        .find(|c| c.name == "VEVENT")
        .ok_or_else(|| SyncError::Protocol("no VEVENT in calendar object".to_string()))?;

    let uid = vevent
        .find_prop("UID")
        .map(|p| p.val.to_string())
        .filter(|uid| !uid.trim().is_empty())
        .ok_or_else(|| SyncError::Protocol("event has no UID".to_string()))?;

    let dtstart = vevent
        .find_prop("DTSTART")
        .ok_or_else(|| SyncError::Protocol(format!("event {} has no DTSTART", uid)))?;
    let (start, all_day) = parse_time(dtstart)
        .ok_or_else(|| SyncError::Protocol(format!("event {} has an invalid DTSTART", uid)))?;

    let end = match vevent.find_prop("DTEND") {
        Some(prop) => {
            parse_time(prop)
                .ok_or_else(|| {
                    SyncError::Protocol(format!("event {} has an invalid DTEND", uid))
                })?
                .0
        }
        None => match vevent.find_prop("DURATION") {
            Some(prop) => parse_duration(prop.val.as_ref())
                .and_then(|duration| start.checked_add_signed(duration))
                .ok_or_else(|| {
                    SyncError::Protocol(format!("event {} has an invalid DURATION", uid))
                })?,
            None if all_day => start
                .checked_add_signed(Duration::days(1))
                .ok_or_else(|| {
                    SyncError::Protocol(format!("event {} has an invalid DTSTART", uid))
                })?,
            None => start,
        },
    };

    let text = |name: &str| vevent.find_prop(name).map(|p| unescape_text(p.val.as_ref()));

    Ok(RemoteEvent {
        uid,
        summary: text("SUMMARY")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNTITLED_EVENT.to_string()),
        start,
        end,
        description: text("DESCRIPTION").unwrap_or_default(),
        location: text("LOCATION").unwrap_or_default(),
        invalid_range: end <= start,
    })
}

/// Resolve a DTSTART/DTEND property to UTC. The flag is true for `VALUE=DATE`.
fn parse_time(prop: &Property) -> Option<(NaiveDateTime, bool)> {
    match DatePerhapsTime::try_from(prop).ok()? {
        DatePerhapsTime::Date(date) => Some((midnight(date), true)),
        DatePerhapsTime::DateTime(dt) => Some((calendar_datetime_to_utc(dt), false)),
    }
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}

/// Floating times and unknown zones are read as UTC.
fn calendar_datetime_to_utc(dt: CalendarDateTime) -> NaiveDateTime {
    match dt {
        CalendarDateTime::Utc(utc) => utc.naive_utc(),
        CalendarDateTime::Floating(naive) => naive,
        CalendarDateTime::WithTimezone { date_time, tzid } => {
            match tzid.parse::<chrono_tz::Tz>() {
                Ok(tz) => tz
                    .from_local_datetime(&date_time)
                    .earliest()
                    .map(|local| local.with_timezone(&Utc).naive_utc())
                    .unwrap_or(date_time),
                Err(_) => {
                    tracing::debug!("Unknown TZID {}, treating time as UTC", tzid);
                    date_time
                }
            }
        }
    }
}

/// Parse an RFC 5545 DURATION such as `PT1H30M`, `P1D` or `-P2W`.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (negative, rest) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };

    let parsed: std::time::Duration = iso8601::duration(rest).ok()?.into();
    let duration = Duration::from_std(parsed).ok()?;
    Some(if negative { -duration } else { duration })
}

/// Undo TEXT escaping (`\n`, `\,`, `\;`, `\\`).
fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
