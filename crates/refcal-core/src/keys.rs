use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use time::{Date, Month, PrimitiveDateTime, Time};

/// Parse the timestamp forms found in use-after keys and dataset headers.
///
/// Accepts `YYYY-MM-DD`, optionally followed by `HH:MM[:SS[.fff]]` separated by a
/// space or `T`. `/` is accepted as a date separator.
#[must_use]
pub fn parse_timestamp(text: &str) -> Option<PrimitiveDateTime> {
    let normalized = text.trim().replace('T', " ").replace('/', "-");
    let mut parts = normalized.split_whitespace();
    let date = parse_date(parts.next()?)?;
    let time = match parts.next() {
        Some(clock) => parse_clock(clock)?,
        None => Time::MIDNIGHT,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(PrimitiveDateTime::new(date, time))
}

fn parse_date(text: &str) -> Option<Date> {
    let mut fields = text.split('-');
    let year = fields.next()?.parse::<i32>().ok()?;
    let month = fields.next()?.parse::<u8>().ok()?;
    let day = fields.next()?.parse::<u8>().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
}

fn parse_clock(text: &str) -> Option<Time> {
    let (clock, fraction) = match text.split_once('.') {
        Some((clock, fraction)) => (clock, Some(fraction)),
        None => (text, None),
    };
    let mut fields = clock.split(':');
    let hour = fields.next()?.parse::<u8>().ok()?;
    let minute = fields.next()?.parse::<u8>().ok()?;
    let second = match fields.next() {
        Some(second) => second.parse::<u8>().ok()?,
        None => 0,
    };
    if fields.next().is_some() {
        return None;
    }
    let nanos = match fraction {
        Some(digits) if !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()) => {
            let mut padded = digits.chars().take(9).collect::<String>();
            while padded.len() < 9 {
                padded.push('0');
            }
            padded.parse::<u32>().ok()?
        }
        Some(_) => return None,
        None => 0,
    };
    Time::from_hms_nano(hour, minute, second, nanos).ok()
}

/// Dotted numeric version, compared component-wise with missing components as zero.
#[derive(Debug, Clone, Eq)]
pub struct Version(Vec<u64>);

impl Version {
    /// Parse `4.2`, `v6.0.1`, or `11.3rc2` (trailing non-digits of a component are ignored).
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let text = text.strip_prefix(['v', 'V']).unwrap_or(text);
        if text.is_empty() {
            return None;
        }
        let mut components = Vec::new();
        for field in text.split('.') {
            let digits = field.chars().take_while(char::is_ascii_digit).collect::<String>();
            if digits.is_empty() {
                return None;
            }
            components.push(digits.parse::<u64>().ok()?);
        }
        Some(Self(components))
    }

    /// Rendering with trailing zero components dropped; equal versions share it.
    pub(crate) fn canonical(&self) -> String {
        let width = self.0.iter().rposition(|component| *component != 0).map_or(1, |last| last + 1);
        let parts = (0..width).map(|index| self.component(index).to_string()).collect::<Vec<_>>();
        parts.join(".")
    }

    fn component(&self, index: usize) -> u64 {
        self.0.get(index).copied().unwrap_or(0)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let width = self.0.len().max(other.0.len());
        (0..width)
            .map(|index| self.component(index).cmp(&other.component(index)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts = self.0.iter().map(u64::to_string).collect::<Vec<_>>();
        f.write_str(&parts.join("."))
    }
}
