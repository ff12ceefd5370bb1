//! The scheduling horizon: two date windows separated by a holiday gap,
//! expanded into indexed weeks whose boundary weekday sets are truncated to
//! the window edges.

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::Weekday;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CalendarWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalendarSpec {
    pub windows: Vec<CalendarWindow>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("calendar has no scheduling windows")]
    NoWindows,
    #[error("window ends before it starts: {start} > {end}")]
    BadWindow { start: NaiveDate, end: NaiveDate },
    #[error("windows overlap or are out of order around {at}")]
    Overlap { at: NaiveDate },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeekInfo {
    pub monday: NaiveDate,
    /// Weekdays of this week inside the window. Mon..Sat; Sundays never appear.
    pub days: Vec<Weekday>,
}

/// Indexed week calendar derived from a [`CalendarSpec`].
#[derive(Clone, Debug)]
pub struct Horizon {
    weeks: Vec<WeekInfo>,
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Days::new(date.weekday().num_days_from_monday() as u64)
}

impl Horizon {
    pub fn build(spec: &CalendarSpec) -> Result<Horizon, CalendarError> {
        let mut weeks: Vec<WeekInfo> = Vec::new();

        for window in &spec.windows {
            if window.end < window.start {
                return Err(CalendarError::BadWindow {
                    start: window.start,
                    end: window.end,
                });
            }
            if let Some(last) = weeks.last() {
                if monday_of(window.start) <= last.monday {
                    return Err(CalendarError::Overlap { at: window.start });
                }
            }

            let mut monday = monday_of(window.start);
            while monday <= window.end {
                let days: Vec<Weekday> = Weekday::ALL
                    .iter()
                    .copied()
                    .filter(|d| {
                        let date = monday + Days::new(d.index() as u64);
                        date >= window.start && date <= window.end
                    })
                    .collect();
                if !days.is_empty() {
                    weeks.push(WeekInfo { monday, days });
                }
                monday = monday + Days::new(7);
            }
        }

        if weeks.is_empty() {
            return Err(CalendarError::NoWindows);
        }
        Ok(Horizon { weeks })
    }

    pub fn week_count(&self) -> usize {
        self.weeks.len()
    }

    pub fn weeks(&self) -> &[WeekInfo] {
        &self.weeks
    }

    pub fn days(&self, week: usize) -> &[Weekday] {
        self.weeks.get(week).map(|w| w.days.as_slice()).unwrap_or(&[])
    }

    pub fn allows(&self, week: usize, day: Weekday) -> bool {
        self.days(week).contains(&day)
    }

    pub fn date_of(&self, week: usize, day: Weekday) -> Option<NaiveDate> {
        self.weeks
            .get(week)
            .map(|w| w.monday + Days::new(day.index() as u64))
    }

    /// Maps an absolute date back to (week index, weekday). `None` for dates
    /// outside the horizon, in the holiday gap, or on a truncated weekday.
    pub fn locate(&self, date: NaiveDate) -> Option<(usize, Weekday)> {
        let day = Weekday::from_chrono(date.weekday())?;
        let monday = monday_of(date);
        let week = self.weeks.iter().position(|w| w.monday == monday)?;
        self.allows(week, day).then_some((week, day))
    }
}
