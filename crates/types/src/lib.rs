mod calendar;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use calendar::{CalendarError, CalendarSpec, CalendarWindow, Horizon, WeekInfo};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}
id_newtype!(SchoolId);
id_newtype!(ClassId);
id_newtype!(TrainerId);
id_newtype!(WorkshopId);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl Weekday {
    pub const ALL: [Weekday; 6] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Weekday> {
        Weekday::ALL.get(i).copied()
    }

    /// Sundays have no equivalent here; the horizon never contains them.
    pub fn from_chrono(d: chrono::Weekday) -> Option<Weekday> {
        Weekday::from_index(d.num_days_from_monday() as usize)
    }
}

/// Generic half-day band. Mapping to clock times is per school and belongs
/// to the output layer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    M1,
    M2,
    P,
}

impl Band {
    pub const ALL: [Band; 3] = [Band::M1, Band::M2, Band::P];

    pub fn is_morning(self) -> bool {
        matches!(self, Band::M1 | Band::M2)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DayPart {
    Morning,
    Afternoon,
}

impl DayPart {
    pub fn bands(self) -> &'static [Band] {
        match self {
            DayPart::Morning => &[Band::M1, Band::M2],
            DayPart::Afternoon => &[Band::P],
        }
    }

    pub fn contains(self, band: Band) -> bool {
        match self {
            DayPart::Morning => band.is_morning(),
            DayPart::Afternoon => band == Band::P,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TimePref {
    Morning,
    Afternoon,
    #[default]
    Either,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct School {
    pub id: SchoolId,
    pub name: String,
    /// Classes of this school may be scheduled on Saturday.
    #[serde(default)]
    pub saturday: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub school_id: SchoolId,
    /// School year, 3..=5.
    pub year: u8,
    #[serde(default)]
    pub priority: Priority,
    /// Partner class (same school) this class would like to be co-taught with.
    #[serde(default)]
    pub preferred_partner: Option<ClassId>,
}

/// A (weekday, band) cell of a trainer's whitelist.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct SlotRef {
    pub weekday: Weekday,
    pub band: Band,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trainer {
    pub id: TrainerId,
    pub name: String,
    /// Hour budget for the whole horizon; a co-taught meeting is charged once.
    pub total_hours: u32,
    /// Advisory mean weekly-hours target; deviations are penalized softly.
    #[serde(default)]
    pub weekly_hours: Option<f64>,
    #[serde(default)]
    pub morning_days: Vec<Weekday>,
    #[serde(default)]
    pub afternoon_days: Vec<Weekday>,
    /// When present, supersedes the weekday availability entirely.
    #[serde(default)]
    pub specific_slots: Option<Vec<SlotRef>>,
    #[serde(default)]
    pub excluded_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub saturday: bool,
    #[serde(default)]
    pub time_pref: TimePref,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workshop {
    pub id: WorkshopId,
    pub name: String,
    pub default_meetings: u32,
    pub hours_per_meeting: u32,
    /// Position in the preferred cross-workshop sequence, when the workshop
    /// participates in it.
    #[serde(default)]
    pub ordering_rank: Option<u32>,
    /// Run by an external partner; never scheduled here, only reserves weeks.
    #[serde(default)]
    pub external: bool,
    /// Must come strictly after every other covered workshop of the class.
    #[serde(default)]
    pub must_be_last: bool,
    /// Schools whose classes run one meeting of this workshop autonomously:
    /// one meeting fewer is emitted and a one-week gap is kept for it.
    #[serde(default)]
    pub autonomous_gap_schools: Vec<SchoolId>,
}

/// Typed form of the free-text enrollment detail note. Parsing the note is
/// the input layer's job; the solver only sees this.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeetingDetail {
    #[default]
    None,
    /// Every meeting of the enrollment restricted to one half of the day.
    HalfDay(DayPart),
    /// At least `count` meetings in the afternoon band, in non-consecutive
    /// weeks when flagged.
    AfternoonCount { count: u32, non_consecutive: bool },
    /// The class does fewer meetings than the workshop default.
    OnlyCount(u32),
}

/// Externally fixed meeting. The k-th pin binds the k-th meeting ordinal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pin {
    pub date: NaiveDate,
    /// Leave open to let the solver pick a band within the class domain.
    #[serde(default)]
    pub band: Option<Band>,
    #[serde(default)]
    pub trainer: Option<TrainerId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Enrollment {
    pub class_id: ClassId,
    pub workshop_id: WorkshopId,
    /// Overrides the workshop's default meeting count.
    #[serde(default)]
    pub meetings: Option<u32>,
    #[serde(default)]
    pub detail: MeetingDetail,
    #[serde(default)]
    pub pins: Vec<Pin>,
    /// Hard trainer assignment; leaves the trainer free when absent.
    #[serde(default)]
    pub trainer: Option<TrainerId>,
}

impl Enrollment {
    /// Number of meeting instances actually emitted: the workshop default,
    /// overridden per enrollment, minus the autonomous meeting for flagged
    /// (workshop, school) combinations.
    pub fn effective_meetings(&self, workshop: &Workshop, school: &SchoolId) -> u32 {
        let mut count = self.meetings.unwrap_or(workshop.default_meetings);
        if let MeetingDetail::OnlyCount(n) = self.detail {
            count = n;
        }
        if count > 1 && workshop.autonomous_gap_schools.contains(school) {
            count -= 1;
        }
        count
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DayBands {
    pub weekday: Weekday,
    pub bands: Vec<Band>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    Hard,
    Soft,
}

/// Which slots a class may use at all. Soft mode is accepted on input but
/// currently pruned like hard mode; production data marks every row hard.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SlotPolicy {
    pub class_id: ClassId,
    pub bands: Vec<Band>,
    pub weekdays: Vec<Weekday>,
    /// Per-day overrides, e.g. "Wednesday afternoon only".
    #[serde(default)]
    pub day_bands: Vec<DayBands>,
    #[serde(default)]
    pub mode: PolicyMode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlackoutDate {
    pub date: NaiveDate,
    /// Absent part blocks the whole day.
    #[serde(default)]
    pub part: Option<DayPart>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Blackout {
    pub class_id: ClassId,
    pub dates: Vec<BlackoutDate>,
}

/// Advisory continuity pairing from past editions; biases trainer candidate
/// order, never the objective.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContinuityPref {
    pub trainer_id: TrainerId,
    pub class_id: ClassId,
}

/// A week already consumed for a class by an external-partner workshop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExternalBusy {
    pub class_id: ClassId,
    pub week: u32,
}

/// Hard cross-workshop ordering: for every class enrolled in both, the last
/// meeting of `before` lands strictly before the first meeting of `after`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Precedence {
    pub before: WorkshopId,
    pub after: WorkshopId,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown soft weight name: {0}")]
pub struct UnknownWeight(pub String);

/// Soft-constraint weights. Bonus terms are subtracted, penalties added;
/// the defaults are the production values.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SoftWeights {
    pub group: i64,
    pub continuity: i64,
    pub pref_group: i64,
    pub year5: i64,
    pub seq_pref: i64,
    pub band_var: i64,
    pub load_bal: i64,
    pub weekly_hrs: i64,
    pub time_pref: i64,
    pub late_may: i64,
}

impl Default for SoftWeights {
    fn default() -> Self {
        SoftWeights {
            group: 20,
            continuity: 10,
            pref_group: 5,
            year5: 3,
            seq_pref: 2,
            band_var: 2,
            load_bal: 2,
            weekly_hrs: 3,
            time_pref: 1,
            late_may: 1,
        }
    }
}

impl SoftWeights {
    pub const NAMES: [&'static str; 10] = [
        "group",
        "continuity",
        "pref-group",
        "year5",
        "seq-pref",
        "band-var",
        "load-bal",
        "weekly-hrs",
        "time-pref",
        "late-may",
    ];

    pub fn zeroed() -> Self {
        SoftWeights {
            group: 0,
            continuity: 0,
            pref_group: 0,
            year5: 0,
            seq_pref: 0,
            band_var: 0,
            load_bal: 0,
            weekly_hrs: 0,
            time_pref: 0,
            late_may: 0,
        }
    }

    /// The recognized names are a closed set; anything else is an error.
    pub fn set(&mut self, name: &str, value: i64) -> Result<(), UnknownWeight> {
        match name {
            "group" => self.group = value,
            "continuity" => self.continuity = value,
            "pref-group" => self.pref_group = value,
            "year5" => self.year5 = value,
            "seq-pref" => self.seq_pref = value,
            "band-var" => self.band_var = value,
            "load-bal" => self.load_bal = value,
            "weekly-hrs" => self.weekly_hrs = value,
            "time-pref" => self.time_pref = value,
            "late-may" => self.late_may = value,
            other => return Err(UnknownWeight(other.to_string())),
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub soft_weights: SoftWeights,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub schools: Vec<School>,
    pub classes: Vec<Class>,
    pub trainers: Vec<Trainer>,
    pub workshops: Vec<Workshop>,
    pub enrollments: Vec<Enrollment>,
    #[serde(default)]
    pub slot_policies: Vec<SlotPolicy>,
    #[serde(default)]
    pub blackouts: Vec<Blackout>,
    #[serde(default)]
    pub continuity_prefs: Vec<ContinuityPref>,
    #[serde(default)]
    pub external_busy: Vec<ExternalBusy>,
    #[serde(default)]
    pub precedences: Vec<Precedence>,
    pub calendar: CalendarSpec,
    #[serde(default)]
    pub policy: Policy,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SolveParams {
    /// Wall-clock limit handed to backends that support one.
    pub time_limit_sec: u64,
    pub seed: u64,
    /// Solver worker threads; `None` picks min(available CPUs, 12).
    #[serde(default)]
    pub workers: Option<usize>,
}

impl Default for SolveParams {
    fn default() -> Self {
        SolveParams {
            time_limit_sec: 300,
            seed: 0,
            workers: None,
        }
    }
}

impl SolveParams {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            cpus.min(12)
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolveEnvelope {
    pub instance: Instance,
    #[serde(default)]
    pub params: SolveParams,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SolveStatus {
    /// Objective proven minimal.
    Optimal,
    /// Best known solution within the time limit, optimality not proven.
    Feasible,
    Infeasible,
    Timeout,
}

/// One scheduled meeting of the output calendar.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeetingRecord {
    pub class_id: ClassId,
    pub school_id: SchoolId,
    pub workshop_id: WorkshopId,
    /// 1-based meeting ordinal within the enrollment.
    pub ordinal: u32,
    pub trainer_id: TrainerId,
    pub week: u32,
    pub weekday: Weekday,
    pub band: Band,
    pub date: NaiveDate,
    #[serde(default)]
    pub co_taught_with: Vec<ClassId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainerHours {
    pub trainer_id: TrainerId,
    pub used: u32,
    pub budget: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolveReport {
    pub wall_seconds: f64,
    pub trainer_hours: Vec<TrainerHours>,
    /// Realized co-teaching pairs.
    pub groupings: u32,
    /// (class, workshop) enrollments fully scheduled.
    pub completions: u32,
    pub stats: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolveResult {
    pub status: SolveStatus,
    pub objective: f64,
    pub records: Vec<MeetingRecord>,
    pub report: SolveReport,
}
