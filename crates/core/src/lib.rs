pub mod scoring;
pub mod verify;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub use types::{
    Band, Blackout, CalendarSpec, Class, ClassId, DayPart, Enrollment, Horizon, Instance,
    MeetingRecord, Pin, School, SchoolId, SlotPolicy, SoftWeights, SolveEnvelope, SolveParams,
    SolveReport, SolveResult, SolveStatus, Trainer, TrainerId, Weekday, Workshop, WorkshopId,
};

/// Every structured failure the scheduler can surface. Pre-solve kinds carry
/// the offending entity so the caller can point the operator at a row.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("invalid instance: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Calendar(#[from] types::CalendarError),
    #[error("no admissible slot left for class {class}, workshop {workshop}: {reason}")]
    DomainEmpty {
        class: ClassId,
        workshop: WorkshopId,
        reason: String,
    },
    #[error("class {class} has two pinned meetings in week {week}")]
    PinConflict { class: ClassId, week: u32 },
    #[error(
        "trainer {trainer} needs at least {needed}h even with full co-teaching, budget is {budget}h"
    )]
    BudgetOver {
        trainer: TrainerId,
        needed: u32,
        budget: u32,
    },
    #[error("hard constraints admit no calendar")]
    Infeasible,
    #[error("time limit reached with no feasible calendar")]
    TimeoutNoFeasible,
}

/// Structural sanity of an instance: unique ids, resolvable cross-references,
/// value ranges, a buildable calendar. Domain-level feasibility (empty
/// admissible sets, pin collisions, budgets) is the preprocessor's job.
pub fn validate(inst: &Instance) -> Result<(), SchedError> {
    let mut errors: Vec<String> = Vec::new();

    let horizon = match Horizon::build(&inst.calendar) {
        Ok(h) => Some(h),
        Err(e) => {
            errors.push(e.to_string());
            None
        }
    };

    fn chk_unique<I: ToString>(name: &str, ids: impl Iterator<Item = I>, errors: &mut Vec<String>) {
        let mut seen = HashSet::new();
        for id in ids {
            let s = id.to_string();
            if !seen.insert(s.clone()) {
                errors.push(format!("duplicate {name} id: {s}"));
            }
        }
    }
    chk_unique("school", inst.schools.iter().map(|x| &x.id.0), &mut errors);
    chk_unique("class", inst.classes.iter().map(|x| &x.id.0), &mut errors);
    chk_unique("trainer", inst.trainers.iter().map(|x| &x.id.0), &mut errors);
    chk_unique(
        "workshop",
        inst.workshops.iter().map(|x| &x.id.0),
        &mut errors,
    );
    chk_unique(
        "enrollment",
        inst.enrollments
            .iter()
            .map(|e| format!("{}/{}", e.class_id, e.workshop_id)),
        &mut errors,
    );

    let schools: HashSet<_> = inst.schools.iter().map(|s| &s.id.0).collect();
    let classes: HashMap<_, _> = inst.classes.iter().map(|c| (&c.id.0, c)).collect();
    let trainers: HashSet<_> = inst.trainers.iter().map(|t| &t.id.0).collect();
    let workshops: HashMap<_, _> = inst.workshops.iter().map(|w| (&w.id.0, w)).collect();

    for c in &inst.classes {
        if !schools.contains(&c.school_id.0) {
            errors.push(format!(
                "class {} references missing school {}",
                c.id, c.school_id
            ));
        }
        if !(3..=5).contains(&c.year) {
            errors.push(format!("class {} has invalid year {}", c.id, c.year));
        }
        if let Some(p) = &c.preferred_partner {
            match classes.get(&p.0) {
                None => errors.push(format!(
                    "class {} prefers missing partner class {p}",
                    c.id
                )),
                Some(partner) => {
                    if partner.school_id != c.school_id {
                        errors.push(format!(
                            "class {} prefers partner {p} from another school",
                            c.id
                        ));
                    }
                    if p == &c.id {
                        errors.push(format!("class {} prefers itself as partner", c.id));
                    }
                }
            }
        }
    }

    let saturday_trainers: Vec<_> = inst.trainers.iter().filter(|t| t.saturday).collect();
    if saturday_trainers.len() > 1 {
        errors.push(format!(
            "more than one Saturday trainer: {}",
            saturday_trainers
                .iter()
                .map(|t| t.id.0.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    for t in &inst.trainers {
        if t.total_hours == 0 {
            errors.push(format!("trainer {} has a zero hour budget", t.id));
        }
        if let Some(w) = t.weekly_hours {
            if !(w > 0.0) {
                errors.push(format!("trainer {} has non-positive weekly target", t.id));
            }
        }
        if let Some(slots) = &t.specific_slots {
            if slots.is_empty() {
                errors.push(format!("trainer {} has an empty slot whitelist", t.id));
            }
        }
    }

    for w in &inst.workshops {
        if !w.external {
            if w.default_meetings == 0 {
                errors.push(format!("workshop {} has default_meetings=0", w.id));
            }
            if w.hours_per_meeting == 0 {
                errors.push(format!("workshop {} has hours_per_meeting=0", w.id));
            }
        }
        for s in &w.autonomous_gap_schools {
            if !schools.contains(&s.0) {
                errors.push(format!(
                    "workshop {} flags missing school {s} for the autonomous gap",
                    w.id
                ));
            }
        }
    }

    for e in &inst.enrollments {
        let class = classes.get(&e.class_id.0);
        if class.is_none() {
            errors.push(format!(
                "enrollment {}/{} references missing class",
                e.class_id, e.workshop_id
            ));
        }
        let workshop = workshops.get(&e.workshop_id.0);
        if workshop.is_none() {
            errors.push(format!(
                "enrollment {}/{} references missing workshop",
                e.class_id, e.workshop_id
            ));
        }
        if let Some(t) = &e.trainer {
            if !trainers.contains(&t.0) {
                errors.push(format!(
                    "enrollment {}/{} assigns missing trainer {t}",
                    e.class_id, e.workshop_id
                ));
            }
        }
        if matches!(e.meetings, Some(0)) || e.detail == types::MeetingDetail::OnlyCount(0) {
            errors.push(format!(
                "enrollment {}/{} asks for zero meetings",
                e.class_id, e.workshop_id
            ));
        }
        if let (Some(class), Some(workshop)) = (class, workshop) {
            if !workshop.external {
                let count = e.effective_meetings(workshop, &class.school_id);
                if (e.pins.len() as u32) > count {
                    errors.push(format!(
                        "enrollment {}/{} has {} pins for {} meetings",
                        e.class_id,
                        e.workshop_id,
                        e.pins.len(),
                        count
                    ));
                }
                if let types::MeetingDetail::AfternoonCount { count: n, .. } = e.detail {
                    if n > count {
                        errors.push(format!(
                            "enrollment {}/{} requires {n} afternoon meetings of {count}",
                            e.class_id, e.workshop_id
                        ));
                    }
                }
            }
        }
    }

    for p in &inst.slot_policies {
        if !classes.contains_key(&p.class_id.0) {
            errors.push(format!("slot policy references missing class {}", p.class_id));
        }
        if p.bands.is_empty() {
            errors.push(format!("slot policy for class {} allows no band", p.class_id));
        }
        if p.weekdays.is_empty() {
            errors.push(format!(
                "slot policy for class {} allows no weekday",
                p.class_id
            ));
        }
    }
    chk_unique(
        "slot policy class",
        inst.slot_policies.iter().map(|p| &p.class_id.0),
        &mut errors,
    );

    for b in &inst.blackouts {
        if !classes.contains_key(&b.class_id.0) {
            errors.push(format!("blackout references missing class {}", b.class_id));
        }
    }
    for p in &inst.continuity_prefs {
        if !classes.contains_key(&p.class_id.0) {
            errors.push(format!(
                "continuity preference references missing class {}",
                p.class_id
            ));
        }
        if !trainers.contains(&p.trainer_id.0) {
            errors.push(format!(
                "continuity preference references missing trainer {}",
                p.trainer_id
            ));
        }
    }
    for x in &inst.external_busy {
        if !classes.contains_key(&x.class_id.0) {
            errors.push(format!(
                "external reservation references missing class {}",
                x.class_id
            ));
        }
        if let Some(h) = &horizon {
            if x.week as usize >= h.week_count() {
                errors.push(format!(
                    "external reservation for class {} is outside the horizon (week {})",
                    x.class_id, x.week
                ));
            }
        }
    }
    for p in &inst.precedences {
        for id in [&p.before, &p.after] {
            if !workshops.contains_key(&id.0) {
                errors.push(format!("precedence references missing workshop {id}"));
            }
        }
        if p.before == p.after {
            errors.push(format!("workshop {} precedes itself", p.before));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SchedError::InvalidInput(errors.join("; ")))
    }
}

#[async_trait]
pub trait Solver: Send + Sync + 'static {
    async fn solve(&self, env: SolveEnvelope) -> anyhow::Result<SolveResult>;
}
