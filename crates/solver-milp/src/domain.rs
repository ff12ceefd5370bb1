//! Domain reduction ahead of variable creation. Computes, for every meeting
//! instance, the admissible (week, weekday, band, trainer) candidates by
//! intersecting the calendar, class slot policies, blackouts, external
//! reservations, pins and trainer availability, and discovers the compatible
//! co-teaching pairs. Pure transformation: no variables, no constraints.

use std::collections::{BTreeSet, HashMap, HashSet};

use lab_core::SchedError;
use types::{
    Band, ClassId, DayPart, Horizon, Instance, MeetingDetail, SlotPolicy, Trainer, Weekday,
};

/// One admissible calendar cell.
pub(crate) type Slot = (u32, Weekday, Band);

/// A (slot, trainer index) candidate for one meeting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Cand {
    pub slot: Slot,
    pub trainer: usize,
}

#[derive(Clone, Debug)]
pub(crate) struct Meeting {
    pub enrollment: usize,
    pub class: usize,
    pub workshop: usize,
    /// 1-based ordinal within the enrollment.
    pub ordinal: u32,
    pub hours: u32,
    pub cands: Vec<Cand>,
}

#[derive(Clone, Debug)]
pub(crate) struct EnrollmentInfo {
    /// Index into `inst.enrollments`.
    pub source: usize,
    pub class: usize,
    pub workshop: usize,
    pub count: u32,
    /// Indices into `Prep::meetings`, ordinal order.
    pub meetings: Vec<usize>,
}

/// Candidate co-teaching pair; `e1`'s class id sorts before `e2`'s.
#[derive(Clone, Debug)]
pub(crate) struct GroupPair {
    pub e1: usize,
    pub e2: usize,
    /// Ordinals that would be co-taught: 1..=shared.
    pub shared: u32,
    pub preferred: bool,
}

#[derive(Debug)]
pub(crate) struct Prep<'a> {
    pub inst: &'a Instance,
    pub horizon: &'a Horizon,
    pub enrollments: Vec<EnrollmentInfo>,
    pub meetings: Vec<Meeting>,
    pub pairs: Vec<GroupPair>,
    /// Candidate cells before trainer filtering, for reduction stats.
    pub raw_cells: usize,
}

pub(crate) fn trainer_allows(
    t: &Trainer,
    horizon: &Horizon,
    week: u32,
    day: Weekday,
    band: Band,
) -> bool {
    if day == Weekday::Sat && !t.saturday {
        return false;
    }
    if let Some(date) = horizon.date_of(week as usize, day) {
        if t.excluded_dates.contains(&date) {
            return false;
        }
    }
    if let Some(slots) = &t.specific_slots {
        return slots.iter().any(|s| s.weekday == day && s.band == band);
    }
    if band.is_morning() {
        t.morning_days.contains(&day) || (day == Weekday::Sat && t.saturday)
    } else {
        t.afternoon_days.contains(&day) || (day == Weekday::Sat && t.saturday)
    }
}

fn policy_allows(policy: Option<&SlotPolicy>, day: Weekday, band: Band) -> bool {
    let Some(p) = policy else { return true };
    if !p.weekdays.contains(&day) || !p.bands.contains(&band) {
        return false;
    }
    if let Some(db) = p.day_bands.iter().find(|db| db.weekday == day) {
        return db.bands.contains(&band);
    }
    true
}

/// Admissible slots of one class, before per-enrollment restrictions.
fn class_slots(
    inst: &Instance,
    horizon: &Horizon,
    class_idx: usize,
    school_saturday: bool,
) -> Vec<Slot> {
    let class = &inst.classes[class_idx];
    let policy = inst
        .slot_policies
        .iter()
        .find(|p| p.class_id == class.id);
    let blackout = inst.blackouts.iter().find(|b| b.class_id == class.id);
    let busy_weeks: HashSet<u32> = inst
        .external_busy
        .iter()
        .filter(|x| x.class_id == class.id)
        .map(|x| x.week)
        .collect();

    let mut slots = Vec::new();
    for week in 0..horizon.week_count() as u32 {
        if busy_weeks.contains(&week) {
            continue;
        }
        for &day in horizon.days(week as usize) {
            if day == Weekday::Sat && !school_saturday {
                continue;
            }
            let date = horizon.date_of(week as usize, day);
            for band in Band::ALL {
                if !policy_allows(policy, day, band) {
                    continue;
                }
                let blocked = blackout.is_some_and(|b| {
                    b.dates.iter().any(|entry| {
                        Some(entry.date) == date
                            && entry.part.map_or(true, |part| part.contains(band))
                    })
                });
                if blocked {
                    continue;
                }
                slots.push((week, day, band));
            }
        }
    }
    slots
}

pub(crate) fn build_prep<'a>(
    inst: &'a Instance,
    horizon: &'a Horizon,
) -> Result<Prep<'a>, SchedError> {
    let class_index: HashMap<&str, usize> = inst
        .classes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.0.as_str(), i))
        .collect();
    let workshop_index: HashMap<&str, usize> = inst
        .workshops
        .iter()
        .enumerate()
        .map(|(i, w)| (w.id.0.as_str(), i))
        .collect();
    let trainer_index: HashMap<&str, usize> = inst
        .trainers
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.0.as_str(), i))
        .collect();
    let school_saturday: HashMap<&str, bool> = inst
        .schools
        .iter()
        .map(|s| (s.id.0.as_str(), s.saturday))
        .collect();
    let preferred_trainer: HashMap<usize, usize> = inst
        .continuity_prefs
        .iter()
        .filter_map(|p| {
            let c = class_index.get(p.class_id.0.as_str())?;
            let t = trainer_index.get(p.trainer_id.0.as_str())?;
            Some((*c, *t))
        })
        .collect();

    let mut slots_by_class: HashMap<usize, Vec<Slot>> = HashMap::new();
    let mut raw_cells = 0usize;

    let mut enrollments: Vec<EnrollmentInfo> = Vec::new();
    let mut meetings: Vec<Meeting> = Vec::new();

    for (source, e) in inst.enrollments.iter().enumerate() {
        let class = class_index[e.class_id.0.as_str()];
        let workshop_idx = workshop_index[e.workshop_id.0.as_str()];
        let workshop = &inst.workshops[workshop_idx];
        if workshop.external {
            continue;
        }
        let school_id = &inst.classes[class].school_id;
        let count = e.effective_meetings(workshop, school_id);

        let base_slots = slots_by_class.entry(class).or_insert_with(|| {
            let sat = school_saturday
                .get(school_id.0.as_str())
                .copied()
                .unwrap_or(false);
            class_slots(inst, horizon, class, sat)
        });
        raw_cells += base_slots.len();

        // Eligible trainers, continuity-preferred first for stable
        // declaration order.
        let mut eligible: Vec<usize> = match &e.trainer {
            Some(t) => vec![trainer_index[t.0.as_str()]],
            None => {
                let mut all: Vec<usize> = (0..inst.trainers.len()).collect();
                if let Some(&pref) = preferred_trainer.get(&class) {
                    all.sort_by_key(|&t| (t != pref, inst.trainers[t].id.clone()));
                }
                all
            }
        };

        let band_filter: Option<DayPart> = match e.detail {
            MeetingDetail::HalfDay(part) => Some(part),
            _ => None,
        };

        let mut meeting_ids = Vec::new();
        for ordinal in 1..=count {
            let mut slots: Vec<Slot> = base_slots
                .iter()
                .copied()
                .filter(|&(_, _, band)| band_filter.map_or(true, |p| p.contains(band)))
                .collect();

            if let Some(pin) = e.pins.get(ordinal as usize - 1) {
                let Some((week, day)) = horizon.locate(pin.date) else {
                    return Err(SchedError::DomainEmpty {
                        class: e.class_id.clone(),
                        workshop: e.workshop_id.clone(),
                        reason: format!("pinned date {} is outside the horizon", pin.date),
                    });
                };
                slots.retain(|&(w, d, b)| {
                    w == week as u32 && d == day && pin.band.map_or(true, |pb| pb == b)
                });
                if let Some(t) = &pin.trainer {
                    let idx = trainer_index.get(t.0.as_str()).copied();
                    eligible.retain(|&ti| Some(ti) == idx);
                }
            }

            let cands: Vec<Cand> = slots
                .iter()
                .flat_map(|&(week, day, band)| {
                    eligible.iter().filter_map(move |&trainer| {
                        trainer_allows(&inst.trainers[trainer], horizon, week, day, band)
                            .then_some(Cand {
                                slot: (week, day, band),
                                trainer,
                            })
                    })
                })
                .collect();

            if cands.is_empty() {
                return Err(SchedError::DomainEmpty {
                    class: e.class_id.clone(),
                    workshop: e.workshop_id.clone(),
                    reason: format!("meeting {ordinal} has no admissible slot"),
                });
            }
            meeting_ids.push(meetings.len());
            meetings.push(Meeting {
                enrollment: enrollments.len(),
                class,
                workshop: workshop_idx,
                ordinal,
                hours: workshop.hours_per_meeting,
                cands,
            });
        }

        // Enough distinct weeks for one meeting per week.
        let weeks: BTreeSet<u32> = meeting_ids
            .iter()
            .flat_map(|&m| meetings[m].cands.iter().map(|c| c.slot.0))
            .collect();
        if (weeks.len() as u32) < count {
            return Err(SchedError::DomainEmpty {
                class: e.class_id.clone(),
                workshop: e.workshop_id.clone(),
                reason: format!(
                    "{count} meetings but only {} admissible weeks",
                    weeks.len()
                ),
            });
        }

        enrollments.push(EnrollmentInfo {
            source,
            class,
            workshop: workshop_idx,
            count,
            meetings: meeting_ids,
        });
    }

    // Two pins of one class in the same week can never satisfy the
    // one-meeting-per-week rule; report instead of letting the solver fail.
    let mut pinned_weeks: HashMap<usize, HashSet<u32>> = HashMap::new();
    for info in &enrollments {
        let e = &inst.enrollments[info.source];
        for pin in &e.pins {
            if let Some((week, _)) = horizon.locate(pin.date) {
                if !pinned_weeks.entry(info.class).or_default().insert(week as u32) {
                    return Err(SchedError::PinConflict {
                        class: inst.classes[info.class].id.clone(),
                        week: week as u32,
                    });
                }
            }
        }
    }

    let pairs = discover_pairs(inst, &enrollments, &meetings);
    check_budget_floor(inst, &enrollments, &meetings)?;

    Ok(Prep {
        inst,
        horizon,
        enrollments,
        meetings,
        pairs,
        raw_cells,
    })
}

/// Enrollment pairs that could be co-taught: same school, same workshop,
/// distinct classes, compatible trainer assignments, and for every shared
/// ordinal a non-empty candidate intersection.
fn discover_pairs(
    inst: &Instance,
    enrollments: &[EnrollmentInfo],
    meetings: &[Meeting],
) -> Vec<GroupPair> {
    let preferred: HashSet<(&ClassId, &ClassId)> = inst
        .classes
        .iter()
        .filter_map(|c| c.preferred_partner.as_ref().map(|p| (&c.id, p)))
        .collect();

    let mut pairs = Vec::new();
    for i in 0..enrollments.len() {
        for j in (i + 1)..enrollments.len() {
            let (a, b) = (&enrollments[i], &enrollments[j]);
            if a.workshop != b.workshop || a.class == b.class {
                continue;
            }
            let (ca, cb) = (&inst.classes[a.class], &inst.classes[b.class]);
            if ca.school_id != cb.school_id {
                continue;
            }
            let (e1, e2) = if ca.id <= cb.id { (i, j) } else { (j, i) };
            let shared = a.count.min(b.count);

            let compatible = (0..shared as usize).all(|k| {
                let m1 = &meetings[enrollments[e1].meetings[k]];
                let m2 = &meetings[enrollments[e2].meetings[k]];
                let set: BTreeSet<Cand> = m1.cands.iter().copied().collect();
                m2.cands.iter().any(|c| set.contains(c))
            });
            if !compatible {
                continue;
            }

            let (id1, id2) = (
                &inst.classes[enrollments[e1].class].id,
                &inst.classes[enrollments[e2].class].id,
            );
            pairs.push(GroupPair {
                e1,
                e2,
                shared,
                preferred: preferred.contains(&(id1, id2)) || preferred.contains(&(id2, id1)),
            });
        }
    }
    pairs
}

/// Lower bound on each trainer's charged hours assuming every possible
/// co-teaching happens: meetings hard-bound to the trainer, bucketed by
/// (school, workshop, ordinal), with each bucket pairing off two by two.
fn check_budget_floor(
    inst: &Instance,
    enrollments: &[EnrollmentInfo],
    meetings: &[Meeting],
) -> Result<(), SchedError> {
    for (t_idx, trainer) in inst.trainers.iter().enumerate() {
        let mut buckets: HashMap<(usize, usize, u32), (u32, u32)> = HashMap::new();
        for m in meetings {
            if !(m.cands.iter().all(|c| c.trainer == t_idx)) {
                continue;
            }
            let school = &inst.classes[enrollments[m.enrollment].class].school_id;
            let school_idx = inst
                .schools
                .iter()
                .position(|s| &s.id == school)
                .unwrap_or(usize::MAX);
            let entry = buckets
                .entry((school_idx, m.workshop, m.ordinal))
                .or_insert((0, m.hours));
            entry.0 += 1;
        }
        let needed: u32 = buckets
            .values()
            .map(|&(n, hours)| n.div_ceil(2) * hours)
            .sum();
        if needed > trainer.total_hours {
            return Err(SchedError::BudgetOver {
                trainer: trainer.id.clone(),
                needed,
                budget: trainer.total_hours,
            });
        }
    }
    Ok(())
}
