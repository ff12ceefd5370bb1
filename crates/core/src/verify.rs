//! Hard-constraint verification of an extracted calendar. Re-parses the
//! records against the instance and reports every violated rule; a valid
//! solver output produces an empty list.

use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use types::{
    Band, Horizon, Instance, MeetingDetail, MeetingRecord, SlotPolicy, Trainer, Weekday,
};

#[derive(Clone, Debug, serde::Serialize)]
pub struct Violation {
    pub code: String,
    pub details: serde_json::Value,
}

fn violation(out: &mut Vec<Violation>, code: &str, details: serde_json::Value) {
    out.push(Violation {
        code: code.to_string(),
        details,
    });
}

fn trainer_allows(t: &Trainer, horizon: &Horizon, week: u32, day: Weekday, band: Band) -> bool {
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

pub fn check_hard(inst: &Instance, horizon: &Horizon, records: &[MeetingRecord]) -> Vec<Violation> {
    let mut out = Vec::new();

    let classes: HashMap<&str, &types::Class> =
        inst.classes.iter().map(|c| (c.id.0.as_str(), c)).collect();
    let schools: HashMap<&str, &types::School> =
        inst.schools.iter().map(|s| (s.id.0.as_str(), s)).collect();
    let trainers: HashMap<&str, &Trainer> =
        inst.trainers.iter().map(|t| (t.id.0.as_str(), t)).collect();
    let workshops: HashMap<&str, &types::Workshop> =
        inst.workshops.iter().map(|w| (w.id.0.as_str(), w)).collect();
    let policies: HashMap<&str, &SlotPolicy> = inst
        .slot_policies
        .iter()
        .map(|p| (p.class_id.0.as_str(), p))
        .collect();

    // Calendar placement and per-record slot legality.
    for r in records {
        if !horizon.allows(r.week as usize, r.weekday) {
            violation(
                &mut out,
                "horizon",
                json!({"class": r.class_id, "week": r.week, "weekday": r.weekday}),
            );
            continue;
        }
        if horizon.date_of(r.week as usize, r.weekday) != Some(r.date) {
            violation(
                &mut out,
                "date-mismatch",
                json!({"class": r.class_id, "week": r.week, "date": r.date}),
            );
        }

        let Some(class) = classes.get(r.class_id.0.as_str()) else {
            violation(&mut out, "unknown-class", json!({"class": r.class_id}));
            continue;
        };
        if r.weekday == Weekday::Sat {
            let school_ok = schools
                .get(class.school_id.0.as_str())
                .is_some_and(|s| s.saturday);
            if !school_ok {
                violation(
                    &mut out,
                    "saturday-school",
                    json!({"class": r.class_id, "week": r.week}),
                );
            }
        }
        match trainers.get(r.trainer_id.0.as_str()) {
            None => violation(&mut out, "unknown-trainer", json!({"trainer": r.trainer_id})),
            Some(t) => {
                if !trainer_allows(t, horizon, r.week, r.weekday, r.band) {
                    violation(
                        &mut out,
                        "trainer-slot",
                        json!({
                            "trainer": r.trainer_id,
                            "week": r.week,
                            "weekday": r.weekday,
                            "band": r.band,
                        }),
                    );
                }
            }
        }
        if !policy_allows(policies.get(r.class_id.0.as_str()).copied(), r.weekday, r.band) {
            violation(
                &mut out,
                "slot-policy",
                json!({"class": r.class_id, "weekday": r.weekday, "band": r.band}),
            );
        }
    }

    // Blackouts.
    for b in &inst.blackouts {
        for entry in &b.dates {
            for r in records {
                if r.class_id != b.class_id || r.date != entry.date {
                    continue;
                }
                let blocked = match entry.part {
                    None => true,
                    Some(part) => part.contains(r.band),
                };
                if blocked {
                    violation(
                        &mut out,
                        "blackout",
                        json!({"class": r.class_id, "date": r.date, "band": r.band}),
                    );
                }
            }
        }
    }

    // External reservations.
    for x in &inst.external_busy {
        for r in records {
            if r.class_id == x.class_id && r.week == x.week {
                violation(
                    &mut out,
                    "external-week",
                    json!({"class": r.class_id, "week": r.week}),
                );
            }
        }
    }

    // Per-enrollment bookkeeping: counts, ordinal sequence, pins, details.
    let mut by_enrollment: HashMap<(&str, &str), Vec<&MeetingRecord>> = HashMap::new();
    for r in records {
        by_enrollment
            .entry((r.class_id.0.as_str(), r.workshop_id.0.as_str()))
            .or_default()
            .push(r);
    }
    for e in &inst.enrollments {
        let Some(workshop) = workshops.get(e.workshop_id.0.as_str()) else {
            continue;
        };
        let Some(class) = classes.get(e.class_id.0.as_str()) else {
            continue;
        };
        if workshop.external {
            continue;
        }
        let expected = e.effective_meetings(workshop, &class.school_id);
        let mut recs = by_enrollment
            .remove(&(e.class_id.0.as_str(), e.workshop_id.0.as_str()))
            .unwrap_or_default();
        recs.sort_by_key(|r| r.ordinal);

        if recs.len() as u32 != expected {
            violation(
                &mut out,
                "meeting-count",
                json!({
                    "class": e.class_id,
                    "workshop": e.workshop_id,
                    "expected": expected,
                    "actual": recs.len(),
                }),
            );
        }
        for (i, r) in recs.iter().enumerate() {
            if r.ordinal != i as u32 + 1 {
                violation(
                    &mut out,
                    "ordinal-sequence",
                    json!({"class": e.class_id, "workshop": e.workshop_id, "ordinal": r.ordinal}),
                );
            }
        }
        for w in recs.windows(2) {
            if w[0].week >= w[1].week {
                violation(
                    &mut out,
                    "meeting-order",
                    json!({
                        "class": e.class_id,
                        "workshop": e.workshop_id,
                        "weeks": [w[0].week, w[1].week],
                    }),
                );
            }
        }

        for (pin, r) in e.pins.iter().zip(recs.iter()) {
            let mut ok = r.date == pin.date;
            if let Some(band) = pin.band {
                ok = ok && r.band == band;
            }
            if let Some(t) = &pin.trainer {
                ok = ok && r.trainer_id == *t;
            }
            if !ok {
                violation(
                    &mut out,
                    "pin",
                    json!({
                        "class": e.class_id,
                        "workshop": e.workshop_id,
                        "ordinal": r.ordinal,
                        "pinned_date": pin.date,
                        "date": r.date,
                    }),
                );
            }
        }

        match e.detail {
            MeetingDetail::HalfDay(part) => {
                for r in &recs {
                    if !part.contains(r.band) {
                        violation(
                            &mut out,
                            "half-day",
                            json!({"class": e.class_id, "workshop": e.workshop_id, "band": r.band}),
                        );
                    }
                }
            }
            MeetingDetail::AfternoonCount {
                count,
                non_consecutive,
            } => {
                let afternoons: Vec<&&MeetingRecord> =
                    recs.iter().filter(|r| r.band == Band::P).collect();
                if (afternoons.len() as u32) < count {
                    violation(
                        &mut out,
                        "afternoon-count",
                        json!({
                            "class": e.class_id,
                            "workshop": e.workshop_id,
                            "required": count,
                            "actual": afternoons.len(),
                        }),
                    );
                }
                if non_consecutive {
                    for (a, b) in afternoons.iter().zip(afternoons.iter().skip(1)) {
                        if b.week.saturating_sub(a.week) < 2 {
                            violation(
                                &mut out,
                                "afternoon-consecutive",
                                json!({
                                    "class": e.class_id,
                                    "workshop": e.workshop_id,
                                    "weeks": [a.week, b.week],
                                }),
                            );
                        }
                    }
                }
            }
            _ => {}
        }

        if !workshop.autonomous_gap_schools.is_empty()
            && workshop
                .autonomous_gap_schools
                .contains(&class.school_id)
            && recs.len() >= 3
            && recs[2].week < recs[1].week + 2
        {
            violation(
                &mut out,
                "autonomous-gap",
                json!({
                    "class": e.class_id,
                    "workshop": e.workshop_id,
                    "weeks": [recs[1].week, recs[2].week],
                }),
            );
        }
    }
    for ((class, workshop), _) in by_enrollment {
        violation(
            &mut out,
            "unknown-enrollment",
            json!({"class": class, "workshop": workshop}),
        );
    }

    // At most one meeting per class and week.
    let mut class_weeks: HashMap<(&str, u32), u32> = HashMap::new();
    for r in records {
        *class_weeks
            .entry((r.class_id.0.as_str(), r.week))
            .or_default() += 1;
    }
    for ((class, week), n) in class_weeks {
        if n > 1 {
            violation(
                &mut out,
                "class-week-overlap",
                json!({"class": class, "week": week, "meetings": n}),
            );
        }
    }

    // Trainer slot occupancy: one physical meeting, i.e. one record or a
    // mutually linked co-taught pair.
    let mut slot_records: BTreeMap<(&str, u32, Weekday, Band), Vec<&MeetingRecord>> =
        BTreeMap::new();
    for r in records {
        slot_records
            .entry((r.trainer_id.0.as_str(), r.week, r.weekday, r.band))
            .or_default()
            .push(r);
    }
    for ((trainer, week, weekday, band), rs) in &slot_records {
        let linked_pair = rs.len() == 2
            && rs[0].workshop_id == rs[1].workshop_id
            && rs[0].ordinal == rs[1].ordinal
            && rs[0].school_id == rs[1].school_id
            && rs[0].class_id != rs[1].class_id
            && rs[0].co_taught_with.contains(&rs[1].class_id)
            && rs[1].co_taught_with.contains(&rs[0].class_id);
        if rs.len() > 1 && !linked_pair {
            violation(
                &mut out,
                "slot-overlap",
                json!({
                    "trainer": trainer,
                    "week": week,
                    "weekday": weekday,
                    "band": band,
                    "classes": rs.iter().map(|r| &r.class_id).collect::<Vec<_>>(),
                }),
            );
        }
    }
    for r in records {
        if r.co_taught_with.len() > 1 {
            violation(
                &mut out,
                "group-cap",
                json!({"class": r.class_id, "partners": r.co_taught_with}),
            );
        }
        for partner in &r.co_taught_with {
            let linked = records.iter().any(|o| {
                o.class_id == *partner
                    && o.workshop_id == r.workshop_id
                    && o.ordinal == r.ordinal
                    && o.week == r.week
                    && o.weekday == r.weekday
                    && o.band == r.band
                    && o.trainer_id == r.trainer_id
                    && o.co_taught_with.contains(&r.class_id)
            });
            if !linked {
                violation(
                    &mut out,
                    "group-coupling",
                    json!({"class": r.class_id, "partner": partner, "workshop": r.workshop_id}),
                );
            }
        }
    }

    // Trainer budgets, charging each physical meeting once.
    let workshop_hours: HashMap<&str, u32> = inst
        .workshops
        .iter()
        .map(|w| (w.id.0.as_str(), w.hours_per_meeting))
        .collect();
    let mut used: HashMap<&str, u32> = HashMap::new();
    for ((trainer, ..), rs) in &slot_records {
        let hours = workshop_hours
            .get(rs[0].workshop_id.0.as_str())
            .copied()
            .unwrap_or(0);
        *used.entry(trainer).or_default() += hours;
    }
    for t in &inst.trainers {
        let u = used.get(t.id.0.as_str()).copied().unwrap_or(0);
        if u > t.total_hours {
            violation(
                &mut out,
                "budget",
                json!({"trainer": t.id, "used": u, "budget": t.total_hours}),
            );
        }
    }

    // Last workshop and precedence ordering, per class.
    let mut weeks_by_enrollment: HashMap<(&str, &str), (u32, u32)> = HashMap::new();
    for r in records {
        let e = weeks_by_enrollment
            .entry((r.class_id.0.as_str(), r.workshop_id.0.as_str()))
            .or_insert((r.week, r.week));
        e.0 = e.0.min(r.week);
        e.1 = e.1.max(r.week);
    }
    let class_ids: HashSet<&str> = records.iter().map(|r| r.class_id.0.as_str()).collect();
    for class in class_ids {
        for w in inst.workshops.iter().filter(|w| w.must_be_last) {
            let Some(&(last_first, _)) = weeks_by_enrollment.get(&(class, w.id.0.as_str())) else {
                continue;
            };
            let others_max = weeks_by_enrollment
                .iter()
                .filter(|((c, wk), _)| *c == class && *wk != w.id.0.as_str())
                .map(|(_, (_, max))| *max)
                .max();
            if let Some(m) = others_max {
                if last_first <= m {
                    violation(
                        &mut out,
                        "must-be-last",
                        json!({"class": class, "workshop": w.id, "week": last_first, "latest_other": m}),
                    );
                }
            }
        }
        for p in &inst.precedences {
            let before = weeks_by_enrollment.get(&(class, p.before.0.as_str()));
            let after = weeks_by_enrollment.get(&(class, p.after.0.as_str()));
            if let (Some(&(_, before_last)), Some(&(after_first, _))) = (before, after) {
                if before_last >= after_first {
                    violation(
                        &mut out,
                        "precedence",
                        json!({
                            "class": class,
                            "before": p.before,
                            "after": p.after,
                            "weeks": [before_last, after_first],
                        }),
                    );
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::*;

    fn date(y: i32, m: u32, d: u32) -> chrono::NaiveDate {
        chrono::NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn instance() -> Instance {
        Instance {
            schools: vec![School {
                id: "s1".into(),
                name: "Alpha".into(),
                saturday: false,
            }],
            classes: vec![Class {
                id: "c1".into(),
                name: "4A".into(),
                school_id: "s1".into(),
                year: 4,
                priority: Priority::Normal,
                preferred_partner: None,
            }],
            trainers: vec![Trainer {
                id: "t1".into(),
                name: "Anna".into(),
                total_hours: 4,
                weekly_hours: None,
                morning_days: vec![Weekday::Mon, Weekday::Tue],
                afternoon_days: vec![],
                specific_slots: None,
                excluded_dates: vec![],
                saturday: false,
                time_pref: TimePref::Either,
            }],
            workshops: vec![Workshop {
                id: "w1".into(),
                name: "Discovery".into(),
                default_meetings: 2,
                hours_per_meeting: 2,
                ordering_rank: None,
                external: false,
                must_be_last: false,
                autonomous_gap_schools: vec![],
            }],
            enrollments: vec![Enrollment {
                class_id: "c1".into(),
                workshop_id: "w1".into(),
                meetings: None,
                detail: MeetingDetail::None,
                pins: vec![],
                trainer: None,
            }],
            slot_policies: vec![],
            blackouts: vec![],
            continuity_prefs: vec![],
            external_busy: vec![],
            precedences: vec![],
            calendar: CalendarSpec {
                windows: vec![CalendarWindow {
                    start: date(2026, 1, 26),
                    end: date(2026, 2, 20),
                }],
            },
            policy: Default::default(),
        }
    }

    fn record(week: u32, weekday: Weekday, band: Band, ordinal: u32, h: &Horizon) -> MeetingRecord {
        MeetingRecord {
            class_id: "c1".into(),
            school_id: "s1".into(),
            workshop_id: "w1".into(),
            ordinal,
            trainer_id: "t1".into(),
            week,
            weekday,
            band,
            date: h.date_of(week as usize, weekday).unwrap(),
            co_taught_with: vec![],
        }
    }

    #[test]
    fn clean_calendar_has_no_violations() {
        let inst = instance();
        let h = Horizon::build(&inst.calendar).unwrap();
        let recs = vec![
            record(0, Weekday::Mon, Band::M1, 1, &h),
            record(1, Weekday::Tue, Band::M2, 2, &h),
        ];
        assert!(check_hard(&inst, &h, &recs).is_empty());
    }

    #[test]
    fn detects_missing_meeting_and_bad_slot() {
        let inst = instance();
        let h = Horizon::build(&inst.calendar).unwrap();
        // Only one of two meetings, on an afternoon the trainer cannot do.
        let recs = vec![record(0, Weekday::Mon, Band::P, 1, &h)];
        let v = check_hard(&inst, &h, &recs);
        let codes: Vec<&str> = v.iter().map(|x| x.code.as_str()).collect();
        assert!(codes.contains(&"meeting-count"));
        assert!(codes.contains(&"trainer-slot"));
    }

    #[test]
    fn detects_class_week_overlap_and_budget() {
        let mut inst = instance();
        inst.enrollments[0].meetings = Some(3);
        inst.trainers[0].total_hours = 4;
        let h = Horizon::build(&inst.calendar).unwrap();
        let recs = vec![
            record(0, Weekday::Mon, Band::M1, 1, &h),
            record(0, Weekday::Tue, Band::M1, 2, &h),
            record(1, Weekday::Mon, Band::M1, 3, &h),
        ];
        let v = check_hard(&inst, &h, &recs);
        let codes: Vec<&str> = v.iter().map(|x| x.code.as_str()).collect();
        assert!(codes.contains(&"class-week-overlap"));
        assert!(codes.contains(&"budget"));
        assert!(codes.contains(&"meeting-order"));
    }
}
