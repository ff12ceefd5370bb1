//! Soft-score recomputation over an extracted calendar. Mirrors the solver's
//! objective term by term, so a reported objective can be re-derived from the
//! records alone.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use types::{Band, ClassId, Horizon, Instance, MeetingRecord, TimePref, TrainerId, WorkshopId};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scores {
    /// Realized co-teaching pairs (one per class pair and workshop).
    pub groupings: i64,
    /// Realized pairs between preferred partner classes.
    pub preferred_groupings: i64,
    /// Per class: distinct trainers used minus one.
    pub continuity_breaks: i64,
    /// Week indices summed over meetings of year-5 classes.
    pub year5_week_sum: i64,
    /// Classes whose ranked workshops run in rank order.
    pub sequence_classes: i64,
    /// (class, consecutive-week) pairs sharing a band.
    pub band_repeats: i64,
    /// Per trainer: pairwise weekly-load differences summed.
    pub load_spread: i64,
    /// Per trainer with a weekly target: summed |weekly load - target|.
    pub weekly_deviation: f64,
    /// Meetings whose band goes against the trainer's preference.
    pub time_pref_misses: i64,
    /// Week indices summed over meetings in the last two horizon weeks.
    pub late_week_sum: i64,
    pub objective: f64,
}

pub fn compute_soft_scores(
    inst: &Instance,
    horizon: &Horizon,
    records: &[MeetingRecord],
) -> Scores {
    let class_year: HashMap<&str, u8> = inst
        .classes
        .iter()
        .map(|c| (c.id.0.as_str(), c.year))
        .collect();
    let partner_of: HashMap<&str, &ClassId> = inst
        .classes
        .iter()
        .filter_map(|c| c.preferred_partner.as_ref().map(|p| (c.id.0.as_str(), p)))
        .collect();
    let workshop_rank: HashMap<&str, u32> = inst
        .workshops
        .iter()
        .filter_map(|w| w.ordering_rank.map(|r| (w.id.0.as_str(), r)))
        .collect();
    let workshop_hours: HashMap<&str, u32> = inst
        .workshops
        .iter()
        .map(|w| (w.id.0.as_str(), w.hours_per_meeting))
        .collect();
    let trainer_pref: HashMap<&str, TimePref> = inst
        .trainers
        .iter()
        .map(|t| (t.id.0.as_str(), t.time_pref))
        .collect();

    let mut s = Scores::default();
    let week_count = horizon.week_count() as u32;

    // Realized pairs, one entry per (class pair, workshop).
    let mut pairs: BTreeSet<(ClassId, ClassId, WorkshopId)> = BTreeSet::new();
    for r in records {
        for other in &r.co_taught_with {
            let (a, b) = if r.class_id <= *other {
                (r.class_id.clone(), other.clone())
            } else {
                (other.clone(), r.class_id.clone())
            };
            pairs.insert((a, b, r.workshop_id.clone()));
        }
    }
    s.groupings = pairs.len() as i64;
    for (a, b, _) in &pairs {
        let preferred = partner_of.get(a.0.as_str()).is_some_and(|p| *p == b)
            || partner_of.get(b.0.as_str()).is_some_and(|p| *p == a);
        if preferred {
            s.preferred_groupings += 1;
        }
    }

    // Trainer continuity per class.
    let mut trainers_by_class: HashMap<&str, HashSet<&str>> = HashMap::new();
    for r in records {
        trainers_by_class
            .entry(r.class_id.0.as_str())
            .or_default()
            .insert(r.trainer_id.0.as_str());
    }
    for used in trainers_by_class.values() {
        s.continuity_breaks += used.len() as i64 - 1;
    }

    // Week-position terms.
    for r in records {
        if class_year.get(r.class_id.0.as_str()) == Some(&5) {
            s.year5_week_sum += r.week as i64;
        }
        if week_count >= 2 && r.week >= week_count - 2 {
            s.late_week_sum += r.week as i64;
        }
        let pref = trainer_pref
            .get(r.trainer_id.0.as_str())
            .copied()
            .unwrap_or_default();
        let miss = match pref {
            TimePref::Morning => r.band == Band::P,
            TimePref::Afternoon => r.band.is_morning(),
            TimePref::Either => false,
        };
        if miss {
            s.time_pref_misses += 1;
        }
    }

    // Preferred cross-workshop sequence, whole-class indicator.
    let mut weeks_by_enrollment: HashMap<(&str, &str), (u32, u32)> = HashMap::new();
    for r in records {
        let key = (r.class_id.0.as_str(), r.workshop_id.0.as_str());
        let e = weeks_by_enrollment.entry(key).or_insert((r.week, r.week));
        e.0 = e.0.min(r.week);
        e.1 = e.1.max(r.week);
    }
    let mut ranked_by_class: HashMap<&str, Vec<(u32, u32, u32)>> = HashMap::new();
    for ((class, workshop), (first, last)) in &weeks_by_enrollment {
        if let Some(rank) = workshop_rank.get(workshop) {
            ranked_by_class
                .entry(class)
                .or_default()
                .push((*rank, *first, *last));
        }
    }
    for ranked in ranked_by_class.values_mut() {
        if ranked.len() < 2 {
            continue;
        }
        ranked.sort_by_key(|(rank, ..)| *rank);
        let in_order = ranked
            .windows(2)
            .all(|w| w[0].2 < w[1].1);
        if in_order {
            s.sequence_classes += 1;
        }
    }

    // Band variation between consecutive class weeks.
    let mut band_by_class_week: HashMap<&str, BTreeMap<u32, Band>> = HashMap::new();
    for r in records {
        band_by_class_week
            .entry(r.class_id.0.as_str())
            .or_default()
            .insert(r.week, r.band);
    }
    for weeks in band_by_class_week.values() {
        for (week, band) in weeks {
            if weeks.get(&(week + 1)) == Some(band) {
                s.band_repeats += 1;
            }
        }
    }

    // Weekly loads, charging a co-taught meeting once.
    let mut physical: HashMap<(&str, u32, types::Weekday, Band), u32> = HashMap::new();
    for r in records {
        let hours = workshop_hours
            .get(r.workshop_id.0.as_str())
            .copied()
            .unwrap_or(0);
        physical.insert((r.trainer_id.0.as_str(), r.week, r.weekday, r.band), hours);
    }
    let mut loads: HashMap<&str, Vec<i64>> = HashMap::new();
    for t in &inst.trainers {
        loads.insert(t.id.0.as_str(), vec![0; horizon.week_count()]);
    }
    for ((trainer, week, _, _), hours) in &physical {
        if let Some(l) = loads.get_mut(trainer) {
            l[*week as usize] += *hours as i64;
        }
    }
    for t in &inst.trainers {
        let l = &loads[t.id.0.as_str()];
        for i in 0..l.len() {
            for j in (i + 1)..l.len() {
                s.load_spread += (l[i] - l[j]).abs();
            }
        }
        if let Some(target) = t.weekly_hours {
            for &week_load in l {
                s.weekly_deviation += (week_load as f64 - target).abs();
            }
        }
    }

    let w = &inst.policy.soft_weights;
    s.objective = -(w.group as f64) * s.groupings as f64
        + w.continuity as f64 * s.continuity_breaks as f64
        - w.pref_group as f64 * s.preferred_groupings as f64
        + w.year5 as f64 * s.year5_week_sum as f64
        - w.seq_pref as f64 * s.sequence_classes as f64
        + w.band_var as f64 * s.band_repeats as f64
        + w.load_bal as f64 * s.load_spread as f64
        + w.weekly_hrs as f64 * s.weekly_deviation
        + w.time_pref as f64 * s.time_pref_misses as f64
        + w.late_may as f64 * s.late_week_sum as f64;
    s
}

/// Per-trainer hours actually charged (co-taught meetings once).
pub fn trainer_hours_used(inst: &Instance, records: &[MeetingRecord]) -> Vec<(TrainerId, u32)> {
    let workshop_hours: HashMap<&str, u32> = inst
        .workshops
        .iter()
        .map(|w| (w.id.0.as_str(), w.hours_per_meeting))
        .collect();
    let mut physical: HashMap<(&str, u32, types::Weekday, Band), u32> = HashMap::new();
    for r in records {
        let hours = workshop_hours
            .get(r.workshop_id.0.as_str())
            .copied()
            .unwrap_or(0);
        physical.insert((r.trainer_id.0.as_str(), r.week, r.weekday, r.band), hours);
    }
    inst.trainers
        .iter()
        .map(|t| {
            let used = physical
                .iter()
                .filter(|((id, ..), _)| *id == t.id.0.as_str())
                .map(|(_, h)| *h)
                .sum();
            (t.id.clone(), used)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::*;

    fn date(y: i32, m: u32, d: u32) -> chrono::NaiveDate {
        chrono::NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(
        class: &str,
        workshop: &str,
        ordinal: u32,
        trainer: &str,
        week: u32,
        weekday: Weekday,
        band: Band,
        horizon: &Horizon,
    ) -> MeetingRecord {
        MeetingRecord {
            class_id: class.into(),
            school_id: "s1".into(),
            workshop_id: workshop.into(),
            ordinal,
            trainer_id: trainer.into(),
            week,
            weekday,
            band,
            date: horizon.date_of(week as usize, weekday).unwrap(),
            co_taught_with: vec![],
        }
    }

    fn small_instance() -> Instance {
        Instance {
            schools: vec![School {
                id: "s1".into(),
                name: "Alpha".into(),
                saturday: false,
            }],
            classes: vec![
                Class {
                    id: "c1".into(),
                    name: "5A".into(),
                    school_id: "s1".into(),
                    year: 5,
                    priority: Priority::Normal,
                    preferred_partner: Some("c2".into()),
                },
                Class {
                    id: "c2".into(),
                    name: "5B".into(),
                    school_id: "s1".into(),
                    year: 5,
                    priority: Priority::Normal,
                    preferred_partner: None,
                },
            ],
            trainers: vec![Trainer {
                id: "t1".into(),
                name: "Anna".into(),
                total_hours: 100,
                weekly_hours: None,
                morning_days: Weekday::ALL.to_vec(),
                afternoon_days: Weekday::ALL.to_vec(),
                specific_slots: None,
                excluded_dates: vec![],
                saturday: false,
                time_pref: TimePref::Morning,
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
            enrollments: vec![],
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

    #[test]
    fn grouping_counted_once_per_pair() {
        let inst = small_instance();
        let horizon = Horizon::build(&inst.calendar).unwrap();
        let mut r1 = record("c1", "w1", 1, "t1", 0, Weekday::Mon, Band::M1, &horizon);
        let mut r2 = record("c2", "w1", 1, "t1", 0, Weekday::Mon, Band::M1, &horizon);
        r1.co_taught_with = vec!["c2".into()];
        r2.co_taught_with = vec!["c1".into()];
        let mut r3 = record("c1", "w1", 2, "t1", 1, Weekday::Tue, Band::M1, &horizon);
        let mut r4 = record("c2", "w1", 2, "t1", 1, Weekday::Tue, Band::M1, &horizon);
        r3.co_taught_with = vec!["c2".into()];
        r4.co_taught_with = vec!["c1".into()];

        let s = compute_soft_scores(&inst, &horizon, &[r1, r2, r3, r4]);
        assert_eq!(s.groupings, 1);
        assert_eq!(s.preferred_groupings, 1);
        assert_eq!(s.continuity_breaks, 0);
        // Same band in consecutive weeks, for both classes.
        assert_eq!(s.band_repeats, 2);
        // Both meetings are in year-5 classes.
        assert_eq!(s.year5_week_sum, 0 + 0 + 1 + 1);
    }

    #[test]
    fn time_pref_and_budget_hours() {
        let inst = small_instance();
        let horizon = Horizon::build(&inst.calendar).unwrap();
        let r1 = record("c1", "w1", 1, "t1", 0, Weekday::Mon, Band::P, &horizon);
        let r2 = record("c1", "w1", 2, "t1", 2, Weekday::Mon, Band::M1, &horizon);
        let s = compute_soft_scores(&inst, &horizon, &[r1.clone(), r2.clone()]);
        // Morning-preferring trainer, one afternoon meeting.
        assert_eq!(s.time_pref_misses, 1);
        let hours = trainer_hours_used(&inst, &[r1, r2]);
        assert_eq!(hours, vec![("t1".into(), 4)]);
    }
}
