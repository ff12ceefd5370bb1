//! MILP rendering of the constraint catalogue. One binary per admissible
//! (meeting, week, weekday, band, trainer) candidate; one binary per
//! co-teaching pair; auxiliary binaries and deviation variables for the
//! soft terms. Emission order is not semantically significant.

use good_lp::{variable, Expression, ProblemVariables, ResolutionError, Solution, SolverModel};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::domain::{Cand, Prep, Slot};
use types::{Band, MeetingDetail, MeetingRecord, SoftWeights, TimePref};

pub(crate) struct CandVar {
    pub meeting: usize,
    pub cand: Cand,
    pub var: good_lp::Variable,
}

/// Budget relief: 1 exactly when the pair is realized and the second class's
/// meeting sits on this candidate, so the co-taught hours are charged once.
pub(crate) struct Relief {
    pub pair: usize,
    pub cand: usize,
    pub var: good_lp::Variable,
}

pub(crate) struct Vars {
    pub groups: Vec<good_lp::Variable>,
    pub cands: Vec<CandVar>,
    pub by_meeting: Vec<Vec<usize>>,
    pub reliefs: Vec<Relief>,
    /// (class, trainer) usage flags for the continuity term.
    pub used: Vec<((usize, usize), good_lp::Variable)>,
    /// (class, week) same-band-as-next-week flags.
    pub band_repeat: Vec<(usize, u32, good_lp::Variable)>,
    /// Per-class preferred-sequence bonus flags.
    pub seq_bonus: Vec<(usize, good_lp::Variable)>,
    /// (trainer, week) deviation from the advisory weekly target.
    pub weekly_dev: Vec<(usize, u32, good_lp::Variable)>,
    /// (trainer, w1, w2) pairwise weekly-load spread.
    pub spread_dev: Vec<(usize, u32, u32, good_lp::Variable)>,
}

/// Adjacent pairs of a class's rank-ordered enrollments.
pub(crate) fn rank_chain(prep: &Prep, class: usize) -> Vec<(usize, usize)> {
    let mut ranked: Vec<(u32, usize)> = prep
        .enrollments
        .iter()
        .enumerate()
        .filter(|(_, e)| e.class == class)
        .filter_map(|(i, e)| {
            prep.inst.workshops[e.workshop]
                .ordering_rank
                .map(|r| (r, i))
        })
        .collect();
    ranked.sort();
    ranked.windows(2).map(|w| (w[0].1, w[1].1)).collect()
}

pub(crate) fn declare_vars(prep: &Prep, pv: &mut ProblemVariables) -> Vars {
    // Grouping decisions first: they carry the most structure.
    let groups: Vec<good_lp::Variable> = prep
        .pairs
        .iter()
        .map(|_| pv.add(variable().binary()))
        .collect();

    let mut cands = Vec::new();
    let mut by_meeting: Vec<Vec<usize>> = vec![Vec::new(); prep.meetings.len()];
    for (m_idx, m) in prep.meetings.iter().enumerate() {
        for &cand in &m.cands {
            by_meeting[m_idx].push(cands.len());
            cands.push(CandVar {
                meeting: m_idx,
                cand,
                var: pv.add(variable().binary()),
            });
        }
    }

    let mut reliefs = Vec::new();
    for (p_idx, pair) in prep.pairs.iter().enumerate() {
        for k in 0..pair.shared as usize {
            let m2 = prep.enrollments[pair.e2].meetings[k];
            for &ci in &by_meeting[m2] {
                reliefs.push(Relief {
                    pair: p_idx,
                    cand: ci,
                    var: pv.add(variable().binary()),
                });
            }
        }
    }

    let mut used_keys: BTreeSet<(usize, usize)> = BTreeSet::new();
    for cv in &cands {
        used_keys.insert((prep.meetings[cv.meeting].class, cv.cand.trainer));
    }
    let used = used_keys
        .into_iter()
        .map(|key| (key, pv.add(variable().binary())))
        .collect();

    let mut class_weeks: BTreeMap<usize, BTreeSet<u32>> = BTreeMap::new();
    for cv in &cands {
        class_weeks
            .entry(prep.meetings[cv.meeting].class)
            .or_default()
            .insert(cv.cand.slot.0);
    }
    let mut band_repeat = Vec::new();
    for (class, weeks) in &class_weeks {
        for &w in weeks {
            if weeks.contains(&(w + 1)) {
                band_repeat.push((*class, w, pv.add(variable().binary())));
            }
        }
    }

    let mut seq_bonus = Vec::new();
    for class in 0..prep.inst.classes.len() {
        if !rank_chain(prep, class).is_empty() {
            seq_bonus.push((class, pv.add(variable().binary())));
        }
    }

    let week_count = prep.horizon.week_count() as u32;
    let mut weekly_dev = Vec::new();
    for (t, trainer) in prep.inst.trainers.iter().enumerate() {
        if trainer.weekly_hours.is_some() {
            for w in 0..week_count {
                weekly_dev.push((t, w, pv.add(variable().min(0.0))));
            }
        }
    }

    // Spread deviations are clamped to the largest load a trainer could
    // carry in one week, which never cuts a solution.
    let max_hours = prep
        .inst
        .workshops
        .iter()
        .filter(|w| !w.external)
        .map(|w| w.hours_per_meeting)
        .max()
        .unwrap_or(0);
    let clamp = (max_hours * 6 * Band::ALL.len() as u32) as f64;
    let mut spread_dev = Vec::new();
    for t in 0..prep.inst.trainers.len() {
        for w1 in 0..week_count {
            for w2 in (w1 + 1)..week_count {
                spread_dev.push((t, w1, w2, pv.add(variable().min(0.0).max(clamp))));
            }
        }
    }

    Vars {
        groups,
        cands,
        by_meeting,
        reliefs,
        used,
        band_repeat,
        seq_bonus,
        weekly_dev,
        spread_dev,
    }
}

fn week_expr(vars: &Vars, meeting: usize) -> Expression {
    let mut e = Expression::from(0.0);
    for &ci in &vars.by_meeting[meeting] {
        e = e + (vars.cands[ci].cand.slot.0 as f64) * vars.cands[ci].var;
    }
    e
}

/// Per-trainer weekly load in hours, co-taught meetings charged once.
fn load_exprs(prep: &Prep, vars: &Vars) -> Vec<Vec<Expression>> {
    let week_count = prep.horizon.week_count();
    let mut loads =
        vec![vec![Expression::from(0.0); week_count]; prep.inst.trainers.len()];
    for cv in &vars.cands {
        let hours = prep.meetings[cv.meeting].hours as f64;
        let (week, _, _) = cv.cand.slot;
        loads[cv.cand.trainer][week as usize] =
            loads[cv.cand.trainer][week as usize].clone() + hours * cv.var;
    }
    for r in &vars.reliefs {
        let cv = &vars.cands[r.cand];
        let hours = prep.meetings[cv.meeting].hours as f64;
        let (week, _, _) = cv.cand.slot;
        loads[cv.cand.trainer][week as usize] =
            loads[cv.cand.trainer][week as usize].clone() - hours * r.var;
    }
    loads
}

pub(crate) fn build_objective(prep: &Prep, vars: &Vars, w: &SoftWeights) -> Expression {
    let week_count = prep.horizon.week_count() as u32;
    let mut obj = Expression::from(0.0);

    for (p_idx, pair) in prep.pairs.iter().enumerate() {
        let mut bonus = w.group as f64;
        if pair.preferred {
            bonus += w.pref_group as f64;
        }
        if bonus != 0.0 {
            obj = obj - bonus * vars.groups[p_idx];
        }
    }

    if w.continuity != 0 {
        let classes_with: BTreeSet<usize> =
            vars.used.iter().map(|((class, _), _)| *class).collect();
        for (_, var) in &vars.used {
            obj = obj + (w.continuity as f64) * *var;
        }
        obj = obj - (w.continuity as f64) * classes_with.len() as f64;
    }

    for cv in &vars.cands {
        let m = &prep.meetings[cv.meeting];
        let (week, _, band) = cv.cand.slot;
        let mut coef = 0.0;
        if prep.inst.classes[m.class].year == 5 {
            coef += w.year5 as f64 * week as f64;
        }
        if week_count >= 2 && week >= week_count - 2 {
            coef += w.late_may as f64 * week as f64;
        }
        let pref = prep.inst.trainers[cv.cand.trainer].time_pref;
        let miss = match pref {
            TimePref::Morning => band == Band::P,
            TimePref::Afternoon => band.is_morning(),
            TimePref::Either => false,
        };
        if miss {
            coef += w.time_pref as f64;
        }
        if coef != 0.0 {
            obj = obj + coef * cv.var;
        }
    }

    for (_, var) in &vars.seq_bonus {
        obj = obj - (w.seq_pref as f64) * *var;
    }
    for (_, _, var) in &vars.band_repeat {
        obj = obj + (w.band_var as f64) * *var;
    }
    for (_, _, var) in &vars.weekly_dev {
        obj = obj + (w.weekly_hrs as f64) * *var;
    }
    for (_, _, _, var) in &vars.spread_dev {
        obj = obj + (w.load_bal as f64) * *var;
    }

    obj
}

pub(crate) fn add_assignment_constraints<M: SolverModel>(
    mut model: M,
    _prep: &Prep,
    vars: &Vars,
) -> M {
    for cis in &vars.by_meeting {
        let mut sum = Expression::from(0.0);
        for &ci in cis {
            sum = sum + vars.cands[ci].var;
        }
        model = model.with(sum.eq(1.0));
    }
    model
}

pub(crate) fn add_class_week_constraints<M: SolverModel>(
    mut model: M,
    prep: &Prep,
    vars: &Vars,
) -> M {
    let mut per_cell: BTreeMap<(usize, u32), Expression> = BTreeMap::new();
    for cv in &vars.cands {
        let key = (prep.meetings[cv.meeting].class, cv.cand.slot.0);
        let e = per_cell.entry(key).or_insert_with(|| Expression::from(0.0));
        *e = e.clone() + cv.var;
    }
    for (_, sum) in per_cell {
        model = model.with(sum.leq(1.0));
    }
    model
}

pub(crate) fn add_order_constraints<M: SolverModel>(mut model: M, prep: &Prep, vars: &Vars) -> M {
    // Meetings of one enrollment in strictly increasing weeks.
    for e in &prep.enrollments {
        for pair in e.meetings.windows(2) {
            let diff = week_expr(vars, pair[1]) - week_expr(vars, pair[0]);
            model = model.with(diff.geq(1.0));
        }
    }

    // Cross-workshop precedence.
    for p in &prep.inst.precedences {
        for class in 0..prep.inst.classes.len() {
            let before = prep
                .enrollments
                .iter()
                .find(|e| e.class == class && prep.inst.workshops[e.workshop].id == p.before);
            let after = prep
                .enrollments
                .iter()
                .find(|e| e.class == class && prep.inst.workshops[e.workshop].id == p.after);
            if let (Some(b), Some(a)) = (before, after) {
                let last_before = *b.meetings.last().expect("enrollment has meetings");
                let first_after = a.meetings[0];
                let diff = week_expr(vars, first_after) - week_expr(vars, last_before);
                model = model.with(diff.geq(1.0));
            }
        }
    }

    // The flagged workshop comes after everything else of the class.
    for e_last in prep
        .enrollments
        .iter()
        .filter(|e| prep.inst.workshops[e.workshop].must_be_last)
    {
        for other in prep
            .enrollments
            .iter()
            .filter(|o| o.class == e_last.class && o.workshop != e_last.workshop)
        {
            let first_last = e_last.meetings[0];
            let last_other = *other.meetings.last().expect("enrollment has meetings");
            let diff = week_expr(vars, first_last) - week_expr(vars, last_other);
            model = model.with(diff.geq(1.0));
        }
    }

    // Autonomous gap: the skipped week sits between emitted meetings 2 and 3.
    for e in &prep.enrollments {
        let workshop = &prep.inst.workshops[e.workshop];
        let school = &prep.inst.classes[e.class].school_id;
        if workshop.autonomous_gap_schools.contains(school) && e.meetings.len() >= 3 {
            let diff = week_expr(vars, e.meetings[2]) - week_expr(vars, e.meetings[1]);
            model = model.with(diff.geq(2.0));
        }
    }

    model
}

pub(crate) fn add_afternoon_constraints<M: SolverModel>(
    mut model: M,
    prep: &Prep,
    vars: &Vars,
) -> M {
    let big_m = prep.horizon.week_count() as f64;
    for e in &prep.enrollments {
        let MeetingDetail::AfternoonCount {
            count,
            non_consecutive,
        } = prep.inst.enrollments[e.source].detail
        else {
            continue;
        };

        let afternoon = |meeting: usize| {
            let mut sum = Expression::from(0.0);
            for &ci in &vars.by_meeting[meeting] {
                if vars.cands[ci].cand.slot.2 == Band::P {
                    sum = sum + vars.cands[ci].var;
                }
            }
            sum
        };

        let mut total = Expression::from(0.0);
        for &m in &e.meetings {
            total = total + afternoon(m);
        }
        model = model.with(total.geq(count as f64));

        if non_consecutive {
            // Two afternoon meetings of consecutive ordinals must sit at
            // least two weeks apart; farther ordinals already are.
            for pair in e.meetings.windows(2) {
                let diff = week_expr(vars, pair[1]) - week_expr(vars, pair[0])
                    - big_m * afternoon(pair[0])
                    - big_m * afternoon(pair[1]);
                model = model.with(diff.geq(2.0 - 2.0 * big_m));
            }
        }
    }
    model
}

pub(crate) fn add_overlap_constraints<M: SolverModel>(
    mut model: M,
    prep: &Prep,
    vars: &Vars,
) -> M {
    let pair_index: HashMap<(usize, usize), usize> = prep
        .pairs
        .iter()
        .enumerate()
        .flat_map(|(i, p)| [((p.e1, p.e2), i), ((p.e2, p.e1), i)])
        .collect();

    let mut per_key: BTreeMap<(Slot, usize), Vec<usize>> = BTreeMap::new();
    for (ci, cv) in vars.cands.iter().enumerate() {
        per_key
            .entry((cv.cand.slot, cv.cand.trainer))
            .or_default()
            .push(ci);
    }

    for cis in per_key.values() {
        for (a, &ci) in cis.iter().enumerate() {
            for &cj in cis.iter().skip(a + 1) {
                let (m1, m2) = (vars.cands[ci].meeting, vars.cands[cj].meeting);
                if m1 == m2 {
                    continue;
                }
                let (me1, me2) = (&prep.meetings[m1], &prep.meetings[m2]);
                let groupable = me1.ordinal == me2.ordinal
                    && pair_index
                        .get(&(me1.enrollment, me2.enrollment))
                        .is_some_and(|&p| me1.ordinal <= prep.pairs[p].shared);
                let sum = Expression::from(vars.cands[ci].var) + vars.cands[cj].var;
                if groupable {
                    let p = pair_index[&(me1.enrollment, me2.enrollment)];
                    model = model.with((sum - vars.groups[p]).leq(1.0));
                } else {
                    model = model.with(sum.leq(1.0));
                }
            }
        }
    }
    model
}

pub(crate) fn add_group_constraints<M: SolverModel>(mut model: M, prep: &Prep, vars: &Vars) -> M {
    // At most one co-teaching partner per enrollment.
    let mut touching: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (p_idx, pair) in prep.pairs.iter().enumerate() {
        touching.entry(pair.e1).or_default().push(p_idx);
        touching.entry(pair.e2).or_default().push(p_idx);
    }
    for pair_ids in touching.values() {
        if pair_ids.len() > 1 {
            let mut sum = Expression::from(0.0);
            for &p in pair_ids {
                sum = sum + vars.groups[p];
            }
            model = model.with(sum.leq(1.0));
        }
    }

    // Coupling: a realized pair pins both meetings of every shared ordinal
    // to the same (week, weekday, band, trainer).
    for (p_idx, pair) in prep.pairs.iter().enumerate() {
        let g = vars.groups[p_idx];
        for k in 0..pair.shared as usize {
            let m1 = prep.enrollments[pair.e1].meetings[k];
            let m2 = prep.enrollments[pair.e2].meetings[k];
            let map1: HashMap<Cand, good_lp::Variable> = vars.by_meeting[m1]
                .iter()
                .map(|&ci| (vars.cands[ci].cand, vars.cands[ci].var))
                .collect();
            let map2: HashMap<Cand, good_lp::Variable> = vars.by_meeting[m2]
                .iter()
                .map(|&ci| (vars.cands[ci].cand, vars.cands[ci].var))
                .collect();
            let keys: BTreeSet<Cand> = map1.keys().chain(map2.keys()).copied().collect();
            for key in keys {
                match (map1.get(&key), map2.get(&key)) {
                    (Some(&v1), Some(&v2)) => {
                        model = model.with((Expression::from(v1) - v2 + g).leq(1.0));
                        model = model.with((Expression::from(v2) - v1 + g).leq(1.0));
                    }
                    (Some(&v1), None) => {
                        model = model.with((Expression::from(v1) + g).leq(1.0));
                    }
                    (None, Some(&v2)) => {
                        model = model.with((Expression::from(v2) + g).leq(1.0));
                    }
                    (None, None) => {}
                }
            }
        }
    }

    // Relief flags equal (pair realized AND candidate chosen).
    for r in &vars.reliefs {
        let g = vars.groups[r.pair];
        let x = vars.cands[r.cand].var;
        model = model.with((Expression::from(r.var) - g).leq(0.0));
        model = model.with((Expression::from(r.var) - x).leq(0.0));
        model = model.with((Expression::from(r.var) - g - x).geq(-1.0));
    }

    model
}

pub(crate) fn add_budget_constraints<M: SolverModel>(mut model: M, prep: &Prep, vars: &Vars) -> M {
    for (t, trainer) in prep.inst.trainers.iter().enumerate() {
        let mut charged = Expression::from(0.0);
        let mut any = false;
        for cv in &vars.cands {
            if cv.cand.trainer == t {
                charged = charged + (prep.meetings[cv.meeting].hours as f64) * cv.var;
                any = true;
            }
        }
        if !any {
            continue;
        }
        for r in &vars.reliefs {
            let cv = &vars.cands[r.cand];
            if cv.cand.trainer == t {
                charged = charged - (prep.meetings[cv.meeting].hours as f64) * r.var;
            }
        }
        model = model.with(charged.leq(trainer.total_hours as f64));
    }
    model
}

pub(crate) fn add_soft_support_constraints<M: SolverModel>(
    mut model: M,
    prep: &Prep,
    vars: &Vars,
) -> M {
    // Usage flags dominate every candidate of their (class, trainer).
    let used: HashMap<(usize, usize), good_lp::Variable> = vars.used.iter().copied().collect();
    for cv in &vars.cands {
        let key = (prep.meetings[cv.meeting].class, cv.cand.trainer);
        model = model.with((Expression::from(cv.var) - used[&key]).leq(0.0));
    }

    // Same band in consecutive class weeks.
    let mut class_week_band: HashMap<(usize, u32, Band), Expression> = HashMap::new();
    for cv in &vars.cands {
        let (week, _, band) = cv.cand.slot;
        let key = (prep.meetings[cv.meeting].class, week, band);
        let e = class_week_band
            .entry(key)
            .or_insert_with(|| Expression::from(0.0));
        *e = e.clone() + cv.var;
    }
    for (class, week, var) in &vars.band_repeat {
        for band in Band::ALL {
            let a = class_week_band.get(&(*class, *week, band));
            let b = class_week_band.get(&(*class, *week + 1, band));
            if let (Some(a), Some(b)) = (a, b) {
                model =
                    model.with((a.clone() + b.clone() - *var).leq(1.0));
            }
        }
    }

    // One-sided reification of the preferred sequence: the bonus may be
    // taken only when every adjacent ranked pair is in order.
    let big_m = prep.horizon.week_count() as f64;
    for (class, var) in &vars.seq_bonus {
        for (prev, next) in rank_chain(prep, *class) {
            let last_prev = *prep.enrollments[prev]
                .meetings
                .last()
                .expect("enrollment has meetings");
            let first_next = prep.enrollments[next].meetings[0];
            let diff =
                week_expr(vars, first_next) - week_expr(vars, last_prev) - big_m * *var;
            model = model.with(diff.geq(1.0 - big_m));
        }
    }

    // Weekly-load deviations.
    let loads = load_exprs(prep, vars);
    for (t, w, var) in &vars.weekly_dev {
        let target = prep.inst.trainers[*t]
            .weekly_hours
            .unwrap_or_default();
        let load = loads[*t][*w as usize].clone();
        model = model.with((Expression::from(*var) - load.clone()).geq(-target));
        model = model.with((Expression::from(*var) + load).geq(target));
    }
    for (t, w1, w2, var) in &vars.spread_dev {
        let l1 = loads[*t][*w1 as usize].clone();
        let l2 = loads[*t][*w2 as usize].clone();
        model = model.with((Expression::from(*var) - l1.clone() + l2.clone()).geq(0.0));
        model = model.with((Expression::from(*var) + l1 - l2).geq(0.0));
    }

    model
}

pub(crate) struct Outcome {
    pub objective: f64,
    /// Chosen candidate per meeting.
    pub chosen: Vec<Cand>,
    pub realized: Vec<bool>,
    pub candidates: usize,
}

pub(crate) fn run_model(prep: &Prep, weights: &SoftWeights) -> Result<Outcome, ResolutionError> {
    let mut pv = ProblemVariables::new();
    let vars = declare_vars(prep, &mut pv);
    let candidates = vars.cands.len();
    let objective = build_objective(prep, &vars, weights);

    let mut model = pv
        .minimise(objective.clone())
        .using(good_lp::default_solver);
    model = add_assignment_constraints(model, prep, &vars);
    model = add_class_week_constraints(model, prep, &vars);
    model = add_order_constraints(model, prep, &vars);
    model = add_afternoon_constraints(model, prep, &vars);
    model = add_overlap_constraints(model, prep, &vars);
    model = add_group_constraints(model, prep, &vars);
    model = add_budget_constraints(model, prep, &vars);
    model = add_soft_support_constraints(model, prep, &vars);

    let sol = model.solve()?;

    let chosen = vars
        .by_meeting
        .iter()
        .map(|cis| {
            cis.iter()
                .map(|&ci| &vars.cands[ci])
                .find(|cv| sol.value(cv.var) > 0.5)
                .map(|cv| cv.cand)
                .expect("assignment row guarantees one candidate")
        })
        .collect();
    let realized = vars.groups.iter().map(|g| sol.value(*g) > 0.5).collect();

    Ok(Outcome {
        objective: sol.eval(objective),
        chosen,
        realized,
        candidates,
    })
}

/// Turns solved variables into calendar records; both classes of a realized
/// pair keep their own record, cross-linked through `co_taught_with`.
pub(crate) fn to_records(prep: &Prep, outcome: &Outcome) -> Vec<MeetingRecord> {
    let mut partners: Vec<Vec<types::ClassId>> = vec![Vec::new(); prep.meetings.len()];
    for (p_idx, pair) in prep.pairs.iter().enumerate() {
        if !outcome.realized[p_idx] {
            continue;
        }
        let (c1, c2) = (
            prep.inst.classes[prep.enrollments[pair.e1].class].id.clone(),
            prep.inst.classes[prep.enrollments[pair.e2].class].id.clone(),
        );
        for k in 0..pair.shared as usize {
            partners[prep.enrollments[pair.e1].meetings[k]].push(c2.clone());
            partners[prep.enrollments[pair.e2].meetings[k]].push(c1.clone());
        }
    }

    let mut records: Vec<MeetingRecord> = prep
        .meetings
        .iter()
        .enumerate()
        .map(|(m_idx, m)| {
            let Cand {
                slot: (week, weekday, band),
                trainer,
            } = outcome.chosen[m_idx];
            let class = &prep.inst.classes[m.class];
            MeetingRecord {
                class_id: class.id.clone(),
                school_id: class.school_id.clone(),
                workshop_id: prep.inst.workshops[m.workshop].id.clone(),
                ordinal: m.ordinal,
                trainer_id: prep.inst.trainers[trainer].id.clone(),
                week,
                weekday,
                band,
                date: prep
                    .horizon
                    .date_of(week as usize, weekday)
                    .expect("candidate slots lie in the horizon"),
                co_taught_with: std::mem::take(&mut partners[m_idx]),
            }
        })
        .collect();

    records.sort_by(|a, b| {
        (a.week, a.weekday, a.band, &a.class_id, &a.workshop_id).cmp(&(
            b.week,
            b.weekday,
            b.band,
            &b.class_id,
            &b.workshop_id,
        ))
    });
    records
}
