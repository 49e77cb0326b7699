//! Group modes: how a segment's items are split into groups and which of the
//! segment's parallel targets each group is sent to.
//!
//! A group mode applies, in order:
//! 1. its split modes, each splitting every non-ignored group further,
//! 2. its mid modes (`IF`, `SORT BY`, `GROUP BY`) on the resulting groups,
//! 3. its assign mode, pairing each group with a target index (or none, meaning
//!    the group passes through unaffected).
//!
//! Strictness 0 keeps ill-fitting items, 1 drops them and 2 makes them an error.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use rand::Rng;

use pipescript_grammar::{Assign, Bound, GroupByMode, GroupModeSpec, MidMode, SortKey, Split, SplitKind};
use pipescript_types::{ErrorLog, ItemScope, Result, ScriptError};

use crate::condition::Condition;
use crate::context::{Context, Runtime};

/// A group of items, and whether it is ignored (passed around the pipe).
pub type Group = (Vec<String>, bool);

fn gm_error(message: impl Into<String>) -> ScriptError {
    ScriptError::GroupMode(message.into())
}

// ---------------------------------------------------------------------------
// Split modes
// ---------------------------------------------------------------------------

fn check_split(split: &Split) -> Result<()> {
    match split.kind {
        SplitKind::Row { size: 0, .. } => Err(gm_error("Row size must be at least 1.")),
        SplitKind::Divide { count: 0, .. } => Err(gm_error("Divide count must be at least 1.")),
        SplitKind::Modulo { count: 0, .. } => Err(gm_error("Modulo value must be at least 1.")),
        SplitKind::Column { size: 0, .. } => Err(gm_error("Column size must be at least 1.")),
        _ => Ok(()),
    }
}

/// What an empty list of items turns into, for the splits that chunk items.
fn empty_split(strictness: u8, groups: usize) -> Result<Vec<Group>> {
    match strictness {
        2 => Err(gm_error("No items to strictly group!")),
        1 => Ok(Vec::new()),
        _ => Ok(vec![(Vec::new(), false); groups]),
    }
}

/// Split `items` according to a single split mode.
pub fn split_items(split: &Split, mut items: Vec<String>) -> Result<Vec<Group>> {
    check_split(split)?;
    let strictness = split.strictness;
    match split.kind {
        SplitKind::Row { size, padding } => {
            let rest = items.len() % size;
            if rest > 0 {
                match strictness {
                    2 => return Err(gm_error(format!("Could not strictly group into rows size {size}!"))),
                    1 => items.truncate(items.len() - rest),
                    _ if padding => items.resize(items.len() + size - rest, String::new()),
                    _ => {}
                }
            }
            if items.is_empty() {
                return empty_split(strictness, 1);
            }
            Ok(items.chunks(size).map(|c| (c.to_vec(), false)).collect())
        }

        SplitKind::Divide { count, padding } => {
            let mut size = items.len() / count;
            let mut rest = items.len() % count;
            if rest > 0 {
                match strictness {
                    2 => return Err(gm_error(format!("Could not strictly divide into {count} rows!"))),
                    1 => {
                        items.truncate(size * count);
                        rest = 0;
                    }
                    _ if padding => {
                        items.resize(items.len() + count - rest, String::new());
                        size += 1;
                        rest = 0;
                    }
                    _ => {}
                }
            }
            if items.is_empty() {
                return empty_split(strictness, count);
            }
            // The first `rest` groups get one extra item.
            Ok((0..count)
                .map(|i| {
                    let left = i * size + rest.min(i);
                    let right = (i + 1) * size + rest.min(i + 1);
                    (items[left..right].to_vec(), false)
                })
                .collect())
        }

        SplitKind::Modulo { count, padding } => {
            let rest = items.len() % count;
            if rest > 0 {
                match strictness {
                    2 => return Err(gm_error(format!("Could not strictly group into {count} columns!"))),
                    // Strict padding still adds a full round of padding after cropping.
                    1 => {
                        items.truncate(items.len() - rest);
                        if padding && !items.is_empty() {
                            items.resize(items.len() + count, String::new());
                        }
                    }
                    _ if padding => items.resize(items.len() + count - rest, String::new()),
                    _ => {}
                }
            }
            if items.is_empty() {
                return empty_split(strictness, count);
            }
            Ok(stride(&items, count))
        }

        SplitKind::Column { size, padding } => {
            let rest = items.len() % size;
            if rest > 0 {
                match strictness {
                    2 => return Err(gm_error(format!("Could not strictly group into columns size {size}!"))),
                    // Strict padding still adds a full round of padding after cropping.
                    1 => {
                        items.truncate(items.len() - rest);
                        if padding && !items.is_empty() {
                            items.resize(items.len() + size, String::new());
                        }
                    }
                    _ if padding => items.resize(items.len() + size - rest, String::new()),
                    _ => {}
                }
            }
            if items.is_empty() {
                return empty_split(strictness, 1);
            }
            // Fewer items than a single column holds: they make up one column.
            let count = (items.len() / size).max(1);
            Ok(stride(&items, count))
        }

        SplitKind::Interval { start, end } => interval(&items, start, end, strictness),
        SplitKind::One => split_items(
            &Split {
                kind: SplitKind::Row { size: 1, padding: false },
                strictness,
            },
            items,
        ),
        SplitKind::Head => interval(&items, Bound::Index(0), None, strictness),
        SplitKind::Tail => interval(&items, Bound::Index(-1), None, strictness),
    }
}

/// `count` groups, the i-th holding every item whose index is i modulo `count`.
fn stride(items: &[String], count: usize) -> Vec<Group> {
    (0..count)
        .map(|i| (items.iter().skip(i).step_by(count).cloned().collect(), false))
        .collect()
}

fn interval(items: &[String], start: Bound, end: Option<Bound>, strictness: u8) -> Result<Vec<Group>> {
    let len = items.len() as i64;
    if len == 0 {
        return Ok(vec![(Vec::new(), false)]);
    }

    let mut from = match start {
        Bound::Index(i) => i,
        Bound::End => len,
    };
    let mut to = match (end, start) {
        (Some(Bound::End), _) | (None, Bound::End) | (None, Bound::Index(-1)) => len,
        (Some(Bound::Index(i)), _) => i,
        (None, Bound::Index(i)) => i + 1,
    };
    if from < 0 {
        from = from.rem_euclid(len);
    }
    if to < 0 {
        to = to.rem_euclid(len);
    }
    let from = from.min(len) as usize;
    let to = (to.min(len) as usize).max(from);
    let len = len as usize;

    match strictness {
        0 => Ok(vec![
            (items[..from].to_vec(), true),
            (items[from..to].to_vec(), false),
            (items[to..].to_vec(), true),
        ]),
        2 if from > 0 || to != len => Err(gm_error("The range does not strictly fit the set of items!")),
        _ => Ok(vec![(items[from..to].to_vec(), false)]),
    }
}

fn fmt_split(split: &Split, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let pad = |padding: bool| if padding { "0" } else { "" };
    let bound = |b: Bound| match b {
        Bound::Index(i) => i.to_string(),
        Bound::End => "-0".to_string(),
    };
    match split.kind {
        SplitKind::Row { size, padding } => write!(f, "({}{size})", pad(padding))?,
        SplitKind::Divide { count, padding } => write!(f, "/{}{count}", pad(padding))?,
        SplitKind::Modulo { count, padding } => write!(f, "%{}{count}", pad(padding))?,
        SplitKind::Column { size, padding } => write!(f, "\\{}{size}", pad(padding))?,
        SplitKind::Interval { start, end: None } => write!(f, "#{}", bound(start))?,
        SplitKind::Interval { start, end: Some(end) } => write!(f, "#{}:{}", bound(start), bound(end))?,
        SplitKind::One => f.write_str(".")?,
        SplitKind::Head => f.write_str("^")?,
        SplitKind::Tail => f.write_str("$")?,
    }
    f.write_str(&"!".repeat(split.strictness as usize))
}

// ---------------------------------------------------------------------------
// Mid modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Mid {
    If { condition: Condition, strictness: u8 },
    SortBy(Vec<SortKey>),
    GroupBy { mode: GroupByMode, indices: Vec<usize> },
}

#[derive(Debug, PartialEq, PartialOrd)]
enum SortValue {
    Num(f64),
    Str(String),
}

fn sort_key(items: &[String], keys: &[SortKey]) -> Result<Vec<SortValue>> {
    keys.iter()
        .map(|key| {
            let value = items
                .get(key.index)
                .ok_or_else(|| gm_error("SORT BY index out of range."))?;
            if key.numeric {
                value
                    .trim()
                    .parse::<f64>()
                    .map(SortValue::Num)
                    .map_err(|_| gm_error(format!("SORT BY could not convert \"{value}\" to a number.")))
            } else {
                Ok(SortValue::Str(value.clone()))
            }
        })
        .collect()
}

fn compare_keys(a: &[SortValue], b: &[SortValue]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = match (x, y) {
            (SortValue::Num(x), SortValue::Num(y)) => x.total_cmp(y),
            _ => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn sort_by(groups: Vec<Group>, keys: &[SortKey]) -> Result<Vec<Group>> {
    // Ignored groups float before or after the sorted block, depending on
    // whether they came before the first sorted group.
    let mut head = Vec::new();
    let mut to_sort = Vec::new();
    let mut tail = Vec::new();
    for (items, ignored) in groups {
        if !ignored {
            let key = sort_key(&items, keys)?;
            to_sort.push((key, items));
        } else if to_sort.is_empty() {
            head.push((items, true));
        } else {
            tail.push((items, true));
        }
    }
    to_sort.sort_by(|(a, _), (b, _)| compare_keys(a, b));
    head.extend(to_sort.into_iter().map(|(_, items)| (items, false)));
    head.extend(tail);
    Ok(head)
}

fn group_by(groups: Vec<Group>, mode: GroupByMode, indices: &[usize]) -> Result<Vec<Group>> {
    let max_index = indices.iter().copied().max().unwrap_or(0);
    let non_keys = |items: &[String]| -> Vec<String> {
        items
            .iter()
            .enumerate()
            .filter(|(i, _)| !indices.contains(i))
            .map(|(_, v)| v.clone())
            .collect()
    };

    let mut out: Vec<Group> = Vec::new();
    let mut known: HashMap<Vec<String>, usize> = HashMap::new();
    for (items, ignored) in groups {
        if ignored {
            out.push((items, true));
            continue;
        }
        if max_index >= items.len() {
            return Err(gm_error("GROUP BY index out of range."));
        }
        let key: Vec<String> = indices.iter().map(|&i| items[i].clone()).collect();
        match known.get(&key) {
            Some(&at) => {
                let values = match mode {
                    GroupByMode::Group => items,
                    GroupByMode::Collect | GroupByMode::Extract => non_keys(&items),
                };
                out[at].0.extend(values);
            }
            None => {
                let values = match mode {
                    GroupByMode::Group => items,
                    GroupByMode::Collect => key.iter().cloned().chain(non_keys(&items)).collect(),
                    GroupByMode::Extract => non_keys(&items),
                };
                known.insert(key, out.len());
                out.push((values, false));
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Assign modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum AssignMode {
    Default,
    Random,
    Switch { conditions: Vec<Condition>, strictness: u8 },
}

/// A group paired with the index of the target it goes to, if any.
pub type Assignment = (Vec<String>, Option<usize>);

fn assign_random(groups: Vec<Group>, targets: usize) -> Vec<Assignment> {
    let mut rng = rand::rng();
    groups
        .into_iter()
        .map(|(items, ignored)| {
            let target = (!ignored).then(|| rng.random_range(0..targets));
            (items, target)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// GroupMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GroupMode {
    multiply: bool,
    splits: Vec<Split>,
    mids: Vec<Mid>,
    assign: AssignMode,
}

impl Default for GroupMode {
    fn default() -> Self {
        Self {
            multiply: false,
            splits: Vec::new(),
            mids: Vec::new(),
            assign: AssignMode::Default,
        }
    }
}

impl GroupMode {
    /// Build from a parsed group mode, reporting invalid sizes and condition
    /// pre-errors.
    pub fn from_spec(spec: &GroupModeSpec, rt: &Runtime) -> (Option<Self>, ErrorLog) {
        let mut errors = ErrorLog::new();
        for split in &spec.splits {
            if let Err(e) = check_split(split) {
                errors.log(e.to_string(), true);
            }
        }

        let mids = spec
            .mids
            .iter()
            .map(|mid| match mid {
                MidMode::If { condition, strictness } => {
                    let (condition, errs, _) = Condition::from_ast(condition, 0, rt);
                    errors.extend_in(&errs, "IF");
                    Mid::If {
                        condition,
                        strictness: *strictness,
                    }
                }
                MidMode::SortBy(keys) => Mid::SortBy(keys.clone()),
                MidMode::GroupBy { mode, indices } => Mid::GroupBy {
                    mode: *mode,
                    indices: indices.clone(),
                },
            })
            .collect();

        let assign = match &spec.assign {
            Assign::Default => AssignMode::Default,
            Assign::Random => AssignMode::Random,
            Assign::Switch { conditions, strictness } => AssignMode::Switch {
                conditions: conditions
                    .iter()
                    .map(|c| {
                        let (condition, errs, _) = Condition::from_ast(c, 0, rt);
                        errors.extend_in(&errs, "SWITCH");
                        condition
                    })
                    .collect(),
                strictness: *strictness,
            },
        };

        if errors.is_terminal() {
            return (None, errors);
        }
        let mode = Self {
            multiply: spec.multiply,
            splits: spec.splits.clone(),
            mids,
            assign,
        };
        (Some(mode), errors)
    }

    pub fn splits_trivially(&self) -> bool {
        self.splits.is_empty()
    }

    /// Whether every item is guaranteed to arrive at a single target as one group.
    pub fn is_singular(&self) -> bool {
        self.splits.is_empty() && !self.multiply
    }

    pub fn is_trivial(&self) -> bool {
        self.splits.is_empty() && self.mids.is_empty() && !self.multiply && matches!(self.assign, AssignMode::Default)
    }

    /// Split `items` into groups and assign each to one of `targets` targets.
    ///
    /// Condition warnings are added to `errors`; a condition failing terminally
    /// adds its errors and returns a group mode error.
    pub async fn apply(
        &self,
        items: Vec<String>,
        targets: usize,
        ctx: &Context,
        scope: Option<&ItemScope>,
        errors: &mut ErrorLog,
    ) -> Result<Vec<Assignment>> {
        let mut groups: Vec<Group> = vec![(items, false)];
        for split in &self.splits {
            let mut next = Vec::with_capacity(groups.len());
            for (items, ignored) in groups {
                if ignored {
                    next.push((items, true));
                } else {
                    next.extend(split_items(split, items)?);
                }
            }
            groups = next;
        }

        for mid in &self.mids {
            groups = match mid {
                Mid::If { condition, strictness } => {
                    let mut kept = Vec::with_capacity(groups.len());
                    for (items, ignored) in groups {
                        if ignored {
                            kept.push((items, true));
                            continue;
                        }
                        let group_scope = ItemScope::nested(scope, items.clone());
                        if check(condition, ctx, &group_scope, errors).await? {
                            kept.push((items, false));
                        } else if *strictness == 0 {
                            kept.push((items, true));
                        }
                    }
                    kept
                }
                Mid::SortBy(keys) => sort_by(groups, keys)?,
                Mid::GroupBy { mode, indices } => group_by(groups, *mode, indices)?,
            };
        }

        match &self.assign {
            AssignMode::Default => Ok(self.assign_default(groups, targets)),
            AssignMode::Random => Ok(assign_random(groups, targets)),
            AssignMode::Switch { conditions, strictness } => {
                self.assign_switch(groups, targets, conditions, *strictness, ctx, scope, errors)
                    .await
            }
        }
    }

    fn assign_default(&self, groups: Vec<Group>, targets: usize) -> Vec<Assignment> {
        let mut out = Vec::with_capacity(groups.len());
        let mut i = 0;
        for (items, ignored) in groups {
            if ignored {
                out.push((items, None));
            } else if self.multiply {
                out.extend((0..targets).map(|t| (items.clone(), Some(t))));
            } else {
                out.push((items, Some(i % targets)));
                i += 1;
            }
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    async fn assign_switch(
        &self,
        groups: Vec<Group>,
        targets: usize,
        conditions: &[Condition],
        strictness: u8,
        ctx: &Context,
        scope: Option<&ItemScope>,
        errors: &mut ErrorLog,
    ) -> Result<Vec<Assignment>> {
        let cases = conditions.len();
        if targets != cases {
            if strictness > 0 {
                return Err(gm_error(
                    "Strict condition error: Unmatched number of cases and parallel pipes; should be equal.",
                ));
            } else if targets != cases + 1 {
                return Err(gm_error(
                    "Unmatched number of cases and parallel pipes; number of pipes should be equal or one more.",
                ));
            }
        }
        let overflow = (targets == cases + 1).then_some(cases);

        let mut out = Vec::new();
        for (items, ignored) in groups {
            if ignored {
                out.push((items, None));
                continue;
            }
            let group_scope = ItemScope::nested(scope, items.clone());

            if self.multiply {
                for (t, condition) in conditions.iter().enumerate() {
                    if check(condition, ctx, &group_scope, errors).await? {
                        out.push((items.clone(), Some(t)));
                    }
                }
                if let Some(t) = overflow {
                    out.push((items, Some(t)));
                }
                continue;
            }

            let mut matched = None;
            for (t, condition) in conditions.iter().enumerate() {
                if check(condition, ctx, &group_scope, errors).await? {
                    matched = Some(t);
                    break;
                }
            }
            match (matched.or(overflow), strictness) {
                (Some(t), _) => out.push((items, Some(t))),
                (None, 0) => out.push((items, None)),
                (None, 1) => {}
                (None, _) => {
                    return Err(gm_error("Very strict switch error: Default case was reached!"));
                }
            }
        }
        Ok(out)
    }
}

async fn check(condition: &Condition, ctx: &Context, scope: &ItemScope, errors: &mut ErrorLog) -> Result<bool> {
    let (value, errs) = condition.evaluate(ctx, Some(scope)).await;
    errors.extend_in(&errs, "condition");
    match value {
        Some(v) if !errs.is_terminal() => Ok(v),
        _ => Err(gm_error(format!("Error while evaluating condition `{condition}`."))),
    }
}

impl fmt::Display for GroupMode {
    /// Written back in script syntax; the trivial group mode is empty.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if self.multiply {
            parts.push("*".into());
        }
        for split in &self.splits {
            parts.push(SplitDisplay(split).to_string());
        }
        for mid in &self.mids {
            parts.push(match mid {
                Mid::If { condition, strictness } => {
                    format!("IF({condition}){}", "!".repeat(*strictness as usize))
                }
                Mid::SortBy(keys) => {
                    let keys: Vec<String> = keys
                        .iter()
                        .map(|k| format!("{}{}", if k.numeric { "+" } else { "" }, k.index))
                        .collect();
                    format!("SORT BY {}", keys.join(", "))
                }
                Mid::GroupBy { mode, indices } => {
                    let indices: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
                    format!("{} BY {}", mode.as_str(), indices.join(", "))
                }
            });
        }
        match &self.assign {
            AssignMode::Default => {}
            AssignMode::Random => parts.push("?".into()),
            AssignMode::Switch { conditions, strictness } => {
                let conds: Vec<String> = conditions.iter().map(|c| c.to_string()).collect();
                parts.push(format!(
                    "SWITCH({}){}",
                    conds.join(" | "),
                    "!".repeat(*strictness as usize)
                ));
            }
        }
        f.write_str(&parts.join(" "))
    }
}

struct SplitDisplay<'a>(&'a Split);

impl fmt::Display for SplitDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_split(self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_runtime;
    use pipescript_grammar::parse_groupmode;

    fn items(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn split(kind: SplitKind, strictness: u8) -> Split {
        Split { kind, strictness }
    }

    fn groups(result: Vec<Group>) -> Vec<Vec<String>> {
        result.into_iter().map(|(g, _)| g).collect()
    }

    const GREEK: &[&str] = &["alpha", "beta", "gamma", "delta", "epsilon", "phi"];

    #[test]
    fn row_keeps_drops_or_pads_the_remainder() {
        let row = |strictness, padding| split(SplitKind::Row { size: 4, padding }, strictness);
        assert_eq!(groups(split_items(&row(0, false), items(GREEK)).unwrap())[1], items(&["epsilon", "phi"]));
        assert_eq!(groups(split_items(&row(1, false), items(GREEK)).unwrap()).len(), 1);
        assert_eq!(
            groups(split_items(&row(0, true), items(GREEK)).unwrap())[1],
            items(&["epsilon", "phi", "", ""])
        );
        let err = split_items(&row(2, false), items(GREEK)).unwrap_err();
        assert_eq!(err.to_string(), "Could not strictly group into rows size 4!");
    }

    #[test]
    fn empty_input_per_strictness() {
        let divide = |s| split(SplitKind::Divide { count: 3, padding: false }, s);
        assert_eq!(split_items(&divide(0), vec![]).unwrap().len(), 3);
        assert!(split_items(&divide(1), vec![]).unwrap().is_empty());
        assert!(split_items(&divide(2), vec![]).is_err());
    }

    #[test]
    fn divide_gives_extra_items_to_the_first_groups() {
        let result = split_items(
            &split(SplitKind::Divide { count: 4, padding: false }, 0),
            items(GREEK),
        )
        .unwrap();
        let sizes: Vec<usize> = groups(result).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1, 1]);
    }

    #[test]
    fn modulo_and_column_transpose() {
        let modulo = split_items(&split(SplitKind::Modulo { count: 3, padding: false }, 0), items(GREEK)).unwrap();
        assert_eq!(
            groups(modulo),
            vec![items(&["alpha", "delta"]), items(&["beta", "epsilon"]), items(&["gamma", "phi"])]
        );
        let column = split_items(&split(SplitKind::Column { size: 3, padding: false }, 0), items(GREEK)).unwrap();
        assert_eq!(
            groups(column),
            vec![items(&["alpha", "gamma", "epsilon"]), items(&["beta", "delta", "phi"])]
        );
    }

    #[test]
    fn column_round_trips_through_modulo() {
        let column = split_items(&split(SplitKind::Column { size: 3, padding: false }, 0), items(GREEK)).unwrap();
        let flat: Vec<String> = column.into_iter().flat_map(|(g, _)| g).collect();
        let modulo = split_items(&split(SplitKind::Modulo { count: 3, padding: false }, 0), flat).unwrap();
        let restored: Vec<String> = modulo.into_iter().flat_map(|(g, _)| g).collect();
        assert_eq!(restored, items(GREEK));
    }

    #[test]
    fn strict_padding_crops_then_pads_a_full_round() {
        let seven = items(&["a", "b", "c", "d", "e", "f", "g"]);
        let expected = vec![items(&["a", "d", ""]), items(&["b", "e", ""]), items(&["c", "f", ""])];

        let modulo = split_items(&split(SplitKind::Modulo { count: 3, padding: true }, 1), seven.clone()).unwrap();
        assert_eq!(groups(modulo), expected);
        let column = split_items(&split(SplitKind::Column { size: 3, padding: true }, 1), seven).unwrap();
        assert_eq!(groups(column), expected);

        let cropped_away = split_items(&split(SplitKind::Modulo { count: 3, padding: true }, 1), items(&["a"])).unwrap();
        assert!(cropped_away.is_empty());
    }

    #[test]
    fn column_smaller_than_size_is_one_group() {
        let result = split_items(&split(SplitKind::Column { size: 5, padding: false }, 0), items(&["a", "b"])).unwrap();
        assert_eq!(groups(result), vec![items(&["a", "b"])]);
    }

    #[test]
    fn interval_marks_outside_items_ignored() {
        let four = items(&["alpha", "beta", "gamma", "delta"]);
        let interval = |strictness| {
            split(
                SplitKind::Interval {
                    start: Bound::Index(1),
                    end: Some(Bound::Index(3)),
                },
                strictness,
            )
        };
        assert_eq!(
            split_items(&interval(0), four.clone()).unwrap(),
            vec![
                (items(&["alpha"]), true),
                (items(&["beta", "gamma"]), false),
                (items(&["delta"]), true),
            ]
        );
        assert_eq!(
            split_items(&interval(1), four.clone()).unwrap(),
            vec![(items(&["beta", "gamma"]), false)]
        );
        assert!(split_items(&interval(2), four).is_err());
    }

    #[test]
    fn single_indices_and_symbols() {
        let four = items(&["a", "b", "c", "d"]);
        let last = split(SplitKind::Interval { start: Bound::Index(-1), end: None }, 1);
        assert_eq!(groups(split_items(&last, four.clone()).unwrap()), vec![items(&["d"])]);
        let tail = split(SplitKind::Interval { start: Bound::End, end: None }, 1);
        assert_eq!(groups(split_items(&tail, four.clone()).unwrap()), vec![Vec::<String>::new()]);
        assert_eq!(groups(split_items(&split(SplitKind::Head, 1), four.clone()).unwrap()), vec![items(&["a"])]);
        assert_eq!(split_items(&split(SplitKind::One, 0), four).unwrap().len(), 4);
    }

    #[test]
    fn zero_sizes_are_refused() {
        let rt = test_runtime();
        let (spec, _) = parse_groupmode("(0) x").unwrap();
        let (mode, errors) = GroupMode::from_spec(&spec, &rt);
        assert!(mode.is_none());
        assert_eq!(errors.entries()[0].message, "Row size must be at least 1.");
    }

    #[test]
    fn sort_by_numeric_and_textual_keys() {
        let g = vec![
            (items(&["10", "b"]), false),
            (items(&["9", "a"]), false),
            (items(&["x"]), true),
            (items(&["9", "0"]), false),
        ];
        let keys = [SortKey { index: 0, numeric: true }, SortKey { index: 1, numeric: false }];
        let sorted = sort_by(g, &keys).unwrap();
        assert_eq!(
            groups(sorted),
            vec![items(&["9", "0"]), items(&["9", "a"]), items(&["10", "b"]), items(&["x"])]
        );
    }

    #[test]
    fn group_by_modes() {
        let g = || {
            vec![
                (items(&["k1", "a"]), false),
                (items(&["k2", "b"]), false),
                (items(&["k1", "c"]), false),
            ]
        };
        assert_eq!(
            groups(group_by(g(), GroupByMode::Group, &[0]).unwrap()),
            vec![items(&["k1", "a", "k1", "c"]), items(&["k2", "b"])]
        );
        assert_eq!(
            groups(group_by(g(), GroupByMode::Collect, &[0]).unwrap()),
            vec![items(&["k1", "a", "c"]), items(&["k2", "b"])]
        );
        assert_eq!(
            groups(group_by(g(), GroupByMode::Extract, &[0]).unwrap()),
            vec![items(&["a", "c"]), items(&["b"])]
        );
        assert!(group_by(g(), GroupByMode::Group, &[2]).is_err());
    }

    async fn assign(mode: &str, input: &[&str], targets: usize) -> Result<Vec<Assignment>> {
        let rt = test_runtime();
        let ctx = Context::for_tests(rt.clone());
        let (spec, _) = parse_groupmode(mode).unwrap();
        let (mode, errors) = GroupMode::from_spec(&spec, &rt);
        assert!(!errors.is_terminal(), "{errors}");
        let mut errors = ErrorLog::new();
        mode.unwrap().apply(items(input), targets, &ctx, None, &mut errors).await
    }

    #[tokio::test]
    async fn rows_alternate_between_targets() {
        let out = assign("(3) x", GREEK, 2).await.unwrap();
        assert_eq!(out[0], (items(&["alpha", "beta", "gamma"]), Some(0)));
        assert_eq!(out[1], (items(&["delta", "epsilon", "phi"]), Some(1)));
    }

    #[tokio::test]
    async fn multiply_sends_every_group_everywhere() {
        let out = assign("*(3) x", GREEK, 2).await.unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[1], (items(&["alpha", "beta", "gamma"]), Some(1)));
    }

    #[tokio::test]
    async fn if_mode_ignores_or_drops_failing_groups() {
        let out = assign("(1) IF({0} LIKE /a$/) x", &["alpha", "phi", "beta"], 1).await.unwrap();
        assert_eq!(
            out,
            vec![
                (items(&["alpha"]), Some(0)),
                (items(&["phi"]), None),
                (items(&["beta"]), Some(0)),
            ]
        );
        let out = assign("(1) IF({0} LIKE /a$/)! x", &["alpha", "phi", "beta"], 1).await.unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn switch_picks_the_first_matching_case() {
        let out = assign("(1) SWITCH({0} == a | {0} == b) x", &["a", "b", "c"], 3).await.unwrap();
        assert_eq!(
            out,
            vec![(items(&["a"]), Some(0)), (items(&["b"]), Some(1)), (items(&["c"]), Some(2))]
        );
        let out = assign("(1) SWITCH({0} == a | {0} == b) x", &["c"], 2).await.unwrap();
        assert_eq!(out, vec![(items(&["c"]), None)]);
        let err = assign("(1) SWITCH({0} == a | {0} == b)!! x", &["c"], 2).await.unwrap_err();
        assert_eq!(err.to_string(), "Very strict switch error: Default case was reached!");
        let err = assign("(1) SWITCH({0} == a) x", &["c"], 3).await.unwrap_err();
        assert!(err.to_string().starts_with("Unmatched number of cases"));
    }

    #[tokio::test]
    async fn random_assigns_within_range() {
        let out = assign("(1)? x", GREEK, 3).await.unwrap();
        assert_eq!(out.len(), 6);
        assert!(out.iter().all(|(_, t)| matches!(t, Some(0..=2))));
    }

    #[test]
    fn display_is_script_syntax() {
        let rt = test_runtime();
        for text in ["", "(3)!", "* /02 #1:-0", "%2 \\3!! SORT BY +0, 1", "(1) IF({0} == a)! ?", "GROUP BY 0, 2 SWITCH({0} == a | {0} == b)!"] {
            let src = format!("{text} x");
            let (spec, rest) = parse_groupmode(&src).unwrap();
            assert_eq!(rest, "x");
            let (mode, _) = GroupMode::from_spec(&spec, &rt);
            let mode = mode.unwrap();
            assert_eq!(mode.to_string(), text);
        }
    }
}
