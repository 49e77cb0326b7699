//! Grammar for the group mode prefix of a pipe segment, e.g. `*(2)! IF({} == x) SWITCH(...)`.

use winnow::ascii::digit1;
use winnow::combinator::{alt, cut_err, delimited, opt, preceded, separated, terminated};
use winnow::token::take_while;
use winnow::{ModalResult, Parser};

use pipescript_types::ParseError;

use crate::ast::*;
use crate::parser::{backtrack, condition, expected, keyword, pos_integer, to_parse_error, ws};

/// Consume the group mode at the start of `input`, returning it with the remainder.
///
/// The remainder starts at the first non-whitespace character after the group mode.
pub fn parse_groupmode(input: &str) -> Result<(GroupModeSpec, &str), ParseError> {
    let mut remaining = input;
    match groupmode.parse_next(&mut remaining) {
        Ok(spec) => Ok((spec, remaining)),
        Err(e) => Err(to_parse_error(input, remaining, e)),
    }
}

fn groupmode(input: &mut &str) -> ModalResult<GroupModeSpec> {
    ws.parse_next(input)?;
    let leading_multiply = opt(terminated('*', ws)).parse_next(input)?.is_some();

    let mut splits = Vec::new();
    while let Some(split) = opt(terminated(split, ws)).parse_next(input)? {
        splits.push(split);
    }

    let mut mids = Vec::new();
    if let Some(mid) = opt(terminated(mid_if, ws)).parse_next(input)? {
        mids.push(mid);
    }
    if let Some(mid) = opt(terminated(mid_sort_by, ws)).parse_next(input)? {
        mids.push(mid);
    }
    if let Some(mid) = opt(terminated(mid_group_by, ws)).parse_next(input)? {
        mids.push(mid);
    }

    let assign_multiply = opt(terminated('*', ws)).parse_next(input)?.is_some();
    let assign = alt((assign_random, assign_switch, assign_default)).parse_next(input)?;
    ws.parse_next(input)?;

    Ok(GroupModeSpec {
        multiply: leading_multiply || assign_multiply,
        splits,
        mids,
        assign,
    })
}

// ---------------------------------------------------------------------------
// Split modes
// ---------------------------------------------------------------------------

fn strictness(input: &mut &str) -> ModalResult<u8> {
    take_while(0.., '!')
        .map(|s: &str| s.len().min(2) as u8)
        .parse_next(input)
}

/// Digits where a leading zero requests padding.
fn padded_number(input: &mut &str) -> ModalResult<(usize, bool)> {
    digit1
        .try_map(|s: &str| s.parse::<usize>().map(|n| (n, s.starts_with('0'))))
        .parse_next(input)
}

fn split(input: &mut &str) -> ModalResult<Split> {
    let kind = alt((split_row, split_operator, split_interval, split_symbol)).parse_next(input)?;
    let strictness = strictness.parse_next(input)?;
    Ok(Split { kind, strictness })
}

/// `(N)`; backtracks when the parenthesis does not hold a number, since it
/// may open an inline pipeline instead.
fn split_row(input: &mut &str) -> ModalResult<SplitKind> {
    let (size, padding) = preceded(('(', ws), padded_number).parse_next(input)?;
    ws.parse_next(input)?;
    cut_err(')').context(expected("`)`")).parse_next(input)?;
    Ok(SplitKind::Row { size, padding })
}

fn split_operator(input: &mut &str) -> ModalResult<SplitKind> {
    let op = alt(('/', '%', '\\')).parse_next(input)?;
    let (n, padding) = cut_err(preceded(ws, padded_number))
        .context(expected("a number"))
        .parse_next(input)?;
    Ok(match op {
        '/' => SplitKind::Divide { count: n, padding },
        '%' => SplitKind::Modulo { count: n, padding },
        _ => SplitKind::Column { size: n, padding },
    })
}

fn bound_text<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (opt('-'), digit1).take().parse_next(input)
}

/// `-0` means the end of the list.
fn to_bound(text: &str) -> Bound {
    match text.parse::<i64>() {
        Ok(0) if text.starts_with('-') => Bound::End,
        Ok(n) => Bound::Index(n),
        Err(_) => Bound::End,
    }
}

fn split_interval(input: &mut &str) -> ModalResult<SplitKind> {
    '#'.parse_next(input)?;
    let (start, end) = cut_err(interval_body)
        .context(expected("an index or interval"))
        .parse_next(input)?;
    Ok(SplitKind::Interval { start, end })
}

fn interval_body(input: &mut &str) -> ModalResult<(Bound, Option<Bound>)> {
    let start = opt(bound_text).parse_next(input)?;
    let colon = opt(':').parse_next(input)?.is_some();
    if !colon {
        return match start {
            Some(start) => Ok((to_bound(start), None)),
            None => Err(backtrack()),
        };
    }
    let end = opt(bound_text).parse_next(input)?;
    let start = start.map(to_bound).unwrap_or(Bound::Index(0));
    let end = end.map(to_bound).unwrap_or(Bound::End);
    Ok((start, Some(end)))
}

fn split_symbol(input: &mut &str) -> ModalResult<SplitKind> {
    alt((
        '.'.value(SplitKind::One),
        '^'.value(SplitKind::Head),
        '$'.value(SplitKind::Tail),
    ))
    .parse_next(input)
}

// ---------------------------------------------------------------------------
// Mid modes
// ---------------------------------------------------------------------------

fn mid_if(input: &mut &str) -> ModalResult<MidMode> {
    keyword("IF", false).parse_next(input)?;
    let condition = cut_err(delimited((ws, '('), condition, (ws, ')')))
        .context(expected("`IF(condition)`"))
        .parse_next(input)?;
    let strictness = strictness.parse_next(input)?;
    Ok(MidMode::If {
        condition,
        strictness,
    })
}

fn sort_key(input: &mut &str) -> ModalResult<SortKey> {
    (opt('+'), pos_integer)
        .map(|(plus, index)| SortKey {
            index,
            numeric: plus.is_some(),
        })
        .parse_next(input)
}

fn mid_sort_by(input: &mut &str) -> ModalResult<MidMode> {
    (keyword("SORT", false), ws, keyword("BY", false)).parse_next(input)?;
    let keys = cut_err(list_of(sort_key))
        .context(expected("a list of indices"))
        .parse_next(input)?;
    Ok(MidMode::SortBy(keys))
}

fn mid_group_by(input: &mut &str) -> ModalResult<MidMode> {
    let mode = alt((
        keyword("GROUP", false).value(GroupByMode::Group),
        keyword("COLLECT", false).value(GroupByMode::Collect),
        keyword("EXTRACT", false).value(GroupByMode::Extract),
    ))
    .parse_next(input)?;
    cut_err(preceded(ws, keyword("BY", false)))
        .context(expected("`BY`"))
        .parse_next(input)?;
    let indices = cut_err(list_of(pos_integer))
        .context(expected("a list of indices"))
        .parse_next(input)?;
    Ok(MidMode::GroupBy { mode, indices })
}

// ---------------------------------------------------------------------------
// Assign modes
// ---------------------------------------------------------------------------

fn assign_random(input: &mut &str) -> ModalResult<Assign> {
    '?'.value(Assign::Random).parse_next(input)
}

fn assign_default(_input: &mut &str) -> ModalResult<Assign> {
    Ok(Assign::Default)
}

fn condition_list(input: &mut &str) -> ModalResult<Vec<Condition>> {
    separated(1.., condition, (ws, '|')).parse_next(input)
}

fn assign_switch(input: &mut &str) -> ModalResult<Assign> {
    keyword("SWITCH", false).parse_next(input)?;
    let conditions = cut_err(delimited(
        (ws, '('),
        alt((
            terminated(condition_list, (ws, ')')),
            terminated(
                delimited((ws, '('), condition_list, (ws, ')')),
                (ws, ')'),
            ),
        )),
        ws,
    ))
    .context(expected("`SWITCH(condition | condition | ...)`"))
    .parse_next(input)?;
    let strictness = strictness.parse_next(input)?;
    Ok(Assign::Switch {
        conditions,
        strictness,
    })
}

/// A comma separated list, optionally wrapped in parentheses.
fn list_of<O, P>(item: P) -> impl FnMut(&mut &str) -> ModalResult<Vec<O>>
where
    P: FnMut(&mut &str) -> ModalResult<O> + Copy,
{
    move |input: &mut &str| {
        ws.parse_next(input)?;
        if opt('(').parse_next(input)?.is_some() {
            let list: Vec<O> = separated(1.., preceded(ws, item), (ws, ',')).parse_next(input)?;
            (ws, ')').parse_next(input)?;
            Ok(list)
        } else {
            separated(1.., preceded(ws, item), (ws, ',')).parse_next(input)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> (GroupModeSpec, &str) {
        parse_groupmode(s).unwrap()
    }

    #[test]
    fn no_groupmode() {
        let (spec, rest) = parse("  join s=x");
        assert_eq!(spec, GroupModeSpec::default());
        assert_eq!(rest, "join s=x");
    }

    #[test]
    fn row_with_padding_and_strictness() {
        let (spec, rest) = parse("(03)!! join");
        assert_eq!(
            spec.splits,
            vec![Split {
                kind: SplitKind::Row {
                    size: 3,
                    padding: true
                },
                strictness: 2
            }]
        );
        assert_eq!(rest, "join");
    }

    #[test]
    fn strictness_is_clamped() {
        let (spec, _) = parse("/2!!!! x");
        assert_eq!(spec.splits[0].strictness, 2);
    }

    #[test]
    fn chained_splits() {
        let (spec, rest) = parse("%2 \\3 #1:-0 . ^ $ foo");
        let kinds: Vec<_> = spec.splits.into_iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SplitKind::Modulo {
                    count: 2,
                    padding: false
                },
                SplitKind::Column {
                    size: 3,
                    padding: false
                },
                SplitKind::Interval {
                    start: Bound::Index(1),
                    end: Some(Bound::End)
                },
                SplitKind::One,
                SplitKind::Head,
                SplitKind::Tail,
            ]
        );
        assert_eq!(rest, "foo");
    }

    #[test]
    fn interval_forms() {
        let (spec, _) = parse("#-0 x");
        assert_eq!(
            spec.splits[0].kind,
            SplitKind::Interval {
                start: Bound::End,
                end: None
            }
        );
        let (spec, _) = parse("#:2 x");
        assert_eq!(
            spec.splits[0].kind,
            SplitKind::Interval {
                start: Bound::Index(0),
                end: Some(Bound::Index(2))
            }
        );
    }

    #[test]
    fn inline_pipeline_is_not_a_row() {
        let (spec, rest) = parse("(foo > bar)");
        assert!(spec.splits.is_empty());
        assert_eq!(rest, "(foo > bar)");
    }

    #[test]
    fn multiply_flag_in_either_position() {
        assert!(parse("*(2) foo").0.multiply);
        assert!(parse("(2) * foo").0.multiply);
        assert!(!parse("(2) foo").0.multiply);
    }

    #[test]
    fn mid_modes() {
        let (spec, rest) = parse("IF({} == a)! SORT BY +1, 0 COLLECT BY (0) foo");
        assert_eq!(spec.mids.len(), 3);
        assert!(matches!(spec.mids[0], MidMode::If { strictness: 1, .. }));
        assert_eq!(
            spec.mids[1],
            MidMode::SortBy(vec![
                SortKey {
                    index: 1,
                    numeric: true
                },
                SortKey {
                    index: 0,
                    numeric: false
                }
            ])
        );
        assert_eq!(
            spec.mids[2],
            MidMode::GroupBy {
                mode: GroupByMode::Collect,
                indices: vec![0]
            }
        );
        assert_eq!(rest, "foo");
    }

    #[test]
    fn switch_and_random() {
        let (spec, rest) = parse("(1) SWITCH({} == a | {} == b)! [x|y|z]");
        match spec.assign {
            Assign::Switch {
                conditions,
                strictness,
            } => {
                assert_eq!(conditions.len(), 2);
                assert_eq!(strictness, 1);
            }
            other => panic!("expected switch, got {other:?}"),
        }
        assert_eq!(rest, "[x|y|z]");

        let (spec, _) = parse("(1) ? [x|y]");
        assert_eq!(spec.assign, Assign::Random);
    }

    #[test]
    fn doubly_parenthesized_switch() {
        let (spec, _) = parse("SWITCH(({} == a | {} == b)) [x|y]");
        assert!(matches!(spec.assign, Assign::Switch { ref conditions, .. } if conditions.len() == 2));
    }

    #[test]
    fn missing_number_is_an_error() {
        assert!(parse_groupmode("/ foo").is_err());
        assert!(parse_groupmode("(2 foo").is_err());
        assert!(parse_groupmode("IF foo").is_err());
    }
}
