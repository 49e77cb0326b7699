//! Parsers for the pipeline script language.
//!
//! Turns source text into a raw syntax tree: templated strings ([`Element`]),
//! argument lists ([`RawArg`]), conditions ([`Condition`]) and group modes
//! ([`GroupModeSpec`]). Also provides the coarse script splitters and
//! [`ChoiceTree`] bracket expansion that run before any of those.
//!
//! # Example
//! ```
//! use pipescript_grammar::{parse_template, Element, Item};
//!
//! let pieces = parse_template("Hello {}, meet {^0!}").unwrap();
//! assert_eq!(pieces.len(), 4);
//! assert_eq!(pieces[0], Element::text("Hello "));
//! assert!(matches!(pieces[1], Element::Item(Item::Implicit { carrots: 0, bang: false })));
//! ```

pub mod ast;
mod choicetree;
mod groupmode;
mod parser;
mod segments;

pub use ast::*;
pub use choicetree::ChoiceTree;
pub use groupmode::parse_groupmode;
pub use parser::{parse_arguments, parse_condition, parse_template, ESCAPABLE};
pub use segments::{
    expand_segment, parse_inline_pipeline, protected_spans, split_origin, split_segments,
};

/// Escape every character of `text` that the templated string grammar would
/// otherwise interpret.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if ESCAPABLE.contains(&c) {
            out.push('~');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipescript_types::ParseErrorKind;

    fn text(s: &str) -> Element {
        Element::text(s)
    }

    #[test]
    fn plain_text_and_escapes() {
        assert_eq!(parse_template("abc").unwrap(), vec![text("abc")]);
        assert_eq!(parse_template("a~{b~}~~c~x").unwrap(), vec![text("a{b}~c~x")]);
        assert_eq!(parse_template("").unwrap(), vec![]);
    }

    #[test]
    fn escape_roundtrips_through_parser() {
        let raw = "{weird} \"text\" ~/'";
        assert_eq!(parse_template(&escape(raw)).unwrap(), vec![text(raw)]);
    }

    #[test]
    fn explicit_items() {
        let pieces = parse_template("{0}{^1!}{-1}{1:3,^2!}{:}").unwrap();
        assert_eq!(
            pieces[0],
            Element::Item(Item::Explicit(vec![ItemIndex::Index {
                carrots: 0,
                index: 0,
                bang: false
            }]))
        );
        assert_eq!(
            pieces[1],
            Element::Item(Item::Explicit(vec![ItemIndex::Index {
                carrots: 1,
                index: 1,
                bang: true
            }]))
        );
        assert_eq!(
            pieces[3],
            Element::Item(Item::Explicit(vec![
                ItemIndex::Range {
                    carrots: 0,
                    start: Some(1),
                    end: Some(3),
                    bang: false
                },
                ItemIndex::Index {
                    carrots: 1,
                    index: 2,
                    bang: true
                },
            ]))
        );
        assert_eq!(
            pieces[4],
            Element::Item(Item::Explicit(vec![ItemIndex::Range {
                carrots: 0,
                start: None,
                end: None,
                bang: false
            }]))
        );
    }

    #[test]
    fn implicit_items() {
        let pieces = parse_template("{}{^^!}").unwrap();
        assert_eq!(
            pieces,
            vec![
                Element::Item(Item::Implicit {
                    carrots: 0,
                    bang: false
                }),
                Element::Item(Item::Implicit {
                    carrots: 2,
                    bang: true
                }),
            ]
        );
    }

    #[test]
    fn sources() {
        let pieces = parse_template("{3 word min=4 foo} {ALL things} {all}").unwrap();
        match &pieces[0] {
            Element::Source(call) => {
                assert_eq!(call.amount, Some(Amount::Count(3)));
                assert_eq!(call.name, "word");
                assert_eq!(call.args.len(), 2);
                assert_eq!(
                    call.args[0],
                    RawArg::Explicit {
                        name: "min".into(),
                        value: vec![text("4")]
                    }
                );
                assert_eq!(
                    call.args[1],
                    RawArg::Implicit {
                        pieces: vec![text(" foo")]
                    }
                );
            }
            other => panic!("expected source, got {other:?}"),
        }
        assert!(matches!(&pieces[2], Element::Source(c) if c.amount == Some(Amount::All) && c.name == "things"));
        assert!(matches!(&pieces[4], Element::Source(c) if c.amount.is_none() && c.name == "all"));
    }

    #[test]
    fn nested_source_arguments() {
        let pieces = parse_template("{arg {0} n=\"{word}s\"}").unwrap();
        let Element::Source(call) = &pieces[0] else {
            panic!("expected source")
        };
        assert_eq!(call.args.len(), 2);
        let RawArg::Explicit { value, .. } = &call.args[1] else {
            panic!("expected explicit arg")
        };
        assert_eq!(value.len(), 2);
        assert_eq!(value[1], text("s"));
    }

    #[test]
    fn special_symbols_and_inline_scripts() {
        let pieces = parse_template("a{\\n}b{>> {word} > upper}").unwrap();
        assert_eq!(pieces[1], Element::Special { name: "n".into() });
        assert_eq!(
            pieces[3],
            Element::InlineScript {
                script: "{word} > upper".into()
            }
        );
    }

    #[test]
    fn conditionals() {
        let pieces = parse_template("{? yes if {} == a else no}").unwrap();
        let Element::Conditional(cond) = &pieces[0] else {
            panic!("expected conditional")
        };
        assert_eq!(cond.case_if, vec![text("yes")]);
        assert_eq!(cond.case_else, vec![text("no")]);
        assert!(matches!(
            cond.condition,
            Condition::Comparison { op: CompOp::Eq, .. }
        ));
    }

    #[test]
    fn arguments_mix() {
        let args = parse_arguments("  hello world sep=\", \" n=3 tail").unwrap();
        assert_eq!(
            args,
            vec![
                RawArg::Implicit {
                    pieces: vec![text("hello world")]
                },
                RawArg::Explicit {
                    name: "sep".into(),
                    value: vec![text(", ")]
                },
                RawArg::Explicit {
                    name: "n".into(),
                    value: vec![text("3")]
                },
                RawArg::Implicit {
                    pieces: vec![text(" tail")]
                },
            ]
        );
    }

    #[test]
    fn quoted_arguments() {
        let args = parse_arguments("a=\"\"\"x \"y\" z\"\"\" b='q' c=/re+/").unwrap();
        assert_eq!(
            args[0],
            RawArg::Explicit {
                name: "a".into(),
                value: vec![text("x \"y\" z")]
            }
        );
        assert_eq!(
            args[2],
            RawArg::Explicit {
                name: "c".into(),
                value: vec![text("re+")]
            }
        );
    }

    #[test]
    fn condition_precedence() {
        let cond = parse_condition("a == b or c != d and not e IS EMPTY").unwrap();
        let Condition::Or(parts) = cond else {
            panic!("expected disjunction")
        };
        assert_eq!(parts.len(), 2);
        let Condition::And(conj) = &parts[1] else {
            panic!("expected conjunction")
        };
        assert!(matches!(
            conj[1],
            Condition::Not(ref inner) if matches!(**inner, Condition::Predicate { category: Category::Empty, negated: false, .. })
        ));
    }

    #[test]
    fn condition_forms() {
        assert!(matches!(
            parse_condition("{} NOT LIKE /^a/").unwrap(),
            Condition::Comparison {
                op: CompOp::NotLike,
                ..
            }
        ));
        assert!(matches!(
            parse_condition("{0} IS NOT INT").unwrap(),
            Condition::Predicate {
                negated: true,
                category: Category::Int,
                ..
            }
        ));
        assert_eq!(
            parse_condition("NOTHING").unwrap(),
            Condition::Aggregate(Aggregate::Nothing)
        );
        assert!(matches!(
            parse_condition("(a < 3) AND (b >= 4)").unwrap(),
            Condition::And(_)
        ));
    }

    #[test]
    fn stray_brace_is_unclosed() {
        let err = parse_template("abc } def").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Unclosed);
        assert_eq!(err.offset, 4);
    }

    #[test]
    fn unclosed_element_is_a_syntax_error() {
        let err = parse_template("abc {word").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnexpectedEnd);
        let err = parse_template("abc {\\} def").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidSyntax);
    }

    #[test]
    fn missing_argument_value_is_an_error() {
        assert!(parse_arguments("n= foo").is_err());
    }

    #[test]
    fn ast_serializes() {
        let pieces = parse_template("x{0}").unwrap();
        let json = serde_json::to_value(&pieces).unwrap();
        assert_eq!(json[0]["type"], "text");
        assert_eq!(json[1]["type"], "item");
    }
}
