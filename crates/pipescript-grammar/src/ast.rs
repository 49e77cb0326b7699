use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Templated strings
// ---------------------------------------------------------------------------

/// One piece of a templated string: literal text or a `{...}` element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Element {
    /// Literal text, with `~` escapes already resolved.
    Text { text: String },
    Item(Item),
    Source(SourceCall),
    Conditional(Box<Conditional>),
    /// `{>> script}`, holding the raw script text.
    InlineScript { script: String },
    /// `{\name}`, holding the symbol name.
    Special { name: String },
}

impl Element {
    pub fn text(text: impl Into<String>) -> Self {
        Element::Text { text: text.into() }
    }
}

/// A `{}` item reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Item {
    /// `{}`, `{^}`, `{!}`: numbered automatically, left to right.
    Implicit { carrots: usize, bang: bool },
    /// `{0}`, `{^1!}`, `{1:3,-1}`: one or more explicit indices or ranges.
    Explicit(Vec<ItemIndex>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemIndex {
    Index {
        carrots: usize,
        index: i64,
        bang: bool,
    },
    Range {
        carrots: usize,
        start: Option<i64>,
        end: Option<i64>,
        bang: bool,
    },
}

/// How many values a `{N source}` call asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amount {
    Count(u32),
    All,
}

/// A `{[amount] name args...}` source call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCall {
    pub amount: Option<Amount>,
    pub name: String,
    pub args: Vec<RawArg>,
}

/// `{? case_if if condition else case_else}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditional {
    pub case_if: Vec<Element>,
    pub condition: Condition,
    pub case_else: Vec<Element>,
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// An argument as written: `name=value` or a run of implicit text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawArg {
    Explicit { name: String, value: Vec<Element> },
    /// Implicit argument text, whitespace preserved.
    Implicit { pieces: Vec<Element> },
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompOp {
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Like,
    NotLike,
}

impl CompOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompOp::Eq => "==",
            CompOp::NotEq => "!=",
            CompOp::Lt => "<",
            CompOp::Gt => ">",
            CompOp::LtEq => "<=",
            CompOp::GtEq => ">=",
            CompOp::Like => "LIKE",
            CompOp::NotLike => "NOT LIKE",
        }
    }
}

/// Predicate categories for `SUBJECT IS [NOT] CATEGORY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    White,
    Empty,
    True,
    False,
    Bool,
    Int,
    Float,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::White => "WHITE",
            Category::Empty => "EMPTY",
            Category::True => "TRUE",
            Category::False => "FALSE",
            Category::Bool => "BOOL",
            Category::Int => "INT",
            Category::Float => "FLOAT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregate {
    Anything,
    Nothing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Comparison {
        lhs: Vec<Element>,
        op: CompOp,
        rhs: Vec<Element>,
    },
    Predicate {
        subject: Vec<Element>,
        negated: bool,
        category: Category,
    },
    Aggregate(Aggregate),
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

// ---------------------------------------------------------------------------
// Group modes
// ---------------------------------------------------------------------------

/// One end of an interval: an index, or `-0` meaning the end of the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Index(i64),
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitKind {
    /// `(N)`
    Row { size: usize, padding: bool },
    /// `/N`
    Divide { count: usize, padding: bool },
    /// `%N`
    Modulo { count: usize, padding: bool },
    /// `\N`
    Column { size: usize, padding: bool },
    /// `#A` or `#A:B`; `end` is `None` for the single index form.
    Interval { start: Bound, end: Option<Bound> },
    /// `.`
    One,
    /// `^`
    Head,
    /// `$`
    Tail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub kind: SplitKind,
    pub strictness: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub index: usize,
    /// `+` prefix: compare numerically.
    pub numeric: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupByMode {
    Group,
    Collect,
    Extract,
}

impl GroupByMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupByMode::Group => "GROUP",
            GroupByMode::Collect => "COLLECT",
            GroupByMode::Extract => "EXTRACT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidMode {
    If {
        condition: Condition,
        strictness: u8,
    },
    SortBy(Vec<SortKey>),
    GroupBy {
        mode: GroupByMode,
        indices: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assign {
    Default,
    Random,
    Switch {
        conditions: Vec<Condition>,
        strictness: u8,
    },
}

/// The group mode prefix of a pipe segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupModeSpec {
    pub multiply: bool,
    pub splits: Vec<Split>,
    pub mids: Vec<MidMode>,
    pub assign: Assign,
}

impl Default for GroupModeSpec {
    fn default() -> Self {
        Self {
            multiply: false,
            splits: Vec::new(),
            mids: Vec::new(),
            assign: Assign::Default,
        }
    }
}
