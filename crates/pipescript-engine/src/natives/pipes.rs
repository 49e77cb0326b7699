use async_trait::async_trait;

use pipescript_types::{Result, ScriptError};

use crate::registry::{Pipe, Pipeoid};
use crate::signature::{EvaluatedArguments, Par, ParamType, Signature};

macro_rules! pipe_struct {
    ($name:ident, $id:literal, $doc:literal) => {
        pub struct $name {
            signature: Signature,
        }

        impl Pipeoid for $name {
            fn name(&self) -> &str {
                $id
            }
            fn signature(&self) -> &Signature {
                &self.signature
            }
            fn doc(&self) -> &str {
                $doc
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

pipe_struct!(Upper, "upper", "Makes every item uppercase.");
pipe_struct!(Lower, "lower", "Makes every item lowercase.");

impl Upper {
    pub fn new() -> Self {
        Self {
            signature: Signature::empty(),
        }
    }
}

#[async_trait]
impl Pipe for Upper {
    async fn apply(&self, items: Vec<String>, _: &EvaluatedArguments) -> Result<Vec<String>> {
        Ok(items.iter().map(|s| s.to_uppercase()).collect())
    }
}

impl Lower {
    pub fn new() -> Self {
        Self {
            signature: Signature::empty(),
        }
    }
}

#[async_trait]
impl Pipe for Lower {
    async fn apply(&self, items: Vec<String>, _: &EvaluatedArguments) -> Result<Vec<String>> {
        Ok(items.iter().map(|s| s.to_lowercase()).collect())
    }
}

pipe_struct!(Join, "join", "Joins all items into one, separated by `s`.");

impl Join {
    pub fn new() -> Self {
        Self {
            signature: Signature::new([(
                "s",
                Par::new(ParamType::Str, "The separator inserted between two items.")
                    .with_default(""),
            )]),
        }
    }
}

#[async_trait]
impl Pipe for Join {
    async fn apply(&self, items: Vec<String>, args: &EvaluatedArguments) -> Result<Vec<String>> {
        Ok(vec![items.join(args.str("s")?)])
    }
}

pipe_struct!(Split, "split", "Splits every item on a pattern.");

impl Split {
    pub fn new() -> Self {
        Self {
            signature: Signature::new([
                ("on", Par::new(ParamType::Regex, "Pattern to split on")),
                (
                    "lim",
                    Par::new(ParamType::Int, "Maximum number of splits. (0 for no limit)")
                        .with_default("0")
                        .with_check(|v| v.as_int() >= Some(0)),
                ),
            ]),
        }
    }
}

#[async_trait]
impl Pipe for Split {
    async fn apply(&self, items: Vec<String>, args: &EvaluatedArguments) -> Result<Vec<String>> {
        let on = args.regex("on")?;
        let lim = args.int("lim")?;
        let mut out = Vec::new();
        for item in &items {
            if lim == 0 {
                out.extend(on.split(item).map(String::from));
            } else {
                out.extend(on.splitn(item, lim as usize + 1).map(String::from));
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

pipe_struct!(Reverse, "reverse", "Reverses the order of the items.");

impl Reverse {
    pub fn new() -> Self {
        Self {
            signature: Signature::empty(),
        }
    }
}

#[async_trait]
impl Pipe for Reverse {
    async fn apply(&self, mut items: Vec<String>, _: &EvaluatedArguments) -> Result<Vec<String>> {
        items.reverse();
        Ok(items)
    }
}

pipe_struct!(Repeat, "repeat", "Repeats the items a given number of times.");

impl Repeat {
    pub fn new() -> Self {
        Self {
            signature: Signature::new([
                (
                    "times",
                    Par::new(ParamType::Int, "Number of times repeated")
                        .with_check(|v| v.as_int() >= Some(0)),
                ),
                (
                    "max",
                    Par::new(ParamType::Int, "Maximum number of outputs, -1 for unlimited.")
                        .with_default("-1"),
                ),
            ]),
        }
    }
}

/// Upper bound on what `repeat` may produce.
const MAX_REPEATED_ITEMS: usize = 100_000;

#[async_trait]
impl Pipe for Repeat {
    async fn apply(&self, items: Vec<String>, args: &EvaluatedArguments) -> Result<Vec<String>> {
        let times = args.int("times")? as usize;
        let max = args.int("max")?;
        let mut count = items.len().checked_mul(times);
        if max >= 0 {
            let max = max as usize;
            count = Some(count.map_or(max, |count| count.min(max)));
        }
        match count {
            Some(count) if count <= MAX_REPEATED_ITEMS => {
                Ok(items.iter().cloned().cycle().take(count).collect())
            }
            _ => Err(ScriptError::Argument(format!(
                "Refusing to repeat {} items {times} times, that is over {MAX_REPEATED_ITEMS} items.",
                items.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::ArgValue;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn case_pipes() {
        let args = EvaluatedArguments::new();
        assert_eq!(Upper::new().apply(strs(&["aB"]), &args).await.unwrap(), strs(&["AB"]));
        assert_eq!(Lower::new().apply(strs(&["aB"]), &args).await.unwrap(), strs(&["ab"]));
    }

    #[tokio::test]
    async fn split_honours_limit() {
        let mut args = EvaluatedArguments::new();
        args.insert("on", ArgValue::Regex(regex::Regex::new(r",\s*").unwrap()));
        args.insert("lim", ArgValue::Int(0));
        let out = Split::new().apply(strs(&["a, b,c"]), &args).await.unwrap();
        assert_eq!(out, strs(&["a", "b", "c"]));

        args.insert("lim", ArgValue::Int(1));
        let out = Split::new().apply(strs(&["a, b,c"]), &args).await.unwrap();
        assert_eq!(out, strs(&["a", "b,c"]));
    }

    #[tokio::test]
    async fn repeat_truncates_to_max() {
        let mut args = EvaluatedArguments::new();
        args.insert("times", ArgValue::Int(3));
        args.insert("max", ArgValue::Int(-1));
        let out = Repeat::new().apply(strs(&["a", "b"]), &args).await.unwrap();
        assert_eq!(out, strs(&["a", "b", "a", "b", "a", "b"]));

        args.insert("max", ArgValue::Int(3));
        let out = Repeat::new().apply(strs(&["a", "b"]), &args).await.unwrap();
        assert_eq!(out, strs(&["a", "b", "a"]));
    }

    #[tokio::test]
    async fn repeat_refuses_huge_outputs() {
        let mut args = EvaluatedArguments::new();
        args.insert("times", ArgValue::Int(99_999_999_999));
        args.insert("max", ArgValue::Int(-1));
        let err = Repeat::new().apply(strs(&["a"]), &args).await.unwrap_err();
        assert!(matches!(err, ScriptError::Argument(_)));

        args.insert("times", ArgValue::Int(i64::MAX));
        let err = Repeat::new().apply(strs(&["a", "b"]), &args).await.unwrap_err();
        assert!(err.to_string().contains("Refusing to repeat 2 items"));

        args.insert("max", ArgValue::Int(2));
        let out = Repeat::new().apply(strs(&["a"]), &args).await.unwrap();
        assert_eq!(out, strs(&["a", "a"]));
    }

    #[tokio::test]
    async fn join_and_reverse() {
        let mut args = EvaluatedArguments::new();
        args.insert("s", ArgValue::Str("-".into()));
        let out = Join::new().apply(strs(&["a", "b"]), &args).await.unwrap();
        assert_eq!(out, strs(&["a-b"]));
        let out = Reverse::new()
            .apply(strs(&["a", "b"]), &EvaluatedArguments::new())
            .await
            .unwrap();
        assert_eq!(out, strs(&["b", "a"]));
    }
}
