use async_trait::async_trait;

use pipescript_types::{Result, ScriptError};

use crate::context::Context;
use crate::registry::{Pipeoid, Source};
use crate::signature::{EvaluatedArguments, Par, ParamType, Signature};

/// `{arg name}`: an argument bound by a macro call or an event trigger.
pub struct Arg {
    signature: Signature,
}

impl Arg {
    pub fn new() -> Self {
        Self {
            signature: Signature::new([
                ("name", Par::new(ParamType::Str, "The argument's name")),
                (
                    "default",
                    Par::new(ParamType::Str, "Used if the argument is not bound").optional(),
                ),
            ]),
        }
    }
}

impl Pipeoid for Arg {
    fn name(&self) -> &str {
        "arg"
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn doc(&self) -> &str {
        "The value of a macro or event argument."
    }
}

#[async_trait]
impl Source for Arg {
    async fn generate(&self, ctx: &Context, args: &EvaluatedArguments) -> Result<Vec<String>> {
        let name = args.str("name")?;
        let default = args.get("default").and_then(|d| d.as_str());
        let bound = ctx.arguments.as_ref().and_then(|a| a.get(name));
        match (bound, default) {
            (Some(value), _) => Ok(vec![value.clone()]),
            (None, Some(default)) => Ok(vec![default.to_string()]),
            (None, None) if ctx.arguments.is_none() => Err(ScriptError::Context(
                "No arguments are bound in this context.".into(),
            )),
            (None, None) => Err(ScriptError::Context(format!(
                "No argument named `{name}`."
            ))),
        }
    }
}

/// `{output}`: everything the previous direct script in this channel produced.
pub struct Output {
    signature: Signature,
}

impl Output {
    pub fn new() -> Self {
        Self {
            signature: Signature::empty(),
        }
    }
}

impl Pipeoid for Output {
    fn name(&self) -> &str {
        "output"
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn doc(&self) -> &str {
        "The entire output of the previous script that ran in this channel."
    }
}

#[async_trait]
impl Source for Output {
    fn depletable(&self) -> bool {
        true
    }

    async fn generate(&self, ctx: &Context, _: &EvaluatedArguments) -> Result<Vec<String>> {
        let channel = ctx.channel.as_deref().unwrap_or_default();
        Ok(ctx.runtime.previous_output(channel))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::context::test_runtime;
    use crate::signature::ArgValue;

    fn named(name: &str) -> EvaluatedArguments {
        let mut args = EvaluatedArguments::new();
        args.insert("name", ArgValue::Str(name.into()));
        args.insert("default", ArgValue::None);
        args
    }

    #[tokio::test]
    async fn arg_reads_bound_arguments() {
        let ctx = Context::for_tests(test_runtime())
            .with_arguments(BTreeMap::from([("who".to_string(), "world".to_string())]));
        let out = Arg::new().generate(&ctx, &named("who")).await.unwrap();
        assert_eq!(out, vec!["world"]);

        let err = Arg::new().generate(&ctx, &named("what")).await.unwrap_err();
        assert_eq!(err.to_string(), "No argument named `what`.");

        let mut args = named("what");
        args.insert("default", ArgValue::Str("fallback".into()));
        let out = Arg::new().generate(&ctx, &args).await.unwrap();
        assert_eq!(out, vec!["fallback"]);
    }

    #[tokio::test]
    async fn arg_without_arguments_errors() {
        let ctx = Context::for_tests(test_runtime());
        let err = Arg::new().generate(&ctx, &named("x")).await.unwrap_err();
        assert_eq!(err.kind(), "ContextError");
    }

    #[tokio::test]
    async fn output_reads_the_channel() {
        let rt = test_runtime();
        rt.set_previous_output("here", vec!["a".into(), "b".into()]);
        let ctx = Context::for_tests(rt).with_channel("here");
        let out = Output::new()
            .generate(&ctx, &EvaluatedArguments::new())
            .await
            .unwrap();
        assert_eq!(out, vec!["a", "b"]);
    }
}
