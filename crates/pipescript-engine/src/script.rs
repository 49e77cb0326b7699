//! Complete scripts: an origin followed by a pipeline, executed with their
//! side effects (spouts, printing, remembering the output).

use std::fmt;
use std::sync::Arc;

use tracing::Instrument;

use pipescript_grammar::split_origin;
use pipescript_types::{ErrorLog, ItemScope, OriginKind, Result};

use crate::context::{Context, Runtime};
use crate::pipeline::{Pipeline, PipelineOutput};
use crate::spout_state::SpoutState;
use crate::templated::TemplatedString;

#[derive(Debug)]
pub struct ExecutableScript {
    pub source: String,
    origin: String,
    pipeline: Pipeline,
    static_errors: ErrorLog,
}

impl ExecutableScript {
    fn parse(script: &str, rt: &Runtime) -> Self {
        let (origin, rest) = split_origin(script);
        let (_, origin_errors) = TemplatedString::parse_origin(&origin, rt);
        let pipeline = Pipeline::parse(&rest, rt);

        let mut static_errors = ErrorLog::new();
        static_errors.extend_in(&origin_errors, "script origin");
        static_errors.extend(&pipeline.parser_errors);

        Self {
            source: script.to_string(),
            origin,
            pipeline,
            static_errors,
        }
    }

    /// Parse `script`, reusing the runtime's cached parse if there is one.
    pub fn from_string(script: &str, rt: &Runtime) -> Arc<Self> {
        if let Some(parsed) = rt.cached_script(script) {
            return parsed;
        }
        let parsed = Arc::new(Self::parse(script, rt));
        rt.cache_script(script, parsed.clone());
        parsed
    }

    /// Errors knowable without executing anything.
    pub fn get_static_errors(&self) -> &ErrorLog {
        &self.static_errors
    }

    /// Run the script and return its values, errors and encountered spouts,
    /// leaving every side effect to the caller.
    pub async fn execute_without_side_effects(
        &self,
        ctx: &Context,
        scope: Option<&ItemScope>,
    ) -> PipelineOutput {
        let mut errors = ErrorLog::new();
        let (values, origin_errors) =
            Box::pin(TemplatedString::evaluate_origin(&self.origin, ctx, scope)).await;
        errors.extend_in(&origin_errors, "script origin");
        let Some(values) = values.filter(|_| !errors.is_terminal()) else {
            return (None, errors, SpoutState::new());
        };

        let (values, pipe_errors, spouts) = self.pipeline.apply(values, ctx, scope).await;
        errors.extend(&pipe_errors);
        (values.filter(|_| !errors.is_terminal()), errors, spouts)
    }

    /// Execute the script and carry out its side effects, reporting any
    /// errors or warnings through the context's sink.
    pub async fn execute(&self, ctx: &Context, scope: Option<&ItemScope>) -> Result<()> {
        let span = tracing::info_span!(
            "script",
            execution_id = %ctx.execution_id,
            origin = %ctx.origin.name,
        );
        async {
            let name = ctx.origin.name.as_str();
            let result: Result<()> = async {
                let (values, mut errors, spouts) = self.execute_without_side_effects(ctx, scope).await;
                if let Some(values) = values.filter(|_| !errors.is_terminal()) {
                    self.perform_side_effects(ctx, values, spouts, &mut errors).await?;
                }
                if errors.is_terminal() {
                    tracing::info!("Script execution halted due to error");
                }
                if !errors.is_empty() {
                    ctx.sink.send_error_log(&errors, name).await?;
                }
                Ok(())
            }
            .await;

            if let Err(e) = &result {
                tracing::error!(error = %e, "Script execution halted unexpectedly");
                let mut errors = ErrorLog::new();
                errors.log(format!("🛑 **Unexpected pipeline error:**\n {}: {e}", e.kind()), true);
                let _ = ctx.sink.send_error_log(&errors, name).await;
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Remember the output, run every encountered spout and print if needed.
    pub async fn perform_side_effects(
        &self,
        ctx: &Context,
        values: Vec<String>,
        mut spouts: SpoutState,
        errors: &mut ErrorLog,
    ) -> Result<()> {
        if ctx.origin.kind == OriginKind::Direct {
            if let Some(channel) = &ctx.channel {
                ctx.runtime.set_previous_output(channel, values.clone());
            }
        }

        let print = !spouts.anything() || spouts.has_spout("print");
        for call in std::mem::take(&mut spouts.callbacks) {
            let name = call.spout.name().to_string();
            if let Err(e) = call.spout.perform(ctx, &[(call.values, call.args)]).await {
                errors.log(format!("Failed to execute spout `{name}`:\n\t{}: {e}", e.kind()), true);
                return Ok(());
            }
        }
        for (spout, calls) in std::mem::take(&mut spouts.aggregated) {
            if let Err(e) = spout.perform(ctx, &calls).await {
                errors.log(format!("Failed to execute spout `{}`:\n\t{}: {e}", spout.name(), e.kind()), true);
                return Ok(());
            }
        }

        if print {
            spouts.print_values.push(values);
            ctx.sink.send_text(&print_table(&spouts.print_values)).await?;
        }
        Ok(())
    }
}

impl fmt::Display for ExecutableScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.origin)?;
        let pipeline = self.pipeline.to_string();
        if !pipeline.is_empty() {
            write!(f, " > {pipeline}")?;
        }
        Ok(())
    }
}

/// Lay out printed columns side by side, with arrows leading from each
/// value to the one next to it.
pub fn print_table(columns: &[Vec<String>]) -> String {
    if let [column] = columns {
        match column.as_slice() {
            [cell] if cell.trim().is_empty() => return "`empty string`".into(),
            [cell] => return cell.clone(),
            [] => return "`no output`".into(),
            _ => {}
        }
    }

    let width = |s: &str| s.chars().count();
    let row_count = columns.iter().map(Vec::len).max().unwrap_or(0);
    let mut rows = vec![String::new(); row_count];
    for (c, column) in columns.iter().enumerate() {
        if column.is_empty() {
            continue;
        }
        let col_width = column.iter().map(|v| width(v)).max().unwrap_or(0);
        for (r, row) in rows.iter_mut().enumerate() {
            let cell = column.get(r).map(String::as_str).unwrap_or("");
            row.push_str(cell);
            row.push_str(&" ".repeat(col_width - width(cell)));
            let continues = columns.get(c + 1).is_some_and(|next| r < next.len());
            row.push_str(if continues { " → " } else { "   " });
        }
    }

    let body: Vec<&str> = rows.iter().map(|r| r.trim_end()).collect();
    format!("```\n{}\n```", body.join("\n"))
}
