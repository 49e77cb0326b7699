use async_trait::async_trait;

use pipescript_types::Result;

use crate::context::Context;
use crate::registry::{Pipeoid, Spout};
use crate::signature::{EvaluatedArguments, Signature};

/// Marks values to be shown in the output table. The table itself is sent by
/// the script once every other spout has run.
pub struct Print {
    signature: Signature,
}

impl Print {
    pub fn new() -> Self {
        Self {
            signature: Signature::empty(),
        }
    }
}

impl Pipeoid for Print {
    fn name(&self) -> &str {
        "print"
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn doc(&self) -> &str {
        "Appends the values to the output table."
    }
}

#[async_trait]
impl Spout for Print {
    async fn perform(&self, _: &Context, _: &[(Vec<String>, EvaluatedArguments)]) -> Result<()> {
        Ok(())
    }
}

/// Sends the values as a plain message.
pub struct Say {
    signature: Signature,
}

impl Say {
    pub fn new() -> Self {
        Self {
            signature: Signature::empty(),
        }
    }
}

impl Pipeoid for Say {
    fn name(&self) -> &str {
        "say"
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn doc(&self) -> &str {
        "Sends the values as a message, one per line."
    }
}

#[async_trait]
impl Spout for Say {
    async fn perform(&self, ctx: &Context, calls: &[(Vec<String>, EvaluatedArguments)]) -> Result<()> {
        for (values, _) in calls {
            ctx.sink.send_text(&values.join("\n")).await?;
        }
        Ok(())
    }
}
