use async_trait::async_trait;
use irctl_protocol::{
    CommandClass, CommandDone, ControlError, ControlResult, InboundCommand, codes,
};
use serde_json::Value;

use crate::InstrumentRuntime;
use crate::registry::{CommandContext, CommandHandler};

/// Reports instrument mode, exposure progress, pipeline and safety state.
pub struct GetStatusHandler;

#[async_trait]
impl CommandHandler for GetStatusHandler {
    fn command_type(&self) -> &'static str {
        "get_status"
    }

    fn class(&self) -> CommandClass {
        CommandClass::Interrupt
    }

    fn acknowledge_time(
        &self,
        _command: &InboundCommand,
        runtime: &InstrumentRuntime,
    ) -> ControlResult<u64> {
        Ok(runtime.config().acks.min_ms)
    }

    async fn execute(&self, ctx: &CommandContext) -> ControlResult<CommandDone> {
        let runtime = ctx.runtime();
        let snapshot = serde_json::to_value(runtime.status().snapshot())
            .map_err(|e| ControlError::command(codes::STATUS, format!("status snapshot: {e}")))?;
        let Value::Object(fields) = snapshot else {
            return Err(ControlError::command(codes::STATUS, "status snapshot is not an object"));
        };

        let mut done = CommandDone::success(ctx.command_id().clone());
        done.fields = fields;
        let safety = runtime
            .safety_state()
            .map_or(Value::Null, |state| Value::String(state.to_string()));
        Ok(done
            .with_field("queue_depth", runtime.correlator().queue_depth())
            .with_field("link_running", runtime.link().is_running())
            .with_field("safety_state", safety))
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{Harness, client};
    use anyhow::Result;
    use serde_json::json;

    #[tokio::test]
    async fn status_reports_mode_and_collaborators() -> Result<()> {
        let harness = Harness::start().await?;
        harness.runtime.status().configured("J-band");
        let (mut client, _session) = client(&harness.dispatcher);

        client.send(r#"{"id":"s1","type":"get_status"}"#).await?;
        let done = client.done_skipping_acks().await?;
        assert!(done.successful);
        assert_eq!(done.fields.get("mode"), Some(&json!("idle")));
        assert_eq!(done.fields.get("config_name"), Some(&json!("J-band")));
        assert_eq!(done.fields.get("queue_depth"), Some(&json!(0)));
        assert_eq!(done.fields.get("link_running"), Some(&json!(true)));
        assert_eq!(done.fields.get("safety_state"), Some(&json!(null)));
        Ok(())
    }
}
