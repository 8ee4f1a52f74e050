//! A single command instance and its lifecycle.
//!
//! Every mutation checks the transition graph, mints the PATCH body
//! describing the delta, and enqueues it on the per-command upload queue.
//! Progress and results are validated against the definition's schemas
//! before any state changes.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::commands::catalog::CommandDefinition;
use crate::commands::schema::PropertySchema;
use crate::commands::{CommandOrigin, CommandState};
use crate::error::{domain, Error, Result};
use std::sync::Arc;

/// One pending PATCH for a command.
#[derive(Debug, Clone)]
pub struct CommandUpdate {
    pub command_id: String,
    pub body: Value,
    pub terminal: bool,
}

struct InstanceState {
    state: CommandState,
    progress: Option<Value>,
    results: Option<Value>,
    error: Option<Value>,
}

pub struct CommandInstance {
    id: String,
    definition: Arc<CommandDefinition>,
    origin: CommandOrigin,
    parameters: Value,
    created_ms: u64,
    inner: RwLock<InstanceState>,
    /// Cloud-origin commands report deltas here; local commands have none.
    updates: Option<UnboundedSender<CommandUpdate>>,
}

impl CommandInstance {
    pub fn new(
        id: impl Into<String>,
        definition: Arc<CommandDefinition>,
        parameters: Value,
        origin: CommandOrigin,
        updates: Option<UnboundedSender<CommandUpdate>>,
    ) -> Self {
        CommandInstance {
            id: id.into(),
            definition,
            origin,
            parameters,
            created_ms: now_ms(),
            inner: RwLock::new(InstanceState {
                state: CommandState::Queued,
                progress: None,
                results: None,
                error: None,
            }),
            updates,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.definition.full_name()
    }

    pub fn definition(&self) -> &Arc<CommandDefinition> {
        &self.definition
    }

    pub fn origin(&self) -> CommandOrigin {
        self.origin
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn state(&self) -> CommandState {
        self.inner.read().state
    }

    /// Acknowledge acceptance by the device application.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.transition(&mut inner, CommandState::InProgress)?;
        self.enqueue(json!({ "state": CommandState::InProgress.as_str() }), false);
        Ok(())
    }

    /// Report progress. Also resumes a paused command.
    pub fn set_progress(&self, progress: Value) -> Result<()> {
        validate_block(self.definition.progress.as_ref(), &progress, "progress")?;
        let mut inner = self.inner.write();
        if !matches!(inner.state, CommandState::InProgress | CommandState::Paused) {
            return Err(invalid_state(inner.state, "set progress"));
        }
        self.transition(&mut inner, CommandState::InProgress)?;
        inner.progress = Some(progress.clone());
        self.enqueue(
            json!({
                "state": CommandState::InProgress.as_str(),
                "progress": progress,
            }),
            false,
        );
        Ok(())
    }

    /// Finish successfully; results may be set only here.
    pub fn complete(&self, results: Value) -> Result<()> {
        validate_block(self.definition.results.as_ref(), &results, "results")?;
        let mut inner = self.inner.write();
        self.transition(&mut inner, CommandState::Done)?;
        inner.results = Some(results.clone());
        self.enqueue(
            json!({
                "state": CommandState::Done.as_str(),
                "results": results,
            }),
            true,
        );
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.transition(&mut inner, CommandState::Paused)?;
        self.enqueue(json!({ "state": CommandState::Paused.as_str() }), false);
        Ok(())
    }

    /// Fail the command from the device application.
    pub fn abort(&self, error: Option<&Error>) -> Result<()> {
        let mut inner = self.inner.write();
        self.transition(&mut inner, CommandState::Aborted)?;
        let mut body = json!({ "state": CommandState::Aborted.as_str() });
        if let Some(error) = error {
            let payload = error_payload(error);
            inner.error = Some(payload.clone());
            body["error"] = payload;
        }
        self.enqueue(body, true);
        Ok(())
    }

    pub fn cancel(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.transition(&mut inner, CommandState::Cancelled)?;
        self.enqueue(json!({ "state": CommandState::Cancelled.as_str() }), true);
        Ok(())
    }

    /// Mark the command failed (retryable per the transition graph).
    pub fn fail(&self, error: &Error) -> Result<()> {
        let mut inner = self.inner.write();
        // Rejected-at-validation commands go straight from queued to error.
        if inner.state == CommandState::Queued {
            inner.state = CommandState::Error;
        } else {
            self.transition(&mut inner, CommandState::Error)?;
        }
        let payload = error_payload(error);
        inner.error = Some(payload.clone());
        self.enqueue(
            json!({
                "state": CommandState::Error.as_str(),
                "error": payload,
            }),
            false,
        );
        Ok(())
    }

    /// Expire a command that was never picked up.
    pub fn expire(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.transition(&mut inner, CommandState::Expired)?;
        self.enqueue(json!({ "state": CommandState::Expired.as_str() }), true);
        Ok(())
    }

    /// Wire representation for local status queries.
    pub fn to_json(&self) -> Value {
        let inner = self.inner.read();
        let mut out = json!({
            "id": self.id,
            "name": self.name(),
            "parameters": self.parameters,
            "state": inner.state.as_str(),
            "origin": self.origin.as_str(),
            "creationTimeMs": self.created_ms,
        });
        if let Some(progress) = &inner.progress {
            out["progress"] = progress.clone();
        }
        if let Some(results) = &inner.results {
            out["results"] = results.clone();
        }
        if let Some(error) = &inner.error {
            out["error"] = error.clone();
        }
        out
    }

    fn transition(&self, inner: &mut InstanceState, to: CommandState) -> Result<()> {
        if inner.state == to {
            return Ok(());
        }
        if !inner.state.can_transition(to) {
            return Err(invalid_state(inner.state, to.as_str()));
        }
        debug!(target: "commands", id = %self.id, from = %inner.state, to = %to, "command transition");
        inner.state = to;
        Ok(())
    }

    fn enqueue(&self, body: Value, terminal: bool) {
        if let Some(updates) = &self.updates {
            // A closed channel means the uploader is gone; nothing to do.
            let _ = updates.send(CommandUpdate {
                command_id: self.id.clone(),
                body,
                terminal,
            });
        }
    }
}

fn invalid_state(state: CommandState, action: &str) -> Error {
    Error::new(
        domain::GCD,
        "invalid_state",
        format!("cannot {action} from state '{state}'"),
    )
}

fn error_payload(error: &Error) -> Value {
    json!({
        "code": error.code(),
        "message": error.message(),
    })
}

/// Progress/results blocks validate against their schema; commands that
/// declare none accept only an empty object.
fn validate_block(schema: Option<&PropertySchema>, value: &Value, what: &str) -> Result<()> {
    match schema {
        Some(schema) => schema.validate(value),
        None => {
            if value.as_object().is_some_and(|m| m.is_empty()) {
                Ok(())
            } else {
                Err(Error::new(
                    domain::GCD,
                    "unknown_property",
                    format!("command declares no {what} schema"),
                ))
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
