//! Command instance registry, device-application handlers, and the
//! per-command upload queues.
//!
//! Each cloud-origin command gets its own uploader task, so updates for a
//! single command serialize while different commands upload in parallel.
//! A newer update collapses an unacknowledged older one, except that a
//! terminal update is never displaced.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cloud::client::CloudClient;
use crate::cloud::Backoff;
use crate::commands::catalog::CommandDefinition;
use crate::commands::instance::{CommandInstance, CommandUpdate};
use crate::commands::CommandOrigin;
use crate::error::{domain, Error};
use crate::providers::Method;

/// Device-application callback invoked when a command is dispatched.
pub type CommandHandler = Arc<dyn Fn(Arc<CommandInstance>) + Send + Sync>;

/// Registry of live command instances plus their upload plumbing.
pub struct CommandDispatcher {
    client: Arc<CloudClient>,
    instances: RwLock<HashMap<String, Arc<CommandInstance>>>,
    handlers: RwLock<HashMap<String, CommandHandler>>,
}

impl CommandDispatcher {
    pub fn new(client: Arc<CloudClient>) -> Self {
        CommandDispatcher {
            client,
            instances: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the device-application handler for a command name.
    pub fn add_handler(&self, full_name: impl Into<String>, handler: CommandHandler) {
        self.handlers.write().insert(full_name.into(), handler);
    }

    pub fn handler_for(&self, full_name: &str) -> Option<CommandHandler> {
        self.handlers.read().get(full_name).cloned()
    }

    /// Materialize a cloud-issued command with its server-assigned id and
    /// spawn its uploader.
    pub fn create_cloud_instance(
        &self,
        id: impl Into<String>,
        definition: Arc<CommandDefinition>,
        parameters: Value,
    ) -> Arc<CommandInstance> {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let instance = Arc::new(CommandInstance::new(
            id.clone(),
            definition,
            parameters,
            CommandOrigin::Cloud,
            Some(tx),
        ));
        tokio::spawn(upload_worker(self.client.clone(), id.clone(), rx));
        self.instances.write().insert(id, instance.clone());
        instance
    }

    /// Materialize a locally-submitted command. Local commands are not
    /// reported to the cloud.
    pub fn create_local_instance(
        &self,
        definition: Arc<CommandDefinition>,
        parameters: Value,
    ) -> Arc<CommandInstance> {
        let id = Uuid::new_v4().to_string();
        let instance = Arc::new(CommandInstance::new(
            id.clone(),
            definition,
            parameters,
            CommandOrigin::Local,
            None,
        ));
        self.instances.write().insert(id, instance.clone());
        instance
    }

    pub fn find(&self, id: &str) -> Option<Arc<CommandInstance>> {
        self.instances.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<CommandInstance>> {
        self.instances.read().values().cloned().collect()
    }

    /// Dispatch an instance to its registered handler. Returns false when
    /// no handler is registered for the command name.
    pub fn dispatch(&self, instance: &Arc<CommandInstance>) -> bool {
        match self.handler_for(&instance.name()) {
            Some(handler) => {
                handler(instance.clone());
                true
            }
            None => false,
        }
    }
}

/// Collapse policy for the per-command queue: a terminal update is sticky.
fn collapse(older: CommandUpdate, newer: CommandUpdate) -> CommandUpdate {
    if older.terminal {
        older
    } else {
        newer
    }
}

/// 4xx responses other than auth failures are not retryable; the update is
/// dropped and logged. Everything else retries with backoff.
fn is_permanent(error: &Error) -> bool {
    if error.domain() != domain::GCD_SERVER {
        return false;
    }
    match error.code().parse::<u16>() {
        Ok(status) => (400..500).contains(&status) && status != 401,
        // A server-level semantic code means the request itself was bad.
        Err(_) => true,
    }
}

async fn upload_worker(
    client: Arc<CloudClient>,
    command_id: String,
    mut rx: mpsc::UnboundedReceiver<CommandUpdate>,
) {
    let mut backoff = Backoff::new();
    'updates: while let Some(mut update) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            update = collapse(update, newer);
        }
        loop {
            let url = client.service_url(&format!("commands/{command_id}"), &[]);
            match client
                .authorized_request(Method::Patch, &url, Some(&update.body))
                .await
            {
                Ok(_) => {
                    debug!(target: "commands", id = %command_id, "command update acknowledged");
                    backoff.reset();
                    continue 'updates;
                }
                Err(err) if is_permanent(&err) => {
                    warn!(target: "commands", id = %command_id, error = %err, "dropping rejected command update");
                    backoff.reset();
                    continue 'updates;
                }
                Err(err) => {
                    debug!(target: "commands", id = %command_id, error = %err, "command update failed, will retry");
                    tokio::time::sleep(backoff.next_delay()).await;
                    while let Ok(newer) = rx.try_recv() {
                        update = collapse(update, newer);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collapse_preserves_terminal() {
        let terminal = CommandUpdate {
            command_id: "1".into(),
            body: json!({"state": "done"}),
            terminal: true,
        };
        let late = CommandUpdate {
            command_id: "1".into(),
            body: json!({"state": "inProgress"}),
            terminal: false,
        };
        let kept = collapse(terminal.clone(), late);
        assert_eq!(kept.body, terminal.body);

        let older = CommandUpdate {
            command_id: "1".into(),
            body: json!({"state": "inProgress", "progress": {"p": 1}}),
            terminal: false,
        };
        let newer = CommandUpdate {
            command_id: "1".into(),
            body: json!({"state": "inProgress", "progress": {"p": 2}}),
            terminal: false,
        };
        let kept = collapse(older, newer.clone());
        assert_eq!(kept.body, newer.body);
    }

    #[test]
    fn test_permanent_error_classification() {
        assert!(is_permanent(&Error::new(domain::GCD_SERVER, "404", "gone")));
        assert!(is_permanent(&Error::new(domain::GCD_SERVER, "invalid_argument", "bad")));
        assert!(!is_permanent(&Error::new(domain::GCD_SERVER, "401", "auth")));
        assert!(!is_permanent(&Error::new(domain::GCD_SERVER, "503", "busy")));
        assert!(!is_permanent(&Error::new(domain::NETWORK, "send_failed", "down")));
        assert!(!is_permanent(&Error::new(domain::BUFFET, "deadline_exceeded", "slow")));
    }
}
