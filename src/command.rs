use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde_json::json;

use crate::config::constants;
use crate::error::CommandError;
use crate::scheduler::PollScheduler;
use crate::store::FleetStore;

/// Control commands accepted by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// Immediate firmware halt.
    EmergencyStop,
    /// Pause a running print, or resume a paused one, depending on the
    /// device's current state.
    PauseResume,
    /// Cancel the active print job.
    CancelPrint,
    /// Run the printer's light-switch macro.
    ToggleLight,
    /// Change the local display label. Never leaves this process.
    Rename(String),
}

impl CommandKind {
    /// Whether a successful dispatch changes remote printer state and so
    /// warrants an immediate out-of-cycle reconciliation.
    pub fn is_state_affecting(&self) -> bool {
        matches!(
            self,
            CommandKind::EmergencyStop | CommandKind::PauseResume | CommandKind::CancelPrint
        )
    }

    fn label(&self) -> &'static str {
        match self {
            CommandKind::EmergencyStop => "emergency stop",
            CommandKind::PauseResume => "pause/resume",
            CommandKind::CancelPrint => "cancel print",
            CommandKind::ToggleLight => "toggle light",
            CommandKind::Rename(_) => "rename",
        }
    }
}

/// Fire-and-forget control command dispatch against the Moonraker API.
///
/// Commands are delivered once, with no automatic retry; failures are
/// returned to the caller for notification. The one guaranteed follow-up is
/// that a successful state-affecting command triggers exactly one immediate
/// reconciliation pass, so the record reflects the new state without
/// waiting for the next scheduled tick.
pub struct CommandDispatcher {
    store: FleetStore,
    scheduler: Arc<PollScheduler>,
    client: reqwest::blocking::Client,
}

impl CommandDispatcher {
    pub fn new(store: FleetStore, scheduler: Arc<PollScheduler>) -> Self {
        Self {
            store,
            scheduler,
            client: reqwest::blocking::Client::new(),
        }
    }

    /// Send one command to the device at `address`.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] when the device is unknown, unreachable,
    /// rejects the command, or is in a state the command does not apply to.
    pub fn dispatch(&self, address: &str, command: CommandKind) -> Result<(), CommandError> {
        if !self.store.contains(address) {
            return Err(CommandError::UnknownDevice {
                address: address.to_string(),
            });
        }

        let result = match &command {
            CommandKind::EmergencyStop => self.post(address, "/printer/emergency_stop", None),
            CommandKind::PauseResume => self.pause_or_resume(address),
            CommandKind::CancelPrint => self.post(address, "/printer/print/cancel", None),
            CommandKind::ToggleLight => self.post(
                address,
                "/printer/gcode/script",
                Some(json!({ "script": constants::LIGHT_SWITCH_MACRO })),
            ),
            CommandKind::Rename(name) => {
                self.store.rename(address, name);
                info!("Renamed {} to '{}'", address, name);
                return Ok(());
            }
        };

        match result {
            Ok(()) => {
                info!("Dispatched {} to {}", command.label(), address);
                if command.is_state_affecting() {
                    self.scheduler.poll_now(address);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Command {} for {} failed: {}", command.label(), address, e);
                Err(e)
            }
        }
    }

    /// Decide between pause and resume from the device's current state.
    ///
    /// Mirrors the device-side semantics: only a printing job can be paused
    /// and only a paused one resumed; anything else is an invalid state.
    fn pause_or_resume(&self, address: &str) -> Result<(), CommandError> {
        let state = self.query_print_state(address)?;
        match state.as_str() {
            "printing" => self.post(address, "/printer/print/pause", None),
            "paused" => self.post(address, "/printer/print/resume", None),
            other => Err(CommandError::InvalidState {
                requested_action: "pause/resume".to_string(),
                current_state: other.to_string(),
            }),
        }
    }

    fn query_print_state(&self, address: &str) -> Result<String, CommandError> {
        let response = self
            .client
            .get(format!("{}/printer/objects/query?print_stats", address))
            .timeout(Duration::from_secs(constants::QUERY_TIMEOUT_SECONDS))
            .send()
            .map_err(|e| CommandError::Unreachable {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let data: serde_json::Value =
            response.json().map_err(|e| CommandError::Unreachable {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        Ok(data["result"]["status"]["print_stats"]["state"]
            .as_str()
            .unwrap_or("")
            .to_string())
    }

    /// POST one command endpoint, optionally with a JSON body.
    fn post(
        &self,
        address: &str,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), CommandError> {
        let url = format!("{}{}", address, endpoint);
        let mut request = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(constants::COMMAND_TIMEOUT_SECONDS));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().map_err(|e| CommandError::Unreachable {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(CommandError::Rejected {
                endpoint: url,
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}
