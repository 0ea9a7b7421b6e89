use std::fmt;

/// Failure modes of the command dispatch path.
///
/// Command failures are expected and occasional: they are surfaced to the
/// caller for user notification, never retried automatically, and never
/// allowed to halt a device's polling loop.
#[derive(Debug)]
pub enum CommandError {
    /// The target address is not registered in the fleet.
    UnknownDevice { address: String },

    /// The device could not be reached to deliver the command.
    Unreachable { address: String, reason: String },

    /// The device rejected the command with a non-success response.
    Rejected {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// The device is in a state the requested command does not apply to
    /// (e.g. pause/resume while idle).
    InvalidState {
        requested_action: String,
        current_state: String,
    },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::UnknownDevice { address } => {
                write!(f, "No registered printer at '{}'", address)
            }
            CommandError::Unreachable { address, reason } => {
                write!(f, "Failed to reach printer at '{}': {}", address, reason)
            }
            CommandError::Rejected {
                endpoint,
                status,
                message,
            } => {
                write!(
                    f,
                    "Printer rejected command at '{}' (HTTP {}): {}",
                    endpoint, status, message
                )
            }
            CommandError::InvalidState {
                requested_action,
                current_state,
            } => {
                write!(
                    f,
                    "Cannot {} printer in state '{}'",
                    requested_action, current_state
                )
            }
        }
    }
}

impl std::error::Error for CommandError {}
