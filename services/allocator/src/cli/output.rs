//! Output formatting and error display.

use std::str::FromStr;

use colored::Colorize;
use devlease_allocator::{AllocError, ProxyError, SessionDescriptor};
use devlease_farm_api::ApiError;

/// How `allocate` prints the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// `KEY=value` lines, suitable for sourcing.
    #[default]
    Env,
    /// JSON object.
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "env" => Ok(Self::Env),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown format `{}` (expected env or json)", other)),
        }
    }
}

/// Print the session descriptor.
pub fn print_descriptor(descriptor: &SessionDescriptor, format: OutputFormat) {
    match format {
        OutputFormat::Env => {
            for (key, value) in descriptor.env_vars() {
                println!("{}={}", key, value);
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(descriptor).unwrap_or_else(|_| "{}".into());
            println!("{}", json);
        }
    }
}

/// Print a success message.
pub fn print_success(message: &str) {
    eprintln!("{} {}", "Success:".green().bold(), message);
}

/// Exit code for an error: 130 for cancellation, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<AllocError>() {
        Some(e) if e.is_cancelled() => 130,
        _ => 1,
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    let hint = match err.downcast_ref::<AllocError>() {
        Some(AllocError::Auth(_)) => {
            Some("Hint: Check --endpoint, --username and --password (or DEVLEASE_*).")
        }
        Some(AllocError::JobNotFound(_)) => {
            Some("Hint: Set DEVLEASE_FLASH_PROJECT to the name of the flash project.")
        }
        Some(AllocError::FlashingFailed { .. }) => {
            Some("Hint: Check the flash logs in the workspace and that the build URL is reachable.")
        }
        Some(AllocError::SessionUnavailable { .. }) => {
            Some("Hint: All matching devices are busy. Retry later or raise DEVLEASE_MAX_RETRIES.")
        }
        Some(AllocError::NoMatchingDevice { .. }) => {
            Some("Hint: No online device matches the filters. Check the label names.")
        }
        Some(AllocError::ProxyDiscovery(ProxyError::Timeout { .. })) => {
            Some("Hint: The farm did not publish device proxies in time.")
        }
        Some(AllocError::Api(ApiError::Network(_))) => {
            Some("Hint: Check your network connection and API endpoint.")
        }
        _ => None,
    };

    if let Some(hint) = hint {
        eprintln!("\n{}", hint.yellow());
    }
}
