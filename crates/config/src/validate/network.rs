//! Listener address validation

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::net::ToSocketAddrs;

/// Validate that the listener address resolves to a socket address.
///
/// Host names are accepted when they resolve, matching what the listener
/// itself binds to.
pub fn validate_listener(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let address = &config.listener.address;

    let resolved = address.as_str().to_socket_addrs().and_then(|mut addrs| {
        addrs.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
        })
    });

    match resolved {
        Ok(addr) => {
            if addr.port() == 0 {
                result.add_warning(ValidationWarning::new(format!(
                    "Listener '{}' uses port 0, the OS will pick a random port",
                    address
                )));
            }
        }
        Err(e) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Network,
                format!("Invalid listener address '{}': {}", address, e),
            ));
        }
    }

    result
}
