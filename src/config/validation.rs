use std::{collections::BTreeMap, net::SocketAddr};

use crate::config::models::{
    CertificateConfig, EntryPointConfig, GatewayConfig, ProvidersConfig, ServersTransportConfig,
    Transport,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
///
/// Only the static part of a document is validated up front. Routers,
/// services and middlewares are checked while building and their errors
/// end up in the runtime status instead.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Entry points '{first}' and '{second}' both listen on {transport} {address}")]
    DuplicateAddress {
        first: String,
        second: String,
        transport: &'static str,
        address: SocketAddr,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the static part of the configuration.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let errors = Self::collect(config);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Every problem found, in document order.
    pub fn collect(config: &GatewayConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.entry_points.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "entry_points".to_string(),
            });
        }
        for (name, entry_point) in &config.entry_points {
            errors.extend(Self::validate_entry_point(name, entry_point));
        }
        errors.extend(Self::check_duplicate_addresses(&config.entry_points));

        if tracing_subscriber::EnvFilter::try_new(&config.log.level).is_err() {
            errors.push(ValidationError::InvalidField {
                field: "log.level".to_string(),
                message: format!("'{}' is not a valid log filter", config.log.level),
            });
        }
        errors.extend(Self::validate_providers(&config.providers));
        errors.extend(Self::validate_servers_transport(&config.servers_transport));

        for (i, certificate) in config.tls.certificates.iter().enumerate() {
            if let Err(e) = Self::validate_certificate(i, certificate) {
                errors.push(e);
            }
        }
        if config.tls.certificates.iter().filter(|c| c.default).count() > 1 {
            errors.push(ValidationError::InvalidTls {
                message: "at most one certificate can be the default".to_string(),
            });
        }

        errors
    }

    fn validate_entry_point(name: &str, entry_point: &EntryPointConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Err(e) = Self::validate_listen_address(&entry_point.address) {
            errors.push(e);
        }
        if entry_point.transport == Transport::Tcp && entry_point.client_hello_timeout_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("entry_points.{name}.client_hello_timeout_ms"),
                message: "Must be greater than 0".to_string(),
            });
        }
        if entry_point.transport == Transport::Udp && entry_point.udp_session_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("entry_points.{name}.udp_session_timeout_secs"),
                message: "Must be greater than 0".to_string(),
            });
        }
        errors
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Two entry points may share a port only across transports.
    fn check_duplicate_addresses(
        entry_points: &BTreeMap<String, EntryPointConfig>,
    ) -> Vec<ValidationError> {
        let mut seen: BTreeMap<(Transport, SocketAddr), &str> = BTreeMap::new();
        let mut errors = Vec::new();
        for (name, entry_point) in entry_points {
            let Ok(address) = entry_point.address.parse::<SocketAddr>() else {
                continue;
            };
            // Port 0 asks the OS for a fresh port each time.
            if address.port() == 0 {
                continue;
            }
            let key = (entry_point.transport, address);
            if let Some(first) = seen.get(&key) {
                errors.push(ValidationError::DuplicateAddress {
                    first: first.to_string(),
                    second: name.clone(),
                    transport: match entry_point.transport {
                        Transport::Tcp => "tcp",
                        Transport::Udp => "udp",
                    },
                    address,
                });
            } else {
                seen.insert(key, name);
            }
        }
        errors
    }

    fn validate_providers(providers: &ProvidersConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if providers.poll_interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "providers.poll_interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn validate_servers_transport(transport: &ServersTransportConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if transport.dial_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "servers_transport.dial_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        for path in &transport.root_cas {
            if !path.exists() {
                errors.push(ValidationError::InvalidTls {
                    message: format!("Root CA file does not exist: {}", path.display()),
                });
            }
        }
        errors
    }

    fn validate_certificate(index: usize, certificate: &CertificateConfig) -> ValidationResult<()> {
        for (kind, path) in [
            ("Certificate", &certificate.cert_file),
            ("Private key", &certificate.key_file),
        ] {
            if !path.exists() {
                return Err(ValidationError::InvalidTls {
                    message: format!(
                        "{kind} file of certificate {} does not exist: {}",
                        index + 1,
                        path.display()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn minimal_valid_config() -> GatewayConfig {
        GatewayConfig {
            entry_points: BTreeMap::from([
                ("web".to_string(), EntryPointConfig::tcp("127.0.0.1:8080")),
                ("dns".to_string(), EntryPointConfig::udp("127.0.0.1:8080")),
            ]),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(ServerConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_requires_entry_points() {
        let errors = ServerConfigValidator::collect(&GatewayConfig::default());
        assert!(matches!(&errors[..], [ValidationError::MissingField { field }] if field == "entry_points"));
    }

    #[test]
    fn validate_rejects_bad_addresses_and_timeouts() {
        let mut config = minimal_valid_config();
        config
            .entry_points
            .insert("bad".to_string(), EntryPointConfig::tcp("localhost"));
        let mut slow = EntryPointConfig::tcp("127.0.0.1:9000");
        slow.client_hello_timeout_ms = 0;
        config.entry_points.insert("slow".to_string(), slow);

        let errors = ServerConfigValidator::collect(&config);
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], ValidationError::InvalidListenAddress { .. }));
    }

    #[test]
    fn validate_rejects_duplicate_listeners_per_transport() {
        let mut config = minimal_valid_config();
        config
            .entry_points
            .insert("web2".to_string(), EntryPointConfig::tcp("127.0.0.1:8080"));
        let errors = ServerConfigValidator::collect(&config);
        assert!(matches!(
            &errors[..],
            [ValidationError::DuplicateAddress { first, second, .. }] if first == "web" && second == "web2"
        ));
    }

    #[test]
    fn validate_rejects_missing_certificate_files() {
        let mut config = minimal_valid_config();
        config.tls.certificates.push(CertificateConfig {
            cert_file: PathBuf::from("/nonexistent/cert.pem"),
            key_file: PathBuf::from("/nonexistent/key.pem"),
            domains: vec![],
            default: false,
        });
        let err = ServerConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("cert.pem"));
    }

    #[test]
    fn validate_checks_the_servers_transport() {
        let mut config = minimal_valid_config();
        config.servers_transport.dial_timeout_secs = 0;
        config.servers_transport.root_cas = vec![PathBuf::from("/nonexistent/ca.pem")];
        let errors = ServerConfigValidator::collect(&config);
        assert_eq!(errors.len(), 2);
        assert!(matches!(
            &errors[0],
            ValidationError::InvalidField { field, .. } if field == "servers_transport.dial_timeout_secs"
        ));
        assert!(matches!(errors[1], ValidationError::InvalidTls { .. }));
    }

    #[test]
    fn validate_rejects_bad_log_filter() {
        let mut config = minimal_valid_config();
        config.log.level = "info,hyper=loud".to_string();
        assert_eq!(ServerConfigValidator::collect(&config).len(), 1);
    }
}
