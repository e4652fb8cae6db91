use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::config::models::{Config, LogConfig, MatchKind, PluginDecl, RouteConfig, ServerConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Route '{route}' references plugin '{plugin}' which is {reason}")]
    UnknownPlugin {
        route: String,
        plugin: String,
        reason: String,
    },

    #[error("Duplicate route name '{name}'")]
    DuplicateRoute { name: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Configuration validator. A configuration that fails here is rejected at
/// startup and aborts a reload, keeping the previous snapshot in service.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire configuration.
    pub fn validate(config: &Config) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(mut server_errors) = Self::validate_server(&config.server) {
            errors.append(&mut server_errors);
        }

        if let Err(mut log_errors) = Self::validate_log(&config.log) {
            errors.append(&mut log_errors);
        }

        let enabled = match Self::validate_plugins(&config.plugins.available) {
            Ok(enabled) => enabled,
            Err((enabled, mut plugin_errors)) => {
                errors.append(&mut plugin_errors);
                enabled
            }
        };

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        } else {
            let mut seen = HashSet::new();
            for route in &config.routes {
                if !seen.insert(route.name.clone()) {
                    errors.push(ValidationError::DuplicateRoute {
                        name: route.name.clone(),
                    });
                }
                if let Err(mut route_errors) = Self::validate_route(route, &enabled) {
                    errors.append(&mut route_errors);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_server(server: &ServerConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if server.port == 0 {
            errors.push(ValidationError::InvalidField {
                field: "server.port".to_string(),
                message: "port must be between 1 and 65535".to_string(),
            });
        }

        for (field, value) in [
            ("server.read_timeout", &server.read_timeout),
            ("server.write_timeout", &server.write_timeout),
            (
                "server.graceful_shutdown_timeout",
                &server.graceful_shutdown_timeout,
            ),
        ] {
            match humantime::parse_duration(value) {
                Ok(parsed) if parsed.is_zero() => errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "duration must be greater than zero".to_string(),
                }),
                Ok(_) => {}
                Err(e) => errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("invalid duration '{value}': {e}"),
                }),
            }
        }

        if server.max_header_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "server.max_header_bytes".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_log(log: &LogConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&log.level.as_str()) {
            errors.push(ValidationError::InvalidField {
                field: "log.level".to_string(),
                message: format!("unknown level '{}', expected one of {LEVELS:?}", log.level),
            });
        }

        if log.output.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "log.output".to_string(),
            });
        }

        for (field, value) in [
            ("log.max_size", log.max_size),
            ("log.max_age", log.max_age),
            ("log.max_backups", log.max_backups),
        ] {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validate available-plugin declarations and return the set of names
    /// that routes are allowed to reference (declared and enabled).
    fn validate_plugins(
        decls: &[PluginDecl],
    ) -> Result<HashSet<String>, (HashSet<String>, Vec<ValidationError>)> {
        let mut errors = Vec::new();
        let mut enabled = HashSet::new();
        let mut seen: HashMap<&str, usize> = HashMap::new();

        for (i, decl) in decls.iter().enumerate() {
            if decl.name.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("plugins.available[{i}].name"),
                });
                continue;
            }
            if decl.order < 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("plugins.available[{i}].order"),
                    message: format!("negative order {}", decl.order),
                });
            }
            if seen.insert(decl.name.as_str(), i).is_some() {
                errors.push(ValidationError::InvalidField {
                    field: format!("plugins.available[{i}].name"),
                    message: format!("duplicate plugin declaration '{}'", decl.name),
                });
            }
            if decl.enabled {
                enabled.insert(decl.name.clone());
            }
        }

        if errors.is_empty() {
            Ok(enabled)
        } else {
            Err((enabled, errors))
        }
    }

    fn validate_route(
        route: &RouteConfig,
        enabled_plugins: &HashSet<String>,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if route.name.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "route.name".to_string(),
            });
        }

        if route.rule.path.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{}' match.path", route.name),
            });
        }

        if route.rule.priority < 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{}' match.priority", route.name),
                message: format!("negative priority {}", route.rule.priority),
            });
        }

        match route.rule.kind {
            MatchKind::Exact | MatchKind::Prefix => {
                if !route.rule.path.starts_with('/') {
                    errors.push(ValidationError::InvalidField {
                        field: format!("route '{}' match.path", route.name),
                        message: "path must start with '/'".to_string(),
                    });
                }
            }
            MatchKind::Regex => {
                if let Err(e) = Regex::new(&route.rule.path) {
                    errors.push(ValidationError::InvalidField {
                        field: format!("route '{}' match.path", route.name),
                        message: format!("invalid regex: {e}"),
                    });
                }
            }
            MatchKind::Wildcard => {
                let translated = crate::core::router::wildcard_to_regex(&route.rule.path);
                if let Err(e) = Regex::new(&translated) {
                    errors.push(ValidationError::InvalidField {
                        field: format!("route '{}' match.path", route.name),
                        message: format!("invalid wildcard pattern: {e}"),
                    });
                }
            }
        }

        if route.target.url.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{}' target.url", route.name),
            });
        } else if !route.target.is_internal() {
            match url::Url::parse(&route.target.url) {
                Ok(url) => {
                    if url.scheme() != "http" && url.scheme() != "https" {
                        errors.push(ValidationError::InvalidField {
                            field: format!("route '{}' target.url", route.name),
                            message: format!(
                                "URL scheme must be 'http' or 'https', got '{}'",
                                url.scheme()
                            ),
                        });
                    }
                    if url.host().is_none() {
                        errors.push(ValidationError::InvalidField {
                            field: format!("route '{}' target.url", route.name),
                            message: "URL must have a valid host".to_string(),
                        });
                    }
                }
                Err(e) => errors.push(ValidationError::InvalidField {
                    field: format!("route '{}' target.url", route.name),
                    message: format!("invalid URL: {e}"),
                }),
            }
        }

        for plugin in &route.plugins {
            if !enabled_plugins.contains(plugin) {
                errors.push(ValidationError::UnknownPlugin {
                    route: route.name.clone(),
                    plugin: plugin.clone(),
                    reason: "not declared in plugins.available or not enabled".to_string(),
                });
            }
        }

        if let Some(response) = &route.response {
            if http::StatusCode::from_u16(response.status).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{}' response.status", route.name),
                    message: format!("invalid HTTP status {}", response.status),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

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
