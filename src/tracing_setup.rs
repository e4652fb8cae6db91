//! Structured logging setup driven by the `log:` config section.
use std::{fs::OpenOptions, sync::Arc};

use eyre::{Result, WrapErr};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::models::{LogConfig, LogFormat, ServerMode};

/// Initialize logging from the configuration. `RUST_LOG` takes precedence
/// over the configured level when set; debug mode lowers the default floor.
pub fn init_from_config(log: &LogConfig, mode: ServerMode) -> Result<()> {
    let default_level = match mode {
        ServerMode::Debug if log.level == "info" => "debug".to_string(),
        _ => log.level.clone(),
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_level))
        .wrap_err_with(|| format!("invalid log level '{default_level}'"))?;

    let layer = match log.output.as_str() {
        "stdout" => build_fmt_layer(log.format, std::io::stdout),
        "stderr" => build_fmt_layer(log.format, std::io::stderr),
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .wrap_err_with(|| format!("failed to open log output '{path}'"))?;
            build_fmt_layer(log.format, Arc::new(file))
        }
    };

    Registry::default().with(env_filter).with(layer).init();
    Ok(())
}

fn build_fmt_layer<S, W>(format: LogFormat, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true);

    match format {
        LogFormat::Json => layer
            .json()
            .with_current_span(false)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => layer.boxed(),
    }
}

/// Create a request-scoped tracing span
pub fn create_request_span(
    method: &str,
    path: &str,
    request_id: &str,
    client_ip: Option<&str>,
    user_agent: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        client.ip = client_ip,
        http.user_agent = user_agent,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}
