//! Tracing setup for the orchestration core, adapted from the host
//! project's own tracing bootstrap: a daily-rolling file appender plus an
//! optional OpenTelemetry OTLP layer gated behind the `otel` feature.

use anyhow::Result;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

pub struct Guard {
    #[cfg(feature = "otel")]
    otel: Option<opentelemetry_sdk::trace::TracerProvider>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        tracing::debug!("shutting down tracing");
        #[cfg(feature = "otel")]
        if let Some(provider) = self.otel.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down OpenTelemetry: {e:?}");
            }
        }
    }
}

/// Configures tracing for the process hosting this crate.
///
/// # Errors
///
/// Returns an error if the global subscriber was already set, or if the
/// OTLP exporter fails to initialize.
pub fn init(config: &Config) -> Result<Guard> {
    let file_appender =
        tracing_appender::rolling::daily(&config.log_dir, format!("{}.log", config.project_name));

    let fmt_layer = fmt::layer().compact().with_writer(file_appender);

    let mut env_filter_layer = EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .from_env_lossy();

    if cfg!(feature = "otel") && config.otel_enabled {
        env_filter_layer = env_filter_layer.add_directive("modelpool=debug".parse().unwrap());
    }

    let mut layers = vec![fmt_layer.boxed()];

    #[cfg(feature = "otel")]
    let provider_for_guard = {
        let mut provider_for_guard = None;
        if config.otel_enabled {
            let provider = init_otel(&config.project_name);
            let tracer = {
                use opentelemetry::trace::TracerProvider as _;
                provider.tracer("modelpool")
            };
            opentelemetry::global::set_tracer_provider(provider.clone());
            provider_for_guard = Some(provider);

            let layer = tracing_opentelemetry::OpenTelemetryLayer::new(tracer);
            layers.push(layer.boxed());
        }
        provider_for_guard
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter_layer)
        .with(layers);
    registry.try_init()?;

    Ok(Guard {
        #[cfg(feature = "otel")]
        otel: provider_for_guard,
    })
}

#[cfg(feature = "otel")]
fn init_otel(project_name: &str) -> opentelemetry_sdk::trace::TracerProvider {
    use opentelemetry_sdk::{runtime, trace::TracerProvider, Resource};
    use std::collections::HashMap;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .build()
        .expect("failed to create otlp exporter");

    let service_name = if let Ok(service_name) = std::env::var("OTEL_SERVICE_NAME") {
        service_name
    } else {
        let resource_attributes = std::env::var("OTEL_RESOURCE_ATTRIBUTES")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.split_once('=').expect("invalid OTEL_RESOURCE_ATTRIBUTES"))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<String, String>>();
        resource_attributes
            .get("service.name")
            .cloned()
            .unwrap_or_else(|| project_name.to_string())
    };

    TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new(vec![opentelemetry::KeyValue::new(
            "service.name",
            service_name,
        )]))
        .build()
}
