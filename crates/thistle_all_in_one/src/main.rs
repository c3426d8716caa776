mod config;

use common::memory::InMemoryMessageRepository;
use common::postgres::{PostgresClient, PostgresMessageRepository};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use common::MessageRepository;
use config::{ServiceConfig, StorageBackend};
use std::sync::Arc;
use telemetry_pipeline::Pipeline;
use thistle_runner::Runner;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transport_connector::MqttBrokerLink;

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_config = match config.telemetry_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Invalid telemetry configuration: {}", e);
            std::process::exit(1);
        }
    };
    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&telemetry_config) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        otel_enabled = config.otel_enabled,
        storage_backend = %config.storage_backend,
        broker = %config.mqtt_broker_url,
        "Starting thistle telemetry pipeline"
    );
    debug!("Configuration: {:?}", config);

    let pipeline = match build_pipeline(&config).await {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            error!(error = ?e, "Failed to initialize pipeline");
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    let runner = Runner::new()
        .with_named_process("telemetry_pipeline", pipeline.clone().into_runner_process())
        .with_named_process("config_reloader", {
            let pipeline = pipeline.clone();
            move |ctx| reload_on_hangup(pipeline, ctx)
        })
        .with_closer(move || async move {
            shutdown_telemetry(telemetry_providers);
            Ok(())
        })
        .with_closer_timeout(config.closer_timeout());

    if let Err(e) = runner.run().await {
        eprintln!("thistle stopped with error: {:#}", e);
        std::process::exit(1);
    }
}

async fn build_pipeline(config: &ServiceConfig) -> anyhow::Result<Pipeline> {
    let pipeline_config = config.pipeline_config().validated()?;
    let repository = initialize_repository(config, &pipeline_config).await?;
    let link = MqttBrokerLink::new(config.mqtt_config())?;
    Ok(Pipeline::new(pipeline_config, repository, Arc::new(link))?)
}

async fn initialize_repository(
    config: &ServiceConfig,
    pipeline_config: &common::PipelineConfig,
) -> anyhow::Result<Arc<dyn MessageRepository>> {
    match config.storage_backend()? {
        StorageBackend::Postgres => {
            info!("Initializing PostgreSQL...");
            let client = PostgresClient::new(
                &config.postgres_config(),
                pipeline_config.pool_size,
                pipeline_config.pool_wait_timeout(),
            )?;
            client.migrate().await?;
            Ok(Arc::new(PostgresMessageRepository::new(
                client,
                config.retry_policy(),
                pipeline_config.shutdown_grace(),
            )))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage, messages are lost on exit");
            Ok(Arc::new(
                InMemoryMessageRepository::new(
                    pipeline_config.pool_size,
                    pipeline_config.pool_wait_timeout(),
                )
                .with_close_timeout(pipeline_config.shutdown_grace()),
            ))
        }
    }
}

/// Re-read the environment on SIGHUP and apply the pipeline section. A
/// rejected reload leaves the running configuration in place.
async fn reload_on_hangup(pipeline: Arc<Pipeline>, token: CancellationToken) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    reload(&pipeline);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pipeline;
        token.cancelled().await;
    }

    Ok(())
}

fn reload(pipeline: &Pipeline) {
    info!("SIGHUP received, reloading configuration");
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "Failed to read configuration, keeping current");
            return;
        }
    };

    if let Err(e) = pipeline.reload_config(config.pipeline_config()) {
        warn!(error = %e, "Configuration rejected, keeping current");
    }
}
