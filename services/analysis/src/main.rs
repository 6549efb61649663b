use anyhow::{Context, Result};
use prism_analysis::aws_capabilities::{
    load_sdk_config, ComprehendSentimentAnalyzer, PollySpeechSynthesizer,
    RekognitionLabelDetector, SsmParameterSource,
};
use prism_analysis::config::Config;
use prism_analysis::{
    start_api_server, AnalyzeSentimentStage, AppState, ConsolidateSummaryStage,
    DetectLabelsStage, NotificationConsumer, NotificationStage, PgStatusStore, S3ObjectStore,
    SqsQueue, StageContext, SynthesizeSpeechStage,
};
use prism_pipeline::{
    BatchEngine, CancellationToken, ObjectGateway, ParameterCache, RecordHandler, StatusStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        bucket = %config.s3.bucket,
        "Starting Prism Analysis Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let sdk_config = load_sdk_config(&config.aws).await;

    // Status tracking is optional
    let status_store: Option<Arc<dyn StatusStore>> = match &config.database.url {
        Some(url) => {
            let store = PgStatusStore::new(&config.database, url)
                .await
                .context("Failed to initialize status store")?;
            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }
            Some(Arc::new(store) as Arc<dyn StatusStore>)
        }
        None => {
            warn!("No database configured, stage ordering is not enforced");
            None
        }
    };

    let object_store = Arc::new(S3ObjectStore::new(&sdk_config, &config.aws));
    let ctx = Arc::new(StageContext::new(
        ObjectGateway::new(object_store),
        config.keyspace.clone(),
        status_store.clone(),
    ));

    let cancel = CancellationToken::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let engine = BatchEngine::new(config.batch.clone());

    for stage in NotificationStage::ALL {
        let Some(url) = queue_url(&config, stage) else {
            info!(stage = %stage, "No queue configured, stage disabled");
            continue;
        };
        let queue = Arc::new(SqsQueue::new(&sdk_config, url, &config.queues));

        let handle = match stage {
            NotificationStage::DetectLabels => {
                let detector = Arc::new(RekognitionLabelDetector::new(&sdk_config));
                let handler = Arc::new(DetectLabelsStage::new(ctx.clone(), detector));
                spawn_consumer(stage, queue, handler, &engine, &config, &cancel)
            }
            NotificationStage::SynthesizeSpeech => {
                let voices = Arc::new(ParameterCache::new(
                    Arc::new(SsmParameterSource::new(&sdk_config)),
                    config.speech.parameter_cache.ttl(),
                ));
                let synthesizer = Arc::new(PollySpeechSynthesizer::new(&sdk_config));
                let handler = Arc::new(SynthesizeSpeechStage::new(
                    ctx.clone(),
                    synthesizer,
                    voices,
                    config.speech.clone(),
                ));
                spawn_consumer(stage, queue, handler, &engine, &config, &cancel)
            }
            NotificationStage::ConsolidateSummary => {
                let handler = Arc::new(ConsolidateSummaryStage::new(ctx.clone()));
                spawn_consumer(stage, queue, handler, &engine, &config, &cancel)
            }
        };
        handles.push(handle);
    }

    // Spawn API server task
    if config.api.enabled {
        let api_state = AppState {
            sentiment: Arc::new(AnalyzeSentimentStage::new(
                ctx.clone(),
                Arc::new(ComprehendSentimentAnalyzer::new(&sdk_config)),
                config.s3.bucket.clone(),
                config.sentiment.default_language.clone(),
            )),
            status: status_store.clone(),
        };
        let api_config = config.api.clone();
        let api_cancel = cancel.child_token();
        handles.push(tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config, api_cancel).await {
                error!(error = %e, "API server error");
            }
        }));
    }

    info!(tasks = handles.len(), "Analysis service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down analysis service");
    cancel.cancel();

    for mut handle in handles {
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
            warn!("Task did not stop within the grace period, aborting");
            handle.abort();
        }
    }

    info!("Analysis service stopped");

    Ok(())
}

const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

fn queue_url(config: &Config, stage: NotificationStage) -> Option<&str> {
    let url = match stage {
        NotificationStage::DetectLabels => &config.queues.detect_labels_url,
        NotificationStage::SynthesizeSpeech => &config.queues.synthesize_speech_url,
        NotificationStage::ConsolidateSummary => &config.queues.consolidate_summary_url,
    };
    url.as_deref().filter(|u| !u.is_empty())
}

fn spawn_consumer<H: RecordHandler>(
    stage: NotificationStage,
    queue: Arc<SqsQueue>,
    handler: Arc<H>,
    engine: &BatchEngine,
    config: &Config,
    cancel: &CancellationToken,
) -> JoinHandle<()> {
    let consumer = NotificationConsumer::new(
        stage,
        queue,
        handler,
        engine.clone(),
        config.keyspace.clone(),
    );
    let cancel = cancel.child_token();

    tokio::spawn(async move {
        if let Err(e) = consumer.run(cancel).await {
            error!(stage = %stage, error = %e, "Notification consumer error");
        }
    })
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
