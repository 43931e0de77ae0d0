// Process wiring. The engine task, publisher, operations listener and queue
// ingestion share one shutdown broadcast and one start/stop switch.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::{AggregatorConfig, NamespaceFilter, QueueSource};
use crate::control::{Controller, RunSwitch};
use crate::engine::resync::{ResyncSummary, SnapshotSource};
use crate::engine::{Engine, EngineConfig, EngineHandle};
use crate::error::SourceError;
use crate::http;
use crate::ingest::{
    broker_uri, AmqpEventSource, EventSource, IngestionAdapter, LineEventSource, MalformedPolicy,
    QueueNames, QueueRouting,
};
use crate::metrics::EngineMetrics;
use crate::publish::{run_publisher, LogPublisher, PublishTargets};
use crate::rest::{ChannelEnumerator, RestClient};

/// Build initial state from a snapshot of every active channel in the
/// namespace. Runs before the engine loop consumes any event. On failure the
/// engine starts empty and state is built from the event stream alone.
pub async fn bootstrap<S, C>(
    engine: &mut Engine<S>,
    enumerator: &C,
    namespace: &NamespaceFilter,
) -> Option<ResyncSummary>
where
    S: SnapshotSource,
    C: ChannelEnumerator,
{
    let channels: BTreeSet<String> = match enumerator.list_channels().await {
        Ok(channels) => {
            channels.into_iter().filter(|channel| namespace.matches(channel)).collect()
        }
        Err(error) => {
            warn!(
                error = %error,
                "channel enumeration failed, starting from the event stream only"
            );
            return None;
        }
    };
    info!(channels = channels.len(), namespace = namespace.as_str(), "fetching initial presence");

    match engine.resync_now(channels).await {
        Ok(summary) => {
            info!(
                channels = summary.channels,
                members = summary.members_applied,
                "initial presence loaded"
            );
            Some(summary)
        }
        Err(error) => {
            warn!(
                error = %error,
                "initial presence fetch failed, starting from the event stream only"
            );
            None
        }
    }
}

/// Run the aggregator until the event source ends or a termination signal
/// arrives.
pub async fn run(config: AggregatorConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(EngineMetrics::default());
    let rest = Arc::new(
        RestClient::new(config.rest_base_url.clone(), config.api_key.clone())
            .context("failed to build REST client")?,
    );

    let (mut engine, handle) = Engine::new(
        EngineConfig::with_verify_delay(config.verify_delay),
        Arc::clone(&rest),
        Arc::clone(&metrics),
    );

    if config.fetch_initial_state {
        bootstrap(&mut engine, rest.as_ref(), &config.namespace).await;
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let engine_task = tokio::spawn(engine.run(shutdown_tx.subscribe()));
    let switch = RunSwitch::default();

    if let Some(addr) = config.metrics_addr {
        let controller = Controller::new(
            switch.clone(),
            handle.clone(),
            Arc::clone(&rest),
            config.namespace.clone(),
        );
        let router = http::build_router(Arc::clone(&metrics), Arc::new(controller));
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(error) = http::serve(addr, router, shutdown).await {
                error!(error = %format!("{error:#}"), "operations listener stopped");
            }
        });
    }

    if let Some(period) = config.publish_interval {
        let targets = PublishTargets::with_prefix(&config.publish_prefix);
        let shutdown = shutdown_tx.subscribe();
        if config.publish_dry_run {
            tokio::spawn(run_publisher(
                handle.clone(),
                LogPublisher,
                targets,
                period,
                switch.clone(),
                Arc::clone(&metrics),
                shutdown,
            ));
        } else {
            tokio::spawn(run_publisher(
                handle.clone(),
                rest.as_ref().clone(),
                targets,
                period,
                switch.clone(),
                Arc::clone(&metrics),
                shutdown,
            ));
        }
    }

    let ingestion = Ingestion {
        engine: handle,
        policy: config.malformed_policy,
        switch,
        metrics: Arc::clone(&metrics),
        shutdown: shutdown_tx.subscribe(),
    };
    let mut ingestion = match config.queue_source {
        QueueSource::Amqp => {
            let uri = broker_uri(&config.queue_endpoint, &config.api_key)
                .context("invalid QUEUE_ENDPOINT")?;
            let queues = QueueNames::for_app(
                config.api_key.app_id(),
                &config.presence_queue,
                &config.occupancy_queue,
            );
            let source = AmqpEventSource::connect(&uri, &queues, config.queue_prefetch)
                .await
                .context("failed to connect to the queue broker")?;
            tokio::spawn(async move {
                let mut adapter = ingestion.adapter(source);
                let result = adapter.run(ingestion.shutdown).await;
                adapter.into_source().close().await;
                result
            })
        }
        QueueSource::Stdin => {
            let routing = QueueRouting::new(&config.presence_queue, &config.occupancy_queue);
            let source = LineEventSource::new(BufReader::new(tokio::io::stdin()), routing);
            info!("reading queue frames from stdin");
            tokio::spawn(async move {
                let mut adapter = ingestion.adapter(source);
                adapter.run(ingestion.shutdown).await
            })
        }
    };

    info!(
        presence_queue = %config.presence_queue,
        occupancy_queue = %config.occupancy_queue,
        source = ?config.queue_source,
        "presence aggregator running"
    );

    let ingestion_done = tokio::select! {
        _ = shutdown_signal() => {
            info!("termination signal received");
            false
        }
        result = &mut ingestion => {
            log_ingestion_result(result)?;
            true
        }
    };

    let _ = shutdown_tx.send(());
    if !ingestion_done {
        log_ingestion_result(ingestion.await)?;
    }
    engine_task.await.context("engine task panicked")?;

    let totals = metrics.snapshot();
    info!(
        applied = totals.events_applied,
        stale = totals.events_stale,
        drift = totals.drift_detected,
        resyncs = totals.resync_requests,
        "presence aggregator stopped"
    );
    Ok(())
}

/// Everything an ingestion task needs besides its event source.
struct Ingestion {
    engine: EngineHandle,
    policy: MalformedPolicy,
    switch: RunSwitch,
    metrics: Arc<EngineMetrics>,
    shutdown: broadcast::Receiver<()>,
}

impl Ingestion {
    fn adapter<E: EventSource>(&self, source: E) -> IngestionAdapter<E> {
        IngestionAdapter::new(source, self.engine.clone(), self.policy, Arc::clone(&self.metrics))
            .with_switch(self.switch.clone())
    }
}

fn log_ingestion_result(
    result: Result<Result<(), SourceError>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match result.context("ingestion task panicked")? {
        Ok(()) => info!("ingestion finished"),
        Err(error) => error!(error = %error, "ingestion failed"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
