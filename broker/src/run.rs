use std::{sync::Arc, time::Duration};

use anyhow::Context;
use etran_tokio::{notify_once::NotifyOnce, sleep::PollSleep, task::Task};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    consumer::Consumer,
    db,
    etran::request::RequestCatalog,
    heartbeat,
    producer::Producer,
    queue::PriorityQueue,
    server,
    state::UpstreamStatus,
    worker::Worker,
};

/// The amount of time tasks have to finish after a graceful shutdown was
/// initiated before the program exits.
const SHUTDOWN_TIME_LIMIT: Duration = Duration::from_secs(15);

/// Wire up and run the whole pipeline until SIGINT.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    warn!("Broker start");

    // Rows claimed by a previous run but never answered go back to the
    // pool; the in-memory queues do not survive restarts.
    db::reset_processing_queue(&config.db.url())
        .await
        .context("ResetProcessingQueue failed")?;

    let shutdown = NotifyOnce::new();
    let poll_sleep = PollSleep::new(shutdown.clone());
    let status = UpstreamStatus::new();
    let catalog = Arc::new(RequestCatalog::new(&config.etran));
    let queue_in = Arc::new(PriorityQueue::new(config.app.queue_maxsize));
    let (queue_out_tx, queue_out_rx) = mpsc::unbounded_channel();

    let mut tasks = Vec::with_capacity(config.app.workers_count + 5);

    tasks.push(
        Producer::new(
            config.clone(),
            catalog,
            queue_in.clone(),
            queue_out_tx.clone(),
            poll_sleep.clone(),
            shutdown.clone(),
        )
        .spawn(),
    );

    for index in 0..config.app.workers_count {
        let worker = Worker::new(
            index,
            config.clone(),
            queue_in.clone(),
            queue_out_tx.clone(),
            status.clone(),
            shutdown.clone(),
        )
        .with_context(|| format!("Failed to build worker {index}"))?;
        tasks.push(worker.spawn());
    }

    tasks.push(
        Consumer::new(
            config.clone(),
            queue_in,
            queue_out_rx,
            queue_out_tx,
            status,
            shutdown.clone(),
        )
        .spawn(),
    );

    tasks.push(heartbeat::spawn(
        config.app.heartbeat_path.clone(),
        config.app.heartbeat_interval(),
        shutdown.clone(),
    ));

    tasks.push(
        server::spawn(
            config.app.http_endpoint_port,
            poll_sleep,
            shutdown.clone(),
        )
        .await?,
    );

    tasks.push(spawn_sigint_listener(shutdown.clone()));

    info!(
        "Pipeline up: {workers} workers, queue capacity {capacity}",
        workers = config.app.workers_count,
        capacity = config.app.queue_maxsize,
    );

    etran_tokio::task::try_join_tasks_and_shutdown(
        tasks,
        shutdown,
        SHUTDOWN_TIME_LIMIT,
    )
    .await
    .context("Pipeline tasks")
}

/// SIGINT initiates a graceful shutdown: in-flight polling sleeps resolve
/// as `Terminated` and every loop winds down.
fn spawn_sigint_listener(shutdown: NotifyOnce) -> Task<()> {
    Task::spawn("(sigint)", async move {
        let mut observer = shutdown.clone();
        tokio::select! {
            biased;
            // Someone else already shut us down; nothing to listen for.
            () = observer.recv() => {}
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => warn!("SIGINT; shutting down"),
                    Err(e) => error!("Failed to listen for SIGINT: {e:#}"),
                }
                shutdown.send();
            }
        }
    })
}
