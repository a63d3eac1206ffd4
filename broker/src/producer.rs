use std::sync::Arc;

use etran_tokio::{
    notify_once::NotifyOnce,
    sleep::{PollSleep, SleepOutcome},
    task::Task,
};
use sqlx::mssql::MssqlConnection;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn};

use crate::{
    config::Config,
    db::{self, DbError},
    etran::request::RequestCatalog,
    packet::{RequestPacket, ResponsePacket},
    queue::PriorityQueue,
};

/// Why the inner loop of a DB-owning task stopped.
pub(crate) enum LoopExit {
    /// The session died; the supervisor reconnects after a pause.
    Disconnected(DbError),
    /// Shutdown signal observed; the supervisor returns.
    Shutdown,
}

/// The DB producer: claims request rows, builds their SOAP bodies and feeds
/// the priority queue.
pub struct Producer {
    config: Arc<Config>,
    catalog: Arc<RequestCatalog>,
    queue_in: Arc<PriorityQueue<RequestPacket>>,
    queue_out: mpsc::UnboundedSender<ResponsePacket>,
    poll_sleep: PollSleep,
    shutdown: NotifyOnce,
}

impl Producer {
    pub fn new(
        config: Arc<Config>,
        catalog: Arc<RequestCatalog>,
        queue_in: Arc<PriorityQueue<RequestPacket>>,
        queue_out: mpsc::UnboundedSender<ResponsePacket>,
        poll_sleep: PollSleep,
        shutdown: NotifyOnce,
    ) -> Self {
        Self {
            config,
            catalog,
            queue_in,
            queue_out,
            poll_sleep,
            shutdown,
        }
    }

    pub fn spawn(self) -> Task<()> {
        const SPAN_NAME: &str = "(producer)";
        Task::spawn_with_span(SPAN_NAME, info_span!(SPAN_NAME), async move {
            self.run().await
        })
    }

    /// Supervisor: owns the DB session and reruns the claim loop across
    /// reconnects. A dead session is dropped, never closed.
    async fn run(self) {
        loop {
            let mut conn = match db::connect(&self.config.db.url()).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Producer failed to connect: {e:#}");
                    if !self.pause_before_reconnect().await {
                        return;
                    }
                    continue;
                }
            };

            match self.produce(&mut conn).await {
                LoopExit::Shutdown => return,
                LoopExit::Disconnected(e) => {
                    warn!(
                        "Rerunning producer after {pause:?} because of {e:#}",
                        pause = self.config.app.sleep_on_disconnect(),
                    );
                    drop(conn);
                    if !self.pause_before_reconnect().await {
                        return;
                    }
                }
            }
        }
    }

    /// The claim-build-enqueue loop over one live session.
    async fn produce(&self, conn: &mut MssqlConnection) -> LoopExit {
        let mut shutdown = self.shutdown.clone();
        loop {
            // Ask only for what will fit right now. The headroom keeps the
            // queue drainable so a later poll can surface higher-priority
            // rows instead of being stuck behind a full queue.
            let headroom = self
                .config
                .app
                .queue_maxsize
                .saturating_sub(self.queue_in.len());

            let batch =
                match db::get_request_queue(conn, headroom as i32).await {
                    Ok(batch) => batch,
                    Err(e @ DbError::Disconnected(_)) =>
                        return LoopExit::Disconnected(e),
                    Err(e) => {
                        error!("Producer query failed: {e:#}");
                        continue;
                    }
                };

            let claimed = batch.len();
            for row in batch {
                info!(
                    "id={id} type={type_id} priority={priority}",
                    id = row.id,
                    type_id = row.type_id,
                    priority = row.priority,
                );
                match self.catalog.build(row.type_id, &row.query) {
                    Ok(body) => {
                        let packet = RequestPacket {
                            priority: row.priority,
                            request_id: row.id,
                            body,
                            dos_counter: 0,
                        };
                        // May block on a full queue; that backpressure is
                        // what bounds the next claim.
                        tokio::select! {
                            biased;
                            () = shutdown.recv() => return LoopExit::Shutdown,
                            () = self.queue_in.push(packet) => {}
                        }
                    }
                    Err(e) => {
                        // Answer the bad row right away so it is never
                        // claimed (and rejected) again.
                        warn!("id={id} {e}", id = row.id);
                        let rejected =
                            ResponsePacket::error(row.id, e.to_string());
                        if self.queue_out.send(rejected).is_err() {
                            return LoopExit::Shutdown;
                        }
                    }
                }
            }

            // Pace gently while there is work, poll lazily when idle.
            let pause = if claimed > 0 {
                self.config.app.db_querying_interval()
            } else {
                self.config.app.db_polling_interval()
            };
            info!("Producer going to sleep for {pause:?}");
            match self.poll_sleep.sleep(pause).await {
                SleepOutcome::Expired | SleepOutcome::Woken => {}
                SleepOutcome::Terminated => return LoopExit::Shutdown,
            }
        }
    }

    /// Returns false if shutdown fired during the pause.
    async fn pause_before_reconnect(&self) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            () = shutdown.recv() => false,
            () = tokio::time::sleep(self.config.app.sleep_on_disconnect()) => true,
        }
    }
}
