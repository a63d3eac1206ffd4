use std::sync::Arc;

use etran_tokio::{notify_once::NotifyOnce, task::Task};
use sqlx::mssql::MssqlConnection;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn};

use crate::{
    config::Config,
    db::{self, DbError},
    etran::response::{decode_response, Decoded},
    packet::{RequestPacket, ResponsePacket},
    producer::LoopExit,
    queue::PriorityQueue,
    state::UpstreamStatus,
};

/// The upstream's rate-limit rejection. Matched as a prefix: the full text
/// carries the caller's address.
const RATE_LIMIT_PREFIX: &str = "400 Дождитесь окончания предыдущего запроса";
/// Prefix of 504-class rejections: the upstream itself is down.
const OUTAGE_PREFIX: &str = "504";

/// What to do with one decoded response.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Upstream outage: raise the outage flag, republish the request,
    /// persist nothing.
    RetryOutage,
    /// Rate-limited: clear the outage flag, bump the packet's counter,
    /// republish the request.
    RetryRateLimited,
    /// Terminal: clear the outage flag and persist the text.
    Persist { is_error: bool },
}

/// The requeue dispositions require an origin packet to republish; a
/// response synthesized by the producer (no origin) is always persisted.
pub fn classify(has_origin: bool, is_error: bool, text: &str) -> Disposition {
    if is_error && has_origin && text.starts_with(OUTAGE_PREFIX) {
        Disposition::RetryOutage
    } else if is_error && has_origin && text.starts_with(RATE_LIMIT_PREFIX) {
        Disposition::RetryRateLimited
    } else {
        Disposition::Persist { is_error }
    }
}

/// The stored procedure expects XML; bare diagnostics get a wrapper.
fn ensure_xml_payload(text: String) -> String {
    if text.starts_with('<') {
        text
    } else {
        format!("<root>{text}</root>")
    }
}

/// The DB consumer: drains the response queue, decodes, and either persists
/// the verdict or feeds the request back into the priority queue.
pub struct Consumer {
    config: Arc<Config>,
    queue_in: Arc<PriorityQueue<RequestPacket>>,
    queue_out_rx: mpsc::UnboundedReceiver<ResponsePacket>,
    /// Kept to hand a response back when the session dies mid-persist.
    queue_out_tx: mpsc::UnboundedSender<ResponsePacket>,
    status: UpstreamStatus,
    shutdown: NotifyOnce,
}

impl Consumer {
    pub fn new(
        config: Arc<Config>,
        queue_in: Arc<PriorityQueue<RequestPacket>>,
        queue_out_rx: mpsc::UnboundedReceiver<ResponsePacket>,
        queue_out_tx: mpsc::UnboundedSender<ResponsePacket>,
        status: UpstreamStatus,
        shutdown: NotifyOnce,
    ) -> Self {
        Self {
            config,
            queue_in,
            queue_out_rx,
            queue_out_tx,
            status,
            shutdown,
        }
    }

    pub fn spawn(self) -> Task<()> {
        const SPAN_NAME: &str = "(consumer)";
        Task::spawn_with_span(SPAN_NAME, info_span!(SPAN_NAME), async move {
            self.run().await
        })
    }

    /// Supervisor: owns the DB session and reruns the drain loop across
    /// reconnects. A dead session is dropped, never closed.
    async fn run(mut self) {
        loop {
            let mut conn = match db::connect(&self.config.db.url()).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Consumer failed to connect: {e:#}");
                    if !self.pause_before_reconnect().await {
                        return;
                    }
                    continue;
                }
            };

            match self.consume(&mut conn).await {
                LoopExit::Shutdown => return,
                LoopExit::Disconnected(e) => {
                    warn!(
                        "Rerunning consumer after {pause:?} because of {e:#}",
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

    async fn consume(&mut self, conn: &mut MssqlConnection) -> LoopExit {
        let mut shutdown = self.shutdown.clone();
        loop {
            let response = tokio::select! {
                biased;
                () = shutdown.recv() => return LoopExit::Shutdown,
                response = self.queue_out_rx.recv() => match response {
                    Some(response) => response,
                    // All senders dropped; nothing left to drain.
                    None => return LoopExit::Shutdown,
                },
            };

            if let Err(e) = self.handle(conn, &response).await {
                // The decode work is done; hand the response back so the
                // fresh session can persist it.
                let _ = self.queue_out_tx.send(response);
                return LoopExit::Disconnected(e);
            }
        }
    }

    /// Process one response. Only a dead session comes back as `Err`; any
    /// other DB failure is logged and the packet counts as handled.
    async fn handle(
        &self,
        conn: &mut MssqlConnection,
        response: &ResponsePacket,
    ) -> Result<(), DbError> {
        let request_id = response.request_id;
        let decoded = if response.is_error {
            // Producer-side rejection; the body is the error text itself.
            Decoded::error(String::from_utf8_lossy(&response.body))
        } else {
            decode_response(&response.body)
        };

        let disposition = classify(
            response.origin.is_some(),
            decoded.is_error,
            &decoded.text,
        );
        match disposition {
            Disposition::RetryOutage | Disposition::RetryRateLimited => {
                self.status
                    .set_down(disposition == Disposition::RetryOutage);
                warn!(
                    "id={request_id} returning into the queue because of {text}",
                    text = decoded.text,
                );
                if let Some(origin) = &response.origin {
                    let mut packet = origin.clone();
                    if disposition == Disposition::RetryRateLimited {
                        packet.dos_counter += 1;
                    }
                    // Push may block on a full queue; on shutdown the row is
                    // abandoned and restored at the next boot.
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        biased;
                        () = shutdown.recv() => {}
                        () = self.queue_in.push(packet) => {}
                    }
                }
            }
            Disposition::Persist { is_error } => {
                self.status.set_down(false);
                info!(
                    "id={request_id} is_error={is_error} len={len}{detail}",
                    len = decoded.text.len(),
                    detail = if is_error {
                        format!(" error: {}", decoded.text)
                    } else {
                        String::new()
                    },
                );
                let payload = ensure_xml_payload(decoded.text);
                match db::set_request_response(
                    conn, request_id, is_error, &payload,
                )
                .await
                {
                    Ok(()) => {}
                    Err(e @ DbError::Disconnected(_)) => return Err(e),
                    Err(e) => error!("Consumer persist failed: {e:#}"),
                }
            }
        }
        Ok(())
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
