use std::{cmp, sync::Arc, time::Duration};

use anyhow::Context;
use etran_tokio::{notify_once::NotifyOnce, task::Task};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::{sync::mpsc, time::Instant};
use tracing::{info, info_span, warn};

use crate::{
    config::Config,
    packet::{RequestPacket, ResponsePacket},
    queue::PriorityQueue,
    state::UpstreamStatus,
};

/// Idle upstream connections are kept warm this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// One worker of the pool: pulls request packets by priority, enforces the
/// rate-limit / outage pauses, POSTs to the upstream and hands the raw
/// response to the consumer.
pub struct Worker {
    index: usize,
    config: Arc<Config>,
    client: reqwest::Client,
    queue_in: Arc<PriorityQueue<RequestPacket>>,
    queue_out: mpsc::UnboundedSender<ResponsePacket>,
    status: UpstreamStatus,
    shutdown: NotifyOnce,
}

impl Worker {
    pub fn new(
        index: usize,
        config: Arc<Config>,
        queue_in: Arc<PriorityQueue<RequestPacket>>,
        queue_out: mpsc::UnboundedSender<ResponsePacket>,
        status: UpstreamStatus,
        shutdown: NotifyOnce,
    ) -> anyhow::Result<Self> {
        // Every worker owns a long-lived client with its own connection
        // pool, so a slow request on one worker never stalls another.
        let client = reqwest::Client::builder()
            .timeout(config.app.request_timeout())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .default_headers(header_map(&config.etran.headers)?)
            .build()
            .context("Failed to build the upstream HTTP client")?;

        Ok(Self {
            index,
            config,
            client,
            queue_in,
            queue_out,
            status,
            shutdown,
        })
    }

    pub fn spawn(self) -> Task<()> {
        let name = format!("(worker-{})", self.index);
        let span = info_span!("(worker)", index = self.index);
        Task::spawn_with_span(name, span, async move { self.run().await })
    }

    async fn run(self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let packet = tokio::select! {
                biased;
                () = shutdown.recv() => return,
                packet = self.queue_in.pop() => packet,
            };

            if !self.pre_sleep(&packet).await {
                return;
            }

            let request_id = packet.request_id;
            let started = Instant::now();
            match self.post(&packet).await {
                Ok((status, body)) => {
                    info!(
                        "id={request_id} status={status} len={len} \
                         duration={duration}ms queue_in={queued}",
                        len = body.len(),
                        duration = started.elapsed().as_millis(),
                        queued = self.queue_in.len(),
                    );
                    let response = ResponsePacket::from_upstream(packet, body);
                    if self.queue_out.send(response).is_err() {
                        // Consumer is gone; we are shutting down.
                        return;
                    }
                }
                Err(e) => {
                    // Network-level failure: the request itself is still
                    // good. Put it back and let the connection settle.
                    let pause = self.config.app.sleep_on_disconnect();
                    warn!(
                        "id={request_id} going to sleep for {pause:?} \
                         because of {e:#}"
                    );
                    tokio::select! {
                        biased;
                        () = shutdown.recv() => return,
                        () = self.queue_in.push(packet) => {}
                    }
                    if !self.interruptible_sleep(pause).await {
                        return;
                    }
                }
            }
        }
    }

    /// The pre-request pause. Returns false if shutdown fired.
    async fn pre_sleep(&self, packet: &RequestPacket) -> bool {
        let app = &self.config.app;
        let down = self.status.is_down();
        let pause = backoff_pause(
            down,
            packet.dos_counter,
            app.sleep_on_dos(),
            app.sleep_on_dos_max(),
        );
        if pause.is_zero() {
            return true;
        }

        warn!(
            "id={id} going to sleep for {pause:?} because of {reason}",
            id = packet.request_id,
            reason = if down { "an outage" } else { "DoS" },
        );
        self.interruptible_sleep(pause).await
    }

    /// Returns false if shutdown fired during the pause.
    async fn interruptible_sleep(&self, pause: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            () = shutdown.recv() => false,
            () = tokio::time::sleep(pause) => true,
        }
    }

    async fn post(
        &self,
        packet: &RequestPacket,
    ) -> Result<(reqwest::StatusCode, Vec<u8>), reqwest::Error> {
        let response = self
            .client
            .post(&self.config.etran.url)
            .body(packet.body.clone())
            .send()
            .await?;
        let status = response.status();
        // Non-2xx is a transport error here; the upstream's application
        // errors come back as 200 with an <error> payload.
        let body = response.error_for_status()?.bytes().await?;
        Ok((status, body.to_vec()))
    }
}

/// The pre-request pause: the flat outage pause while the upstream is down,
/// else the incremental rate-limit backoff, capped either way.
fn backoff_pause(
    down: bool,
    dos_counter: u32,
    step: Duration,
    max: Duration,
) -> Duration {
    if down {
        max
    } else {
        cmp::min(step * dos_counter, max)
    }
}

/// Build the static header set sent with every upstream request.
fn header_map(
    headers: &std::collections::HashMap<String, String>,
) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("Invalid header name: {name}"))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("Invalid value for header {name}"))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    fn pipeline(
        upstream_url: String,
    ) -> (
        Arc<PriorityQueue<RequestPacket>>,
        mpsc::UnboundedReceiver<ResponsePacket>,
        NotifyOnce,
        Task<()>,
    ) {
        let mut config = crate::config::Config::for_testing();
        config.etran.url = upstream_url;

        let queue_in = Arc::new(PriorityQueue::new(8));
        let (queue_out_tx, queue_out_rx) = mpsc::unbounded_channel();
        let shutdown = NotifyOnce::new();
        let worker = Worker::new(
            0,
            Arc::new(config),
            queue_in.clone(),
            queue_out_tx,
            UpstreamStatus::new(),
            shutdown.clone(),
        )
        .unwrap();
        (queue_in, queue_out_rx, shutdown.clone(), worker.spawn())
    }

    fn packet(request_id: i32) -> RequestPacket {
        RequestPacket {
            priority: 1,
            request_id,
            body: "<GetBlock/>".to_owned(),
            dos_counter: 0,
        }
    }

    #[tokio::test]
    async fn posts_the_packet_and_forwards_the_raw_response() {
        let listener =
            tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
                .await
                .unwrap();
        let addr = listener.local_addr().unwrap();
        let app =
            axum::Router::new().fallback(|| async { "<GetBlockResponse/>" });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (queue_in, mut queue_out_rx, shutdown, task) =
            pipeline(format!("http://{addr}/soap"));

        queue_in.push(packet(7)).await;

        let response =
            tokio::time::timeout(Duration::from_secs(5), queue_out_rx.recv())
                .await
                .expect("worker must answer in time")
                .expect("worker must forward a response");
        assert_eq!(response.request_id, 7);
        assert!(!response.is_error);
        assert_eq!(response.body, b"<GetBlockResponse/>");
        assert_eq!(response.origin.map(|o| o.request_id), Some(7));

        shutdown.send();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn network_failure_requeues_the_packet() {
        // Port 9 (discard): connection refused, nothing ever listens.
        let (queue_in, _queue_out_rx, shutdown, task) =
            pipeline("http://127.0.0.1:9/".to_owned());

        queue_in.push(packet(8)).await;

        // The worker pops the packet, fails to connect (refused, immediate
        // on loopback), puts it back and parks in its reconnect pause.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            queue_in.len(),
            1,
            "packet must be requeued after a transport error"
        );

        let requeued = queue_in.pop().await;
        assert_eq!(requeued.request_id, 8);
        assert_eq!(requeued.dos_counter, 0);

        shutdown.send();
        task.await.unwrap();
    }

    #[test]
    fn backoff_grows_per_bounce_and_is_capped() {
        let step = Duration::from_secs(15);
        let max = Duration::from_secs(300);

        // A fresh packet pays nothing.
        assert_eq!(backoff_pause(false, 0, step, max), Duration::ZERO);
        // Each rate-limit bounce adds one step.
        assert_eq!(backoff_pause(false, 1, step, max), step);
        assert_eq!(backoff_pause(false, 2, step, max), 2 * step);
        // Capped at the maximum.
        assert_eq!(backoff_pause(false, 100, step, max), max);
        // During an outage everyone pays the full pause, bounced or not.
        assert_eq!(backoff_pause(true, 0, step, max), max);
    }

    #[test]
    fn header_map_accepts_the_usual_soap_headers() {
        let headers = std::collections::HashMap::from([
            (
                "Content-Type".to_owned(),
                "text/xml; charset=utf-8".to_owned(),
            ),
            ("SOAPAction".to_owned(), "GetBlock".to_owned()),
        ]);
        let map = header_map(&headers).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["content-type"], "text/xml; charset=utf-8");
    }

    #[test]
    fn header_map_rejects_garbage_names() {
        let headers =
            std::collections::HashMap::from([("bad name".to_owned(), "v".to_owned())]);
        assert!(header_map(&headers).is_err());
    }
}
