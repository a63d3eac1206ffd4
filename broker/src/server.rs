use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use axum::{extract::State, routing::get, Router};
use etran_tokio::{notify_once::NotifyOnce, sleep::PollSleep, task::Task};
use tokio::net::TcpListener;
use tracing::{error, info, info_span};

/// Serve the loopback control endpoint.
///
/// `GET /wakeup` pokes the producer's polling sleep so freshly queued rows
/// are claimed immediately instead of at the next poll. Every path answers
/// `200 OK`; the endpoint is bound to loopback only and carries no state
/// worth protecting.
pub async fn spawn(
    port: u16,
    poll_sleep: PollSleep,
    shutdown: NotifyOnce,
) -> anyhow::Result<Task<()>> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control endpoint {addr}"))?;
    info!("Control endpoint listening on {addr}");

    const SPAN_NAME: &str = "(control-server)";
    let task =
        Task::spawn_with_span(SPAN_NAME, info_span!(SPAN_NAME), async move {
            let serve = axum::serve(listener, router(poll_sleep))
                .with_graceful_shutdown(shutdown.recv_owned());
            if let Err(e) = serve.await {
                error!("Control endpoint failed: {e:#}");
            }
        });
    Ok(task)
}

fn router(poll_sleep: PollSleep) -> Router {
    Router::new()
        .route("/wakeup", get(wakeup))
        .fallback(ok)
        .with_state(poll_sleep)
}

async fn wakeup(State(poll_sleep): State<PollSleep>) -> &'static str {
    info!("Waking up the producer");
    poll_sleep.wake_all();
    "OK"
}

async fn ok() -> &'static str {
    "OK"
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use etran_tokio::sleep::SleepOutcome;

    use super::*;

    async fn serve_once(
        poll_sleep: PollSleep,
        shutdown: NotifyOnce,
    ) -> SocketAddr {
        let listener =
            TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(poll_sleep))
                .with_graceful_shutdown(shutdown.recv_owned())
                .await
                .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn wakeup_pokes_the_polling_sleep_and_answers_ok() {
        let shutdown = NotifyOnce::new();
        let poll_sleep = PollSleep::new(shutdown.clone());
        let addr = serve_once(poll_sleep.clone(), shutdown.clone()).await;

        // A producer-style sleeper is parked on a long poll.
        let sleeper = tokio::spawn({
            let poll_sleep = poll_sleep.clone();
            async move { poll_sleep.sleep(Duration::from_secs(3600)).await }
        });
        tokio::task::yield_now().await;

        let response = reqwest::get(format!("http://{addr}/wakeup"))
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.text().await.unwrap(), "OK");

        let outcome =
            tokio::time::timeout(Duration::from_secs(1), sleeper).await;
        assert_eq!(outcome.unwrap().unwrap(), SleepOutcome::Woken);

        shutdown.send();
    }

    #[tokio::test]
    async fn any_other_path_answers_ok() {
        let shutdown = NotifyOnce::new();
        let poll_sleep = PollSleep::new(shutdown.clone());
        let addr = serve_once(poll_sleep, shutdown.clone()).await;

        let response = reqwest::get(format!("http://{addr}/anything"))
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.text().await.unwrap(), "OK");

        shutdown.send();
    }
}
