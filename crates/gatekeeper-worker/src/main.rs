//! Reference worker: polls the gatekeeper HTTP surface for leases, runs a
//! handler keyed by job type, and reports completion. Has no submission
//! path — a worker only ever consumes.

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug, Clone)]
#[command(name = "gatekeeper-worker")]
#[command(about = "Reference worker for the gatekeeper scheduler")]
struct WorkerConfig {
    #[arg(long, env = "GATEKEEPER_WORKER_BASE_URL", default_value = "http://localhost:9001")]
    base_url: String,

    #[arg(long, env = "GATEKEEPER_WORKER_ID", default_value = "worker-1")]
    worker_id: String,

    /// Must stay below the server's `lease_ttl_s` or leases will expire
    /// between heartbeats.
    #[arg(long, default_value_t = 15.0)]
    heartbeat_interval_s: f64,

    /// Random jitter added to each sleep to desync multiple workers.
    #[arg(long, default_value_t = 0.25)]
    jitter_s: f64,

    #[arg(long)]
    max_units: Option<i64>,

    #[arg(long, default_value_t = 10.0)]
    timeout_s: f64,
}

type Handler = fn(&Value) -> anyhow::Result<Value>;

fn handler_registry() -> HashMap<&'static str, Handler> {
    let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
    handlers.insert("demo.noop", |_payload| Ok(serde_json::json!({ "ran": true })));
    handlers.insert("demo.echo", |payload| Ok(payload.clone()));
    handlers
}

struct WorkerClient {
    http: reqwest::Client,
    cfg: WorkerConfig,
}

#[derive(Debug, Deserialize)]
struct LeaseGrant {
    lease_id: uuid::Uuid,
    #[allow(dead_code)]
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
struct JobView {
    #[serde(rename = "job_type")]
    job_type: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct RequestLeaseResponse {
    denied: bool,
    #[serde(default)]
    retry_after_ms: Option<i64>,
    #[serde(default)]
    lease: Option<LeaseGrant>,
    #[serde(default)]
    job: Option<JobView>,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    worker_id: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl WorkerClient {
    fn new(cfg: WorkerConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs_f64(cfg.timeout_s)).build()?;
        Ok(Self { http, cfg })
    }

    async fn request_lease(&self) -> anyhow::Result<RequestLeaseResponse> {
        let mut body = serde_json::json!({ "worker_id": self.cfg.worker_id });
        if let Some(max_units) = self.cfg.max_units {
            body["max_units"] = serde_json::json!(max_units);
        }
        let url = format!("{}/leases/request", self.cfg.base_url.trim_end_matches('/'));
        let response = self.http.post(url).json(&body).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn heartbeat(&self, lease_id: uuid::Uuid) -> anyhow::Result<()> {
        let url = format!("{}/leases/{}/heartbeat", self.cfg.base_url.trim_end_matches('/'), lease_id);
        self.http
            .post(url)
            .json(&serde_json::json!({ "worker_id": self.cfg.worker_id }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn complete(&self, lease_id: uuid::Uuid, status: &str, result: Option<Value>, error: Option<String>) -> anyhow::Result<()> {
        let url = format!("{}/leases/{}/complete", self.cfg.base_url.trim_end_matches('/'), lease_id);
        let body = CompleteRequest { worker_id: &self.cfg.worker_id, status, result, error };
        self.http.post(url).json(&body).send().await?.error_for_status()?;
        Ok(())
    }

    async fn jitter_sleep(&self, base_s: f64) {
        let extra = rand::thread_rng().gen_range(0.0..self.cfg.jitter_s.max(0.001));
        tokio::time::sleep(Duration::from_secs_f64(base_s + extra)).await;
    }

    async fn heartbeat_loop(&self, lease_id: uuid::Uuid) {
        loop {
            self.jitter_sleep(self.cfg.heartbeat_interval_s).await;
            if let Err(err) = self.heartbeat(lease_id).await {
                // Server restart or network issue: the lease will expire
                // server-side, so give up quietly.
                warn!(%lease_id, error = %err, "heartbeat failed, stopping");
                return;
            }
        }
    }

    async fn run_once(&self, handlers: &HashMap<&'static str, Handler>) -> anyhow::Result<()> {
        let res = self.request_lease().await?;
        if res.denied {
            let retry_ms = res.retry_after_ms.unwrap_or(1500);
            info!(retry_ms, "lease denied, backing off");
            self.jitter_sleep(retry_ms as f64 / 1000.0).await;
            return Ok(());
        }

        let lease = res.lease.ok_or_else(|| anyhow::anyhow!("granted response missing lease"))?;
        let job = res.job.ok_or_else(|| anyhow::anyhow!("granted response missing job"))?;
        let lease_id = lease.lease_id;

        let heartbeat_task = tokio::spawn({
            let client = WorkerClient { http: self.http.clone(), cfg: self.cfg.clone() };
            async move { client.heartbeat_loop(lease_id).await }
        });

        let started = std::time::Instant::now();
        let outcome = match handlers.get(job.job_type.as_str()) {
            Some(handler) => handler(&job.payload),
            None => Err(anyhow::anyhow!("no handler registered for job type '{}'", job.job_type)),
        };

        match outcome {
            Ok(result) => {
                let duration_s = started.elapsed().as_secs_f64();
                self.complete(
                    lease_id,
                    "completed",
                    Some(serde_json::json!({ "job_type": job.job_type, "result": result, "duration_s": duration_s })),
                    None,
                )
                .await?;
                info!(worker_id = %self.cfg.worker_id, job_type = %job.job_type, duration_s, "completed");
            }
            Err(err) => {
                self.complete(lease_id, "failed", None, Some(err.to_string())).await?;
                warn!(worker_id = %self.cfg.worker_id, job_type = %job.job_type, error = %err, "failed");
            }
        }

        heartbeat_task.abort();
        Ok(())
    }

    async fn run_forever(&self, handlers: &HashMap<&'static str, Handler>) -> anyhow::Result<()> {
        loop {
            if let Err(err) = self.run_once(handlers).await {
                warn!(error = %err, "run_once failed, retrying after backoff");
                self.jitter_sleep(1.0).await;
            }
        }
    }
}

impl Clone for WorkerClient {
    fn clone(&self) -> Self {
        Self { http: self.http.clone(), cfg: self.cfg.clone() }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = WorkerConfig::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gatekeeper_worker=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let handlers = handler_registry();
    let client = WorkerClient::new(cfg)?;
    client.run_forever(&handlers).await
}
