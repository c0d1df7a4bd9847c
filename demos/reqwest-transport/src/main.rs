//! # Reqwest Transport Demo
//!
//! Wires lift-client to a real Lift server with `reqwest`.
//!
//! ```text
//! LIFT_SERVER=http://localhost:8080 LIFT_PAGE_ID=F123 LIFT_SESSION_ID=abc \
//! LIFT_COMET=CHAT:0 RUST_LOG=lift_client=debug cargo run -p reqwest-transport-demo
//! ```

use anyhow::Result;
use async_trait::async_trait;
use lift_client::{
    ClientBuilder, ClientConfig, LongPollRequest, PageIdentity, PostRequest, Progress,
    ResponseKind, Transport, TransportError,
};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Transport
// ============================================================================

struct ReqwestTransport {
    http: reqwest::Client,
    origin: String,
}

impl ReqwestTransport {
    /// Client URLs are server-relative unless an alternate origin was set.
    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}{}", self.origin, url)
        }
    }
}

fn transport_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(error.to_string())
    }
}

async fn body(response: reqwest::Response) -> Result<String, TransportError> {
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }
    response.text().await.map_err(transport_error)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post(&self, request: PostRequest) -> Result<String, TransportError> {
        let accept = match request.kind {
            ResponseKind::Json => "application/json",
            ResponseKind::Script => "text/javascript, application/json",
        };
        let size = request.payload.len() as u64;

        let response = self
            .http
            .post(self.absolute(&request.url))
            .timeout(request.timeout)
            .header("Content-Type", "application/x-www-form-urlencoded; charset=UTF-8")
            .header("Accept", accept)
            .body(request.payload)
            .send()
            .await
            .map_err(transport_error)?;

        // reqwest reports no partial upload progress; the body is sent once
        // headers come back.
        if let Some(on_progress) = &request.on_progress {
            on_progress(Progress {
                loaded: size,
                total: Some(size),
            });
        }

        body(response).await
    }

    async fn long_poll(&self, request: LongPollRequest) -> Result<String, TransportError> {
        let watch: Vec<(String, i64)> = request.watch.into_iter().collect();

        let response = self
            .http
            .get(self.absolute(&request.url))
            .timeout(request.timeout)
            .query(&watch)
            .send()
            .await
            .map_err(transport_error)?;

        body(response).await
    }
}

// ============================================================================
// Main
// ============================================================================

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let transport = ReqwestTransport {
        http: reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?,
        origin: env_or("LIFT_SERVER", "http://localhost:8080"),
    };

    let config = match std::env::var("LIFT_OPTIONS") {
        Ok(json) => ClientConfig::from_json(&json)?,
        Err(_) => ClientConfig::default(),
    };

    let mut identity = PageIdentity::new(
        env_or("LIFT_PAGE_ID", "F0"),
        env_or("LIFT_SESSION_ID", "demo"),
    );
    for comet in env_or("LIFT_COMET", "").split(',').filter(|c| !c.is_empty()) {
        let (guid, version) = comet.split_once(':').unwrap_or((comet, "0"));
        identity = identity.with_channel(guid.to_uppercase(), version.parse()?);
    }

    let client = ClientBuilder::new(transport).with_config(config).build();
    client.start(identity)?;

    let deferred = client.create_deferred();
    deferred
        .on_value(|value| info!(%value, "pushed value"))
        .on_done(|| info!("deferred done"))
        .on_failure(|reason| info!(reason, "deferred failed"));

    let payload = env_or("LIFT_PAYLOAD", "");
    if !payload.is_empty() {
        let response = client
            .request(format!("{payload}&deferred={}", deferred.id()), ResponseKind::Json)
            .await?;
        info!(?response, "ajax answered");
    }

    info!("listening for server pushes, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    client.shutdown();
    Ok(())
}
