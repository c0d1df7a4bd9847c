#![allow(dead_code)]

use lift_client::{Client, ClientBuilder, ClientConfig, PageIdentity};
use lift_client_testing::{MockServer, MockTransport, RecordingHooks};
use std::time::Duration;

pub struct Harness {
    pub client: Client,
    pub server: MockServer,
    pub hooks: RecordingHooks,
}

/// Defaults with the keep-alive switched off so only the exchanges under
/// test reach the server.
pub fn quiet_config() -> ClientConfig {
    ClientConfig {
        gc_enabled: false,
        ..ClientConfig::default()
    }
}

pub fn started(config: ClientConfig, identity: PageIdentity) -> Harness {
    let (transport, server) = MockTransport::new();
    let hooks = RecordingHooks::new();
    let client = ClientBuilder::new(transport)
        .with_config(config)
        .with_hooks(hooks.clone())
        .build();
    client.start(identity).expect("inside a runtime");

    Harness {
        client,
        server,
        hooks,
    }
}

pub fn page() -> PageIdentity {
    PageIdentity::new("F1", "S1")
}

/// Let every ready task run without moving the paused clock meaningfully.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
