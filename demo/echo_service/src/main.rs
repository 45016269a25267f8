use std::sync::Arc;
use std::time::Duration;

use courier_core::telemetry::init_tracing;
use courier_core::{
    Envelope, Handler, MemoryBroker, MemoryBrokerConfig, RpcConfig, RpcFacade, Topology,
};
use tracing::{info, warn};

const ECHO_TOPIC: &str = "demo.echo";
const AUDIT_TOPIC: &str = "demo.audit";

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing("info,courier_core=info,echo_service=info")?;

    let requests = env_u64("ECHO_REQUESTS", 5);
    // Simulate a broker where new subscribers need a moment to attach
    let cluster = MemoryBroker::new(MemoryBrokerConfig {
        attach_delay: Duration::from_millis(env_u64("ECHO_ATTACH_DELAY_MS", 30)),
    });

    let server = RpcFacade::new(
        Arc::new(cluster.client()),
        RpcConfig::default()
            .with_group_id("echo-workers")
            .with_topology(Topology::Direct),
    )?;
    server
        .subscribe(
            ECHO_TOPIC,
            Handler::from_fn(|req: &Envelope| {
                let text = String::from_utf8_lossy(req.body_bytes()).to_uppercase();
                Ok(Some(text.into_bytes()))
            }),
        )
        .await?;
    server
        .subscribe(
            AUDIT_TOPIC,
            Handler::from_async_fn(|req: Envelope| async move {
                info!(
                    target: "echo_service",
                    correlation_id = %req.correlation_id,
                    bytes = req.body_bytes().len(),
                    "Audit record received"
                );
                Ok(None)
            }),
        )
        .await?;

    let client = RpcFacade::new(
        Arc::new(cluster.client()),
        RpcConfig::default().with_group_id("echo-callers"),
    )?;
    client.start().await?;

    for i in 0..requests {
        let payload = format!("hello #{i}").into_bytes();
        match client.send(ECHO_TOPIC, payload, true).await {
            Ok(Some(reply)) => info!(
                target: "echo_service",
                correlation_id = %reply.correlation_id,
                body = %String::from_utf8_lossy(reply.body_bytes()),
                "Echo reply"
            ),
            Ok(None) => warn!(target: "echo_service", "No reply returned"),
            Err(e) => warn!(target: "echo_service", error = %e, "Echo call failed"),
        }
        client
            .notify(AUDIT_TOPIC, format!("call {i} done").into_bytes())
            .await?;
    }

    // Let the last audit record drain before printing stats
    tokio::time::sleep(Duration::from_millis(50)).await;

    info!(
        target: "echo_service",
        client = %serde_json::to_string(&client.stats())?,
        server = %serde_json::to_string(&server.stats())?,
        "RPC stats"
    );

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}
