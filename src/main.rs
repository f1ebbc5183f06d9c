use anyhow::Result;
use awcp_core::api::ApiServer;
use awcp_core::config::Config;
use awcp_core::distributor::Distributor;
use awcp_core::external::{InMemoryAutoscaler, InMemoryMetricSink, InMemoryTaskStore, InMemoryWorkflowExecutor};
use awcp_core::fabric::Fabric;
use awcp_core::quality::QualityController;
use awcp_core::resource_monitor::ResourceMonitor;
use std::sync::Arc;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting AWCP control plane");

    let config = Config::load()?;

    let quality = QualityController::new();
    let task_store = Arc::new(InMemoryTaskStore::new());
    let workflow_executor = Arc::new(InMemoryWorkflowExecutor::new());
    let distributor = Distributor::new(Some(quality.clone()), Some(workflow_executor), Some(task_store));

    let metric_sink = Arc::new(InMemoryMetricSink::new());
    let autoscaler = Arc::new(InMemoryAutoscaler::new());
    let resource_monitor = ResourceMonitor::new(metric_sink, autoscaler)
        .with_namespace("AWCP/Resources");

    let fabric = Fabric::new();
    fabric.start_async_processing().await;

    if let Some(key_b64) = &config.security.master_key_base64 {
        use base64::Engine;
        let key = base64::engine::general_purpose::STANDARD
            .decode(key_b64)
            .expect("AWCP_SECURITY_KEY already validated as base64 at config load");
        fabric.enable_security(Some(key)).await?;
        info!("fabric secure envelope enabled with configured key");
    } else {
        warn!("AWCP_SECURITY_KEY not set; secure envelope will use a process-lifetime random key if enabled later");
    }

    let api_server = ApiServer::new(config, distributor, resource_monitor, fabric.clone(), quality);

    let result = api_server.run().await;
    fabric.stop_async_processing().await;
    result?;

    Ok(())
}
