use nacos_client_core::api::config::ConfigService;
use nacos_client_core::api::constants::{DEFAULT_CLUSTER_NAME, DEFAULT_GROUP};
use nacos_client_core::api::naming::{Instance, NamingService};
use nacos_client_core::common::memory::MemoryTransport;
use nacos_client_core::{ChangeEvent, ClientBuilder, ClientConfig, Listener, ListenerError, NacosClient};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_stream::StreamExt;

const DATA_ID: &str = "demo-dataid";
const DATA_GROUP: &str = "demo-group";
const SERVICE: &str = "demo-svc1";

#[tokio::main]
async fn main() -> nacos_client_core::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let transport = Arc::new(MemoryTransport::new());
    let push = transport.connect();
    let client = ClientBuilder::new(
        ClientConfig::new()
            .namespace("public")
            .app_name("simple_app"),
        transport,
    )
    .push_channel(push)
    .build()
    .await?;

    config_walkthrough(&client).await?;
    naming_walkthrough(&client).await?;

    client.shutdown().await;
    Ok(())
}

async fn config_walkthrough(client: &NacosClient) -> nacos_client_core::Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let value = format!("test-value-{}", now);
    let published = client.publish_config(DATA_ID, DATA_GROUP, &value).await?;
    tracing::info!("publish config: {}", published);

    let content = client.get_config(DATA_ID, DATA_GROUP, 3000).await?;
    tracing::info!("get config: {}", content);

    let removed = client.remove_config(DATA_ID, DATA_GROUP).await?;
    tracing::info!("remove config: {}", removed);

    let mut stream = client.listen_config(DATA_ID, DATA_GROUP)?;
    tokio::spawn(async move {
        while let Some(resp) = stream.next().await {
            tracing::info!("listen config: {} => {}", resp.get_data_id(), resp.get_content());
        }
    });
    for i in 0..3 {
        client
            .publish_config(DATA_ID, DATA_GROUP, &format!("{{\"round\":{}}}", i))
            .await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(())
}

async fn register(client: &NacosClient, port: u16) -> nacos_client_core::Result<()> {
    let ip = client.client_config().client_ip.clone();
    let instance = Instance::new(ip.clone(), port)
        .weight(100.0)
        .cluster(DEFAULT_CLUSTER_NAME)
        .metadata("m1", "v1")
        .metadata("m2", "v2");
    client.register_instance(SERVICE, DEFAULT_GROUP, instance).await?;
    tracing::info!("register instance {}:{}", ip, port);
    Ok(())
}

async fn naming_walkthrough(client: &NacosClient) -> nacos_client_core::Result<()> {
    register(client, 9999).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let instances = client.get_all_instances(SERVICE, DEFAULT_GROUP, false).await?;
    tracing::info!("get all instances: {:?}", instances);
    let picked = client.select_one_healthy_instance(SERVICE, DEFAULT_GROUP).await?;
    tracing::info!("select one healthy instance: {}", picked.address());

    client
        .deregister_instance(
            SERVICE,
            DEFAULT_GROUP,
            &client.client_config().client_ip,
            9999,
            DEFAULT_CLUSTER_NAME,
        )
        .await?;
    tracing::info!("deregister instance {}:9999", client.client_config().client_ip);

    let listener: Arc<dyn Listener> = Arc::new(|event: &ChangeEvent| -> Result<(), ListenerError> {
        if let ChangeEvent::InstancesChanged {
            service_name,
            version,
            diff,
            ..
        } = event
        {
            tracing::info!(
                "instances changed: {} v{} added={} removed={}",
                service_name,
                version,
                diff.added.len(),
                diff.removed.len()
            );
        }
        Ok(())
    });
    client.subscribe(SERVICE, DEFAULT_GROUP, listener.clone()).await?;
    // the listener sees this one
    register(client, 9997).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    client.unsubscribe(SERVICE, DEFAULT_GROUP, &listener).await?;
    // and not this one
    register(client, 9999).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}
