use nacos_client_core::api::config::ConfigService;
use nacos_client_core::api::constants::DEFAULT_GROUP;
use nacos_client_core::api::naming::{Instance, NamingService, ServiceKey};
use nacos_client_core::common::memory::MemoryTransport;
use nacos_client_core::common::transport::Transport;
use nacos_client_core::{ChangeEvent, ClientBuilder, ClientConfig, Error, Listener, ListenerError, NacosClient};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn client(client_config: ClientConfig) -> (NacosClient, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let push = transport.connect();
    let client = ClientBuilder::new(client_config, transport.clone())
        .push_channel(push)
        .build()
        .await
        .unwrap();
    (client, transport)
}

async fn wait_until(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn describe(event: &ChangeEvent) -> String {
    match event {
        ChangeEvent::InstancesChanged {
            version, instances, ..
        } => format!("v{}:{}", version, instances.len()),
        ChangeEvent::ConfigChanged { content, .. } => {
            content.clone().unwrap_or_else(|| "<removed>".to_string())
        }
    }
}

/// Records every change it sees, optionally failing on the n-th one.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
    fail_on: Option<usize>,
}

impl Recorder {
    fn failing_on(n: usize) -> Arc<Self> {
        Arc::new(Recorder {
            fail_on: Some(n),
            ..Default::default()
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Listener for Recorder {
    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
        let count = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(describe(event));
            seen.len()
        };
        if Some(count) == self.fail_on {
            return Err("listener rejected change".into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_register_and_deregister_flow_through_push() {
    let (client, _transport) = client(ClientConfig::new()).await;
    let listener = Arc::new(Recorder::default());
    client
        .subscribe("demo-svc1", DEFAULT_GROUP, listener.clone())
        .await
        .unwrap();

    client
        .register_instance("demo-svc1", DEFAULT_GROUP, Instance::new("127.0.0.1", 9999))
        .await
        .unwrap();
    let instances = client
        .get_all_instances("demo-svc1", DEFAULT_GROUP, true)
        .await
        .unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].address(), "127.0.0.1:9999");
    assert!(wait_until(|| listener.seen().contains(&"v1:1".to_string())).await);

    client
        .deregister_instance("demo-svc1", DEFAULT_GROUP, "127.0.0.1", 9999, "")
        .await
        .unwrap();
    let mut drained = false;
    for _ in 0..200 {
        let selected = client
            .select_one_healthy_instance("demo-svc1", DEFAULT_GROUP)
            .await;
        if matches!(selected, Err(Error::NoHealthyInstance { .. })) {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(drained);
    assert!(wait_until(|| listener.seen().last().map(String::as_str) == Some("v2:0")).await);
}

#[tokio::test]
async fn test_published_config_is_served_locally() {
    let (client, transport) = client(ClientConfig::new()).await;
    assert!(client
        .publish_config("demo-dataid", "demo-group", "v1")
        .await
        .unwrap());
    assert_eq!(
        client.get_config("demo-dataid", "demo-group", 3000).await.unwrap(),
        "v1"
    );
    assert_eq!(transport.fetch_count(), 0);
}

#[tokio::test]
async fn test_cold_read_times_out() {
    let (client, transport) = client(ClientConfig::new()).await;
    transport.set_fetch_delay(Duration::from_secs(1));
    let err = client
        .get_config("demo-dataid", "demo-group", 100)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigTimeout { timeout_ms: 100, .. }));
}

#[tokio::test]
async fn test_failing_listener_keeps_receiving() {
    let (client, _transport) = client(ClientConfig::new()).await;
    let failing = Recorder::failing_on(1);
    let healthy = Arc::new(Recorder::default());
    client
        .add_listener("demo-dataid", "demo-group", failing.clone())
        .await
        .unwrap();
    client
        .add_listener("demo-dataid", "demo-group", healthy.clone())
        .await
        .unwrap();

    for content in ["v1", "v2"] {
        client
            .publish_config("demo-dataid", "demo-group", content)
            .await
            .unwrap();
        assert!(wait_until(|| healthy.seen().last().map(String::as_str) == Some(content)).await);
    }
    assert!(wait_until(|| failing.seen().len() == 2).await);
    assert_eq!(failing.seen(), vec!["v1", "v2"]);
    assert_eq!(healthy.seen(), vec!["v1", "v2"]);
}

#[tokio::test]
async fn test_unsubscribed_listener_sees_nothing() {
    let (client, transport) = client(ClientConfig::new()).await;
    let listener = Arc::new(Recorder::default());
    let handle: Arc<dyn Listener> = listener.clone();
    client
        .subscribe("demo-svc1", DEFAULT_GROUP, handle.clone())
        .await
        .unwrap();
    client
        .unsubscribe("demo-svc1", DEFAULT_GROUP, &handle)
        .await
        .unwrap();

    let observer = Arc::new(Recorder::default());
    client
        .subscribe("demo-svc1", DEFAULT_GROUP, observer.clone())
        .await
        .unwrap();
    transport
        .register_instance(
            &ServiceKey::new("demo-svc1", DEFAULT_GROUP),
            &Instance::new("127.0.0.1", 9999),
        )
        .await
        .unwrap();
    assert!(wait_until(|| observer.seen().contains(&"v1:1".to_string())).await);
    assert!(listener.seen().is_empty());
}

#[tokio::test]
async fn test_listeners_see_the_same_order() {
    let (client, _transport) = client(ClientConfig::new()).await;
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    client
        .add_listener("demo-dataid", "demo-group", first.clone())
        .await
        .unwrap();
    client
        .add_listener("demo-dataid", "demo-group", second.clone())
        .await
        .unwrap();

    let expected: Vec<String> = (1..=5).map(|i| format!("v{}", i)).collect();
    for (i, content) in expected.iter().enumerate() {
        client
            .publish_config("demo-dataid", "demo-group", content)
            .await
            .unwrap();
        assert!(wait_until(|| first.seen().len() > i && second.seen().len() > i).await);
    }
    assert_eq!(first.seen(), expected);
    assert_eq!(second.seen(), expected);
}

#[tokio::test]
async fn test_removed_config_reaches_listeners() {
    let (client, _transport) = client(ClientConfig::new()).await;
    let listener = Arc::new(Recorder::default());
    client
        .add_listener("demo-dataid", "demo-group", listener.clone())
        .await
        .unwrap();
    client
        .publish_config("demo-dataid", "demo-group", "v1")
        .await
        .unwrap();
    assert!(client
        .remove_config("demo-dataid", "demo-group")
        .await
        .unwrap());

    assert!(wait_until(|| listener.seen() == vec!["v1", "<removed>"]).await);
    assert!(matches!(
        client.get_config("demo-dataid", "demo-group", 3000).await,
        Err(Error::ConfigNotFound { .. })
    ));
}

#[tokio::test]
async fn test_polling_without_push() {
    let client_config = ClientConfig::new().refresh_interval(Duration::from_millis(100));
    let (client, transport) = client(client_config).await;
    transport.set_push_enabled(false);

    let listener = Arc::new(Recorder::default());
    client
        .subscribe("demo-svc1", DEFAULT_GROUP, listener.clone())
        .await
        .unwrap();
    transport
        .register_instance(
            &ServiceKey::new("demo-svc1", DEFAULT_GROUP),
            &Instance::new("127.0.0.1", 9999),
        )
        .await
        .unwrap();
    assert!(wait_until(|| listener.seen().contains(&"v1:1".to_string())).await);
}

#[tokio::test]
async fn test_shutdown_flushes_then_rejects() {
    let (client, _transport) = client(ClientConfig::new()).await;
    let listener = Arc::new(Recorder::default());
    client
        .add_listener("demo-dataid", "demo-group", listener.clone())
        .await
        .unwrap();
    client
        .publish_config("demo-dataid", "demo-group", "v1")
        .await
        .unwrap();

    client.shutdown().await;
    assert!(client.is_shutdown());
    assert_eq!(listener.seen(), vec!["v1"]);

    assert!(matches!(
        client.get_config("demo-dataid", "demo-group", 100).await,
        Err(Error::ClientShutdown)
    ));
    assert!(matches!(
        client
            .register_instance("demo-svc1", DEFAULT_GROUP, Instance::new("127.0.0.1", 9999))
            .await,
        Err(Error::ClientShutdown)
    ));
    // a second shutdown is a no-op
    client.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_build() {
    let transport = Arc::new(MemoryTransport::new());
    let result = ClientBuilder::new(ClientConfig::new().jitter_fraction(1.5), transport)
        .build()
        .await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}
