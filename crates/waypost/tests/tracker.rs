use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use waypost::session::{BrowserProfile, SessionConfig, SessionManager};
use waypost::transport::{MemoryConnector, Payload, TransportConfig, TransportManager};
use waypost::Tracker;
use waystore::{StorageBroker, StoreConfig};

fn tracker(broker: &StorageBroker, connector: &MemoryConnector) -> Tracker {
    let session = SessionManager::new(
        SessionConfig::default(),
        broker.context(),
        Arc::new(BrowserProfile::default().with_landing_page("https://shop.example/")),
    );
    let config = TransportConfig::default()
        .with_url("mem://collector")
        .with_heartbeat(Duration::ZERO, Duration::from_secs(5), 3);
    let transport = TransportManager::new(config, Arc::new(connector.clone()));
    Tracker::new(session, transport)
}

#[tokio::test(start_paused = true)]
async fn page_views_carry_the_session_context() {
    let broker = StorageBroker::in_memory();
    let connector = MemoryConnector::new();
    let tracker = tracker(&broker, &connector);

    let session = tracker.start().await;
    assert!(tracker.transport().is_connected());
    assert_eq!(session.landing_page.as_deref(), Some("https://shop.example/"));

    assert!(tracker.page_view("/products"));
    assert!(tracker.page_view("/cart"));
    tokio::time::sleep(Duration::from_millis(1)).await;

    let sent = connector.last_peer().unwrap().messages();
    assert_eq!(sent.len(), 2);
    for message in &sent {
        assert_eq!(message.session_id.as_deref(), Some(session.session_id.as_str()));
        assert_eq!(message.visitor_id.as_deref(), Some(session.visitor_id.as_str()));
    }
    match &sent[1].payload {
        Payload::Event(event) => {
            assert_eq!(event.name, "page_view");
            assert_eq!(event.properties["url"], "/cart");
            assert_eq!(event.properties["pageViews"], 2);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    tracker.shutdown();
}

#[tokio::test(start_paused = true)]
async fn identify_updates_outgoing_visitor_id() {
    let broker = StorageBroker::in_memory();
    let connector = MemoryConnector::new();
    let tracker = tracker(&broker, &connector);
    tracker.start().await;

    tracker.identify("customer-7");
    assert!(tracker.track("checkout", None));
    tokio::time::sleep(Duration::from_millis(1)).await;

    let sent = connector.last_peer().unwrap().messages();
    assert_eq!(sent.last().unwrap().visitor_id.as_deref(), Some("customer-7"));
    tracker.shutdown();
}

#[tokio::test(start_paused = true)]
async fn collector_outage_only_queues() {
    let broker = StorageBroker::in_memory();
    let connector = MemoryConnector::new();
    connector.set_mode(waypost::transport::ConnectMode::Refuse);
    let tracker = tracker(&broker, &connector);

    tracker.start().await;
    assert!(!tracker.page_view("/"));
    assert_eq!(tracker.transport().queue_len(), 1);
    assert_eq!(tracker.session().current_session().unwrap().page_views, 1);
    tracker.shutdown();
}

#[tokio::test(start_paused = true)]
async fn visitor_survives_a_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::with_base_path(dir.path());
    let connector = MemoryConnector::new();

    let first = {
        let broker = StorageBroker::open(&config).unwrap();
        let tracker = tracker(&broker, &connector);
        let session = tracker.start().await;
        tracker.page_view("/");
        tracker.shutdown();
        session
    };

    let broker = StorageBroker::open(&config).unwrap();
    let tracker = tracker(&broker, &connector);
    let restored = tracker.start().await;

    assert_eq!(restored.visitor_id, first.visitor_id);
    assert_eq!(restored.session_id, first.session_id);
    assert_eq!(restored.page_views, 1);
    assert!(!tracker.session().is_ephemeral());
    tracker.shutdown();
}
