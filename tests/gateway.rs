use std::sync::Arc;
use std::time::Duration;

use mesh_ota_gateway::prelude::*;
use mesh_ota_gateway::sim::{
    SimBroker, SimClock, SimDevice, SimDistributor, SimFirmwareServer, SimIndicator, SimMesh,
    SimPowerSampler,
};

const URL: &str = "http://h/fw.bin";

fn addr(last: u8) -> MeshAddress {
    MeshAddress::new([0x24, 0x0a, 0xc4, 0x00, 0x00, last])
}

fn config() -> Arc<Config> {
    let mut config = Config::default();
    config.mesh.restart_delay_ms = 10;
    config.telemetry.interval_ms = 20;
    Arc::new(config)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

struct Root {
    node: MeshNode,
    broker: Arc<SimBroker>,
    distributor: Arc<SimDistributor>,
    server: Arc<SimFirmwareServer>,
    indicator: Arc<SimIndicator>,
}

fn start_root(config: &Arc<Config>, mesh: &SimMesh) -> Root {
    let transport = mesh.join(addr(0x01), ROOT_LAYER);
    let distributor = SimDistributor::new();
    distributor.attach(transport.clone());
    let server = Arc::new(SimFirmwareServer::new());
    let indicator = Arc::new(SimIndicator::default());
    let (broker, events) = SimBroker::new();

    let node = MeshNode::start(
        Arc::clone(config),
        NodeParts {
            collaborators: Collaborators {
                transport,
                distributor: distributor.clone(),
                device: Arc::new(SimDevice::new()),
                indicator: indicator.clone(),
                time_sync: Arc::new(SimClock::default()),
                sampler: None,
            },
            source: server.clone(),
            broker: Some(BrokerLink {
                client: broker.clone(),
                events,
            }),
        },
        Supervisor::new(),
    )
    .unwrap();

    Root {
        node,
        broker,
        distributor,
        server,
        indicator,
    }
}

struct Leaf {
    node: MeshNode,
    device: Arc<SimDevice>,
    distributor: Arc<SimDistributor>,
}

fn start_leaf(config: &Arc<Config>, mesh: &SimMesh, address: MeshAddress) -> Leaf {
    let device = Arc::new(SimDevice::new());
    let distributor = SimDistributor::new();
    let node = MeshNode::start(
        Arc::clone(config),
        NodeParts {
            collaborators: Collaborators {
                transport: mesh.join(address, ROOT_LAYER + 1),
                distributor: distributor.clone(),
                device: device.clone(),
                indicator: Arc::new(SimIndicator::default()),
                time_sync: Arc::new(SimClock::default()),
                sampler: Some(Arc::new(SimPowerSampler::default())),
            },
            source: Arc::new(SimFirmwareServer::new()),
            broker: None,
        },
        Supervisor::new(),
    )
    .unwrap();

    Leaf {
        node,
        device,
        distributor,
    }
}

async fn bring_up_root(root: &Root) {
    root.node.notify(LifecycleEvent::Started).await.unwrap();
    root.node
        .notify(LifecycleEvent::ParentConnected { layer: ROOT_LAYER })
        .await
        .unwrap();
    root.node.notify(LifecycleEvent::RootGotAddress).await.unwrap();

    let state = root.node.state().clone();
    eventually(move || state.is_connected()).await;
    let bridge = Arc::clone(root.node.bridge().unwrap());
    eventually(move || bridge.is_session_up()).await;
}

async fn bring_up_leaf(leaf: &Leaf) {
    leaf.node.notify(LifecycleEvent::Started).await.unwrap();
    leaf.node
        .notify(LifecycleEvent::ParentConnected {
            layer: ROOT_LAYER + 1,
        })
        .await
        .unwrap();
    let state = leaf.node.state().clone();
    eventually(move || state.is_linked()).await;
}

#[tokio::test]
async fn test_root_lifecycle() {
    let config = config();
    let mesh = SimMesh::new();
    let root = start_root(&config, &mesh);

    bring_up_root(&root).await;
    assert!(root.indicator.is_on());
    assert!(root.node.state().is_root());
    assert_eq!(root.node.supervisor().running("mesh/"), 2);
    assert_eq!(root.broker.connects(), 1);
    let broker = Arc::clone(&root.broker);
    eventually(move || !broker.subscriptions().is_empty()).await;
    assert_eq!(
        root.broker.subscriptions(),
        vec![(config.broker.command_topic.clone(), QoS::AtMostOnce)]
    );

    root.node
        .notify(LifecycleEvent::ParentDisconnected)
        .await
        .unwrap();
    let state = root.node.state().clone();
    eventually(move || !state.is_linked() && state.role().is_none()).await;
    let supervisor = root.node.supervisor().clone();
    eventually(move || supervisor.running("mesh/") == 0).await;
    assert_eq!(root.broker.disconnects(), 1);
    assert!(!root.node.state().is_connected());

    root.node.notify(LifecycleEvent::Stopped).await.unwrap();
    let indicator = root.indicator.clone();
    eventually(move || !indicator.is_on()).await;
}

#[tokio::test]
async fn test_duplicate_parent_connected_starts_loops_once() {
    let config = config();
    let mesh = SimMesh::new();
    let _root = start_root(&config, &mesh);
    let leaf = start_leaf(&config, &mesh, addr(0x10));

    bring_up_leaf(&leaf).await;
    leaf.node
        .notify(LifecycleEvent::ParentConnected { layer: 4 })
        .await
        .unwrap();
    leaf.node.notify(LifecycleEvent::Started).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(leaf.node.state().role(), Some(NodeRole::Node));
    assert_eq!(leaf.node.supervisor().running("mesh/"), 1);
    assert_eq!(leaf.node.supervisor().running("telemetry/"), 1);
}

#[tokio::test]
async fn test_address_event_ignored_on_node() {
    let config = config();
    let mesh = SimMesh::new();
    let leaf = start_leaf(&config, &mesh, addr(0x10));

    bring_up_leaf(&leaf).await;
    leaf.node.notify(LifecycleEvent::RootGotAddress).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!leaf.node.state().is_connected());
}

#[tokio::test]
async fn test_command_upgrades_and_restarts_nodes() {
    let config = config();
    let mesh = SimMesh::new();
    let root = start_root(&config, &mesh);
    let leaves: Vec<Leaf> = [0x10, 0x11]
        .into_iter()
        .map(|last| start_leaf(&config, &mesh, addr(last)))
        .collect();

    bring_up_root(&root).await;
    for leaf in &leaves {
        bring_up_leaf(leaf).await;
    }

    let image: Vec<u8> = (0..4000u32).map(|i| (i % 256) as u8).collect();
    root.server.serve(URL, image.clone());
    root.distributor
        .set_result(UpgradeResult::new([addr(0x10), addr(0x11)], 0));

    root.broker
        .deliver(&config.broker.command_topic, &OtaCommand::new(URL).to_payload());

    let broker = Arc::clone(&root.broker);
    let status_topic = config.broker.status_topic.clone();
    eventually(move || !broker.published_on(&status_topic).is_empty()).await;

    let report: serde_json::Value = serde_json::from_slice(
        &root.broker.published_on(&config.broker.status_topic)[0].payload,
    )
    .unwrap();
    assert_eq!(report["status"], "completed");
    assert_eq!(report["restart_delivered"], true);
    assert_eq!(root.distributor.image(), image);

    for leaf in &leaves {
        let device = Arc::clone(&leaf.device);
        eventually(move || device.restarts() == 1).await;
        let received: Vec<u8> = leaf
            .distributor
            .node_fragments()
            .into_iter()
            .flat_map(|(_, fragment)| fragment)
            .collect();
        assert_eq!(received, image);
    }
    assert_eq!(root.node.orchestrator().phase(), OtaPhase::Idle);
}

#[tokio::test]
async fn test_node_telemetry_reaches_broker() {
    let config = config();
    let mesh = SimMesh::new();
    let root = start_root(&config, &mesh);
    let leaf = start_leaf(&config, &mesh, addr(0x10));

    bring_up_root(&root).await;
    bring_up_leaf(&leaf).await;

    let broker = Arc::clone(&root.broker);
    let topic = config.broker.telemetry_topic.clone();
    eventually(move || !broker.published_on(&topic).is_empty()).await;

    let published = root.broker.published_on(&config.broker.telemetry_topic);
    let published = &published[0];
    assert_eq!(published.qos, QoS::AtLeastOnce);
    assert_eq!(published.retain, config.broker.retain_telemetry);
    let document: serde_json::Value = serde_json::from_slice(&published.payload).unwrap();
    assert_eq!(document["measurement"], "power_manager");
}

#[tokio::test]
async fn test_telemetry_dropped_after_address_lost() {
    let config = config();
    let mesh = SimMesh::new();
    let root = start_root(&config, &mesh);
    let leaf = start_leaf(&config, &mesh, addr(0x10));

    bring_up_root(&root).await;
    root.node.notify(LifecycleEvent::RootLostAddress).await.unwrap();
    let state = root.node.state().clone();
    eventually(move || !state.is_connected()).await;

    bring_up_leaf(&leaf).await;
    let upstream = mesh.clone();
    eventually(move || upstream.deliveries().iter().filter(|d| d.upstream).count() >= 3).await;

    assert!(root
        .broker
        .published_on(&config.broker.telemetry_topic)
        .is_empty());
}

#[tokio::test]
async fn test_address_lost_unsubscribes_and_ignores_commands() {
    let config = config();
    let mesh = SimMesh::new();
    let root = start_root(&config, &mesh);
    root.server.serve(URL, vec![0xe9; 64]);

    bring_up_root(&root).await;
    root.node.notify(LifecycleEvent::RootLostAddress).await.unwrap();

    let broker = Arc::clone(&root.broker);
    let topic = config.broker.command_topic.clone();
    eventually(move || broker.unsubscriptions() == vec![topic.clone()]).await;
    assert!(!root.node.state().is_connected());

    root.broker
        .deliver(&config.broker.command_topic, &OtaCommand::new(URL).to_payload());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(root.server.opens(), 0);
    assert!(root.distributor.staging_history().is_empty());
    assert!(root.broker.published_on(&config.broker.status_topic).is_empty());

    // Regaining the address resubscribes and commands flow again
    root.node.notify(LifecycleEvent::RootGotAddress).await.unwrap();
    let broker = Arc::clone(&root.broker);
    eventually(move || broker.subscriptions().len() == 2).await;

    root.broker
        .deliver(&config.broker.command_topic, &OtaCommand::new(URL).to_payload());
    let broker = Arc::clone(&root.broker);
    let status_topic = config.broker.status_topic.clone();
    eventually(move || !broker.published_on(&status_topic).is_empty()).await;
    assert_eq!(root.distributor.staging_history().len(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_every_task() {
    let config = config();
    let mesh = SimMesh::new();
    let root = start_root(&config, &mesh);
    bring_up_root(&root).await;
    assert!(root.node.supervisor().running("") > 0);

    root.node.shutdown();
    let supervisor = root.node.supervisor().clone();
    eventually(move || {
        supervisor
            .snapshot()
            .iter()
            .all(|(_, status)| status.is_terminal())
    })
    .await;
}
