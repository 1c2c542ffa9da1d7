use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use mesh_ota_gateway::prelude::*;
use mesh_ota_gateway::sim::{
    SimClock, SimDevice, SimDistributor, SimFirmwareServer, SimIndicator, SimMesh, SimPowerSampler,
};
use mesh_ota_gateway::{info, init_logging, warn};

const NODE_LAYER: i32 = ROOT_LAYER + 1;

fn sim_address(index: u8) -> MeshAddress {
    MeshAddress::new([0x24, 0x0a, 0xc4, 0x00, 0x00, index])
}

/// Root attached to the real broker and HTTP origin, nodes fully simulated.
#[tokio::main]
async fn main() -> Result<(), Error> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.ron".to_string());
    let config = Arc::new(Config::load_or_default(&path)?);
    init_logging(&config.log_level);
    info!("main: config loaded from {}", path);

    let mesh = SimMesh::new();
    let node_addresses: Vec<MeshAddress> = (0..config.sim.nodes)
        .map(|i| sim_address(0x10 + i as u8))
        .collect();

    // Root
    let supervisor = Supervisor::new();
    let root_transport = mesh.join(sim_address(0x01), ROOT_LAYER);
    let root_distributor = SimDistributor::new();
    root_distributor.attach(root_transport.clone());
    root_distributor.set_result(UpgradeResult::new(node_addresses.iter().copied(), 0));

    let (client, events) =
        RumqttBroker::new(&config.broker, &supervisor).context("configuring broker session")?;
    let source = Arc::new(HttpFirmwareSource::new(config.ota.http_timeout())?);

    let root = MeshNode::start(
        Arc::clone(&config),
        NodeParts {
            collaborators: Collaborators {
                transport: root_transport,
                distributor: root_distributor,
                device: Arc::new(SimDevice::new()),
                indicator: Arc::new(SimIndicator::default()),
                time_sync: Arc::new(SimClock::default()),
                sampler: None,
            },
            source,
            broker: Some(BrokerLink { client, events }),
        },
        supervisor,
    )?;

    // Nodes
    let mut nodes = Vec::new();
    for address in &node_addresses {
        let node = MeshNode::start(
            Arc::clone(&config),
            NodeParts {
                collaborators: Collaborators {
                    transport: mesh.join(*address, NODE_LAYER),
                    distributor: SimDistributor::new(),
                    device: Arc::new(SimDevice::new()),
                    indicator: Arc::new(SimIndicator::default()),
                    time_sync: Arc::new(SimClock::default()),
                    sampler: Some(Arc::new(SimPowerSampler::default())),
                },
                source: Arc::new(SimFirmwareServer::new()),
                broker: None,
            },
            Supervisor::new(),
        )?;
        nodes.push(node);
    }

    root.notify(LifecycleEvent::Started).await?;
    root.notify(LifecycleEvent::ParentConnected { layer: ROOT_LAYER })
        .await?;
    root.notify(LifecycleEvent::RootGotAddress).await?;
    for node in &nodes {
        node.notify(LifecycleEvent::Started).await?;
        node.notify(LifecycleEvent::ParentConnected { layer: NODE_LAYER })
            .await?;
    }

    info!(
        "main: mesh up with {} node(s), waiting for commands on {}",
        nodes.len(),
        config.broker.command_topic
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    warn!("main: shutting down");

    for node in nodes.iter().chain(std::iter::once(&root)) {
        node.notify(LifecycleEvent::ParentDisconnected).await?;
        node.notify(LifecycleEvent::Stopped).await?;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    for node in nodes.iter().chain(std::iter::once(&root)) {
        node.shutdown();
    }

    Ok(())
}
