use std::sync::Arc;
use std::time::Duration;

use crc::{Crc, CRC_32_ISO_HDLC};
use mesh_ota_gateway::prelude::*;
use mesh_ota_gateway::role::state::channel;
use mesh_ota_gateway::sim::{SimDistributor, SimFirmwareServer, SimMesh, SimTransport};

const URL: &str = "http://h/fw.bin";

fn addr(last: u8) -> MeshAddress {
    MeshAddress::new([0x24, 0x0a, 0xc4, 0x00, 0x00, last])
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct Rig {
    mesh: SimMesh,
    server: Arc<SimFirmwareServer>,
    distributor: Arc<SimDistributor>,
    orchestrator: Arc<Orchestrator>,
    writer: StateWriter,
    nodes: Vec<Arc<SimTransport>>,
}

impl Rig {
    fn new(nodes: u8) -> Self {
        Self::with_config(
            nodes,
            OtaConfig {
                open_retry_backoff_ms: 50,
                ..OtaConfig::default()
            },
        )
    }

    fn with_config(nodes: u8, config: OtaConfig) -> Self {
        let mesh = SimMesh::new();
        let root = mesh.join(addr(0x01), ROOT_LAYER);
        let nodes = (0..nodes).map(|i| mesh.join(addr(0x10 + i), 2)).collect();

        let server = Arc::new(SimFirmwareServer::new());
        let distributor = SimDistributor::new();
        let (writer, state) = channel();
        writer.set_role(Some(NodeRole::Root));
        writer.set_linked(true);

        let orchestrator = Orchestrator::new(
            server.clone(),
            distributor.clone(),
            root,
            state,
            &config,
        )
        .unwrap();

        Self {
            mesh,
            server,
            distributor,
            orchestrator: Arc::new(orchestrator),
            writer,
            nodes,
        }
    }

    async fn run(&self, url: &str) -> CycleOutcome {
        self.orchestrator
            .run_cycle(OtaEndpoint::new(url))
            .await
            .unwrap()
    }
}

fn failed_stage(outcome: &CycleOutcome) -> Option<CycleStage> {
    match outcome {
        CycleOutcome::Failed { stage, .. } => Some(*stage),
        CycleOutcome::Completed { .. } => None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_command_moves_idle_to_fetching() {
    let rig = Rig::new(1);
    rig.server.serve(URL, image(3000));
    rig.server.refuse_opens(1);
    rig.distributor
        .set_result(UpgradeResult::new([addr(0x10)], 0));

    let endpoint = parse_ota_endpoint(br#"{"ota_endpoint":"http://h/fw.bin"}"#);
    assert_eq!(endpoint.url(), URL);
    assert_eq!(rig.orchestrator.phase(), OtaPhase::Idle);

    let orchestrator = Arc::clone(&rig.orchestrator);
    let cycle = tokio::spawn(async move { orchestrator.run_cycle(endpoint).await });

    // The refused open parks the cycle in its backoff.
    while rig.server.opens() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        rig.orchestrator.phase(),
        OtaPhase::Fetching {
            url: URL.to_string()
        }
    );

    let outcome = cycle.await.unwrap().unwrap();
    assert!(outcome.is_completed());
    assert_eq!(rig.server.opens(), 2);
    assert_eq!(rig.orchestrator.phase(), OtaPhase::Idle);
}

#[tokio::test]
async fn test_zero_length_fails_without_staging() {
    let rig = Rig::new(1);
    rig.server
        .serve_with_length(URL, Some(0), b"<h1>404 Not Found</h1>".to_vec());

    let outcome = rig.run(URL).await;

    assert_eq!(failed_stage(&outcome), Some(CycleStage::Fetch));
    assert_eq!(rig.distributor.init_calls(), 0);
    assert_eq!(rig.distributor.chunks(), 0);
    assert_eq!(rig.distributor.releases(), 0);
    assert!(rig.distributor.distributions().is_empty());
    assert!(matches!(
        rig.orchestrator.phase(),
        OtaPhase::Failed {
            stage: CycleStage::Fetch,
            ..
        }
    ));
}

#[tokio::test]
async fn test_unknown_length_fails_without_staging() {
    let rig = Rig::new(1);
    rig.server.serve_with_length(URL, None, image(100));

    let outcome = rig.run(URL).await;
    assert_eq!(failed_stage(&outcome), Some(CycleStage::Fetch));
    assert_eq!(rig.distributor.init_calls(), 0);
}

#[tokio::test]
async fn test_restart_goes_to_succeeded_only() {
    let rig = Rig::new(3);
    let (a, b, c) = (addr(0x10), addr(0x11), addr(0x12));
    let body = image(3000);
    rig.server.serve(URL, body.clone());
    rig.distributor.set_result(UpgradeResult::new([a, b], 1));

    let outcome = rig.run(URL).await;

    let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&body);
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            url: URL.to_string(),
            succeeded: vec![a, b],
            unfinished: 1,
            image_size: 3000,
            image_crc32: crc,
            restart_delivered: true,
        }
    );
    assert_eq!(rig.mesh.plain_recipients(RESTART_PAYLOAD), vec![a, b]);
    assert!(!rig.mesh.plain_recipients(RESTART_PAYLOAD).contains(&c));
    assert_eq!(rig.orchestrator.phase(), OtaPhase::Idle);

    let message = rig.nodes[0].recv_node().await.unwrap();
    assert_eq!(message.payload, RESTART_PAYLOAD);
    assert_eq!(message.source, addr(0x01));
}

#[tokio::test]
async fn test_restart_count_matches_upgrade_result() {
    for (k, u) in [(0usize, 3usize), (1, 2), (2, 1), (3, 0)] {
        let rig = Rig::new(3);
        rig.server.serve(URL, image(2000));
        let succeeded: Vec<MeshAddress> = (0..k as u8).map(|i| addr(0x10 + i)).collect();
        rig.distributor
            .set_result(UpgradeResult::new(succeeded.clone(), u));

        let outcome = rig.run(URL).await;

        let restarted = rig.mesh.plain_recipients(RESTART_PAYLOAD);
        assert_eq!(restarted, succeeded, "k={k} u={u}");
        if k == 0 {
            assert_eq!(failed_stage(&outcome), Some(CycleStage::Distribute));
            assert!(matches!(rig.orchestrator.phase(), OtaPhase::Failed { .. }));
        } else {
            assert!(outcome.is_completed());
            assert_eq!(rig.orchestrator.phase(), OtaPhase::Idle);
        }
    }
}

#[tokio::test]
async fn test_second_command_while_distributing_is_dropped() {
    let rig = Rig::new(1);
    rig.server.serve(URL, image(2000));
    rig.server.serve("http://h/other.bin", image(10));
    rig.distributor
        .set_result(UpgradeResult::new([addr(0x10)], 0));
    rig.distributor.hold();

    let orchestrator = Arc::clone(&rig.orchestrator);
    let first = tokio::spawn(async move { orchestrator.run_cycle(OtaEndpoint::new(URL)).await });

    let mut phase = rig.orchestrator.subscribe();
    phase
        .wait_for(|phase| *phase == OtaPhase::Distributing)
        .await
        .unwrap();

    let second = rig
        .orchestrator
        .run_cycle(OtaEndpoint::new("http://h/other.bin"))
        .await;
    assert_eq!(second, Err(Error::Busy));
    assert_eq!(rig.server.opens(), 1);
    assert_eq!(rig.distributor.init_calls(), 1);

    rig.distributor.resume();
    let outcome = first.await.unwrap().unwrap();
    assert!(outcome.is_completed());
    assert_eq!(rig.distributor.distributions().len(), 1);

    // Idle again, the next command is accepted.
    assert!(rig.run("http://h/other.bin").await.is_completed());
    assert_eq!(rig.server.opens(), 2);
}

#[tokio::test]
async fn test_concurrent_commands_single_flight() {
    let rig = Rig::new(1);
    rig.server.serve(URL, image(500));
    rig.distributor
        .set_result(UpgradeResult::new([addr(0x10)], 0));
    rig.distributor.hold();

    let mut workers = Vec::new();
    for _ in 0..8 {
        let orchestrator = Arc::clone(&rig.orchestrator);
        workers.push(tokio::spawn(async move {
            orchestrator.run_cycle(OtaEndpoint::new(URL)).await
        }));
    }

    let mut phase = rig.orchestrator.subscribe();
    phase
        .wait_for(|phase| *phase == OtaPhase::Distributing)
        .await
        .unwrap();
    rig.distributor.resume();

    let mut accepted = 0;
    let mut busy = 0;
    for worker in workers {
        match worker.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(Error::Busy) => busy += 1,
            Err(e) => panic!("unexpected {e}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(busy, 7);
    assert_eq!(rig.server.opens(), 1);
}

#[tokio::test]
async fn test_empty_endpoint_rejected() {
    let rig = Rig::new(1);
    let result = rig.orchestrator.run_cycle(OtaEndpoint::default()).await;
    assert_eq!(result, Err(Error::EmptyEndpoint));
    assert_eq!(rig.server.opens(), 0);
    assert_eq!(rig.orchestrator.phase(), OtaPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_open_retry_is_bounded() {
    let rig = Rig::with_config(
        1,
        OtaConfig {
            open_retry_limit: Some(3),
            ..OtaConfig::default()
        },
    );
    rig.server.serve(URL, image(10));
    rig.server.refuse_opens(10);

    let outcome = rig.run(URL).await;
    assert_eq!(failed_stage(&outcome), Some(CycleStage::Fetch));
    assert_eq!(rig.server.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_open_retried_until_origin_answers() {
    let rig = Rig::new(1);
    rig.server.serve(URL, image(10));
    rig.server.refuse_opens(2);
    rig.distributor
        .set_result(UpgradeResult::new([addr(0x10)], 0));

    assert!(rig.run(URL).await.is_completed());
    assert_eq!(rig.server.opens(), 3);
}

#[tokio::test]
async fn test_non_root_does_not_retry() {
    let rig = Rig::new(1);
    rig.writer.set_role(Some(NodeRole::Node));
    rig.server.serve(URL, image(10));
    rig.server.refuse_opens(5);

    let outcome = rig.run(URL).await;
    assert_eq!(failed_stage(&outcome), Some(CycleStage::Fetch));
    assert_eq!(rig.server.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_stops_when_role_is_lost() {
    let rig = Rig::with_config(
        1,
        OtaConfig {
            open_retry_limit: None,
            ..OtaConfig::default()
        },
    );
    rig.server.serve(URL, image(10));
    rig.server.refuse_opens(usize::MAX);

    let orchestrator = Arc::clone(&rig.orchestrator);
    let cycle = tokio::spawn(async move { orchestrator.run_cycle(OtaEndpoint::new(URL)).await });

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(rig.server.opens() >= 2);
    rig.writer.set_role(Some(NodeRole::Node));

    let outcome = cycle.await.unwrap().unwrap();
    assert_eq!(failed_stage(&outcome), Some(CycleStage::Fetch));
    assert!(rig.server.opens() <= 4);
}

#[tokio::test]
async fn test_write_failure_aborts_cycle() {
    let rig = Rig::new(1);
    rig.server.serve(URL, image(3000));
    rig.distributor.fail_write_after(1);

    let outcome = rig.run(URL).await;
    assert_eq!(failed_stage(&outcome), Some(CycleStage::Stage));
    assert_eq!(rig.distributor.releases(), 1);
    assert!(rig.distributor.distributions().is_empty());
    assert!(rig.mesh.plain_recipients(RESTART_PAYLOAD).is_empty());
}

#[tokio::test]
async fn test_staging_init_failure_releases() {
    let rig = Rig::new(1);
    rig.server.serve(URL, image(3000));
    rig.distributor.fail_init();

    let outcome = rig.run(URL).await;
    assert_eq!(failed_stage(&outcome), Some(CycleStage::Stage));
    assert_eq!(rig.distributor.init_calls(), 1);
    assert_eq!(rig.distributor.releases(), 1);
}

#[tokio::test]
async fn test_truncated_body_fails() {
    let rig = Rig::new(1);
    rig.server.serve_with_length(URL, Some(5000), image(3000));

    let outcome = rig.run(URL).await;
    match outcome {
        CycleOutcome::Failed { stage, reason, .. } => {
            assert_eq!(stage, CycleStage::Fetch);
            assert!(reason.contains("3000 of 5000"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(rig.distributor.releases(), 1);
}

#[tokio::test]
async fn test_image_staged_under_url_name() {
    let rig = Rig::new(1);
    let url = "http://10.0.0.2:8070/images/greenhouse_v3.bin";
    let body = image(4000);
    rig.server.serve(url, body.clone());
    rig.distributor
        .set_result(UpgradeResult::new([addr(0x10)], 0));

    assert!(rig.run(url).await.is_completed());
    assert_eq!(
        rig.distributor.staging_history(),
        vec![("greenhouse_v3".to_string(), 4000)]
    );
    assert_eq!(rig.distributor.image(), body);
    assert_eq!(rig.distributor.releases(), 1);
    assert_eq!(rig.distributor.distributions(), vec![vec![MeshAddress::BROADCAST]]);
}

#[tokio::test]
async fn test_configured_targets() {
    let rig = Rig::with_config(
        2,
        OtaConfig {
            targets: vec!["24:0a:c4:00:00:11".to_string()],
            ..OtaConfig::default()
        },
    );
    rig.server.serve(URL, image(10));

    let outcome = rig.run(URL).await;
    assert!(outcome.is_completed());
    assert_eq!(rig.distributor.distributions(), vec![vec![addr(0x11)]]);
    assert_eq!(rig.mesh.plain_recipients(RESTART_PAYLOAD), vec![addr(0x11)]);
}

#[tokio::test]
async fn test_failed_cycle_accepts_next_command() {
    let rig = Rig::new(1);
    rig.server.serve_with_length(URL, Some(0), Vec::new());
    assert!(!rig.run(URL).await.is_completed());

    rig.server.serve(URL, image(10));
    rig.distributor
        .set_result(UpgradeResult::new([addr(0x10)], 0));
    assert!(rig.run(URL).await.is_completed());
}
