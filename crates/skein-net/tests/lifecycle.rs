//! End-to-end network lifecycle against stub executables.
//!
//! The router and client binaries are replaced with shell scripts that
//! sleep, which is all the supervisor cares about: the processes exist,
//! stay up, and die when killed. Verifies:
//! 1. Fan-out halt runs concurrently, not node by node
//! 2. A linear network with an edge and clients reaches Running and
//!    halts cleanly
//! 3. Written configs wire connector ports to the matching listeners
//! 4. Kill-and-restart fault injection brings a router back

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::future::join_all;

use skein_net::network::{InitOutcome, Network, NetworkConfig};
use skein_net::process::{LaunchSpec, ProcessSupervisor, SupervisorState, ROUTER_HALT_TIMEOUT};
use skein_net::version::fabricate_install_root;

fn scratch_root(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "skein_it_{tag}_{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_stub(path: &Path) {
    std::fs::write(path, "#!/bin/sh\nsleep 60\n").unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A network with stubbed router and client binaries and no settle naps.
fn stub_network(tag: &str) -> Network {
    let root = scratch_root(tag);
    let stub = root.join("stub.sh");
    write_stub(&stub);
    fabricate_install_root(&root.join("install"), &stub).unwrap();

    let config = NetworkConfig {
        stabilization: Duration::ZERO,
        client_pacing: Duration::from_millis(1),
        client_restart_pause: Duration::from_millis(50),
        client_executable: stub,
        ..NetworkConfig::default()
    };
    let mut net = Network::new("lifecycle", root.join("session"), config);
    net.register_version("latest", root.join("install"), root.join("install"))
        .unwrap();
    net
}

#[tokio::test]
async fn fan_out_halt_is_concurrent() {
    let root = scratch_root("fanout");
    let mut supervisors = Vec::new();
    for i in 0..6 {
        let supervisor = ProcessSupervisor::new(ROUTER_HALT_TIMEOUT);
        supervisor
            .start(LaunchSpec {
                executable: PathBuf::from("/bin/sleep"),
                args: vec!["60".into()],
                env: Vec::new(),
                setup_dir: root.join(format!("node_{i}")),
            })
            .await
            .unwrap();
        supervisors.push(supervisor);
    }

    let begin = Instant::now();
    let handles: Vec<_> = supervisors
        .iter()
        .map(|s| {
            let s = s.clone();
            tokio::spawn(async move { s.halt().await })
        })
        .collect();
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    // Six halt timeouts back to back would take 3s; concurrent fan-out
    // pays the timeout once.
    assert!(begin.elapsed() < Duration::from_secs(2));
    for supervisor in &supervisors {
        assert_eq!(supervisor.state(), SupervisorState::Halted);
    }
}

#[tokio::test]
async fn linear_network_with_clients_runs_and_halts() {
    let mut net = stub_network("linear");
    net.build_linear(3, None).unwrap();
    let edge = net.attach_edge("C", None).unwrap();
    let sender = net.add_sender("A").unwrap();
    let receiver = net.add_receiver(&edge).unwrap();
    net.add_client_address(&sender, "closest/it_test").unwrap();
    net.add_client_address(&receiver, "closest/it_test").unwrap();

    assert_eq!(net.init().unwrap(), InitOutcome::Ready);
    assert!(net.is_connected());
    net.run().await.unwrap();

    for name in ["A", "B", "C", edge.as_str()] {
        assert_eq!(
            net.topology().router(name).unwrap().state(),
            SupervisorState::Running,
            "router {name} should be running"
        );
    }
    for name in [sender.as_str(), receiver.as_str()] {
        assert_eq!(
            net.topology().client(name).unwrap().state(),
            SupervisorState::Running,
            "client {name} should be running"
        );
    }

    // Launch records let a failed run be reproduced by hand.
    let sender_setup = net.paths().results.join("setup").join(&sender);
    let command_line = std::fs::read_to_string(sender_setup.join("command_line")).unwrap();
    assert!(command_line.contains("--operation send"));
    assert!(command_line.contains("--address closest/it_test"));
    assert!(command_line.contains(&format!("--port {}", net.client_port("A").unwrap())));

    net.halt().await;
    for router in net.topology().routers() {
        assert_eq!(router.state(), SupervisorState::Halted);
    }
    for client in net.topology().clients() {
        assert_eq!(client.state(), SupervisorState::Halted);
    }
}

#[tokio::test]
async fn configs_wire_connectors_to_matching_listeners() {
    let mut net = stub_network("wiring");
    net.build_linear(2, None).unwrap();
    let edge = net.attach_edge("A", None).unwrap();
    net.init().unwrap();

    let a = net.topology().router("A").unwrap();
    let a_router_port = a.router_port();
    let a_edge_port = a.edge_port();

    // B dials A's inter-router listener.
    let b_config = std::fs::read_to_string(net.paths().config_file("B")).unwrap();
    assert!(b_config.contains(&format!("B_connector_to_{a_router_port}")));
    assert!(b_config.contains("role               : inter-router"));

    // The edge dials A's edge listener and exposes none of its own.
    let edge_config = std::fs::read_to_string(net.paths().config_file(&edge)).unwrap();
    assert!(edge_config.contains(&format!("{edge}_connector_to_{a_edge_port}")));
    assert!(edge_config.contains("mode          : edge"));
    assert!(!edge_config.contains("role               : inter-router\n"));

    // A's own config listens on both ports.
    let a_config = std::fs::read_to_string(net.paths().config_file("A")).unwrap();
    assert!(a_config.contains(&format!("port               : {a_router_port}")));
    assert!(a_config.contains(&format!("port               : {a_edge_port}")));
}

#[tokio::test]
async fn killed_router_comes_back_with_the_same_command_line() {
    let mut net = stub_network("restart");
    net.build_linear(2, None).unwrap();
    net.init().unwrap();
    net.run().await.unwrap();

    net.halt_and_restart_router("B", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(
        net.topology().router("B").unwrap().state(),
        SupervisorState::Running
    );

    net.halt().await;
}

#[tokio::test]
async fn random_client_restart_returns_it_to_running() {
    let mut net = stub_network("clientfault");
    net.build_linear(2, None).unwrap();
    let sender = net.add_sender("A").unwrap();
    let receiver = net.add_receiver("B").unwrap();
    net.init().unwrap();
    net.run().await.unwrap();

    let restarted = net.kill_and_restart_random_client().await.unwrap();
    assert!(restarted == sender || restarted == receiver);
    assert_eq!(
        net.topology().client(&restarted).unwrap().state(),
        SupervisorState::Running
    );
    // The untouched client was never halted.
    for client in net.topology().clients() {
        assert_eq!(client.state(), SupervisorState::Running);
    }

    net.halt().await;
}

#[tokio::test]
async fn halting_the_first_edge_only_touches_edges() {
    let mut net = stub_network("edgefault");
    net.build_linear(2, None).unwrap();
    let first = net.attach_edge("A", None).unwrap();
    let second = net.attach_edge("B", None).unwrap();
    net.init().unwrap();
    net.run().await.unwrap();

    let halted = net.halt_first_edge().await.unwrap();
    assert_eq!(halted, first);
    assert_eq!(
        net.topology().router(&first).unwrap().state(),
        SupervisorState::Halted
    );
    assert_eq!(
        net.topology().router(&second).unwrap().state(),
        SupervisorState::Running
    );
    assert_eq!(
        net.topology().router("A").unwrap().state(),
        SupervisorState::Running
    );

    net.halt().await;
}
