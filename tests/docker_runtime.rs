//! Runtime round trip against a real Docker or Podman daemon.
//!
//! Ignored by default; run with `cargo test -- --ignored` on a host with a
//! container runtime. Set SKIP_CONTAINER_TESTS=1 to skip even then.

#![cfg(feature = "containers")]

use gamefleet::config::ContainerSettings;
use gamefleet::container::{ContainerRuntime, ContainerSpec, DockerRuntime, container_name};
use gamefleet::model::RuntimeStatus;
use serial_test::serial;
use test_tag::tag;

fn should_run_container_tests() -> bool {
    if let Ok(value) = std::env::var("SKIP_CONTAINER_TESTS")
        && (value == "1" || value.eq_ignore_ascii_case("true"))
    {
        return false;
    }

    ["docker", "podman"].iter().any(|program| {
        std::process::Command::new(program)
            .arg("info")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    })
}

#[tokio::test]
#[ignore]
#[serial]
#[tag(integration, container)]
async fn test_container_round_trip() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests (Docker/Podman not available or SKIP_CONTAINER_TESTS=1)");
        return;
    }

    let runtime = DockerRuntime::connect(ContainerSettings::default())
        .await
        .expect("Failed to connect to Docker/Podman");
    let name = container_name(uuid::Uuid::new_v4());
    let spec = ContainerSpec::builder()
        .name(&name)
        .image("docker.io/library/busybox:latest")
        .cmd(["sleep", "300"])
        .build()
        .unwrap();

    runtime.rebuild_image("docker.io/library/busybox:latest").await.ok();
    runtime.create(&spec).await.expect("create failed");
    assert_eq!(runtime.status(&name).await.unwrap(), RuntimeStatus::Stopped);

    runtime.start(&name).await.expect("start failed");
    assert_eq!(runtime.status(&name).await.unwrap(), RuntimeStatus::Running);

    runtime.stop(&name).await.expect("stop failed");
    runtime.stop(&name).await.expect("second stop failed");
    assert_eq!(runtime.status(&name).await.unwrap(), RuntimeStatus::Stopped);

    runtime.remove(&name).await.expect("remove failed");
    runtime.remove(&name).await.expect("second remove failed");
    assert_eq!(runtime.status(&name).await.unwrap(), RuntimeStatus::Missing);
}
