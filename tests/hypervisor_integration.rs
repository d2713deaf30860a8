//! Integration tests against a real hypervisor binary.
//!
//! These require a working Incus/LXD installation with the default
//! `coi-bridge` OVN network configured, so they're marked `#[ignore]` by
//! default and skip cleanly when the binary is unavailable.

use coi::container::ContainerManager;
use coi::hypervisor::HypervisorDriver;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coi=debug".parse().unwrap()),
        )
        .try_init();
}

fn hypervisor_available() -> bool {
    HypervisorDriver::default().exec_capture(&["version"]).is_ok()
}

#[tokio::test]
#[ignore = "Requires a working hypervisor (incus) installation"]
async fn container_lifecycle_against_real_hypervisor() {
    init_test_logging();
    if !hypervisor_available() {
        eprintln!("skipping: no hypervisor binary on PATH");
        return;
    }

    let driver = HypervisorDriver::default();
    let containers = ContainerManager::new(driver);
    let name = "coi-test-lifecycle-1";

    containers.delete(name, true).ok();
    containers.launch(name, "images:debian/12").expect("launch");
    assert!(containers.exists(name).unwrap());
    assert!(containers.running(name).unwrap());

    containers.stop(name, false).expect("stop");
    assert!(!containers.running(name).unwrap());

    containers.delete(name, true).expect("delete");
    assert!(!containers.exists(name).unwrap());
}

#[tokio::test]
#[ignore = "Requires a working hypervisor (incus) installation with an OVN network"]
async fn acl_attach_requires_ovn_network() {
    init_test_logging();
    if !hypervisor_available() {
        eprintln!("skipping: no hypervisor binary on PATH");
        return;
    }

    use coi::acl::{build_restricted_rules, AclManager};

    let driver = HypervisorDriver::default();
    let containers = ContainerManager::new(driver.clone());
    let name = "coi-test-acl-1";

    containers.delete(name, true).ok();
    containers.init(name, "images:debian/12").expect("init");

    let acl = AclManager::new(driver);
    let rules = build_restricted_rules("10.128.178.1", false);
    acl.create(name, &rules).expect("create acl");
    acl.apply_to_container(name, "eth0").expect("attach acl");

    acl.delete(name).expect("delete acl");
    containers.delete(name, true).expect("delete container");
}
