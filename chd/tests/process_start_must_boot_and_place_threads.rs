/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

mod common;

use chd::{
    cgroups::ThreadGroup,
    guest::{RunState, StateReason},
};
use common::{fakes::NoThreadsYet, small_guest, Harness};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_start_must_boot_and_place_threads() {
    let harness = Harness::new();
    let guest = harness.guest(small_guest());

    harness
        .controller
        .start(&guest, StateReason::Booted)
        .await
        .expect("start");

    let vmm = harness.launcher.vmm(guest.name());
    assert_eq!(
        vmm.requests(),
        vec![
            "GET vmm.ping",
            "PUT vm.create",
            "PUT vm.add-net",
            "PUT vm.boot",
            "GET vm.info",
        ]
    );

    let state = guest.state();
    assert_eq!(state.state, RunState::Running);
    assert_eq!(state.reason, StateReason::Booted);
    assert!(guest.pid().is_some());
    assert_eq!(
        guest.consoles().console.as_deref(),
        Some(std::path::Path::new("/dev/pts/7"))
    );

    assert_eq!(
        harness.placer.placed(),
        vec![
            ThreadGroup::Emulator,
            ThreadGroup::IoThread(0),
            ThreadGroup::Vcpu(0),
            ThreadGroup::Vcpu(1),
        ]
    );
    assert_eq!(harness.links.calls(), vec!["up tap0"]);
    assert_eq!(
        harness.cgroups.calls(),
        vec![format!("setup {} [100]", guest.name())]
    );
    // no emulatorpin and no strict NUMA: the VMM starts on every online cpu
    let pid = guest.pid().expect("pid");
    assert_eq!(harness.cpus.calls(), vec![format!("affinity {pid} 0-7")]);

    let saved = harness.ctx().status().load_all().expect("load");
    assert!(saved.iter().any(|record| &record.name == guest.name()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_stop_must_release_the_vmm() {
    let harness = Harness::new();
    let guest = harness.guest(small_guest());
    harness
        .controller
        .start(&guest, StateReason::Booted)
        .await
        .expect("start");
    let socket = harness.ctx().config().monitor_paths(guest.name()).socket;
    assert!(socket.exists());

    harness
        .controller
        .stop(&guest, StateReason::Destroyed)
        .await
        .expect("stop");

    let vmm = harness.launcher.vmm(guest.name());
    assert_eq!(vmm.count("PUT vmm.shutdown"), 1);
    assert_eq!(guest.state().state, RunState::ShutOff);
    assert_eq!(guest.state().reason, StateReason::Destroyed);
    assert!(guest.pid().is_none());
    assert!(guest.monitor().is_none());
    assert!(!socket.exists());
    assert_eq!(
        harness.cgroups.calls().last(),
        Some(&format!("remove {}", guest.name()))
    );
    assert!(harness.ctx().status().load_all().expect("load").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_start_must_boot_before_the_vmm_lists_threads() {
    let harness = Harness::with_threads(Arc::new(NoThreadsYet));
    let mut def = small_guest();
    // vcpu 1 wants its own cpus, which needs vcpu threads to honour
    def.vcpus[1].cpumask = Some("2".parse().expect("mask"));
    let guest = harness.guest(def);

    harness
        .controller
        .start(&guest, StateReason::Booted)
        .await
        .expect("start");

    assert_eq!(guest.state().state, RunState::Running);
    assert!(guest.monitor().is_some());
    assert!(harness.placer.placed().is_empty());

    harness.controller.reboot(&guest).await.expect("reboot");
    harness.controller.set_vcpus(&guest, 1).await.expect("resize");
    assert_eq!(guest.state().state, RunState::Running);
    assert!(harness.placer.placed().is_empty());
}
