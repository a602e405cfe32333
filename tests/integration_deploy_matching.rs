use deployr::{
    deployment::{Deployment, Runner},
    fabric::FabricKind,
    runtime::DeployRuntime,
    topology::{Device, Topology},
    DeployError,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

fn node(memory: u64) -> Topology {
    Topology::new().with_device(Device::new("cpu").with_memory("ram", memory).with_compute("core"))
}

const SMALL: u64 = 4 << 30;
const BIG: u64 = 64 << 30;

/// Topology-driven placement: the coordinator gathers every instance's
/// topology over RPC, matches the required topologies, and dispatches
/// accordingly. The big runner can only land on the one big instance.
#[tokio::test]
async fn placement_by_topology_matching() -> anyhow::Result<()> {
    let host_memories = [BIG, SMALL, SMALL];
    let group = FabricKind::Local.build_group(3)?;
    let placements: Arc<Mutex<Vec<(u64, u64)>>> = Arc::default();

    let mut tasks = Vec::new();
    for fabric in group {
        let placements = placements.clone();
        let topology = node(host_memories[fabric.current_instance() as usize]);
        tasks.push(tokio::spawn(async move {
            let instance = fabric.current_instance();
            let mut runtime = DeployRuntime::new(fabric, topology);
            runtime.initialize()?;

            let context = runtime.context();
            let placements = placements.clone();
            runtime.register("task", move || {
                let context = context.clone();
                let placements = placements.clone();
                async move {
                    placements.lock().push((context.argument(), instance));
                }
            })?;

            let deployment = Deployment::new(0)
                .with_runner(Runner::with_topology(0, "task", node(SMALL)))
                .with_runner(Runner::with_topology(1, "task", node(SMALL)))
                .with_runner(Runner::with_topology(2, "task", node(BIG)));
            runtime.deploy(&deployment).await?;
            runtime.finalize().await
        }));
    }
    for task in tasks {
        task.await.unwrap()?;
    }

    let placements = placements.lock().clone();
    assert_eq!(placements.len(), 3);

    // The big runner must be on instance 0; the small runners take the
    // remaining instances, one each.
    let by_runner: std::collections::HashMap<u64, u64> = placements.iter().copied().collect();
    assert_eq!(by_runner[&2], 0);
    let instances: HashSet<u64> = placements.iter().map(|(_, i)| *i).collect();
    assert_eq!(instances, HashSet::from([0, 1, 2]));
    Ok(())
}

/// With only small instances on offer, the big requirement cannot be
/// placed: the coordinator surfaces `Unmatchable` and the workers are
/// unblocked once the application tears the group down.
#[tokio::test]
async fn unplaceable_requirement_is_surfaced() -> anyhow::Result<()> {
    let group = FabricKind::Local.build_group(3)?;

    let mut tasks = Vec::new();
    for fabric in group {
        tasks.push(tokio::spawn(async move {
            let instance = fabric.current_instance();
            let mut runtime = DeployRuntime::new(fabric.clone(), node(SMALL));
            runtime.initialize()?;
            runtime.register("task", || async {})?;

            let deployment = Deployment::new(0)
                .with_runner(Runner::with_topology(0, "task", node(SMALL)))
                .with_runner(Runner::with_topology(1, "task", node(SMALL)))
                .with_runner(Runner::with_topology(2, "task", node(BIG)));
            let result = runtime.deploy(&deployment).await;

            if instance == 0 {
                // Coordinator: matching failed before any dispatch. The
                // deployment cannot proceed, so tear the group down to
                // unpark the workers.
                assert!(matches!(result, Err(DeployError::Unmatchable)));
                fabric.abort(1).await;
            } else {
                // Workers were parked in listen until the abort.
                assert!(matches!(result, Err(DeployError::Transport(_))));
            }
            Ok::<(), DeployError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap()?;
    }
    Ok(())
}

/// Mixed placement: one runner pinned directly, the other matched onto
/// whatever remains.
#[tokio::test]
async fn mixed_direct_and_matched_placement() -> anyhow::Result<()> {
    let host_memories = [SMALL, BIG];
    let group = FabricKind::Local.build_group(2)?;
    let placements: Arc<Mutex<Vec<(u64, u64)>>> = Arc::default();

    let mut tasks = Vec::new();
    for fabric in group {
        let placements = placements.clone();
        let topology = node(host_memories[fabric.current_instance() as usize]);
        tasks.push(tokio::spawn(async move {
            let instance = fabric.current_instance();
            let mut runtime = DeployRuntime::new(fabric, topology);
            runtime.initialize()?;

            let context = runtime.context();
            let placements = placements.clone();
            runtime.register("task", move || {
                let context = context.clone();
                let placements = placements.clone();
                async move {
                    placements.lock().push((context.argument(), instance));
                }
            })?;

            // Runner 0 is pinned to instance 0; runner 1 needs the big
            // instance, which only instance 1 provides.
            let deployment = Deployment::new(0)
                .with_runner(Runner::on_instance(0, "task", 0))
                .with_runner(Runner::with_topology(1, "task", node(BIG)));
            runtime.deploy(&deployment).await?;
            runtime.finalize().await
        }));
    }
    for task in tasks {
        task.await.unwrap()?;
    }

    let mut placements = placements.lock().clone();
    placements.sort();
    assert_eq!(placements, vec![(0, 0), (1, 1)]);
    Ok(())
}
