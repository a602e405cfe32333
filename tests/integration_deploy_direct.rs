use deployr::{
    deployment::{Deployment, Runner},
    fabric::FabricKind,
    runtime::DeployRuntime,
    topology::Topology,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Three instances, direct instance ids: two workers run `W` with runner
/// ids 0 and 1, the coordinator runs `C` with runner id 2. Every entry
/// runs exactly once, on its assigned instance, seeing its own runner id.
#[tokio::test]
async fn three_instance_direct_deployment() -> anyhow::Result<()> {
    let group = FabricKind::Local.build_group(3)?;
    let executions: Arc<Mutex<Vec<(u64, u64, &'static str)>>> = Arc::default();

    let mut tasks = Vec::new();
    for fabric in group {
        let executions = executions.clone();
        tasks.push(tokio::spawn(async move {
            let instance = fabric.current_instance();
            let mut runtime = DeployRuntime::new(fabric, Topology::new());
            runtime.initialize()?;

            let context = runtime.context();
            for name in ["W", "C"] {
                let executions = executions.clone();
                let context = context.clone();
                runtime.register(name, move || {
                    let executions = executions.clone();
                    let context = context.clone();
                    async move {
                        executions.lock().push((instance, context.argument(), name));
                    }
                })?;
            }

            let deployment = Deployment::new(2)
                .with_runner(Runner::on_instance(0, "W", 0))
                .with_runner(Runner::on_instance(1, "W", 1))
                .with_runner(Runner::on_instance(2, "C", 2));
            runtime.deploy(&deployment).await?;
            runtime.finalize().await
        }));
    }
    for task in tasks {
        task.await.unwrap()?;
    }

    let mut seen = executions.lock().clone();
    seen.sort();
    assert_eq!(seen, vec![(0, 0, "W"), (1, 1, "W"), (2, 2, "C")]);
    Ok(())
}

/// A worker instance left without a runner is released by the coordinator
/// and completes its deployment without executing anything.
#[tokio::test]
async fn surplus_instance_is_released() -> anyhow::Result<()> {
    let group = FabricKind::Local.build_group(3)?;
    let executions: Arc<Mutex<Vec<u64>>> = Arc::default();

    let mut tasks = Vec::new();
    for fabric in group {
        let executions = executions.clone();
        tasks.push(tokio::spawn(async move {
            let instance = fabric.current_instance();
            let mut runtime = DeployRuntime::new(fabric, Topology::new());
            runtime.initialize()?;

            let executions = executions.clone();
            runtime.register("only", move || {
                let executions = executions.clone();
                async move {
                    executions.lock().push(instance);
                }
            })?;

            let deployment =
                Deployment::new(0).with_runner(Runner::on_instance(0, "only", 1));
            runtime.deploy(&deployment).await?;
            runtime.finalize().await
        }));
    }
    for task in tasks {
        task.await.unwrap()?;
    }

    assert_eq!(*executions.lock(), vec![1]);
    Ok(())
}
