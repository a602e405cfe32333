use deployr::{
    deployment::{Deployment, Runner},
    fabric::FabricKind,
    runtime::DeployRuntime,
    topology::Topology,
    DeployError,
};

/// A runner references a function that exists on the coordinator but was
/// never registered on its assigned instance. The dispatch RPC itself
/// succeeds; the worker answers with the dispatch fault, which the
/// coordinator surfaces as `UnknownFunction`.
#[tokio::test]
async fn missing_function_on_the_assigned_instance() -> anyhow::Result<()> {
    let group = FabricKind::Local.build_group(2)?;

    let mut tasks = Vec::new();
    for fabric in group {
        tasks.push(tokio::spawn(async move {
            let instance = fabric.current_instance();
            let mut runtime = DeployRuntime::new(fabric, Topology::new());
            runtime.initialize()?;

            // Only the coordinator knows "Z"; the worker's table stays
            // empty.
            if instance == 0 {
                runtime.register("Z", || async {
                    panic!("the coordinator never hosts this runner");
                })?;
            }

            let deployment = Deployment::new(0).with_runner(Runner::on_instance(0, "Z", 1));
            let err = runtime.deploy(&deployment).await.unwrap_err();
            assert!(
                matches!(err, DeployError::UnknownFunction(ref name) if name == "Z"),
                "instance {instance} saw {err}"
            );
            Ok::<(), DeployError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap()?;
    }
    Ok(())
}

/// A deployment that references a function no instance registered fails
/// on the coordinator before anything is dispatched; workers must then be
/// torn down by the application.
#[tokio::test]
async fn missing_function_everywhere_fails_before_dispatch() -> anyhow::Result<()> {
    let group = FabricKind::Local.build_group(2)?;

    let mut tasks = Vec::new();
    for fabric in group {
        tasks.push(tokio::spawn(async move {
            let instance = fabric.current_instance();
            let mut runtime = DeployRuntime::new(fabric.clone(), Topology::new());
            runtime.initialize()?;

            let deployment = Deployment::new(0).with_runner(Runner::on_instance(0, "Z", 1));
            let err = runtime.deploy(&deployment).await.unwrap_err();
            if instance == 0 {
                assert!(matches!(err, DeployError::UnknownFunction(ref name) if name == "Z"));
                fabric.abort(1).await;
            } else {
                assert!(matches!(err, DeployError::Transport(_)));
            }
            Ok::<(), DeployError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap()?;
    }
    Ok(())
}
