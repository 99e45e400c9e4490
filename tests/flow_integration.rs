//! End-to-end tests of the flow API: registration, rounds, persistence

use relayflow::codec::INTERRUPTED_MESSAGE;
use relayflow::parser::parse_workflow_yaml;
use relayflow::workflow::build_flow;
use relayflow::{Flow, FlowError, FlowStatus, NodeOutcome, NodeState, SeedArgs};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn artifact_flow() -> Flow {
    let mut flow = Flow::new("deploy");
    flow.node("find-artifact", &[], |ctx| async move {
        ctx.output("artifact-id", "build-233")?;
        Ok(())
    })
    .unwrap();
    flow.node("dispatch-artifact", &["find-artifact"], |ctx| async move {
        let id: String = ctx.input("artifact-id")?;
        let host: String = ctx.input("host")?;
        ctx.output("artifact-host", &format!("{}:{}", id, host))?;
        Ok(())
    })
    .unwrap();
    flow
}

async fn drive(flow: &mut Flow, cancel: &CancellationToken) -> usize {
    let mut rounds = 0;
    while !flow.is_done().unwrap() {
        flow.advance(cancel).await.unwrap();
        rounds += 1;
    }
    rounds
}

#[tokio::test]
async fn test_artifact_dispatch() {
    let cancel = CancellationToken::new();
    let mut flow = artifact_flow();

    let mut args = SeedArgs::new();
    args.insert("host".to_string(), json!("host1"));
    assert_eq!(flow.seed(args, &cancel).await.unwrap(), vec!["find-artifact"]);

    assert_eq!(drive(&mut flow, &cancel).await, 1);
    assert_eq!(flow.status().unwrap(), FlowStatus::Succeeded);
    assert_eq!(
        flow.read::<String>("artifact-host").unwrap(),
        "build-233:host1"
    );
}

#[tokio::test]
async fn test_resume_in_new_flow_after_every_round() {
    let cancel = CancellationToken::new();
    let mut flow = artifact_flow();
    let mut args = SeedArgs::new();
    args.insert("host".to_string(), json!("host1"));
    flow.seed(args, &cancel).await.unwrap();

    let mut payload = flow.encode().unwrap();
    loop {
        let mut resumed = artifact_flow();
        resumed.decode(&payload).unwrap();
        if resumed.is_done().unwrap() {
            assert_eq!(
                resumed.read::<String>("artifact-host").unwrap(),
                "build-233:host1"
            );
            break;
        }
        resumed.advance(&cancel).await.unwrap();
        payload = resumed.encode().unwrap();
    }
}

#[tokio::test]
async fn test_failure_blocks_only_its_dependents() {
    let cancel = CancellationToken::new();
    let mut flow = Flow::new("partial");
    flow.node("root", &[], |_| async { Ok(()) }).unwrap();
    flow.node("broken", &["root"], |_| async { anyhow::bail!("disk full") })
        .unwrap();
    flow.node("healthy", &["root"], |ctx| async move {
        ctx.output("healthy", &true)?;
        Ok(())
    })
    .unwrap();
    flow.node("after-broken", &["broken"], |_| async { Ok(()) })
        .unwrap();
    flow.node("after-healthy", &["healthy"], |ctx| async move {
        ctx.output("after-healthy", &true)?;
        Ok(())
    })
    .unwrap();

    flow.seed(SeedArgs::new(), &cancel).await.unwrap();
    drive(&mut flow, &cancel).await;

    assert_eq!(flow.status().unwrap(), FlowStatus::Stalled);
    assert_eq!(
        flow.node_outcome("broken").unwrap(),
        Some(NodeOutcome::Failed("disk full".to_string()))
    );
    assert_eq!(flow.node_state("after-broken").unwrap(), NodeState::Pending);
    assert!(flow.read::<bool>("after-healthy").unwrap());
}

#[tokio::test]
async fn test_restored_completed_nodes_never_rerun() {
    let runs = Arc::new(AtomicUsize::new(0));
    let build = |runs: Arc<AtomicUsize>| {
        let mut flow = Flow::new("counted");
        flow.node("once", &[], move |_| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
        flow
    };

    let cancel = CancellationToken::new();
    let mut flow = build(runs.clone());
    flow.seed(SeedArgs::new(), &cancel).await.unwrap();
    let payload = flow.encode().unwrap();

    let mut resumed = build(runs.clone());
    resumed.decode(&payload).unwrap();
    resumed.seed(SeedArgs::new(), &cancel).await.unwrap();
    resumed.advance(&cancel).await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_payload_from_running_checkpoint() {
    let payload = json!({
        "version": 1,
        "data": {"artifact-id": "build-233"},
        "nodes": {
            "find-artifact": {"state": "completed", "outputs": {"artifact-id": "build-233"}, "error": ""},
            "dispatch-artifact": {"state": "running", "outputs": {}, "error": ""}
        }
    });

    let mut flow = artifact_flow();
    flow.decode(payload.to_string().as_bytes()).unwrap();

    assert!(flow.is_done().unwrap());
    assert_eq!(
        flow.node_outcome("dispatch-artifact").unwrap(),
        Some(NodeOutcome::Failed(INTERRUPTED_MESSAGE.to_string()))
    );
}

#[tokio::test]
async fn test_registration_closed_after_start() {
    let mut flow = artifact_flow();
    flow.advance(&CancellationToken::new()).await.unwrap();

    let result = flow.node("late", &[], |_| async { Ok(()) });
    assert!(matches!(result, Err(FlowError::Config(_))));
}

#[tokio::test]
async fn test_declarative_workflow_round_trip() {
    let config = parse_workflow_yaml(
        r#"
name: deploy
nodes:
  - name: find-artifact
    command: "/bin/echo"
    args: ["build-233"]
    output: artifact-id
  - name: dispatch-artifact
    depends_on: [find-artifact]
    command: "/bin/sh"
    args: ["-c", "echo $ARTIFACT_ID:host1"]
    inputs: [artifact-id]
    output: artifact-host
"#,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let mut flow = build_flow(&config).unwrap();
    flow.seed(SeedArgs::new(), &cancel).await.unwrap();
    let payload = flow.encode().unwrap();

    let mut resumed = build_flow(&config).unwrap();
    resumed.decode(&payload).unwrap();
    drive(&mut resumed, &cancel).await;

    assert_eq!(resumed.status().unwrap(), FlowStatus::Succeeded);
    assert_eq!(
        resumed.read::<String>("artifact-host").unwrap(),
        "build-233:host1"
    );
}
