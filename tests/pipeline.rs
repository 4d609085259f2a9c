//! End-to-end: text-file source through the orchestrator into a memory
//! transport.

use std::sync::Arc;
use std::time::Duration;

use hr_bridge::config::PollConfig;
use hr_bridge::prelude::*;

async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn bridge_for(path: std::path::PathBuf) -> (Arc<Orchestrator>, Arc<MemoryTransport>) {
    let config = BridgeConfig {
        source: "textfile".into(),
        textfile: PollConfig {
            path,
            interval_ms: 50,
        },
        min_hr: 50.0,
        max_hr: 150.0,
        skip_process_check: true,
        ..BridgeConfig::default()
    };
    let memory = MemoryTransport::new();
    let bridge = Orchestrator::new(
        Arc::new(ConfigStore::in_memory(config)),
        Arc::new(AlwaysRunning),
        vec![memory.clone()],
    );
    (bridge, memory)
}

#[tokio::test]
async fn file_readings_become_avatar_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hr.txt");
    std::fs::write(&path, "100\n").unwrap();

    let (bridge, memory) = bridge_for(path.clone());
    bridge.handle_line("start").await;
    assert_eq!(bridge.state(), LifecycleState::Running);

    wait_for("HR=100", || memory.last("HR") == Some(ParamValue::Int(100))).await;
    assert_eq!(memory.last("onesHR"), Some(ParamValue::Int(0)));
    assert_eq!(memory.last("tensHR"), Some(ParamValue::Int(0)));
    assert_eq!(memory.last("hundredsHR"), Some(ParamValue::Int(1)));
    assert_eq!(memory.last("isHRConnected"), Some(ParamValue::Bool(true)));
    assert_eq!(memory.last("isHRActive"), Some(ParamValue::Bool(true)));
    match memory.last("HRPercent") {
        Some(ParamValue::Float(p)) => assert!((p - 0.5).abs() < 1e-6),
        other => panic!("unexpected HRPercent {other:?}"),
    }

    std::fs::write(&path, "73").unwrap();
    wait_for("HR=73", || memory.last("HR") == Some(ParamValue::Int(73))).await;
    assert_eq!(memory.last("onesHR"), Some(ParamValue::Int(3)));
    assert_eq!(memory.last("tensHR"), Some(ParamValue::Int(7)));

    bridge.handle_line("stop").await;
    assert_eq!(bridge.state(), LifecycleState::Idle);
    assert_eq!(memory.last("HR"), Some(ParamValue::Int(0)));
    assert_eq!(memory.last("isHRConnected"), Some(ParamValue::Bool(false)));
}

#[tokio::test]
async fn unchanged_readings_are_not_resent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hr.txt");
    std::fs::write(&path, "80").unwrap();

    let (bridge, memory) = bridge_for(path);
    bridge.start().await;
    wait_for("HR=80", || memory.last("HR") == Some(ParamValue::Int(80))).await;
    memory.take();

    // Several more polls of the same value.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(memory.take().iter().all(|(name, _)| name != "HR"));

    bridge.handle_signal(BridgeSignal::AvatarChanged("avtr_x".into()));
    let replayed = memory.take();
    assert!(replayed.contains(&("HR".to_owned(), ParamValue::Int(80))));

    bridge.shutdown().await;
}
