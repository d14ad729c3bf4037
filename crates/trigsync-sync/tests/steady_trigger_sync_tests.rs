//! 端到端测试：稳定触发 → 协调器 → 前端读出
//!
//! 触发线程以 50 Hz 驱动模拟板卡，协调器作为 sink 把每个触发投递给
//! 一个进程内前端和一个 UDP 前端，两个前端都执行“忙 → 读出 → 就绪”循环。

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use trigsync_board::{BoardError, SimulatedBoard, TriggerBoard};
use trigsync_protocol::TriggerEvent;
use trigsync_sync::{
    PollOutcome, ReadoutError, ServerConfig, SyncClient, SyncClientConfig, SyncCoordinator,
    SyncServer, SyncedFrontend,
};
use trigsync_trigger::{SteadyTrigger, StaticConfigStore, TriggerConfig, TriggerSettings};

fn settings(enabled: bool, rate: f64) -> TriggerSettings {
    TriggerSettings {
        use_steady_trigger: enabled,
        trigger_rate: rate,
        ..Default::default()
    }
}

fn steady_trigger(settings: TriggerSettings) -> SteadyTrigger {
    SteadyTrigger::new(
        StaticConfigStore::new(settings),
        |config: &TriggerConfig| -> Result<Box<dyn TriggerBoard>, BoardError> {
            Ok(Box::new(SimulatedBoard::new(config.board_id, config.port)))
        },
    )
}

fn recording_readout(
    seen: &Arc<Mutex<Vec<u64>>>,
) -> impl FnMut(&TriggerEvent) -> Result<(), ReadoutError> + Send + use<> {
    let seen = Arc::clone(seen);
    move |event: &TriggerEvent| -> Result<(), ReadoutError> {
        seen.lock().unwrap().push(event.sequence);
        Ok(())
    }
}

fn assert_strictly_increasing(seen: &[u64]) {
    assert!(
        seen.windows(2).all(|w| w[1] > w[0]),
        "sequence went backwards or repeated: {:?}",
        seen
    );
}

#[test]
fn test_steady_trigger_drives_local_and_remote_frontends() {
    let coordinator = Arc::new(SyncCoordinator::default());
    let server = SyncServer::bind(
        "127.0.0.1:0",
        Arc::clone(&coordinator),
        ServerConfig {
            recv_timeout: Duration::from_millis(10),
            ..Default::default()
        },
    )
    .unwrap();

    let (_local_id, local_endpoint) = coordinator.register_client("local-adc");
    let remote = SyncClient::connect(
        server.local_addr(),
        "remote-adc",
        SyncClientConfig {
            recv_timeout: Duration::from_millis(5),
            ..Default::default()
        },
    )
    .unwrap();

    let local_seen = Arc::new(Mutex::new(Vec::new()));
    let remote_seen = Arc::new(Mutex::new(Vec::new()));
    let mut local = SyncedFrontend::new(local_endpoint, recording_readout(&local_seen));
    let mut remote = SyncedFrontend::new(remote, recording_readout(&remote_seen));

    let mut trigger = steady_trigger(settings(true, 50.0));
    trigger.add_sink(coordinator.clone());
    trigger.init().unwrap();

    local.begin_of_run();
    remote.begin_of_run();
    assert!(trigger.begin_of_run(1).unwrap());

    let deadline = Instant::now() + Duration::from_millis(600);
    while Instant::now() < deadline {
        assert_ne!(local.poll(), PollOutcome::Disconnected);
        assert_ne!(remote.poll(), PollOutcome::Disconnected);
        thread::sleep(Duration::from_millis(1));
    }
    trigger.end_of_run().unwrap();

    // 收尾：读完最后一个在途的触发
    let published = coordinator.metrics().published;
    let settle = Instant::now() + Duration::from_millis(200);
    while Instant::now() < settle {
        local.poll();
        remote.poll();
        thread::sleep(Duration::from_millis(1));
    }
    local.end_of_run();
    remote.end_of_run();

    // 50 Hz × 600 ms
    assert!((25..=35).contains(&published), "published {}", published);

    let local_seen = local_seen.lock().unwrap().clone();
    let remote_seen = remote_seen.lock().unwrap().clone();
    assert_strictly_increasing(&local_seen);
    assert_strictly_increasing(&remote_seen);

    // 每次运行序号从 1 开始、逐次 +1，最后读到的就是最后发布的
    assert_eq!(local_seen.last().copied(), Some(published));
    assert_eq!(remote_seen.last().copied(), Some(published));

    // 读出速度远快于触发周期，不应有覆盖
    let stats = local.endpoint().stats();
    assert_eq!(stats.delivered, published);
    assert_eq!(stats.consumed + stats.overwritten, published);
    assert!(local_seen.len() as u64 >= published - 1);
    assert!(remote.endpoint().stats().stale_dropped == 0);
}

#[test]
fn test_disabled_steady_trigger_publishes_nothing() {
    let coordinator = Arc::new(SyncCoordinator::default());
    let (_id, endpoint) = coordinator.register_client("adc");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut frontend = SyncedFrontend::new(endpoint, recording_readout(&seen));

    let mut trigger = steady_trigger(settings(false, 50.0));
    trigger.add_sink(coordinator.clone());
    frontend.begin_of_run();
    assert!(!trigger.begin_of_run(1).unwrap());

    thread::sleep(Duration::from_millis(100));
    assert_eq!(frontend.poll(), PollOutcome::Idle);
    trigger.end_of_run().unwrap();

    assert_eq!(coordinator.metrics().published, 0);
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_pause_stops_delivery_to_frontends() {
    let coordinator = Arc::new(SyncCoordinator::default());
    let (_id, endpoint) = coordinator.register_client("adc");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut frontend = SyncedFrontend::new(endpoint, recording_readout(&seen));

    let mut trigger = steady_trigger(settings(true, 100.0));
    trigger.add_sink(coordinator.clone());
    frontend.begin_of_run();
    assert!(trigger.begin_of_run(7).unwrap());

    thread::sleep(Duration::from_millis(100));
    assert!(trigger.pause_run());
    // 等待可能在途的最后一次发射
    thread::sleep(Duration::from_millis(20));
    let paused_at = coordinator.metrics().published;
    while frontend.poll() != PollOutcome::Idle {}

    thread::sleep(Duration::from_millis(100));
    assert_eq!(coordinator.metrics().published, paused_at);
    assert_eq!(frontend.poll(), PollOutcome::Idle);

    assert!(trigger.resume_run());
    thread::sleep(Duration::from_millis(100));
    trigger.end_of_run().unwrap();
    assert!(coordinator.metrics().published > paused_at);
    assert_strictly_increasing(&seen.lock().unwrap());
}
