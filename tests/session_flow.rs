//! Session lifecycle against an in-memory transport.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use rust_imu_capture::bluetooth::{NotificationStream, Transport};
use rust_imu_capture::config::parse_device_list;
use rust_imu_capture::error::TransportError;
use rust_imu_capture::models::{AdvertisedDevice, Cell, SessionState};
use rust_imu_capture::{RunOutcome, SessionConfig, SessionController, StartOutcome, StopOutcome};

// ── MockTransport ─────────────────────────────────────────────

#[derive(Default)]
struct MockTransport {
    advertised: Vec<AdvertisedDevice>,
    fail_connect: HashSet<String>,
    fail_subscribe: HashSet<String>,
    fail_unsubscribe: HashSet<String>,
    crash_after_feed: HashSet<String>,
    feeds: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    discover_gate: Option<Arc<Notify>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    fn advertise(mut self, name: &str, address: &str) -> Self {
        self.advertised.push(AdvertisedDevice {
            name: name.to_string(),
            address: address.to_string(),
        });
        self
    }

    fn feed(self, address: &str, packets: Vec<Vec<u8>>) -> Self {
        self.feeds.lock().insert(address.to_string(), packets);
        self
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Handle = String;

    async fn discover(&self, _timeout: Duration) -> Result<Vec<AdvertisedDevice>, TransportError> {
        if let Some(gate) = &self.discover_gate {
            gate.notified().await;
        }
        Ok(self.advertised.clone())
    }

    async fn connect(&self, address: &str) -> Result<Self::Handle, TransportError> {
        self.record(format!("connect:{}", address));
        if self.fail_connect.contains(address) {
            return Err(TransportError::Other("connection refused".to_string()));
        }
        Ok(address.to_string())
    }

    async fn subscribe(
        &self,
        handle: &Self::Handle,
        _characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError> {
        self.record(format!("subscribe:{}", handle));
        if self.fail_subscribe.contains(handle) {
            return Err(TransportError::Other("not permitted".to_string()));
        }
        let packets = self.feeds.lock().remove(handle).unwrap_or_default();
        let tail: NotificationStream = if self.crash_after_feed.contains(handle) {
            stream::poll_fn(|_| -> Poll<Option<Vec<u8>>> { panic!("radio driver fault") }).boxed()
        } else {
            stream::pending().boxed()
        };
        Ok(stream::iter(packets).chain(tail).boxed())
    }

    async fn unsubscribe(&self, handle: &Self::Handle, _characteristic: Uuid) -> Result<(), TransportError> {
        self.record(format!("unsubscribe:{}", handle));
        if self.fail_unsubscribe.contains(handle) {
            return Err(TransportError::NotConnected(handle.clone()));
        }
        Ok(())
    }

    async fn disconnect(&self, handle: &Self::Handle) -> Result<(), TransportError> {
        self.record(format!("disconnect:{}", handle));
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────

const ADDR_A: &str = "AA:00:00:00:00:01";
const ADDR_B: &str = "AA:00:00:00:00:02";
const ADDR_X: &str = "AA:00:00:00:00:99";

fn six_axis(ts: u32) -> Vec<u8> {
    let mut bytes: Vec<u8> = [1i16, 2, 3, 4, 5, 6]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    bytes.extend_from_slice(&ts.to_le_bytes());
    bytes
}

fn config(export_dir: &std::path::Path) -> SessionConfig {
    let registry = parse_device_list(
        "A=00000001-0000-1000-8000-00805f9b34fb:six_axis,\
         B=00000002-0000-1000-8000-00805f9b34fb:six_axis",
    )
    .unwrap();
    let mut config = SessionConfig::new(registry);
    config.export_dir = export_dir.to_path_buf();
    config.scan_duration = Duration::from_millis(10);
    config
}

fn mixed_config(export_dir: &std::path::Path) -> SessionConfig {
    let registry = parse_device_list(
        "A=00000001-0000-1000-8000-00805f9b34fb:six_axis,\
         B=00000002-0000-1000-8000-00805f9b34fb:angle",
    )
    .unwrap();
    let mut config = SessionConfig::new(registry);
    config.export_dir = export_dir.to_path_buf();
    config.scan_duration = Duration::from_millis(10);
    config
}

fn scenario_transport() -> MockTransport {
    MockTransport::default()
        .advertise("B", ADDR_B)
        .advertise("Stranger", ADDR_X)
        .advertise("A", ADDR_A)
        .feed(ADDR_A, vec![six_axis(1000), six_axis(1016), six_axis(1032)])
        .feed(ADDR_B, vec![six_axis(5000), six_axis(5016)])
}

// ── Tests ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn two_devices_stream_and_export_aligned_rows() {
    let dir = tempfile::tempdir().unwrap();
    let transport = scenario_transport();
    let calls = Arc::clone(&transport.calls);
    let controller = SessionController::new(transport, config(dir.path()));

    assert!(matches!(
        controller.run().await,
        RunOutcome::Connected { devices: 2, .. }
    ));
    assert_eq!(controller.state(), SessionState::Connected);

    tokio::time::advance(Duration::from_millis(50)).await;
    assert!(matches!(
        controller.start_streaming().await,
        StartOutcome::Started { subscribed: 2, .. }
    ));

    let StopOutcome::Stopped(report) = controller.stop_streaming().await else {
        panic!("stop was rejected");
    };
    let table = &report.table;
    assert_eq!(table.checkpoint_ms, 50);
    assert_eq!(table.row_count, 2);
    assert_eq!(table.header()[0], "A_time");
    assert_eq!(table.header()[7], "B_time");
    let times: Vec<_> = table.rows().iter().map(|row| (row[0], row[7])).collect();
    assert_eq!(
        times,
        vec![(Cell::Int(50), Cell::Int(50)), (Cell::Int(66), Cell::Int(66))]
    );

    let path = report.export_path.expect("export written");
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    assert!(lines.next().unwrap().starts_with("A_time,A_ax"));
    assert!(lines.next().unwrap().starts_with("50,1,2,3,4,5,6,50,"));
    assert_eq!(lines.count(), 1);

    assert_eq!(controller.state(), SessionState::Idle);
    assert!(controller.connected_devices().is_empty());
    let calls = calls.lock();
    assert!(calls.contains(&format!("disconnect:{}", ADDR_A)));
    assert!(calls.contains(&format!("disconnect:{}", ADDR_B)));
}

#[tokio::test]
async fn unregistered_devices_are_never_connected() {
    let dir = tempfile::tempdir().unwrap();
    let transport = scenario_transport();
    let calls = Arc::clone(&transport.calls);
    let controller = SessionController::new(transport, config(dir.path()));

    controller.run().await;
    let names: Vec<_> = controller
        .connected_devices()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, ["A", "B"]);
    assert!(!calls.lock().contains(&format!("connect:{}", ADDR_X)));
}

#[tokio::test]
async fn connect_failure_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let mut transport = scenario_transport();
    transport.fail_connect.insert(ADDR_B.to_string());
    let controller = SessionController::new(transport, config(dir.path()));

    match controller.run().await {
        RunOutcome::Connected { devices, failures } => {
            assert_eq!(devices, 1);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].name, "B");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(controller.connected_devices(), vec![("A".to_string(), ADDR_A.to_string())]);
}

#[tokio::test]
async fn empty_discovery_leaves_session_idle() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::default().advertise("Stranger", ADDR_X);
    let controller = SessionController::new(transport, config(dir.path()));

    assert_eq!(controller.run().await, RunOutcome::DiscoveryEmpty);
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(*controller.status().borrow(), "No recognized devices detected");
    assert_eq!(controller.start_streaming().await, StartOutcome::NoDevices);
}

#[tokio::test]
async fn run_while_connecting_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Notify::new());
    let mut transport = scenario_transport();
    transport.discover_gate = Some(Arc::clone(&gate));
    let calls = Arc::clone(&transport.calls);
    let controller = SessionController::new(transport, config(dir.path()));

    let (first, second, _) = tokio::join!(controller.run(), controller.run(), async {
        gate.notify_one();
    });
    assert!(matches!(first, RunOutcome::Connected { devices: 2, .. }));
    assert_eq!(second, RunOutcome::Rejected);

    let connects = calls
        .lock()
        .iter()
        .filter(|c| c.starts_with("connect:"))
        .count();
    assert_eq!(connects, 2);
    assert_eq!(controller.connected_devices().len(), 2);
}

#[tokio::test]
async fn start_and_stop_are_guarded_by_state() {
    let dir = tempfile::tempdir().unwrap();
    let controller = SessionController::new(scenario_transport(), config(dir.path()));

    assert!(matches!(controller.stop_streaming().await, StopOutcome::Rejected));
    controller.run().await;
    assert!(matches!(controller.stop_streaming().await, StopOutcome::Rejected));
    assert!(matches!(
        controller.start_streaming().await,
        StartOutcome::Started { .. }
    ));
    assert_eq!(controller.start_streaming().await, StartOutcome::Rejected);
    assert!(matches!(controller.run().await, RunOutcome::Rejected));
    assert_eq!(controller.state(), SessionState::Streaming);
    assert!(matches!(controller.stop_streaming().await, StopOutcome::Stopped(_)));
    assert!(matches!(controller.stop_streaming().await, StopOutcome::Rejected));
}

#[tokio::test]
async fn subscribe_failure_excludes_device_from_export() {
    let dir = tempfile::tempdir().unwrap();
    let mut transport = scenario_transport();
    transport.fail_subscribe.insert(ADDR_B.to_string());
    let controller = SessionController::new(transport, config(dir.path()));

    controller.run().await;
    match controller.start_streaming().await {
        StartOutcome::Started {
            subscribed,
            failures,
        } => {
            assert_eq!(subscribed, 1);
            assert_eq!(failures[0].name, "B");
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let StopOutcome::Stopped(report) = controller.stop_streaming().await else {
        panic!("stop was rejected");
    };
    assert_eq!(report.table.row_count, 3);
    assert!(report.table.column("B").is_none());
    assert!(report.table.header().iter().all(|h| h.starts_with("A_")));
}

#[tokio::test]
async fn unsubscribe_failure_is_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut transport = scenario_transport();
    transport.fail_unsubscribe.insert(ADDR_A.to_string());
    let controller = SessionController::new(transport, config(dir.path()));

    controller.run().await;
    controller.start_streaming().await;
    let StopOutcome::Stopped(report) = controller.stop_streaming().await else {
        panic!("stop was rejected");
    };
    assert_eq!(report.unsubscribe_failures.len(), 1);
    assert_eq!(report.unsubscribe_failures[0].name, "A");
    assert_eq!(report.table.row_count, 2);
    assert!(report.export_path.is_some());
    assert_eq!(controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn all_subscriptions_failing_keeps_session_connected() {
    let dir = tempfile::tempdir().unwrap();
    let mut transport = scenario_transport();
    transport.fail_subscribe.insert(ADDR_A.to_string());
    transport.fail_subscribe.insert(ADDR_B.to_string());
    let controller = SessionController::new(transport, config(dir.path()));

    controller.run().await;
    assert!(matches!(
        controller.start_streaming().await,
        StartOutcome::NoneSubscribed(ref failures) if failures.len() == 2
    ));
    assert_eq!(controller.state(), SessionState::Connected);
}

#[tokio::test]
async fn reference_comparison_is_written_alongside_export() {
    let dir = tempfile::tempdir().unwrap();
    let reference = dir.path().join("reference.csv");
    std::fs::write(&reference, "t\n0\n16\n").unwrap();
    let mut config = config(dir.path());
    config.reference_timestamps = Some(reference);
    let controller = SessionController::new(scenario_transport(), config);

    controller.run().await;
    controller.start_streaming().await;
    let StopOutcome::Stopped(report) = controller.stop_streaming().await else {
        panic!("stop was rejected");
    };
    let export = report.export_path.unwrap();
    let companion = rust_imu_capture::export::reference_path(&export);
    let text = std::fs::read_to_string(companion).unwrap();
    assert!(text.starts_with("reference_time,A_ax"));
    assert_eq!(text.lines().count(), 3);
}

#[tokio::test]
async fn repeated_advertisements_connect_once() {
    let dir = tempfile::tempdir().unwrap();
    let transport = scenario_transport().advertise("A", "AA:00:00:00:00:03");
    let calls = Arc::clone(&transport.calls);
    let controller = SessionController::new(transport, config(dir.path()));

    assert!(matches!(
        controller.run().await,
        RunOutcome::Connected { devices: 2, .. }
    ));
    assert!(!calls.lock().contains(&"connect:AA:00:00:00:00:03".to_string()));
}

#[tokio::test(start_paused = true)]
async fn unplaceable_timestamp_is_dropped_without_losing_the_device() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::default()
        .advertise("A", ADDR_A)
        .advertise("B", ADDR_B)
        .feed(ADDR_A, vec![six_axis(1000), six_axis(1016), six_axis(1032)])
        .feed(
            ADDR_B,
            vec![
                b"2000 1.5".to_vec(),
                b"-9223372036854775808 1.0".to_vec(),
                b"2016 2.5".to_vec(),
            ],
        );
    let controller = SessionController::new(transport, mixed_config(dir.path()));

    controller.run().await;
    tokio::time::advance(Duration::from_millis(50)).await;
    controller.start_streaming().await;
    let StopOutcome::Stopped(report) = controller.stop_streaming().await else {
        panic!("stop was rejected");
    };

    assert!(report.lost_devices.is_empty());
    let table = &report.table;
    assert_eq!(table.row_count, 2);
    assert_eq!(&table.header()[7..], ["B_time", "B_angle0"]);
    let rows: Vec<_> = table.rows().iter().map(|row| (row[0], row[7], row[8])).collect();
    assert_eq!(
        rows,
        vec![
            (Cell::Int(50), Cell::Int(50), Cell::Float(1.5)),
            (Cell::Int(66), Cell::Int(66), Cell::Float(2.5)),
        ]
    );
}

#[tokio::test]
async fn crashed_recorder_is_left_out_of_export() {
    let dir = tempfile::tempdir().unwrap();
    let mut transport = scenario_transport();
    transport.crash_after_feed.insert(ADDR_B.to_string());
    let controller = SessionController::new(transport, config(dir.path()));

    controller.run().await;
    controller.start_streaming().await;
    let StopOutcome::Stopped(report) = controller.stop_streaming().await else {
        panic!("stop was rejected");
    };

    assert_eq!(report.lost_devices.len(), 1);
    assert_eq!(report.lost_devices[0].name, "B");
    assert_eq!(report.table.row_count, 3);
    assert!(report.table.column("B").is_none());
    let text = std::fs::read_to_string(report.export_path.unwrap()).unwrap();
    assert_eq!(text.lines().count(), 4);
    assert_eq!(controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn silent_device_still_gets_header_columns() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::default()
        .advertise("A", ADDR_A)
        .advertise("B", ADDR_B)
        .feed(ADDR_A, vec![six_axis(1000), six_axis(1016)]);
    let controller = SessionController::new(transport, mixed_config(dir.path()));

    controller.run().await;
    controller.start_streaming().await;
    let StopOutcome::Stopped(report) = controller.stop_streaming().await else {
        panic!("stop was rejected");
    };

    assert_eq!(report.table.row_count, 0);
    let text = std::fs::read_to_string(report.export_path.unwrap()).unwrap();
    assert_eq!(text, "A_time,A_ax,A_ay,A_az,A_gx,A_gy,A_gz,B_time\n");
}
