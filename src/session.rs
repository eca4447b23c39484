/// Streaming session controller
///
/// Drives one connect, stream, stop cycle:
/// `Idle -> Connecting -> Connected -> Streaming -> Stopped -> Idle`.
///
/// Each phase issues one task per device and joins the group before the
/// session advances. Per-device failures are collected and reported; they
/// never abort the rest of the group. A phase invoked while it (or an
/// incompatible phase) is already running is rejected as a no-op.
use futures_util::future::join_all;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bluetooth::scanner::{connect_all, discover, ConnectFailure};
use crate::bluetooth::transport::{NotificationStream, Transport};
use crate::config::SessionConfig;
use crate::decoder::decode;
use crate::error::{DecodeError, ExportError};
use crate::export::{
    align_export, read_reference_timestamps, reference_path, write_csv, write_reference_csv,
    ExportTable,
};
use crate::models::{ConnectedDevice, DeviceProfile, RawPacket, SensorSeries, SessionState, StoredSample};
use crate::store::SampleStore;
use crate::sync::ClockSynchronizer;
use crate::utils::{elapsed_ms, export_file_name, format_datetime, now};

/// A per-device failure during subscribe, unsubscribe or disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Connected {
        devices: usize,
        failures: Vec<ConnectFailure>,
    },
    /// No registry device was advertising.
    DiscoveryEmpty,
    DiscoveryFailed(String),
    /// Every connection attempt failed.
    NoneConnected(Vec<ConnectFailure>),
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started {
        subscribed: usize,
        failures: Vec<DeviceFailure>,
    },
    NoDevices,
    /// Every subscription failed; the session stays connected.
    NoneSubscribed(Vec<DeviceFailure>),
    Rejected,
}

#[derive(Debug)]
pub enum StopOutcome {
    Stopped(StopReport),
    Rejected,
}

#[derive(Debug)]
pub struct StopReport {
    pub table: ExportTable,
    /// Where the export was written, if writing succeeded.
    pub export_path: Option<PathBuf>,
    pub unsubscribe_failures: Vec<DeviceFailure>,
    /// Devices whose notification task died; they are left out of the export.
    pub lost_devices: Vec<DeviceFailure>,
}

/// What the notification workers handed back once they were joined.
#[derive(Debug, Default)]
struct Recorded {
    slots: Vec<SensorSeries>,
    lost: Vec<DeviceFailure>,
}

/// State owned by an active streaming session.
struct Streaming<H> {
    cancel: CancellationToken,
    task: JoinHandle<Recorded>,
    active: Vec<ConnectedDevice<H>>,
    sync: Arc<ClockSynchronizer>,
}

pub struct SessionController<T: Transport> {
    transport: Arc<T>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    devices: Mutex<Vec<ConnectedDevice<T::Handle>>>,
    connect_time: Mutex<Option<Instant>>,
    streaming: Mutex<Option<Streaming<T::Handle>>>,
    store: Mutex<SampleStore>,
    status: watch::Sender<String>,
}

impl<T: Transport> SessionController<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let (status, _) = watch::channel("Ready to connect".to_string());
        Self {
            transport: Arc::new(transport),
            config,
            state: Mutex::new(SessionState::Idle),
            devices: Mutex::new(Vec::new()),
            connect_time: Mutex::new(None),
            streaming: Mutex::new(None),
            store: Mutex::new(SampleStore::new()),
            status,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Best-effort, last-write-wins status line for display.
    pub fn status(&self) -> watch::Receiver<String> {
        self.status.subscribe()
    }

    /// Names and addresses of connected devices, in registry order.
    pub fn connected_devices(&self) -> Vec<(String, String)> {
        self.devices
            .lock()
            .iter()
            .map(|d| (d.profile.name.clone(), d.address.clone()))
            .collect()
    }

    /// Frozen clock offset for a device in the current streaming session.
    pub fn clock_offset(&self, device: &str) -> Option<i64> {
        self.streaming
            .lock()
            .as_ref()
            .and_then(|s| s.sync.offset(device))
    }

    fn set_status(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("Status: {}", message);
        self.status.send_replace(message);
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        info!("Session {} -> {}", *state, next);
        *state = next;
    }

    /// Move to `next` only from one of `from`. This is the reentrancy guard
    /// for every phase.
    fn transition(&self, from: &[SessionState], next: SessionState) -> bool {
        let mut state = self.state.lock();
        if !from.contains(&*state) {
            return false;
        }
        info!("Session {} -> {}", *state, next);
        *state = next;
        true
    }

    /// Discover registry devices and connect to all of them.
    pub async fn run(&self) -> RunOutcome {
        if !self.transition(&[SessionState::Idle, SessionState::Connected], SessionState::Connecting) {
            let message = match self.state() {
                SessionState::Connecting => "Connection is already running",
                _ => "Cannot connect while streaming",
            };
            self.set_status(message);
            return RunOutcome::Rejected;
        }

        let previous = std::mem::take(&mut *self.devices.lock());
        if !previous.is_empty() {
            info!("Dropping {} existing connection(s) before rediscovery", previous.len());
            self.disconnect_all(previous).await;
        }

        self.set_status("Connecting...");
        let found = match discover(
            self.transport.as_ref(),
            &self.config.registry,
            self.config.scan_duration,
        )
        .await
        {
            Ok(found) => found,
            Err(e) => {
                error!("Discovery failed: {}", e);
                self.set_status(format!("Discovery failed: {}", e));
                self.set_state(SessionState::Idle);
                return RunOutcome::DiscoveryFailed(e.to_string());
            }
        };

        if found.is_empty() {
            self.set_status("No recognized devices detected");
            self.set_state(SessionState::Idle);
            return RunOutcome::DiscoveryEmpty;
        }
        self.set_status(format!("Found {} device(s)", found.len()));

        let report = connect_all(&self.transport, &self.config.registry, found).await;
        let connect_time = Instant::now();

        if report.connected.is_empty() {
            self.set_status("Failed to connect to any device");
            self.set_state(SessionState::Idle);
            return RunOutcome::NoneConnected(report.failures);
        }

        let summary = report
            .connected
            .iter()
            .map(|d| format!("{} ({})", d.profile.name, d.address))
            .collect::<Vec<_>>()
            .join("\n");
        let devices = report.connected.len();
        *self.devices.lock() = report.connected;
        *self.connect_time.lock() = Some(connect_time);
        self.set_status(format!("Connected devices:\n{}", summary));
        self.set_state(SessionState::Connected);

        RunOutcome::Connected {
            devices,
            failures: report.failures,
        }
    }

    /// Subscribe every connected device and begin recording.
    ///
    /// Returns once all subscriptions have resolved; recording continues in
    /// the background until `stop_streaming`.
    pub async fn start_streaming(&self) -> StartOutcome {
        if self.devices.lock().is_empty() {
            self.set_status("No connected devices");
            return StartOutcome::NoDevices;
        }
        if !self.transition(&[SessionState::Connected], SessionState::Streaming) {
            self.set_status("Streaming is not available right now");
            return StartOutcome::Rejected;
        }

        let devices = self.devices.lock().clone();
        let connect_time = (*self.connect_time.lock()).unwrap_or_else(Instant::now);
        let checkpoint_ms = elapsed_ms(connect_time);
        let min_devices = self.config.sync_min_devices.unwrap_or(devices.len());
        let sync = Arc::new(ClockSynchronizer::new(checkpoint_ms, min_devices));
        info!("Streaming checkpoint at {} ms after connect", checkpoint_ms);

        let tasks = devices.iter().map(|device| {
            let transport = Arc::clone(&self.transport);
            let handle = device.handle.clone();
            let characteristic = device.profile.characteristic;
            tokio::spawn(async move { transport.subscribe(&handle, characteristic).await })
        });
        let results = join_all(tasks).await;

        let mut active = Vec::new();
        let mut streams = Vec::new();
        let mut failures = Vec::new();
        for (device, result) in devices.into_iter().zip(results) {
            let reason = match result {
                Ok(Ok(stream)) => {
                    info!("Subscribed to {} on {}", device.profile.characteristic, device.profile.name);
                    streams.push((device.profile.clone(), stream));
                    active.push(device);
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            error!("Failed to subscribe to {}: {}", device.profile.name, reason);
            failures.push(DeviceFailure {
                name: device.profile.name,
                reason,
            });
        }

        if active.is_empty() {
            self.set_status("Failed to subscribe to any device");
            self.set_state(SessionState::Connected);
            return StartOutcome::NoneSubscribed(failures);
        }

        self.store
            .lock()
            .open(active.iter().map(|d| d.profile.name.as_str()));

        let cancel = CancellationToken::new();
        let (names, workers): (Vec<_>, Vec<_>) = streams
            .into_iter()
            .map(|(profile, stream)| {
                let name = profile.name.clone();
                let worker = tokio::spawn(receive_notifications(
                    profile,
                    stream,
                    Arc::clone(&sync),
                    connect_time,
                    cancel.clone(),
                ));
                (name, worker)
            })
            .unzip();

        let wait = cancel.clone();
        let task = tokio::spawn(async move {
            wait.cancelled().await;
            let mut recorded = Recorded::default();
            for (name, result) in names.into_iter().zip(join_all(workers).await) {
                match result {
                    Ok(series) => recorded.slots.push(series),
                    Err(e) => {
                        error!("Notification task for {} failed: {}", name, e);
                        recorded.lost.push(DeviceFailure {
                            name,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            recorded
        });

        let subscribed = active.len();
        *self.streaming.lock() = Some(Streaming {
            cancel,
            task,
            active,
            sync,
        });
        self.set_status(format!(
            "Streaming from {} device(s) since {}",
            subscribed,
            format_datetime(&now())
        ));

        StartOutcome::Started {
            subscribed,
            failures,
        }
    }

    /// Stop recording, export the aligned table and tear the session down.
    pub async fn stop_streaming(&self) -> StopOutcome {
        if !self.transition(&[SessionState::Streaming], SessionState::Stopped) {
            self.set_status("Not streaming");
            return StopOutcome::Rejected;
        }
        let Some(streaming) = self.streaming.lock().take() else {
            self.set_state(SessionState::Connected);
            return StopOutcome::Rejected;
        };
        self.set_status("Stopping...");
        streaming.cancel.cancel();

        // Workers drop their notification streams on exit, which releases
        // the subscriptions before the unsubscribe group runs.
        let recorded = match streaming.task.await {
            Ok(recorded) => recorded,
            Err(e) => {
                error!("Streaming task failed: {}", e);
                Recorded {
                    slots: Vec::new(),
                    lost: streaming
                        .active
                        .iter()
                        .map(|d| DeviceFailure {
                            name: d.profile.name.clone(),
                            reason: e.to_string(),
                        })
                        .collect(),
                }
            }
        };

        let tasks = streaming.active.iter().map(|device| {
            let transport = Arc::clone(&self.transport);
            let handle = device.handle.clone();
            let characteristic = device.profile.characteristic;
            tokio::spawn(async move { transport.unsubscribe(&handle, characteristic).await })
        });
        let results = join_all(tasks).await;
        let unsubscribe_failures: Vec<DeviceFailure> = streaming
            .active
            .iter()
            .zip(results)
            .filter_map(|(device, result)| {
                let reason = match result {
                    Ok(Ok(())) => return None,
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };
                warn!("Failed to unsubscribe from {}: {}", device.profile.name, reason);
                Some(DeviceFailure {
                    name: device.profile.name.clone(),
                    reason,
                })
            })
            .collect();

        let connect_time = (*self.connect_time.lock()).unwrap_or_else(Instant::now);
        let stop_ms = elapsed_ms(connect_time);

        let table = {
            let mut store = self.store.lock();
            for lost in &recorded.lost {
                warn!("Leaving {} out of the export: {}", lost.name, lost.reason);
                store.remove(&lost.name);
            }
            for slot in recorded.slots {
                store.commit(slot);
            }
            store.freeze();
            align_export(
                &self.config.registry,
                &store,
                streaming.sync.checkpoint_ms(),
                stop_ms,
            )
        };
        info!(
            "Session recorded {} ms to {} ms, {} aligned rows",
            table.checkpoint_ms, stop_ms, table.row_count
        );

        let export_path = match self.write_export(&table).await {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Export failed: {}", e);
                None
            }
        };
        self.store.lock().clear();

        let devices = std::mem::take(&mut *self.devices.lock());
        self.disconnect_all(devices).await;
        *self.connect_time.lock() = None;

        self.set_status(match &export_path {
            Some(path) => format!("Exported {} rows to {}", table.row_count, path.display()),
            None => "Stopped, export failed".to_string(),
        });
        self.set_state(SessionState::Idle);

        StopOutcome::Stopped(StopReport {
            table,
            export_path,
            unsubscribe_failures,
            lost_devices: recorded.lost,
        })
    }

    async fn write_export(&self, table: &ExportTable) -> Result<PathBuf, ExportError> {
        let path = self.config.export_dir.join(export_file_name(&now()));
        let reference = self.config.reference_timestamps.clone();
        let table = table.clone();
        tokio::task::spawn_blocking(move || {
            write_csv(&table, &path)?;
            if let Some(reference) = reference {
                let timestamps = read_reference_timestamps(&reference)?;
                write_reference_csv(&table, &timestamps, &reference_path(&path))?;
            }
            Ok::<_, ExportError>(path)
        })
        .await?
    }

    /// Disconnect concurrently; failures are logged and otherwise ignored.
    async fn disconnect_all(&self, devices: Vec<ConnectedDevice<T::Handle>>) {
        let tasks = devices.iter().map(|device| {
            let transport = Arc::clone(&self.transport);
            let handle = device.handle.clone();
            tokio::spawn(async move { transport.disconnect(&handle).await })
        });
        for (device, result) in devices.iter().zip(join_all(tasks).await) {
            match result {
                Ok(Ok(())) => info!("Disconnected from {}", device.profile.name),
                Ok(Err(e)) => warn!("Failed to disconnect from {}: {}", device.profile.name, e),
                Err(e) => warn!("Disconnect task for {} failed: {}", device.profile.name, e),
            }
        }
    }
}

/// Decode one packet and append it to the device's series.
///
/// A packet that fails to decode, or whose timestamp cannot be placed on the
/// session clock, is dropped and leaves the series unchanged.
pub fn ingest_packet(
    profile: &DeviceProfile,
    packet: &RawPacket,
    sync: &ClockSynchronizer,
    series: &mut SensorSeries,
) -> Result<(), DecodeError> {
    let sample = decode(profile.format, &packet.bytes)?;
    let aligned_ms = sample
        .device_timestamp()
        .map(|ts| sync.align(&profile.name, ts).ok_or(DecodeError::Timestamp(ts)))
        .transpose()?;
    series.samples.push(StoredSample { aligned_ms, sample });
    Ok(())
}

/// Drain one device's notifications into a private series until cancelled or
/// the stream ends.
async fn receive_notifications(
    profile: DeviceProfile,
    mut stream: NotificationStream,
    sync: Arc<ClockSynchronizer>,
    connect_time: Instant,
    cancel: CancellationToken,
) -> SensorSeries {
    let mut series = SensorSeries::new(profile.name.clone());
    let mut dropped = 0usize;

    loop {
        tokio::select! {
            // Packets already queued are drained before the stop is honoured.
            biased;
            next = stream.next() => match next {
                Some(bytes) => {
                    let packet = RawPacket {
                        device: profile.name.clone(),
                        bytes,
                        received_ms: elapsed_ms(connect_time),
                    };
                    debug!("{} bytes from {} at {} ms", packet.bytes.len(), packet.device, packet.received_ms);
                    if let Err(e) = ingest_packet(&profile, &packet, &sync, &mut series) {
                        dropped += 1;
                        warn!("Dropping packet from {}: {}", profile.name, e);
                    }
                }
                None => {
                    warn!("Notification stream for {} ended", profile.name);
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        }
    }

    info!(
        "{}: {} samples recorded, {} packets dropped",
        profile.name,
        series.len(),
        dropped
    );
    series
}
