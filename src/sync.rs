/// Host/device clock offset synchronization
///
/// Each device runs its own millisecond clock from boot. On a device's first
/// timestamped sample after streaming starts, `offset = device_ts - checkpoint`
/// is computed and frozen for the rest of the session. Clock drift between
/// devices is not compensated.
use log::info;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct ClockSynchronizer {
    checkpoint_ms: i64,
    min_devices: usize,
    offsets: Mutex<HashMap<String, i64>>,
    ready: AtomicBool,
}

impl ClockSynchronizer {
    /// `min_devices` is the readiness latch threshold: the latch flips once
    /// at least this many devices hold an offset.
    pub fn new(checkpoint_ms: i64, min_devices: usize) -> Self {
        Self {
            checkpoint_ms,
            min_devices: min_devices.max(1),
            offsets: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
        }
    }

    pub fn checkpoint_ms(&self) -> i64 {
        self.checkpoint_ms
    }

    /// Map a device timestamp onto the shared host-relative axis.
    ///
    /// The first call for a device fixes its offset; later calls reuse it.
    /// Returns `None`, and records nothing, when the arithmetic overflows.
    pub fn align(&self, device: &str, device_ts: i64) -> Option<i64> {
        let offset = {
            let mut offsets = self.offsets.lock();
            let before = offsets.len();
            let offset = match offsets.get(device) {
                Some(offset) => *offset,
                None => {
                    let offset = device_ts.checked_sub(self.checkpoint_ms)?;
                    offsets.insert(device.to_string(), offset);
                    offset
                }
            };
            if offsets.len() != before {
                info!("Clock offset for {} fixed at {} ms", device, offset);
                if offsets.len() >= self.min_devices && !self.ready.swap(true, Ordering::AcqRel) {
                    info!("Time synced across {} device(s)", offsets.len());
                }
            }
            offset
        };
        device_ts.checked_sub(offset)
    }

    pub fn offset(&self, device: &str) -> Option<i64> {
        self.offsets.lock().get(device).copied()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
