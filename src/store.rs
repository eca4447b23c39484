/// Per-device sample buffers for one streaming session
///
/// During streaming each notification task appends to its own private
/// `SensorSeries`; the store receives those slots once the tasks have exited
/// and freezes them for export.
use log::warn;
use std::collections::HashMap;

use crate::models::SensorSeries;

#[derive(Debug, Default)]
pub struct SampleStore {
    series: HashMap<String, SensorSeries>,
    accepting: bool,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to empty series for the given devices and accept writes.
    pub fn open<'a, I>(&mut self, devices: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.series = devices
            .into_iter()
            .map(|name| (name.to_string(), SensorSeries::new(name)))
            .collect();
        self.accepting = true;
    }

    /// Merge a device's private slot. Ignored unless the store is open and
    /// the device was registered by `open`.
    pub fn commit(&mut self, slot: SensorSeries) -> bool {
        if !self.accepting {
            warn!("Dropping {} samples for {}: store is frozen", slot.len(), slot.device);
            return false;
        }
        match self.series.get_mut(&slot.device) {
            Some(series) => {
                series.samples.extend(slot.samples);
                true
            }
            None => {
                warn!("Dropping samples for {}: not an active device", slot.device);
                false
            }
        }
    }

    /// Drop a device from the session, e.g. when its recording task died.
    pub fn remove(&mut self, device: &str) -> Option<SensorSeries> {
        self.series.remove(device)
    }

    /// Stop accepting writes. Series are read-only from here on.
    pub fn freeze(&mut self) {
        self.accepting = false;
    }

    pub fn is_frozen(&self) -> bool {
        !self.accepting
    }

    pub fn series(&self, device: &str) -> Option<&SensorSeries> {
        self.series.get(device)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn clear(&mut self) {
        self.series.clear();
        self.accepting = false;
    }
}
