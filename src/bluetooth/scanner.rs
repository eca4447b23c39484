/// Discovery and concurrent connection of registry devices
use futures_util::future::join_all;
use log::{debug, error, info};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::bluetooth::transport::Transport;
use crate::config::Registry;
use crate::error::TransportError;
use crate::models::{AdvertisedDevice, ConnectedDevice, DeviceProfile};

/// A device that could not be connected, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailure {
    pub name: String,
    pub address: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct ConnectReport<H> {
    pub connected: Vec<ConnectedDevice<H>>,
    pub failures: Vec<ConnectFailure>,
}

/// Scan for `timeout` and keep advertisers whose name is in the registry
///
/// The first address seen for a name wins. An empty result is not an error.
///
/// # Arguments
/// * `transport` - Wireless transport to scan with
/// * `registry` - Recognized devices; everything else is ignored
/// * `timeout` - How long to scan
///
/// # Returns
/// Recognized devices in registry order, one entry per name
pub async fn discover<T: Transport>(
    transport: &T,
    registry: &Registry,
    timeout: Duration,
) -> Result<Vec<AdvertisedDevice>, TransportError> {
    let advertised = transport.discover(timeout).await?;
    let mut seen = HashSet::new();
    let mut found: Vec<AdvertisedDevice> = advertised
        .into_iter()
        .filter(|d| {
            let recognized = registry.contains(&d.name);
            if !recognized {
                debug!("Ignoring unrecognized device {} ({})", d.name, d.address);
            }
            recognized
        })
        .filter(|d| seen.insert(d.name.clone()))
        .collect();
    found.sort_by_key(|d| registry.position(&d.name));

    info!("Discovery found {} recognized device(s)", found.len());
    Ok(found)
}

/// Connect to every device concurrently, one task per device
///
/// Each attempt is isolated: an error or a panic in one attempt only removes
/// that device from the result. Devices outside the registry are never
/// attempted.
///
/// # Arguments
/// * `transport` - Shared transport, cloned into each connect task
/// * `registry` - Recognized devices; supplies each device's profile
/// * `devices` - Discovery results to connect to
///
/// # Returns
/// A `ConnectReport` with connected devices in registry order and one
/// failure entry per device that could not be connected
pub async fn connect_all<T: Transport>(
    transport: &Arc<T>,
    registry: &Registry,
    devices: Vec<AdvertisedDevice>,
) -> ConnectReport<T::Handle> {
    let attempts: Vec<(DeviceProfile, String)> = devices
        .into_iter()
        .filter_map(|d| registry.get(&d.name).cloned().map(|p| (p, d.address)))
        .collect();

    let tasks = attempts.iter().map(|(profile, address)| {
        let transport = Arc::clone(transport);
        let address = address.clone();
        info!("Attempting to connect to {} ({})", profile.name, address);
        tokio::spawn(async move { transport.connect(&address).await })
    });
    let results = join_all(tasks).await;

    let mut report = ConnectReport {
        connected: Vec::new(),
        failures: Vec::new(),
    };
    for ((profile, address), result) in attempts.into_iter().zip(results) {
        match result {
            Ok(Ok(handle)) => {
                info!("Connected to {} ({})", profile.name, address);
                report.connected.push(ConnectedDevice {
                    profile,
                    handle,
                    address,
                });
            }
            Ok(Err(e)) => {
                error!("Failed to connect to {}: {}", profile.name, e);
                report.failures.push(ConnectFailure {
                    name: profile.name,
                    address,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                error!("Connect task for {} aborted: {}", profile.name, e);
                report.failures.push(ConnectFailure {
                    name: profile.name,
                    address,
                    reason: e.to_string(),
                });
            }
        }
    }
    report
        .connected
        .sort_by_key(|d| registry.position(&d.profile.name));
    report
}
