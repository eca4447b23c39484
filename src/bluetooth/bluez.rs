/// BlueZ-backed transport built on `bluer`
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, warn};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use crate::bluetooth::transport::{NotificationStream, Transport};
use crate::error::TransportError;
use crate::models::AdvertisedDevice;

pub struct BluezTransport {
    _session: bluer::Session,
    adapter: bluer::Adapter,
}

impl BluezTransport {
    /// Open a Bluetooth session on the default adapter and power it on.
    pub async fn new() -> Result<Self, TransportError> {
        // Initialize Bluetooth session
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create Bluetooth session: {}", e);
                return Err(e.into());
            }
        };

        // Get the default Bluetooth adapter
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Failed to get default Bluetooth adapter: {}", e);
                return Err(e.into());
            }
        };

        // Ensure Bluetooth adapter is powered on
        if let Err(e) = adapter.set_powered(true).await {
            error!("Failed to power on adapter: {}", e);
            return Err(e.into());
        }

        Ok(Self {
            _session: session,
            adapter,
        })
    }

    async fn find_characteristic(
        &self,
        device: &bluer::Device,
        characteristic: Uuid,
    ) -> Result<bluer::gatt::remote::Characteristic, TransportError> {
        if !device.is_connected().await? {
            return Err(TransportError::NotConnected(device.address().to_string()));
        }
        for service in device.services().await? {
            for candidate in service.characteristics().await? {
                if candidate.uuid().await? == characteristic {
                    return Ok(candidate);
                }
            }
        }
        Err(TransportError::CharacteristicNotFound(characteristic))
    }
}

#[async_trait]
impl Transport for BluezTransport {
    type Handle = bluer::Device;

    async fn discover(&self, timeout: Duration) -> Result<Vec<AdvertisedDevice>, TransportError> {
        // Configure discovery filter for Low Energy devices only
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: false,
            ..Default::default()
        };

        // Apply the discovery filter (warn if it fails, but continue)
        if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        // Start device discovery in background
        let discovery_handle = match self.adapter.discover_devices().await {
            Ok(discovery_stream) => tokio::spawn(async move {
                let mut stream = discovery_stream;
                while let Some(event) = stream.next().await {
                    debug!("Discovery event: {:?}", event);
                }
            }),
            Err(e) => {
                error!("Failed to start device discovery: {}", e);
                return Err(e.into());
            }
        };

        // Let discovery run for the configured duration
        sleep(timeout).await;
        discovery_handle.abort();

        let mut devices = Vec::new();
        for addr in self.adapter.device_addresses().await? {
            let device = match self.adapter.device(addr) {
                Ok(device) => device,
                Err(_) => continue,
            };
            match device.name().await {
                Ok(Some(name)) => devices.push(AdvertisedDevice {
                    name,
                    address: addr.to_string(),
                }),
                Ok(None) => debug!("No advertised name for {}", addr),
                Err(e) => debug!("Failed to read name for {}: {}", addr, e),
            }
        }

        Ok(devices)
    }

    async fn connect(&self, address: &str) -> Result<Self::Handle, TransportError> {
        let addr: bluer::Address = address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
        let device = self.adapter.device(addr)?;
        if !device.is_connected().await? {
            device.connect().await?;
        }
        Ok(device)
    }

    async fn subscribe(
        &self,
        handle: &Self::Handle,
        characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError> {
        let target = self.find_characteristic(handle, characteristic).await?;
        let stream = target.notify().await?;
        Ok(stream.boxed())
    }

    async fn unsubscribe(&self, handle: &Self::Handle, characteristic: Uuid) -> Result<(), TransportError> {
        // BlueZ stops notifying when the last notify stream is dropped, and the
        // session drops its streams before unsubscribing. What is left to
        // check is that the characteristic outlived the release.
        self.find_characteristic(handle, characteristic).await?;
        debug!(
            "Notify stream for {} on {} released, characteristic still reachable",
            characteristic,
            handle.address()
        );
        Ok(())
    }

    async fn disconnect(&self, handle: &Self::Handle) -> Result<(), TransportError> {
        handle.disconnect().await?;
        Ok(())
    }
}
