/// The wireless transport the session consumes
///
/// Discovery, pairing and notification delivery live behind this trait. A
/// subscription is a stream of notification payloads that yields items one at
/// a time, in arrival order, for a single device.
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;
use uuid::Uuid;

use crate::error::TransportError;
use crate::models::AdvertisedDevice;

pub type NotificationStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connection handle for one device.
    type Handle: Clone + Send + Sync + 'static;

    /// Scan for `timeout` and report every named advertiser.
    async fn discover(&self, timeout: Duration) -> Result<Vec<AdvertisedDevice>, TransportError>;

    async fn connect(&self, address: &str) -> Result<Self::Handle, TransportError>;

    async fn subscribe(
        &self,
        handle: &Self::Handle,
        characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError>;

    /// Called after the notification stream for this characteristic has been
    /// dropped. Transports that tie notifications to the stream lifetime only
    /// confirm the device side here.
    async fn unsubscribe(&self, handle: &Self::Handle, characteristic: Uuid) -> Result<(), TransportError>;

    async fn disconnect(&self, handle: &Self::Handle) -> Result<(), TransportError>;
}
