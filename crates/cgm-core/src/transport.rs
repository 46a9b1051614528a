//! Abstraction over the wireless link to a sensor.
//!
//! The acquisition pipeline never talks to a radio stack directly. It drives
//! a [`FrameTransport`], which can be a real BLE adapter binding or the
//! in-process [`MockTransport`](crate::MockTransport).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// A peripheral found while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredSensor {
    /// Address used to connect.
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// Asynchronous link events, delivered in order on the channel returned by
/// [`FrameTransport::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link is up.
    Connected,
    /// One notification chunk from the data characteristic.
    Data(Bytes),
    /// A characteristic or service operation failed; the link is still up.
    Error { message: String },
    /// The link dropped.
    Disconnected { reason: String },
    /// The radio adapter was switched off.
    PoweredOff,
}

/// Operations the connection state machine needs from a wireless link.
///
/// # Example
///
/// ```ignore
/// use cgm_core::{FrameTransport, Result};
///
/// async fn first_sensor<T: FrameTransport>(t: &T) -> Result<Option<String>> {
///     let found = t.scan("CGM", Duration::from_secs(10)).await?;
///     Ok(found.into_iter().next().map(|s| s.address))
/// }
/// ```
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Scan for peripherals whose advertised name starts with `name_prefix`.
    async fn scan(&self, name_prefix: &str, timeout: Duration) -> Result<Vec<DiscoveredSensor>>;

    /// Open a link. Events, starting with [`TransportEvent::Connected`],
    /// arrive on the returned channel.
    async fn connect(&self, address: &str) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Close the link and drop the event channel.
    async fn disconnect(&self, address: &str) -> Result<()>;

    /// Primary services of the connected peripheral.
    async fn discover_services(&self, address: &str) -> Result<Vec<Uuid>>;

    /// Characteristics of one service.
    async fn discover_characteristics(&self, address: &str, service: Uuid) -> Result<Vec<Uuid>>;

    /// Read a characteristic value.
    async fn read(&self, address: &str, characteristic: Uuid) -> Result<Bytes>;

    /// Write a characteristic value with response.
    async fn write(&self, address: &str, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Enable notifications; chunks arrive as [`TransportEvent::Data`].
    async fn subscribe(&self, address: &str, characteristic: Uuid) -> Result<()>;
}
