//! Mock transport for testing.
//!
//! This module provides an in-process [`FrameTransport`] that can be used for
//! unit and integration testing without requiring BLE hardware.
//!
//! # Features
//!
//! - **Failure injection**: fail every operation, or only the next `n`
//!   connects
//! - **Latency simulation**: delay connects to exercise timeouts
//! - **Event injection**: push notification chunks, link drops and power
//!   state changes into the active connection
//! - **Write log**: inspect every characteristic write, e.g. unlock payloads

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use cgm_types::uuids::{
    ADVERTISED_NAME_PREFIX, DATA_CHARACTERISTIC, PAIRING_CHARACTERISTICS,
    REQUIRED_CHARACTERISTICS, SENSOR_SERVICE, UNLOCK_CHARACTERISTIC,
};

use crate::error::{Error, Result};
use crate::transport::{DiscoveredSensor, FrameTransport, TransportEvent};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A mock sensor link for testing.
///
/// # Example
///
/// ```
/// use cgm_core::{FrameTransport, MockTransport, TransportEvent};
///
/// #[tokio::main]
/// async fn main() {
///     let transport = MockTransport::new("CGM-0001");
///     let mut events = transport.connect(transport.address()).await.unwrap();
///     assert_eq!(events.recv().await, Some(TransportEvent::Connected));
/// }
/// ```
/// Link setup step that can be made to fail on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Discover,
    Write,
    Subscribe,
}

pub struct MockTransport {
    name: String,
    address: String,
    services: RwLock<Vec<Uuid>>,
    characteristics: RwLock<Vec<Uuid>>,
    values: RwLock<HashMap<Uuid, Bytes>>,
    writes: Mutex<Vec<(Uuid, Bytes)>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    connected: AtomicBool,
    subscribed: AtomicBool,
    connect_count: AtomicU32,
    should_fail: AtomicBool,
    fail_message: Mutex<String>,
    remaining_failures: AtomicU32,
    operation_failures: Mutex<HashMap<MockOperation, u32>>,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("subscribed", &self.subscribed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockTransport {
    /// Create a mock peripheral advertising `name` and exposing the full
    /// sensor service.
    pub fn new(name: &str) -> Self {
        let mut characteristics = REQUIRED_CHARACTERISTICS.to_vec();
        characteristics.extend_from_slice(&PAIRING_CHARACTERISTICS);
        Self {
            name: name.to_string(),
            address: format!("MOCK-{:06X}", rand::random::<u32>() % 0xFFFFFF),
            services: RwLock::new(vec![SENSOR_SERVICE]),
            characteristics: RwLock::new(characteristics),
            values: RwLock::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            connected: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            should_fail: AtomicBool::new(false),
            fail_message: Mutex::new("Mock failure".to_string()),
            remaining_failures: AtomicU32::new(0),
            operation_failures: Mutex::new(HashMap::new()),
            connect_latency_ms: AtomicU64::new(0),
        }
    }

    /// Create a mock with a default advertised name.
    pub fn with_default_name() -> Self {
        Self::new(&format!("{}-MOCK", ADVERTISED_NAME_PREFIX))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Whether notifications on the data characteristic are enabled.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Relaxed)
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    // --- Test Helpers ---

    /// Set the value returned when reading a characteristic.
    pub async fn set_value(&self, characteristic: Uuid, value: impl Into<Bytes>) {
        self.values.write().await.insert(characteristic, value.into());
    }

    /// Replace the advertised service list.
    pub async fn set_services(&self, services: Vec<Uuid>) {
        *self.services.write().await = services;
    }

    /// Replace the characteristic list of the sensor service.
    pub async fn set_characteristics(&self, characteristics: Vec<Uuid>) {
        *self.characteristics.write().await = characteristics;
    }

    /// Make every operation fail.
    pub fn set_should_fail(&self, fail: bool, message: Option<&str>) {
        self.should_fail.store(fail, Ordering::Relaxed);
        if let Some(msg) = message {
            *lock(&self.fail_message) = msg.to_string();
        }
    }

    /// Fail the next `count` connects, then succeed.
    pub fn set_transient_failures(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Fail the next `count` calls of `operation`, then succeed.
    pub fn fail_next(&self, operation: MockOperation, count: u32) {
        lock(&self.operation_failures).insert(operation, count);
    }

    /// Set simulated connect latency.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Deliver an event on the active connection.
    ///
    /// Returns `false` when there is no connection or its receiver is gone.
    pub fn push_event(&self, event: TransportEvent) -> bool {
        match lock(&self.events).as_ref() {
            Some(sender) => sender.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver one notification chunk, if notifications are enabled.
    pub fn push_chunk(&self, chunk: impl Into<Bytes>) -> bool {
        if !self.is_subscribed() {
            debug!("Dropping chunk: notifications not enabled");
            return false;
        }
        self.push_event(TransportEvent::Data(chunk.into()))
    }

    /// Simulate the peripheral dropping the link.
    pub fn drop_connection(&self, reason: &str) {
        self.push_event(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
        self.teardown();
    }

    /// Simulate the adapter being switched off.
    pub fn power_off(&self) {
        self.push_event(TransportEvent::PoweredOff);
        self.teardown();
    }

    /// All writes so far, in order.
    pub fn writes(&self) -> Vec<(Uuid, Bytes)> {
        lock(&self.writes).clone()
    }

    /// Counter values of every unlock payload written so far.
    pub fn unlock_counters(&self) -> Vec<u32> {
        lock(&self.writes)
            .iter()
            .filter(|(uuid, data)| *uuid == UNLOCK_CHARACTERISTIC && data.len() >= 4)
            .map(|(_, data)| u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
            .collect()
    }

    fn teardown(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.subscribed.store(false, Ordering::Relaxed);
        lock(&self.events).take();
    }

    fn check_should_fail(&self) -> Result<()> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::transport(lock(&self.fail_message).clone()));
        }
        Ok(())
    }

    fn check_connected(&self, address: &str) -> Result<()> {
        if address != self.address || !self.is_connected() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    async fn check_characteristic(&self, characteristic: Uuid) -> Result<()> {
        let characteristics = self.characteristics.read().await;
        if !characteristics.contains(&characteristic) {
            return Err(Error::characteristic_not_found(
                characteristic,
                characteristics.len(),
            ));
        }
        Ok(())
    }
}

impl MockTransport {
    fn check_operation(&self, operation: MockOperation) -> Result<()> {
        let mut failures = lock(&self.operation_failures);
        match failures.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::transport(format!("{:?} failed", operation)))
            }
            _ => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl FrameTransport for MockTransport {
    async fn scan(&self, name_prefix: &str, _timeout: Duration) -> Result<Vec<DiscoveredSensor>> {
        self.check_should_fail()?;
        if !self.name.starts_with(name_prefix) {
            return Ok(Vec::new());
        }
        Ok(vec![DiscoveredSensor {
            address: self.address.clone(),
            name: Some(self.name.clone()),
            rssi: Some(-60),
        }])
    }

    async fn connect(&self, address: &str) -> Result<mpsc::Receiver<TransportEvent>> {
        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.remaining_failures.load(Ordering::Relaxed) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::transport("connection refused"));
        }
        self.check_should_fail()?;
        if address != self.address {
            return Err(Error::transport(format!("unknown peripheral {}", address)));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let _ = tx.try_send(TransportEvent::Connected);
        *lock(&self.events) = Some(tx);
        self.connected.store(true, Ordering::Relaxed);
        self.subscribed.store(false, Ordering::Relaxed);
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        Ok(rx)
    }

    async fn disconnect(&self, _address: &str) -> Result<()> {
        self.teardown();
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<Vec<Uuid>> {
        self.check_connected(address)?;
        self.check_should_fail()?;
        self.check_operation(MockOperation::Discover)?;
        Ok(self.services.read().await.clone())
    }

    async fn discover_characteristics(&self, address: &str, service: Uuid) -> Result<Vec<Uuid>> {
        self.check_connected(address)?;
        self.check_should_fail()?;
        if !self.services.read().await.contains(&service) {
            return Err(Error::service_not_found(service));
        }
        Ok(self.characteristics.read().await.clone())
    }

    async fn read(&self, address: &str, characteristic: Uuid) -> Result<Bytes> {
        self.check_connected(address)?;
        self.check_should_fail()?;
        self.check_characteristic(characteristic).await?;
        Ok(self
            .values
            .read()
            .await
            .get(&characteristic)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, address: &str, characteristic: Uuid, data: &[u8]) -> Result<()> {
        self.check_connected(address)?;
        self.check_should_fail()?;
        self.check_characteristic(characteristic).await?;
        self.check_operation(MockOperation::Write)?;
        lock(&self.writes).push((characteristic, Bytes::copy_from_slice(data)));
        Ok(())
    }

    async fn subscribe(&self, address: &str, characteristic: Uuid) -> Result<()> {
        self.check_connected(address)?;
        self.check_should_fail()?;
        self.check_characteristic(characteristic).await?;
        self.check_operation(MockOperation::Subscribe)?;
        if characteristic == DATA_CHARACTERISTIC {
            self.subscribed.store(true, Ordering::Relaxed);
        }
        Ok(())
    }
}
