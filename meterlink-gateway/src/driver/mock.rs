use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meterlink_core::{DeviceEndpoint, Protocol};
use rand::Rng;

use super::{ChunkDescriptor, DeviceDriver, DeviceHandle, DriverError};
use crate::util::lock_or_recover;

/// A scripted failure returned by the next read against a mock device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    Timeout,
    Exception(u8),
    Reset,
}

/// Behaviour of one simulated device.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    /// Reads asking for more registers than this time out.
    pub max_registers_per_read: Option<u16>,
    /// Refuse every connection attempt.
    pub refuse_connect: bool,
    /// Fail liveness probes.
    pub failing_probe: bool,
    /// Add a little noise on top of the address-derived value.
    pub noisy: bool,
    /// How long a liveness probe takes to answer.
    pub probe_delay: Option<Duration>,
    /// Faults consumed one per read before normal behaviour resumes.
    pub script: VecDeque<MockFault>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_registers(mut self, max: u16) -> Self {
        self.max_registers_per_read = Some(max);
        self
    }

    pub fn refusing_connections(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    pub fn with_failing_probe(mut self) -> Self {
        self.failing_probe = true;
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    pub fn with_fault(mut self, fault: MockFault) -> Self {
        self.script.push_back(fault);
        self
    }
}

/// Call counters shared by a driver and every handle it opened.
#[derive(Debug, Default)]
pub struct MockCounters {
    pub connects: AtomicUsize,
    pub reads: AtomicUsize,
    pub probes: AtomicUsize,
    pub closes: AtomicUsize,
}

impl MockCounters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// In-process driver simulating field devices.
///
/// Register `n` reads back as `n` (optionally with noise), which makes
/// collected values easy to assert on. Unknown endpoints use the default
/// device behaviour.
#[derive(Clone)]
pub struct MockDriver {
    protocol: Protocol,
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
    default_device: MockDevice,
    counters: Arc<MockCounters>,
}

impl MockDriver {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            devices: Arc::new(Mutex::new(HashMap::new())),
            default_device: MockDevice::default(),
            counters: Arc::new(MockCounters::default()),
        }
    }

    /// Driver used by `type = "mock"` configurations: noisy values, no faults.
    pub fn simulated(protocol: Protocol) -> Self {
        let mut driver = Self::new(protocol);
        driver.default_device.noisy = true;
        driver
    }

    pub fn with_device(self, endpoint: &DeviceEndpoint, device: MockDevice) -> Self {
        self.set_device(endpoint, device);
        self
    }

    /// Replace the behaviour of one device, e.g. to heal it mid-test.
    pub fn set_device(&self, endpoint: &DeviceEndpoint, device: MockDevice) {
        lock_or_recover(&self.devices).insert(endpoint.pool_key(), device);
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    fn device(&self, key: &str) -> MockDevice {
        lock_or_recover(&self.devices)
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.default_device.clone())
    }
}

#[async_trait]
impl DeviceDriver for MockDriver {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        _timeout: Duration,
    ) -> Result<Box<dyn DeviceHandle>, DriverError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let key = endpoint.pool_key();

        if self.device(&key).refuse_connect {
            return Err(DriverError::Connect {
                addr: endpoint.socket_addr(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ),
            });
        }

        Ok(Box::new(MockHandle {
            key,
            driver: self.clone(),
            open: true,
        }))
    }
}

struct MockHandle {
    key: String,
    driver: MockDriver,
    open: bool,
}

impl MockHandle {
    /// Pop the next scripted fault, if the device has one queued.
    fn next_fault(&self) -> Option<MockFault> {
        let mut devices = lock_or_recover(&self.driver.devices);
        devices
            .get_mut(&self.key)
            .and_then(|device| device.script.pop_front())
    }
}

#[async_trait]
impl DeviceHandle for MockHandle {
    async fn read_points(
        &mut self,
        chunk: ChunkDescriptor,
        timeout: Duration,
    ) -> Result<Vec<u16>, DriverError> {
        self.driver.counters.reads.fetch_add(1, Ordering::SeqCst);

        if !self.open {
            return Err(DriverError::Closed);
        }

        match self.next_fault() {
            Some(MockFault::Timeout) => return Err(DriverError::Timeout(timeout)),
            Some(MockFault::Exception(code)) => {
                return Err(DriverError::Exception {
                    function: 0x03,
                    code,
                });
            }
            Some(MockFault::Reset) => {
                return Err(DriverError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )));
            }
            None => {}
        }

        let device = self.driver.device(&self.key);
        if let Some(max) = device.max_registers_per_read
            && chunk.count > max
        {
            return Err(DriverError::Timeout(timeout));
        }

        let mut rng = rand::rng();
        Ok((0..chunk.count)
            .map(|offset| {
                let base = chunk.start.wrapping_add(offset);
                if device.noisy {
                    base.wrapping_add(rng.random_range(0..10))
                } else {
                    base
                }
            })
            .collect())
    }

    async fn probe(&mut self) -> bool {
        self.driver.counters.probes.fetch_add(1, Ordering::SeqCst);
        let device = self.driver.device(&self.key);
        if let Some(delay) = device.probe_delay {
            tokio::time::sleep(delay).await;
        }
        self.open && !device.failing_probe
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if self.open {
            self.open = false;
            self.driver.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_return_address_values() {
        let driver = MockDriver::new(Protocol::ModbusTcp);
        let endpoint = DeviceEndpoint::new("meter", 502, 1);
        let mut handle = driver
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();

        let words = handle
            .read_points(ChunkDescriptor::new(10, 3), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(words, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn scripted_faults_are_consumed_in_order() {
        let endpoint = DeviceEndpoint::new("meter", 502, 1);
        let driver = MockDriver::new(Protocol::ModbusTcp).with_device(
            &endpoint,
            MockDevice::new()
                .with_fault(MockFault::Timeout)
                .with_fault(MockFault::Exception(0x02)),
        );
        let mut handle = driver
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        let chunk = ChunkDescriptor::new(0, 1);
        let timeout = Duration::from_secs(1);

        assert!(matches!(
            handle.read_points(chunk, timeout).await,
            Err(DriverError::Timeout(_))
        ));
        assert!(matches!(
            handle.read_points(chunk, timeout).await,
            Err(DriverError::Exception { code: 0x02, .. })
        ));
        assert!(handle.read_points(chunk, timeout).await.is_ok());
        assert_eq!(driver.counters().reads(), 3);
    }

    #[tokio::test]
    async fn oversized_reads_time_out() {
        let endpoint = DeviceEndpoint::new("meter", 502, 1);
        let driver = MockDriver::new(Protocol::ModbusTcp)
            .with_device(&endpoint, MockDevice::new().with_max_registers(50));
        let mut handle = driver
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();

        let timeout = Duration::from_secs(1);
        assert!(
            handle
                .read_points(ChunkDescriptor::new(0, 100), timeout)
                .await
                .is_err()
        );
        assert_eq!(
            handle
                .read_points(ChunkDescriptor::new(0, 50), timeout)
                .await
                .unwrap()
                .len(),
            50
        );
    }
}
