//! Test utilities for usb-mitm
//!
//! Mock proxies, descriptor-blob builders, and polling helpers shared by
//! unit and integration tests. The module is public so downstream backends
//! can reuse the mocks when testing against the relay core.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use model::{
    Configuration, Device, DeviceProxy, Endpoint, EndpointDescriptor, HostProxy, Proxy,
    ProxyError, SetupPacket, Transfer, DT_CONFIGURATION, DT_DEVICE, DT_DEVICE_QUALIFIER,
    DT_ENDPOINT, DT_INTERFACE, REQUEST_SET_CONFIGURATION,
};

/// Build an interface-less endpoint for unit tests
pub fn endpoint(address: u8, attributes: u8) -> Endpoint {
    Endpoint::new(
        None,
        EndpointDescriptor {
            address,
            attributes,
            max_packet_size: 64,
            interval: 0,
        },
    )
}

/// One endpoint entry for a built configuration blob
#[derive(Debug, Clone, Copy)]
pub struct EndpointSpec {
    pub address: u8,
    /// bmAttributes (0x02 bulk, 0x03 interrupt, 0x01 isochronous)
    pub attributes: u8,
}

/// An 18-byte device descriptor with the given identity
pub fn device_descriptor_bytes(vendor: u16, product: u16, num_configurations: u8) -> Vec<u8> {
    let mut bytes = vec![18, DT_DEVICE, 0x00, 0x02, 0, 0, 0, 64];
    bytes.extend_from_slice(&vendor.to_le_bytes());
    bytes.extend_from_slice(&product.to_le_bytes());
    bytes.extend_from_slice(&[0x00, 0x01, 0, 0, 0, num_configurations]);
    bytes
}

/// A configuration blob with a single interface carrying `endpoints`
pub fn config_blob(value: u8, endpoints: &[EndpointSpec]) -> Vec<u8> {
    let mut blob = vec![9, DT_CONFIGURATION, 0, 0, 1, value, 0, 0xa0, 50];
    blob.extend_from_slice(&[9, DT_INTERFACE, 0, 0, endpoints.len() as u8, 0xff, 0, 0, 0]);
    for spec in endpoints {
        blob.extend_from_slice(&[7, DT_ENDPOINT, spec.address, spec.attributes, 64, 0, 0]);
    }
    let total = blob.len() as u16;
    blob[2..4].copy_from_slice(&total.to_le_bytes());
    blob
}

/// A 10-byte device qualifier descriptor
pub fn qualifier_bytes(num_configurations: u8) -> Vec<u8> {
    vec![
        10,
        DT_DEVICE_QUALIFIER,
        0x00,
        0x02,
        0,
        0,
        0,
        64,
        num_configurations,
        0,
    ]
}

/// The host-to-device control transfer carrying SET_CONFIGURATION(`value`)
pub fn set_configuration_transfer(value: u8) -> Transfer {
    Transfer::control(
        SetupPacket {
            request_type: 0x00,
            request: REQUEST_SET_CONFIGURATION,
            value: value as u16,
            index: 0,
            length: 0,
        },
        Vec::new(),
    )
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Scriptable connect behavior shared by both mock proxies
#[derive(Default)]
struct ConnectScript {
    timeouts: AtomicUsize,
    calls: AtomicUsize,
    fatal: Mutex<Option<ProxyError>>,
}

impl ConnectScript {
    fn connect(&self) -> Result<(), ProxyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fatal.lock().unwrap().clone() {
            return Err(err);
        }
        let remaining = self.timeouts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.timeouts.store(remaining.saturating_sub(1), Ordering::SeqCst);
            // Real backends block for their internal timeout; keep retries
            // from spinning hot in tests.
            thread::sleep(Duration::from_millis(5));
            return Err(ProxyError::Timeout);
        }
        Ok(())
    }
}

/// Device-side proxy serving canned descriptors and scripted traffic
pub struct MockDeviceProxy {
    device_descriptor: Vec<u8>,
    configurations: Vec<Vec<u8>>,
    qualifier: Option<Vec<u8>>,
    other_speed: Vec<Vec<u8>>,
    highspeed: bool,
    connect: ConnectScript,
    connected: AtomicBool,
    claimed: Mutex<Vec<u8>>,
    released: Mutex<Vec<u8>>,
    endpoint_interfaces: Mutex<HashMap<u8, u8>>,
    set_configs: Mutex<Vec<(u8, Option<u8>, bool)>>,
    reads: Mutex<HashMap<u8, VecDeque<Transfer>>>,
    read_failures: Mutex<HashSet<u8>>,
    written: Mutex<Vec<Transfer>>,
}

impl MockDeviceProxy {
    pub fn new(device_descriptor: Vec<u8>, configurations: Vec<Vec<u8>>) -> Self {
        Self {
            device_descriptor,
            configurations,
            qualifier: None,
            other_speed: Vec::new(),
            highspeed: false,
            connect: ConnectScript::default(),
            connected: AtomicBool::new(false),
            claimed: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            endpoint_interfaces: Mutex::new(HashMap::new()),
            set_configs: Mutex::new(Vec::new()),
            reads: Mutex::new(HashMap::new()),
            read_failures: Mutex::new(HashSet::new()),
            written: Mutex::new(Vec::new()),
        }
    }

    /// 0x1234:0x5678 with one configuration: bulk IN 0x81 and bulk OUT 0x02
    pub fn default_device() -> Self {
        Self::new(
            device_descriptor_bytes(0x1234, 0x5678, 1),
            vec![config_blob(
                1,
                &[
                    EndpointSpec {
                        address: 0x81,
                        attributes: 0x02,
                    },
                    EndpointSpec {
                        address: 0x02,
                        attributes: 0x02,
                    },
                ],
            )],
        )
    }

    /// Attach a device qualifier with other-speed configurations
    pub fn with_qualifier(
        mut self,
        qualifier: Vec<u8>,
        other_speed: Vec<Vec<u8>>,
        highspeed: bool,
    ) -> Self {
        self.qualifier = Some(qualifier);
        self.other_speed = other_speed;
        self.highspeed = highspeed;
        self
    }

    /// Make the next `count` connect calls time out
    pub fn set_connect_timeouts(&self, count: usize) {
        self.connect.timeouts.store(count, Ordering::SeqCst);
    }

    /// Make every connect call fail fatally with `error`
    pub fn set_connect_error(&self, error: ProxyError) {
        *self.connect.fatal.lock().unwrap() = Some(error);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect.calls.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue a transfer the relay will read from `endpoint`
    pub fn push_read(&self, endpoint: u8, transfer: Transfer) {
        self.reads
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .push_back(transfer);
    }

    /// Make reads on `endpoint` fail unrecoverably
    pub fn fail_reads_on(&self, endpoint: u8) {
        self.read_failures.lock().unwrap().insert(endpoint);
    }

    /// Everything written toward the device on `endpoint`
    pub fn written_on(&self, endpoint: u8) -> Vec<Transfer> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|transfer| transfer.endpoint == endpoint)
            .cloned()
            .collect()
    }

    pub fn claimed(&self) -> Vec<u8> {
        self.claimed.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<u8> {
        self.released.lock().unwrap().clone()
    }

    /// Interface number recorded for an endpoint address
    pub fn endpoint_interface(&self, address: u8) -> Option<u8> {
        self.endpoint_interfaces.lock().unwrap().get(&address).copied()
    }

    /// `(full_speed value, high_speed value, highspeed)` per set_config call
    pub fn set_config_calls(&self) -> Vec<(u8, Option<u8>, bool)> {
        self.set_configs.lock().unwrap().clone()
    }
}

impl Proxy for MockDeviceProxy {
    fn read(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Transfer, ProxyError> {
        if self.read_failures.lock().unwrap().contains(&endpoint.address()) {
            return Err(ProxyError::Io("scripted read failure".to_string()));
        }
        if let Some(transfer) = self
            .reads
            .lock()
            .unwrap()
            .get_mut(&endpoint.address())
            .and_then(|queue| queue.pop_front())
        {
            return Ok(transfer);
        }
        thread::sleep(timeout.min(Duration::from_millis(2)));
        Err(ProxyError::Timeout)
    }

    fn write(&self, transfer: &Transfer) -> Result<(), ProxyError> {
        self.written.lock().unwrap().push(transfer.clone());
        Ok(())
    }
}

impl DeviceProxy for MockDeviceProxy {
    fn connect(&self) -> Result<(), ProxyError> {
        self.connect.connect()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn device_descriptor(&self) -> Result<Vec<u8>, ProxyError> {
        Ok(self.device_descriptor.clone())
    }

    fn configuration_blob(&self, index: u8) -> Result<Vec<u8>, ProxyError> {
        self.configurations
            .get(index as usize)
            .cloned()
            .ok_or(ProxyError::InvalidParam)
    }

    fn device_qualifier(&self) -> Result<Option<Vec<u8>>, ProxyError> {
        Ok(self.qualifier.clone())
    }

    fn other_speed_configuration_blob(&self, index: u8) -> Result<Vec<u8>, ProxyError> {
        self.other_speed
            .get(index as usize)
            .cloned()
            .ok_or(ProxyError::InvalidParam)
    }

    fn is_highspeed(&self) -> bool {
        self.highspeed
    }

    fn claim_interface(&self, number: u8) -> Result<(), ProxyError> {
        self.claimed.lock().unwrap().push(number);
        Ok(())
    }

    fn release_interface(&self, number: u8) -> Result<(), ProxyError> {
        self.released.lock().unwrap().push(number);
        Ok(())
    }

    fn set_endpoint_interface(&self, address: u8, interface: u8) {
        self.endpoint_interfaces
            .lock()
            .unwrap()
            .insert(address, interface);
    }

    fn set_config(
        &self,
        full_speed: &Configuration,
        high_speed: Option<&Configuration>,
        highspeed: bool,
    ) -> Result<(), ProxyError> {
        self.set_configs.lock().unwrap().push((
            full_speed.value(),
            high_speed.map(Configuration::value),
            highspeed,
        ));
        Ok(())
    }
}

/// Host-side proxy with scripted host traffic and a record of what the
/// upstream host "saw"
#[derive(Default)]
pub struct MockHostProxy {
    connect: ConnectScript,
    connected: AtomicBool,
    reads: Mutex<HashMap<u8, VecDeque<Transfer>>>,
    written: Mutex<Vec<Transfer>>,
    set_configs: Mutex<Vec<(u8, Option<u8>, bool)>>,
}

impl MockHostProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a control transfer the EP0 relay will pick up
    pub fn push_control(&self, transfer: Transfer) {
        self.push_read(0x00, transfer);
    }

    /// Queue host-originated traffic on an OUT endpoint
    pub fn push_read(&self, endpoint: u8, transfer: Transfer) {
        self.reads
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .push_back(transfer);
    }

    /// Make the next `count` connect calls time out
    pub fn set_connect_timeouts(&self, count: usize) {
        self.connect.timeouts.store(count, Ordering::SeqCst);
    }

    /// Make every connect call fail fatally with `error`
    pub fn set_connect_error(&self, error: ProxyError) {
        *self.connect.fatal.lock().unwrap() = Some(error);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect.calls.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Everything the host side received on `endpoint`
    pub fn written_on(&self, endpoint: u8) -> Vec<Transfer> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|transfer| transfer.endpoint == endpoint)
            .cloned()
            .collect()
    }

    /// `(full_speed value, high_speed value, highspeed)` per set_config call
    pub fn set_config_calls(&self) -> Vec<(u8, Option<u8>, bool)> {
        self.set_configs.lock().unwrap().clone()
    }
}

impl Proxy for MockHostProxy {
    fn read(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Transfer, ProxyError> {
        if let Some(transfer) = self
            .reads
            .lock()
            .unwrap()
            .get_mut(&endpoint.address())
            .and_then(|queue| queue.pop_front())
        {
            return Ok(transfer);
        }
        thread::sleep(timeout.min(Duration::from_millis(2)));
        Err(ProxyError::Timeout)
    }

    fn write(&self, transfer: &Transfer) -> Result<(), ProxyError> {
        self.written.lock().unwrap().push(transfer.clone());
        Ok(())
    }
}

impl HostProxy for MockHostProxy {
    fn connect(&self, _device: &Device) -> Result<(), ProxyError> {
        self.connect.connect()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn set_config(
        &self,
        full_speed: &Configuration,
        high_speed: Option<&Configuration>,
        highspeed: bool,
    ) -> Result<(), ProxyError> {
        self.set_configs.lock().unwrap().push((
            full_speed.value(),
            high_speed.map(Configuration::value),
            highspeed,
        ));
        Ok(())
    }
}
