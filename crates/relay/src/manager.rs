//! Manager: lifecycle state machine and relay fabric orchestration
//!
//! The manager owns both proxies, the device model, the filter and injector
//! registries, and the relay fabric: 16 IN and 16 OUT endpoint slots, each
//! pairing one reader and one writer around a packet queue. It drives the
//! session through its states (idle, setup, relaying, stopping, setup-abort,
//! reset) and rebuilds the data-endpoint slots whenever the host selects a
//! configuration.
//!
//! Concurrency notes: the state cell is an atomic read from every task but
//! written only on the controller path, plus the EP0 writer's thread, which
//! re-enters the manager through [`Manager::set_config`] when it relays a
//! SET_CONFIGURATION. The fabric table is shared between those two paths
//! under a mutex; `stop_relaying` publishes its state first and never joins
//! the EP0 writer while holding the fabric lock, so the re-entrant call can
//! always drain out.

use std::array;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use common::StopToken;
use model::{
    Device, DeviceProxy, Endpoint, HostProxy, ModelError, ProxyError, TransferKind, DT_ENDPOINT,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::fabric::{packet_queue, PacketSender, ProxyEnd, TaskHandle};
use crate::filter::PacketFilter;
use crate::inject::Injector;
use crate::plugin::PluginSet;
use crate::reader::RelayReader;
use crate::writer::{RelayWriter, SetConfigHook};

/// Logical endpoint slots per direction, matching the 4-bit endpoint number
pub const ENDPOINT_SLOTS: usize = 16;

/// Lifecycle states of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    /// Nothing running; registries may be mutated
    Idle = 0,
    /// `start_control_relaying` is wiring up EP0
    Setup = 1,
    /// Steady state, transfers flowing
    Relaying = 2,
    /// `stop_relaying` is tearing the session down
    Stopping = 3,
    /// A stop arrived during setup; the setup path unwinds
    SetupAbort = 4,
    /// Bus reset observed: data relays torn down, EP0 preserved
    Reset = 5,
}

impl ManagerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ManagerState::Idle,
            1 => ManagerState::Setup,
            2 => ManagerState::Relaying,
            3 => ManagerState::Stopping,
            4 => ManagerState::SetupAbort,
            _ => ManagerState::Reset,
        }
    }
}

/// Errors surfaced by manager operations
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Operation not allowed in the current state
    #[error("operation invalid in state {0:?}")]
    InvalidState(ManagerState),

    /// No proxies have been loaded
    #[error("proxies not loaded")]
    NotConfigured,

    /// Registry index past the end of the list
    #[error("index {0} out of bounds")]
    IndexOutOfBounds(usize),

    /// Setup was cancelled by a concurrent stop
    #[error("setup aborted")]
    SetupAborted,

    /// A proxy operation failed fatally
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// The device model could not be built or queried
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Atomic cell holding the manager state
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ManagerState::Idle as u8))
    }

    fn load(&self) -> ManagerState {
        ManagerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: ManagerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ManagerState, to: ManagerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// One populated endpoint slot: the endpoint, its queue's write end (kept so
/// teardown can close-to-wake), the injection intake, and the paired tasks
struct RelaySlot {
    endpoint: Arc<Endpoint>,
    queue: PacketSender,
    inject: PacketSender,
    reader: TaskHandle,
    writer: TaskHandle,
}

impl RelaySlot {
    fn signal_stop(&self) {
        self.reader.please_stop();
        self.writer.please_stop();
        self.queue.close();
        self.inject.close();
    }

    fn join(&mut self) {
        self.reader.join();
        self.writer.join();
    }
}

#[derive(Default)]
struct RelayFabric {
    in_slots: [Option<RelaySlot>; ENDPOINT_SLOTS],
    out_slots: [Option<RelaySlot>; ENDPOINT_SLOTS],
    injector_tasks: Vec<thread::JoinHandle<()>>,
}

struct ManagerInner {
    state: StateCell,
    device_proxy: Mutex<Option<Arc<dyn DeviceProxy>>>,
    host_proxy: Mutex<Option<Arc<dyn HostProxy>>>,
    device: Mutex<Option<Arc<Device>>>,
    filters: Mutex<Vec<Arc<dyn PacketFilter>>>,
    injectors: Mutex<Vec<Arc<dyn Injector>>>,
    fabric: Mutex<RelayFabric>,
}

/// Adapter handing the EP0 writer its one-method view of the manager
///
/// Holds the manager weakly: the writer must not keep a dropped manager's
/// session alive from inside its own fabric.
struct ConfigHook {
    manager: Weak<ManagerInner>,
}

impl SetConfigHook for ConfigHook {
    fn set_configuration(&self, value: u8) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        let manager = Manager { inner };
        if let Err(err) = manager.set_config(value) {
            warn!("SET_CONFIGURATION({}) not applied: {}", value, err);
        }
    }
}

/// The lifecycle controller; cheap to clone, all clones share one session
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                state: StateCell::new(),
                device_proxy: Mutex::new(None),
                host_proxy: Mutex::new(None),
                device: Mutex::new(None),
                filters: Mutex::new(Vec::new()),
                injectors: Mutex::new(Vec::new()),
                fabric: Mutex::new(RelayFabric::default()),
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ManagerState {
        self.inner.state.load()
    }

    /// Install the proxy/filter/injector bundle produced by the plugin
    /// registry. Valid only while idle.
    pub fn load_plugins(&self, plugins: PluginSet) -> Result<(), ManagerError> {
        let state = self.state();
        if state != ManagerState::Idle {
            warn!("cannot load plugins unless manager is idle");
            return Err(ManagerError::InvalidState(state));
        }
        info!(
            "loading plugins: {} filters, {} injectors",
            plugins.filters.len(),
            plugins.injectors.len()
        );
        *self.inner.device_proxy.lock().unwrap() = Some(plugins.device_proxy);
        *self.inner.host_proxy.lock().unwrap() = Some(plugins.host_proxy);
        for filter in plugins.filters {
            self.add_filter(filter)?;
        }
        for injector in plugins.injectors {
            self.add_injector(injector)?;
        }
        Ok(())
    }

    /// Append a filter. Valid while idle or parked in reset.
    pub fn add_filter(&self, filter: Arc<dyn PacketFilter>) -> Result<(), ManagerError> {
        let state = self.state();
        if state != ManagerState::Idle && state != ManagerState::Reset {
            warn!("cannot add filters unless manager is idle or reset");
            return Err(ManagerError::InvalidState(state));
        }
        self.inner.filters.lock().unwrap().push(filter);
        Ok(())
    }

    /// Remove the filter at `index`, shifting higher indices down. The
    /// removed filter is returned; dropping it destroys it.
    pub fn remove_filter(&self, index: usize) -> Result<Arc<dyn PacketFilter>, ManagerError> {
        let state = self.state();
        if state != ManagerState::Idle && state != ManagerState::Reset {
            warn!("cannot remove filters unless manager is idle or reset");
            return Err(ManagerError::InvalidState(state));
        }
        let mut filters = self.inner.filters.lock().unwrap();
        if index >= filters.len() {
            warn!("filter index {} out of bounds", index);
            return Err(ManagerError::IndexOutOfBounds(index));
        }
        Ok(filters.remove(index))
    }

    /// Number of installed filters
    pub fn filter_count(&self) -> usize {
        self.inner.filters.lock().unwrap().len()
    }

    /// The filter at `index`, if any
    pub fn filter(&self, index: usize) -> Option<Arc<dyn PacketFilter>> {
        self.inner.filters.lock().unwrap().get(index).cloned()
    }

    /// Append an injector. Valid only while idle.
    pub fn add_injector(&self, injector: Arc<dyn Injector>) -> Result<(), ManagerError> {
        let state = self.state();
        if state != ManagerState::Idle {
            warn!("cannot add injectors unless manager is idle");
            return Err(ManagerError::InvalidState(state));
        }
        self.inner.injectors.lock().unwrap().push(injector);
        Ok(())
    }

    /// Remove the injector at `index`, shifting higher indices down
    pub fn remove_injector(&self, index: usize) -> Result<Arc<dyn Injector>, ManagerError> {
        let state = self.state();
        if state != ManagerState::Idle && state != ManagerState::Reset {
            warn!("cannot remove injectors unless manager is idle or reset");
            return Err(ManagerError::InvalidState(state));
        }
        let mut injectors = self.inner.injectors.lock().unwrap();
        if index >= injectors.len() {
            warn!("injector index {} out of bounds", index);
            return Err(ManagerError::IndexOutOfBounds(index));
        }
        Ok(injectors.remove(index))
    }

    /// Number of installed injectors
    pub fn injector_count(&self) -> usize {
        self.inner.injectors.lock().unwrap().len()
    }

    /// The injector at `index`, if any
    pub fn injector(&self, index: usize) -> Option<Arc<dyn Injector>> {
        self.inner.injectors.lock().unwrap().get(index).cloned()
    }

    /// Addresses of all endpoints with a live relay, EP0 included, sorted
    pub fn relay_endpoints(&self) -> Vec<u8> {
        let fabric = self.inner.fabric.lock().unwrap();
        let mut endpoints: Vec<u8> = fabric
            .out_slots
            .iter()
            .chain(fabric.in_slots.iter())
            .flatten()
            .map(|slot| slot.endpoint.address())
            .collect();
        endpoints.sort_unstable();
        endpoints
    }

    /// The enumerated device model for the current session, if any
    pub fn device(&self) -> Option<Arc<Device>> {
        self.inner.device.lock().unwrap().clone()
    }

    fn device_proxy(&self) -> Option<Arc<dyn DeviceProxy>> {
        self.inner.device_proxy.lock().unwrap().clone()
    }

    fn host_proxy(&self) -> Option<Arc<dyn HostProxy>> {
        self.inner.host_proxy.lock().unwrap().clone()
    }

    /// Connect both proxies, build the device model, and bring up the EP0
    /// relay. Returns once the manager is relaying (or the attempt died).
    ///
    /// Must be called from idle. A concurrent [`Manager::stop_relaying`]
    /// flips the state to setup-abort; this path observes that between steps
    /// and unwinds.
    pub fn start_control_relaying(&self) -> Result<(), ManagerError> {
        if !self
            .inner
            .state
            .transition(ManagerState::Idle, ManagerState::Setup)
        {
            warn!("start_control_relaying ignored in state {:?}", self.state());
            return Err(ManagerError::InvalidState(self.state()));
        }
        info!("manager: starting control relaying");

        let (device_proxy, host_proxy) = match (self.device_proxy(), self.host_proxy()) {
            (Some(device_proxy), Some(host_proxy)) => (device_proxy, host_proxy),
            _ => {
                error!("cannot start relaying without loaded proxies");
                self.inner.state.store(ManagerState::Idle);
                return Err(ManagerError::NotConfigured);
            }
        };

        // Step 2: connect the device proxy, retrying timeouts while still
        // in setup.
        info!("manager: connecting to device proxy");
        loop {
            match device_proxy.connect() {
                Ok(()) => break,
                Err(err) if err.is_recoverable() => {
                    if self.state() != ManagerState::Setup {
                        debug!("device proxy connect cancelled");
                        self.inner.state.store(ManagerState::Idle);
                        return Err(ManagerError::SetupAborted);
                    }
                    debug!("device proxy connect timed out, retrying");
                }
                Err(err) => {
                    error!("unable to connect to device proxy: {}", err);
                    self.inner.state.store(ManagerState::Idle);
                    return Err(err.into());
                }
            }
        }

        // Step 3: build and print the device model.
        info!("manager: enumerating device");
        let device = match Device::from_proxy(device_proxy.as_ref()) {
            Ok(device) => Arc::new(device),
            Err(err) => {
                error!("failed to build device model: {}", err);
                device_proxy.disconnect();
                self.inner.state.store(ManagerState::Idle);
                return Err(err.into());
            }
        };
        info!("device enumerated:\n{}", device.tree_summary());
        *self.inner.device.lock().unwrap() = Some(device.clone());

        // Step 4: claim every interface of the active configuration.
        let interface_count = device.active_configuration().num_interfaces();
        info!(
            "manager: claiming {} interfaces on device proxy",
            interface_count
        );
        for number in 0..interface_count {
            if let Err(err) = device_proxy.claim_interface(number) {
                error!("failed to claim interface {}: {}", number, err);
                self.inner.state.store(ManagerState::SetupAbort);
                self.stop_relaying();
                return Err(err.into());
            }
        }

        self.check_setup()?;

        // Step 6: synthesize the EP0 endpoint from bMaxPacketSize0.
        let max_packet0 = device.descriptor().max_packet_size0;
        let ep0 = Arc::new(Endpoint::from_bytes(
            None,
            &[7, DT_ENDPOINT, 0, 0, max_packet0, 0, 0],
        )?);

        self.check_setup()?;

        // Step 7: EP0 reader (host side) and writer (device side), with the
        // configuration callback wired into the writer.
        let (queue_tx, queue_rx) = packet_queue();
        let reader_stop = StopToken::new();
        let writer_stop = StopToken::new();
        let reader = RelayReader::new(
            ep0.clone(),
            ProxyEnd::Host(host_proxy.clone()),
            queue_tx.clone(),
            reader_stop.clone(),
        );
        let mut writer = RelayWriter::new(
            ep0.clone(),
            ProxyEnd::Device(device_proxy.clone()),
            queue_rx,
            writer_stop.clone(),
        );
        writer.set_control_hook(Arc::new(ConfigHook {
            manager: Arc::downgrade(&self.inner),
        }));
        let inject_tx = writer.inject_sender();

        // Step 8: filters matching (device, EP0), in installation order.
        let filters: Vec<Arc<dyn PacketFilter>> = self.inner.filters.lock().unwrap().clone();
        debug!("manager: applying {} filters to EP0", filters.len());
        for filter in &filters {
            if filter.matches_device(device.as_ref()) && filter.matches_endpoint(ep0.as_ref()) {
                writer.add_filter(filter.clone());
            }
        }

        // Step 9: injectors matching (device, EP0) get their EP0 ports wired
        // to the writer's inbox, both address forms.
        let injectors: Vec<Arc<dyn Injector>> = self.inner.injectors.lock().unwrap().clone();
        debug!("manager: applying {} injectors to EP0", injectors.len());
        for injector in &injectors {
            if injector.matches_device(device.as_ref())
                && injector.matches_endpoint(ep0.as_ref())
            {
                injector.ports().connect(0x00, writer.inject_sender());
                injector.ports().connect(0x80, writer.inject_sender());
            }
        }

        self.check_setup()?;

        // Step 10: one task per injector.
        if !injectors.is_empty() {
            info!("manager: starting {} injector tasks", injectors.len());
            let mut fabric = self.inner.fabric.lock().unwrap();
            for (index, injector) in injectors.iter().enumerate() {
                let injector = injector.clone();
                let handle = thread::Builder::new()
                    .name(format!("injector-{:02}", index))
                    .spawn(move || injector.listen())
                    .expect("failed to spawn injector thread");
                fabric.injector_tasks.push(handle);
            }
        }

        // Step 11: connect the host proxy with the same retry loop.
        info!("manager: connecting to host proxy");
        loop {
            match host_proxy.connect(device.as_ref()) {
                Ok(()) => break,
                Err(err) if err.is_recoverable() => {
                    if self.state() != ManagerState::Setup {
                        self.inner.state.store(ManagerState::SetupAbort);
                        self.stop_relaying();
                        return Err(ManagerError::SetupAborted);
                    }
                    debug!("host proxy connect timed out, retrying");
                }
                Err(err) => {
                    error!("unable to connect to host proxy: {}", err);
                    self.inner.state.store(ManagerState::SetupAbort);
                    self.stop_relaying();
                    return Err(err.into());
                }
            }
        }

        // Step 12: launch the EP0 tasks and publish the new state. The CAS
        // loses against a concurrent stop, in which case we unwind.
        {
            let mut fabric = self.inner.fabric.lock().unwrap();
            let reader_handle = thread::Builder::new()
                .name("relay-rd-00".to_string())
                .spawn(move || reader.run())
                .expect("failed to spawn relay reader thread");
            let writer_handle = thread::Builder::new()
                .name("relay-wr-00".to_string())
                .spawn(move || writer.run())
                .expect("failed to spawn relay writer thread");
            fabric.out_slots[0] = Some(RelaySlot {
                endpoint: ep0,
                queue: queue_tx,
                inject: inject_tx,
                reader: TaskHandle::new(reader_stop, reader_handle),
                writer: TaskHandle::new(writer_stop, writer_handle),
            });
        }

        if !self
            .inner
            .state
            .transition(ManagerState::Setup, ManagerState::Relaying)
        {
            self.stop_relaying();
            return Err(ManagerError::SetupAborted);
        }
        info!("manager: control relaying started");
        Ok(())
    }

    fn check_setup(&self) -> Result<(), ManagerError> {
        if self.state() != ManagerState::Setup {
            self.stop_relaying();
            return Err(ManagerError::SetupAborted);
        }
        Ok(())
    }

    /// Apply a configuration selected by the host's SET_CONFIGURATION.
    ///
    /// Invoked on the EP0 writer's thread via its control hook; also the way
    /// back to relaying after a bus reset. Updates the device model's active
    /// configuration, dispatches `set_config` to both proxies with the
    /// qualifier-aware parameter ordering, then rebuilds the data relays.
    pub fn set_config(&self, value: u8) -> Result<(), ManagerError> {
        let state = self.state();
        if state != ManagerState::Relaying && state != ManagerState::Reset {
            warn!("set_config({}) ignored in state {:?}", value, state);
            return Err(ManagerError::InvalidState(state));
        }
        let (device_proxy, host_proxy) = match (self.device_proxy(), self.host_proxy()) {
            (Some(device_proxy), Some(host_proxy)) => (device_proxy, host_proxy),
            _ => return Err(ManagerError::NotConfigured),
        };
        let device = self.device().ok_or(ManagerError::NotConfigured)?;

        if let Err(err) = device.set_active_configuration(value) {
            warn!(
                "SET_CONFIGURATION({}) does not match any configuration, ignoring",
                value
            );
            return Err(err.into());
        }
        info!("manager: switching to configuration {}", value);

        let active = device.active_configuration();
        let other_speed = device.qualifier().and_then(|q| q.configuration(value));
        match other_speed {
            Some(other) if device.is_highspeed() => {
                device_proxy.set_config(other, Some(active), true)?;
                host_proxy.set_config(other, Some(active), true)?;
            }
            Some(other) => {
                device_proxy.set_config(active, Some(other), false)?;
                host_proxy.set_config(active, Some(other), false)?;
            }
            None => {
                device_proxy.set_config(active, None, device.is_highspeed())?;
                host_proxy.set_config(active, None, device.is_highspeed())?;
            }
        }

        // Reconfiguration replaces whatever data relays the previous
        // configuration had.
        self.stop_data_relaying();
        self.start_data_relaying(&device, &device_proxy, &host_proxy)?;

        // Leaving a bus reset resumes relaying.
        self.inner
            .state
            .transition(ManagerState::Reset, ManagerState::Relaying);
        Ok(())
    }

    /// Build and launch the data-endpoint relays for the active
    /// configuration (slots 1..15; EP0 is untouched)
    fn start_data_relaying(
        &self,
        device: &Arc<Device>,
        device_proxy: &Arc<dyn DeviceProxy>,
        host_proxy: &Arc<dyn HostProxy>,
    ) -> Result<(), ManagerError> {
        let config = device.active_configuration();
        info!(
            "manager: setting up data relays for configuration {}",
            config.value()
        );

        let filters: Vec<Arc<dyn PacketFilter>> = self.inner.filters.lock().unwrap().clone();
        let injectors: Vec<Arc<dyn Injector>> = self.inner.injectors.lock().unwrap().clone();
        let mut fabric = self.inner.fabric.lock().unwrap();

        // Re-check under the fabric lock: a stop that won the state race
        // must not have fresh slots installed behind it.
        let state = self.state();
        if state != ManagerState::Relaying && state != ManagerState::Reset {
            debug!("data relay setup abandoned in state {:?}", state);
            return Err(ManagerError::InvalidState(state));
        }

        // Endpoint table first: every alternate contributes its endpoints,
        // isochronous ones are refused, later alternates win a slot.
        let mut in_endpoints: [Option<(Arc<Endpoint>, &model::Interface)>; ENDPOINT_SLOTS] =
            array::from_fn(|_| None);
        let mut out_endpoints: [Option<(Arc<Endpoint>, &model::Interface)>; ENDPOINT_SLOTS] =
            array::from_fn(|_| None);
        for interface in config.interfaces() {
            for endpoint in interface.endpoints() {
                if endpoint.transfer_kind() == TransferKind::Isochronous {
                    warn!(
                        "endpoint {:#04x} has transfer type isochronous, which is not supported; skipping",
                        endpoint.address()
                    );
                    continue;
                }
                let slot = endpoint.number() as usize;
                if slot == 0 {
                    continue;
                }
                let entry = Some((endpoint.clone(), interface));
                if endpoint.is_in() {
                    in_endpoints[slot] = entry;
                } else {
                    out_endpoints[slot] = entry;
                }
                device_proxy.set_endpoint_interface(endpoint.address(), interface.number());
            }
        }

        // Reader/writer pairs per populated slot: IN relays read the device
        // and write the host, OUT relays the reverse. Filters and injector
        // ports attach before the tasks launch.
        struct PendingRelay {
            is_in: bool,
            slot: usize,
            endpoint: Arc<Endpoint>,
            reader: RelayReader,
            writer: RelayWriter,
            queue: PacketSender,
            reader_stop: StopToken,
            writer_stop: StopToken,
        }

        let mut pending: Vec<PendingRelay> = Vec::new();
        let directions = [(true, &in_endpoints), (false, &out_endpoints)];
        for (is_in, table) in directions {
            for slot in 1..ENDPOINT_SLOTS {
                let Some((endpoint, interface)) = table[slot].clone() else {
                    continue;
                };
                let (source, sink) = if is_in {
                    (
                        ProxyEnd::Device(device_proxy.clone()),
                        ProxyEnd::Host(host_proxy.clone()),
                    )
                } else {
                    (
                        ProxyEnd::Host(host_proxy.clone()),
                        ProxyEnd::Device(device_proxy.clone()),
                    )
                };
                let (queue_tx, queue_rx) = packet_queue();
                let reader_stop = StopToken::new();
                let writer_stop = StopToken::new();
                let reader = RelayReader::new(
                    endpoint.clone(),
                    source,
                    queue_tx.clone(),
                    reader_stop.clone(),
                );
                let mut writer =
                    RelayWriter::new(endpoint.clone(), sink, queue_rx, writer_stop.clone());

                for filter in &filters {
                    if filter.matches_device(device.as_ref())
                        && filter.matches_configuration(config)
                        && filter.matches_endpoint(endpoint.as_ref())
                        && filter.matches_interface(interface)
                    {
                        writer.add_filter(filter.clone());
                    }
                }
                for injector in &injectors {
                    if injector.matches_device(device.as_ref())
                        && injector.matches_configuration(config)
                        && injector.matches_endpoint(endpoint.as_ref())
                        && injector.matches_interface(interface)
                    {
                        injector
                            .ports()
                            .connect(endpoint.address(), writer.inject_sender());
                    }
                }

                pending.push(PendingRelay {
                    is_in,
                    slot,
                    endpoint,
                    reader,
                    writer,
                    queue: queue_tx,
                    reader_stop,
                    writer_stop,
                });
            }
        }

        // Re-claim interfaces after the configuration change.
        for number in 0..config.num_interfaces() {
            if let Err(err) = device_proxy.claim_interface(number) {
                warn!("failed to re-claim interface {}: {}", number, err);
            }
        }

        // Launch every pending pair and install the slots.
        for entry in pending {
            let address = entry.endpoint.address();
            let inject_tx = entry.writer.inject_sender();
            let reader = entry.reader;
            let writer = entry.writer;
            let reader_handle = thread::Builder::new()
                .name(format!("relay-rd-{:02x}", address))
                .spawn(move || reader.run())
                .expect("failed to spawn relay reader thread");
            let writer_handle = thread::Builder::new()
                .name(format!("relay-wr-{:02x}", address))
                .spawn(move || writer.run())
                .expect("failed to spawn relay writer thread");
            let relay_slot = RelaySlot {
                endpoint: entry.endpoint,
                queue: entry.queue,
                inject: inject_tx,
                reader: TaskHandle::new(entry.reader_stop, reader_handle),
                writer: TaskHandle::new(entry.writer_stop, writer_handle),
            };
            if entry.is_in {
                fabric.in_slots[entry.slot] = Some(relay_slot);
            } else {
                fabric.out_slots[entry.slot] = Some(relay_slot);
            }
            debug!("data relay running on endpoint {:#04x}", address);
        }

        Ok(())
    }

    /// Tear down slots 1..15, leaving EP0 alone
    fn stop_data_relaying(&self) {
        let mut slots: Vec<RelaySlot> = {
            let mut fabric = self.inner.fabric.lock().unwrap();
            let fabric = &mut *fabric;
            let in_slots = fabric.in_slots[1..].iter_mut();
            let out_slots = fabric.out_slots[1..].iter_mut();
            in_slots.chain(out_slots).filter_map(Option::take).collect()
        };
        if slots.is_empty() {
            return;
        }
        debug!("manager: tearing down {} data relays", slots.len());
        for slot in &slots {
            slot.signal_stop();
        }
        for slot in &mut slots {
            slot.join();
        }
    }

    /// Stop relaying and return to idle. Idempotent; a call during setup
    /// flags the setup path, which unwinds through here again.
    pub fn stop_relaying(&self) {
        match self.state() {
            ManagerState::Setup => {
                self.inner
                    .state
                    .transition(ManagerState::Setup, ManagerState::SetupAbort);
                return;
            }
            state @ (ManagerState::Relaying | ManagerState::SetupAbort) => {
                // Exactly one caller wins the teardown.
                if !self.inner.state.transition(state, ManagerState::Stopping) {
                    return;
                }
            }
            _ => return,
        }
        info!("manager: stopping relaying");

        // Flag injectors and relay tasks first so everything winds down in
        // parallel, then join outside the fabric lock.
        let injectors: Vec<Arc<dyn Injector>> = self.inner.injectors.lock().unwrap().clone();
        for injector in &injectors {
            injector.please_stop();
        }

        let (mut slots, injector_tasks) = {
            let mut fabric = self.inner.fabric.lock().unwrap();
            let fabric = &mut *fabric;
            let in_slots = fabric.in_slots.iter_mut();
            let out_slots = fabric.out_slots.iter_mut();
            let slots: Vec<RelaySlot> =
                in_slots.chain(out_slots).filter_map(Option::take).collect();
            for slot in &slots {
                slot.signal_stop();
            }
            (slots, std::mem::take(&mut fabric.injector_tasks))
        };

        debug!(
            "manager: joining {} injector tasks and {} relay tasks",
            injector_tasks.len(),
            slots.len() * 2
        );
        for handle in injector_tasks {
            let _ = handle.join();
        }
        for slot in &mut slots {
            slot.join();
        }
        drop(slots);

        // Release interfaces, then disconnect host and device sides.
        let device = self.inner.device.lock().unwrap().take();
        if let (Some(device), Some(device_proxy)) = (&device, self.device_proxy()) {
            let interface_count = device.active_configuration().num_interfaces();
            debug!("manager: releasing {} interfaces", interface_count);
            for number in 0..interface_count {
                if let Err(err) = device_proxy.release_interface(number) {
                    debug!("release of interface {} failed: {}", number, err);
                }
            }
        }
        if let Some(host_proxy) = self.host_proxy() {
            host_proxy.disconnect();
        }
        if let Some(device_proxy) = self.device_proxy() {
            device_proxy.disconnect();
        }
        drop(device);

        self.inner.state.store(ManagerState::Idle);
        info!("manager: relaying stopped");
    }

    /// React to a bus reset observed by a proxy: tear down the data relays,
    /// keep EP0 alive, and park in reset until the host reselects a
    /// configuration through [`Manager::set_config`].
    pub fn handle_bus_reset(&self) {
        if !self
            .inner
            .state
            .transition(ManagerState::Relaying, ManagerState::Reset)
        {
            warn!("bus reset observed in state {:?}, ignoring", self.state());
            return;
        }
        info!("manager: bus reset, tearing down data relays");
        self.stop_data_relaying();
    }

    /// Drop all filters, injectors, and both proxies. Called once at
    /// shutdown, from idle.
    pub fn cleanup(&self) {
        if self.state() != ManagerState::Idle {
            warn!("cleanup ignored while manager is not idle");
            return;
        }
        self.inner.filters.lock().unwrap().clear();
        self.inner.injectors.lock().unwrap().clear();
        *self.inner.device_proxy.lock().unwrap() = None;
        *self.inner.host_proxy.lock().unwrap() = None;
        debug!("manager: cleaned up");
    }
}
