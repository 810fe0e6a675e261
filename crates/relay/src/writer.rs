//! Relay writer task
//!
//! The writer drains its slot's queue, runs each transfer through the filter
//! chain in installation order, merges injector-supplied transfers, and
//! submits the survivors to the sink proxy. The EP0 writer additionally
//! watches passed host-to-device control transfers for SET_CONFIGURATION and
//! reports it through a narrow callback, which is how data-endpoint
//! reconfiguration is triggered.

use std::sync::Arc;
use std::thread;

use async_channel::TryRecvError;
use common::StopToken;
use model::{Endpoint, Transfer};
use tracing::{debug, trace, warn};

use crate::fabric::{packet_queue, PacketReceiver, PacketSender, ProxyEnd, POLL_INTERVAL};
use crate::filter::{FilterAction, PacketFilter};

/// Callback the EP0 writer uses to ask for a configuration change
///
/// Kept to one method so the writer stays testable without a full manager
/// behind it.
pub trait SetConfigHook: Send + Sync {
    /// A standard SET_CONFIGURATION carrying `value` was relayed to the
    /// device. Invoked on the writer's thread, after the transfer passed.
    fn set_configuration(&self, value: u8);
}

/// Drains one slot's queue through the filter chain into the sink proxy
pub struct RelayWriter {
    endpoint: Arc<Endpoint>,
    sink: ProxyEnd,
    queue: PacketReceiver,
    inject_tx: PacketSender,
    inject_rx: PacketReceiver,
    filters: Vec<Arc<dyn PacketFilter>>,
    control_hook: Option<Arc<dyn SetConfigHook>>,
    stop: StopToken,
}

impl RelayWriter {
    pub fn new(
        endpoint: Arc<Endpoint>,
        sink: ProxyEnd,
        queue: PacketReceiver,
        stop: StopToken,
    ) -> Self {
        let (inject_tx, inject_rx) = packet_queue();
        Self {
            endpoint,
            sink,
            queue,
            inject_tx,
            inject_rx,
            filters: Vec::new(),
            control_hook: None,
            stop,
        }
    }

    /// Append a filter; the chain runs in installation order
    pub fn add_filter(&mut self, filter: Arc<dyn PacketFilter>) {
        self.filters.push(filter);
    }

    /// Install the SET_CONFIGURATION callback (EP0 writer only)
    pub fn set_control_hook(&mut self, hook: Arc<dyn SetConfigHook>) {
        self.control_hook = Some(hook);
    }

    /// Write end of this writer's injection inbox, handed to matching
    /// injectors at relay setup
    pub fn inject_sender(&self) -> PacketSender {
        self.inject_tx.clone()
    }

    /// Run the write loop until stopped or the upstream queue closes
    ///
    /// The injection inbox is polled before each queue pop; injected
    /// transfers bypass the filter chain and carry no ordering guarantee
    /// relative to upstream traffic.
    pub fn run(self) {
        let address = self.endpoint.address();
        debug!(
            "relay writer for endpoint {:#04x} ({} side, {} filters) started",
            address,
            self.sink.label(),
            self.filters.len()
        );

        'relay: loop {
            if self.stop.is_stopped() {
                break;
            }
            while let Ok(transfer) = self.inject_rx.try_recv() {
                if !self.submit(transfer) {
                    break 'relay;
                }
            }
            match self.queue.try_recv() {
                Ok(transfer) => {
                    if !self.process(transfer) {
                        break;
                    }
                }
                Err(TryRecvError::Empty) => thread::sleep(POLL_INTERVAL),
                Err(TryRecvError::Closed) => break,
            }
        }

        debug!("relay writer for endpoint {:#04x} stopped", address);
    }

    fn process(&self, mut transfer: Transfer) -> bool {
        for filter in &self.filters {
            match filter.filter(&mut transfer) {
                FilterAction::Pass => {}
                FilterAction::Replace(data) => transfer.data = data,
                FilterAction::Drop => {
                    trace!(
                        "filter dropped transfer on endpoint {:#04x}",
                        self.endpoint.address()
                    );
                    return true;
                }
            }
        }
        self.submit(transfer)
    }

    fn submit(&self, transfer: Transfer) -> bool {
        loop {
            match self.sink.write(&transfer) {
                Ok(()) => break,
                Err(err) if err.is_recoverable() => {
                    if self.stop.is_stopped() {
                        return false;
                    }
                }
                Err(err) => {
                    warn!(
                        "write error on endpoint {:#04x}: {}",
                        self.endpoint.address(),
                        err
                    );
                    self.stop.please_stop();
                    return false;
                }
            }
        }

        if let Some(hook) = &self.control_hook {
            if let Some(setup) = &transfer.setup {
                if setup.is_set_configuration() {
                    debug!(
                        "EP0 writer observed SET_CONFIGURATION({})",
                        setup.configuration_value()
                    );
                    hook.set_configuration(setup.configuration_value());
                }
            }
        }
        true
    }
}
