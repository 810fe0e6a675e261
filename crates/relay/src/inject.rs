//! Packet injectors
//!
//! An injector is an independently scheduled producer of synthetic
//! transfers. It carries the same four match predicates as a filter plus an
//! output-port table keyed by endpoint address; at relay setup the manager
//! connects each matching port to the corresponding writer's injection
//! inbox. `listen` runs on its own thread for the whole relaying session and
//! returns only after `please_stop`.
//!
//! Delivery is best-effort over in-process bounded channels: a full or
//! torn-down inbox drops the transfer rather than stalling the injector.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use common::StopToken;
use model::{Configuration, Device, Endpoint, Interface, Transfer};
use tracing::{debug, trace};

use crate::fabric::PacketSender;

/// How long an injector sleeps between stop-token checks while idling
const IDLE_SLICE: Duration = Duration::from_millis(10);

/// Output-port table wiring an injector to writer inboxes
#[derive(Default)]
pub struct InjectionPorts {
    ports: Mutex<HashMap<u8, PacketSender>>,
}

impl InjectionPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect (or re-connect) the port for `endpoint` to a writer inbox.
    /// Called by the manager at relay setup; a later setup for the same
    /// address replaces the wiring.
    pub fn connect(&self, endpoint: u8, inbox: PacketSender) {
        self.ports.lock().unwrap().insert(endpoint, inbox);
    }

    /// Drop all wiring
    pub fn clear(&self) {
        self.ports.lock().unwrap().clear();
    }

    /// Best-effort send toward the writer driving the transfer's endpoint.
    /// Returns false when no port is wired, the inbox is full, or its writer
    /// is gone.
    pub fn send(&self, transfer: Transfer) -> bool {
        let ports = self.ports.lock().unwrap();
        match ports.get(&transfer.endpoint) {
            Some(inbox) => match inbox.try_send(transfer) {
                Ok(()) => true,
                Err(err) => {
                    trace!(
                        "injection dropped on endpoint {:#04x}: inbox unavailable",
                        err.into_inner().endpoint
                    );
                    false
                }
            },
            None => false,
        }
    }
}

/// Independently scheduled producer of synthetic transfers
pub trait Injector: Send + Sync {
    /// Scope predicate: does this injector apply to the device?
    fn matches_device(&self, _device: &Device) -> bool {
        true
    }

    /// Scope predicate: does this injector apply to the configuration?
    fn matches_configuration(&self, _config: &Configuration) -> bool {
        true
    }

    /// Scope predicate: does this injector apply to the interface?
    fn matches_interface(&self, _interface: &Interface) -> bool {
        true
    }

    /// Scope predicate: does this injector apply to the endpoint?
    fn matches_endpoint(&self, _endpoint: &Endpoint) -> bool {
        true
    }

    /// The port table the manager wires at relay setup
    fn ports(&self) -> &InjectionPorts;

    /// Produce transfers until asked to stop
    fn listen(&self);

    /// Cooperative cancellation; idempotent and non-blocking
    fn please_stop(&self);
}

/// Emits a fixed payload on one endpoint at a fixed interval
pub struct PeriodicInjector {
    endpoint: u8,
    payload: Vec<u8>,
    interval: Duration,
    ports: InjectionPorts,
    stop: StopToken,
}

impl PeriodicInjector {
    pub fn new(endpoint: u8, payload: Vec<u8>, interval: Duration) -> Self {
        Self {
            endpoint,
            payload,
            interval,
            ports: InjectionPorts::new(),
            stop: StopToken::new(),
        }
    }
}

impl Injector for PeriodicInjector {
    fn matches_endpoint(&self, endpoint: &Endpoint) -> bool {
        endpoint.address() == self.endpoint
    }

    fn ports(&self) -> &InjectionPorts {
        &self.ports
    }

    fn listen(&self) {
        debug!(
            "periodic injector on endpoint {:#04x} started, interval {:?}",
            self.endpoint, self.interval
        );
        while !self.stop.is_stopped() {
            // Sleep in slices so please_stop is observed promptly even with
            // long intervals.
            let deadline = Instant::now() + self.interval;
            while Instant::now() < deadline {
                if self.stop.is_stopped() {
                    debug!(
                        "periodic injector on endpoint {:#04x} stopped",
                        self.endpoint
                    );
                    return;
                }
                thread::sleep(IDLE_SLICE.min(self.interval));
            }
            self.ports()
                .send(Transfer::new(self.endpoint, self.payload.clone()));
        }
        debug!(
            "periodic injector on endpoint {:#04x} stopped",
            self.endpoint
        );
    }

    fn please_stop(&self) {
        self.stop.please_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::packet_queue;

    #[test]
    fn test_ports_route_by_endpoint_address() {
        let ports = InjectionPorts::new();
        let (tx, rx) = packet_queue();
        ports.connect(0x81, tx);

        assert!(ports.send(Transfer::new(0x81, vec![1])));
        assert!(!ports.send(Transfer::new(0x02, vec![2])));

        assert_eq!(rx.try_recv().unwrap().endpoint, 0x81);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ports_send_fails_once_writer_is_gone() {
        let ports = InjectionPorts::new();
        let (tx, rx) = packet_queue();
        ports.connect(0x81, tx);
        drop(rx);

        assert!(!ports.send(Transfer::new(0x81, vec![1])));
    }

    #[test]
    fn test_periodic_injector_emits_until_stopped() {
        let injector = std::sync::Arc::new(PeriodicInjector::new(
            0x81,
            vec![0xab],
            Duration::from_millis(5),
        ));
        let (tx, rx) = packet_queue();
        injector.ports().connect(0x81, tx);

        let worker = injector.clone();
        let handle = thread::spawn(move || worker.listen());

        // Give it a few intervals, then stop.
        thread::sleep(Duration::from_millis(40));
        injector.please_stop();
        injector.please_stop();
        handle.join().unwrap();

        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert!(seen >= 1, "expected at least one injected transfer");
    }
}
