//! Manager lifecycle integration tests
//!
//! Drives the full manager state machine against mock proxies: control
//! setup, data-endpoint reconfiguration, connect-retry behavior, registry
//! gating, bus reset, and teardown.
//!
//! Run with: `cargo test -p relay --test manager_tests`

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use model::ProxyError;
use relay::filter::LoggingFilter;
use relay::inject::PeriodicInjector;
use relay::manager::{Manager, ManagerState};
use relay::plugin::PluginSet;
use relay::testing::{
    config_blob, device_descriptor_bytes, qualifier_bytes, set_configuration_transfer,
    wait_until, EndpointSpec, MockDeviceProxy, MockHostProxy,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const BULK_IN_81: EndpointSpec = EndpointSpec {
    address: 0x81,
    attributes: 0x02,
};
const BULK_OUT_02: EndpointSpec = EndpointSpec {
    address: 0x02,
    attributes: 0x02,
};

fn plugin_set(device: &Arc<MockDeviceProxy>, host: &Arc<MockHostProxy>) -> PluginSet {
    PluginSet {
        device_proxy: device.clone(),
        host_proxy: host.clone(),
        filters: Vec::new(),
        injectors: Vec::new(),
    }
}

fn start_relaying(device: &Arc<MockDeviceProxy>, host: &Arc<MockHostProxy>) -> Manager {
    let manager = Manager::new();
    manager.load_plugins(plugin_set(device, host)).expect("load plugins");
    manager
        .start_control_relaying()
        .expect("start control relaying");
    manager
}

// ============================================================================
// Control setup and plain enumeration
// ============================================================================

#[test]
fn test_plain_enumeration_brings_up_data_relays() {
    let device = Arc::new(MockDeviceProxy::default_device());
    let host = Arc::new(MockHostProxy::new());
    let manager = start_relaying(&device, &host);

    assert_eq!(manager.state(), ManagerState::Relaying);
    // Only EP0 is relayed before the host selects a configuration.
    assert_eq!(manager.relay_endpoints(), vec![0x00]);
    assert!(device.is_connected());
    assert!(host.is_connected());
    assert!(manager.device().is_some());

    // Host selects configuration 1: slots 1 IN and 2 OUT come up, the other
    // 14 slots stay empty.
    host.push_control(set_configuration_transfer(1));
    assert!(wait_until(TEST_TIMEOUT, || manager.relay_endpoints()
        == vec![0x00, 0x02, 0x81]));

    // The SET_CONFIGURATION itself was relayed to the device side.
    assert!(wait_until(TEST_TIMEOUT, || device.written_on(0x00).len() == 1));
    // Endpoint-to-interface bookkeeping reached the device proxy.
    assert_eq!(device.endpoint_interface(0x81), Some(0));
    assert_eq!(device.endpoint_interface(0x02), Some(0));
    // Interfaces were claimed at control setup and again after the
    // configuration change.
    assert!(device.claimed().len() >= 2);

    manager.stop_relaying();
    assert_eq!(manager.state(), ManagerState::Idle);
    assert!(manager.relay_endpoints().is_empty());
    assert!(manager.device().is_none());
    assert!(!device.is_connected());
    assert!(!host.is_connected());
}

#[test]
fn test_start_requires_idle_and_loaded_proxies() {
    let manager = Manager::new();
    assert!(manager.start_control_relaying().is_err());
    assert_eq!(manager.state(), ManagerState::Idle);

    let device = Arc::new(MockDeviceProxy::default_device());
    let host = Arc::new(MockHostProxy::new());
    let manager = start_relaying(&device, &host);
    // A second start while relaying is rejected.
    assert!(manager.start_control_relaying().is_err());
    assert_eq!(manager.state(), ManagerState::Relaying);
    manager.stop_relaying();
}

#[test]
fn test_fatal_connect_failure_returns_to_idle() {
    let device = Arc::new(MockDeviceProxy::default_device());
    device.set_connect_error(ProxyError::NoDevice);
    let host = Arc::new(MockHostProxy::new());

    let manager = Manager::new();
    manager.load_plugins(plugin_set(&device, &host)).unwrap();
    assert!(manager.start_control_relaying().is_err());
    assert_eq!(manager.state(), ManagerState::Idle);
    assert!(manager.relay_endpoints().is_empty());
}

// ============================================================================
// Connect retry loop
// ============================================================================

#[test]
fn test_connect_timeouts_are_retried_until_success() {
    let device = Arc::new(MockDeviceProxy::default_device());
    device.set_connect_timeouts(4);
    let host = Arc::new(MockHostProxy::new());

    let manager = start_relaying(&device, &host);
    assert_eq!(manager.state(), ManagerState::Relaying);
    // Four timed-out attempts plus the one that succeeded.
    assert_eq!(device.connect_calls(), 5);
    manager.stop_relaying();
}

#[test]
fn test_stop_during_connect_loop_lands_at_idle() {
    let device = Arc::new(MockDeviceProxy::default_device());
    device.set_connect_timeouts(usize::MAX);
    let host = Arc::new(MockHostProxy::new());

    let manager = Manager::new();
    manager.load_plugins(plugin_set(&device, &host)).unwrap();

    let runner = manager.clone();
    let setup = thread::spawn(move || runner.start_control_relaying());

    assert!(wait_until(TEST_TIMEOUT, || device.connect_calls() >= 3));
    manager.stop_relaying();

    assert!(setup.join().unwrap().is_err());
    assert_eq!(manager.state(), ManagerState::Idle);

    // The retry loop is done for good.
    let calls = device.connect_calls();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(device.connect_calls(), calls);
}

#[test]
fn test_host_connect_timeouts_are_retried() {
    let device = Arc::new(MockDeviceProxy::default_device());
    let host = Arc::new(MockHostProxy::new());
    host.set_connect_timeouts(3);

    let manager = start_relaying(&device, &host);
    assert_eq!(manager.state(), ManagerState::Relaying);
    assert_eq!(host.connect_calls(), 4);
    manager.stop_relaying();
}

// ============================================================================
// Registry gating (filters and injectors)
// ============================================================================

#[test]
fn test_registry_mutation_rejected_while_relaying() {
    let device = Arc::new(MockDeviceProxy::default_device());
    let host = Arc::new(MockHostProxy::new());
    let manager = start_relaying(&device, &host);

    assert!(manager
        .add_filter(Arc::new(LoggingFilter::new(None)))
        .is_err());
    assert_eq!(manager.filter_count(), 0);
    assert!(manager.remove_filter(0).is_err());

    assert!(manager
        .add_injector(Arc::new(PeriodicInjector::new(
            0x81,
            vec![0],
            Duration::from_secs(1),
        )))
        .is_err());
    assert_eq!(manager.injector_count(), 0);

    manager.stop_relaying();

    // Back in idle the same operations are accepted, with dense shifting
    // indices.
    manager
        .add_filter(Arc::new(LoggingFilter::new(None)))
        .unwrap();
    manager
        .add_filter(Arc::new(LoggingFilter::new(Some(0x81))))
        .unwrap();
    assert_eq!(manager.filter_count(), 2);
    let removed = manager.remove_filter(0).unwrap();
    drop(removed);
    assert_eq!(manager.filter_count(), 1);
    assert!(manager.filter(0).is_some());

    // Out-of-range removal is rejected without touching the list.
    assert!(manager.remove_filter(5).is_err());
    assert_eq!(manager.filter_count(), 1);
}

// ============================================================================
// Isochronous endpoints
// ============================================================================

#[test]
fn test_isochronous_endpoints_are_skipped() {
    let iso_in_83 = EndpointSpec {
        address: 0x83,
        attributes: 0x01,
    };
    let device = Arc::new(MockDeviceProxy::new(
        device_descriptor_bytes(0x1234, 0x5678, 1),
        vec![config_blob(1, &[BULK_IN_81, BULK_OUT_02, iso_in_83])],
    ));
    let host = Arc::new(MockHostProxy::new());
    let manager = start_relaying(&device, &host);

    host.push_control(set_configuration_transfer(1));
    assert!(wait_until(TEST_TIMEOUT, || manager.relay_endpoints()
        == vec![0x00, 0x02, 0x81]));

    // Slot 3 IN never appears, no matter how long we look.
    thread::sleep(Duration::from_millis(100));
    assert!(!manager.relay_endpoints().contains(&0x83));

    manager.stop_relaying();
}

// ============================================================================
// Reconfiguration
// ============================================================================

#[test]
fn test_reconfiguration_replaces_data_relays() {
    let in_83 = EndpointSpec {
        address: 0x83,
        attributes: 0x02,
    };
    let out_04 = EndpointSpec {
        address: 0x04,
        attributes: 0x02,
    };
    let device = Arc::new(
        MockDeviceProxy::new(
            device_descriptor_bytes(0x1234, 0x5678, 2),
            vec![
                config_blob(1, &[BULK_IN_81, BULK_OUT_02]),
                config_blob(2, &[in_83, out_04]),
            ],
        )
        .with_qualifier(
            qualifier_bytes(2),
            vec![
                config_blob(1, &[BULK_IN_81, BULK_OUT_02]),
                config_blob(2, &[in_83, out_04]),
            ],
            true,
        ),
    );
    let host = Arc::new(MockHostProxy::new());
    let manager = start_relaying(&device, &host);

    host.push_control(set_configuration_transfer(1));
    assert!(wait_until(TEST_TIMEOUT, || manager.relay_endpoints()
        == vec![0x00, 0x02, 0x81]));

    // The host switches to configuration 2: config 1 relays are torn down
    // and config 2's table installed.
    host.push_control(set_configuration_transfer(2));
    assert!(wait_until(TEST_TIMEOUT, || manager.relay_endpoints()
        == vec![0x00, 0x04, 0x83]));

    // Both proxies saw the qualifier-aware high-speed parameterization.
    let device_calls = device.set_config_calls();
    let host_calls = host.set_config_calls();
    assert_eq!(device_calls.last(), Some(&(2, Some(2), true)));
    assert_eq!(host_calls.last(), Some(&(2, Some(2), true)));
    assert_eq!(device_calls.len(), 2);

    manager.stop_relaying();
    assert_eq!(manager.state(), ManagerState::Idle);
}

#[test]
fn test_set_config_without_qualifier_passes_no_other_speed() {
    let device = Arc::new(MockDeviceProxy::default_device());
    let host = Arc::new(MockHostProxy::new());
    let manager = start_relaying(&device, &host);

    host.push_control(set_configuration_transfer(1));
    assert!(wait_until(TEST_TIMEOUT, || !device.set_config_calls().is_empty()));
    assert_eq!(device.set_config_calls(), vec![(1, None, false)]);
    assert_eq!(host.set_config_calls(), vec![(1, None, false)]);

    manager.stop_relaying();
}

#[test]
fn test_unknown_configuration_value_is_ignored() {
    let device = Arc::new(MockDeviceProxy::default_device());
    let host = Arc::new(MockHostProxy::new());
    let manager = start_relaying(&device, &host);

    host.push_control(set_configuration_transfer(7));
    assert!(wait_until(TEST_TIMEOUT, || device.written_on(0x00).len() == 1));

    // No matching configuration: no data relays, session keeps running.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(manager.relay_endpoints(), vec![0x00]);
    assert_eq!(manager.state(), ManagerState::Relaying);

    manager.stop_relaying();
}

// ============================================================================
// Bus reset
// ============================================================================

#[test]
fn test_bus_reset_preserves_ep0_and_recovers_via_set_configuration() {
    let device = Arc::new(MockDeviceProxy::default_device());
    let host = Arc::new(MockHostProxy::new());
    let manager = start_relaying(&device, &host);

    host.push_control(set_configuration_transfer(1));
    assert!(wait_until(TEST_TIMEOUT, || manager.relay_endpoints()
        == vec![0x00, 0x02, 0x81]));

    manager.handle_bus_reset();
    assert_eq!(manager.state(), ManagerState::Reset);
    assert_eq!(manager.relay_endpoints(), vec![0x00]);

    // Filter mutation is allowed while parked in reset.
    manager
        .add_filter(Arc::new(LoggingFilter::new(None)))
        .unwrap();
    assert_eq!(manager.filter_count(), 1);

    // Reset completes when the host reselects a configuration.
    host.push_control(set_configuration_transfer(1));
    assert!(wait_until(TEST_TIMEOUT, || manager.state()
        == ManagerState::Relaying
        && manager.relay_endpoints() == vec![0x00, 0x02, 0x81]));

    manager.stop_relaying();
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_stop_relaying_is_idempotent() {
    let device = Arc::new(MockDeviceProxy::default_device());
    let host = Arc::new(MockHostProxy::new());
    let manager = start_relaying(&device, &host);

    manager.stop_relaying();
    manager.stop_relaying();
    assert_eq!(manager.state(), ManagerState::Idle);

    // Stopping an idle manager stays a no-op.
    manager.stop_relaying();
    assert_eq!(manager.state(), ManagerState::Idle);
}

#[test]
fn test_cleanup_drops_registries_and_proxies() {
    let device = Arc::new(MockDeviceProxy::default_device());
    let host = Arc::new(MockHostProxy::new());
    let manager = Manager::new();
    manager.load_plugins(plugin_set(&device, &host)).unwrap();
    manager
        .add_filter(Arc::new(LoggingFilter::new(None)))
        .unwrap();

    manager.cleanup();
    assert_eq!(manager.filter_count(), 0);
    assert_eq!(manager.injector_count(), 0);
    // With the proxies gone, a start attempt fails immediately.
    assert!(manager.start_control_relaying().is_err());
    assert_eq!(manager.state(), ManagerState::Idle);
}
