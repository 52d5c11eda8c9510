mod common;

use canopy_core::cfg::{ConditionalConfig, ConditionalMode, EdgeDirection, EdgeInputConfig, InputChannelConfig, PreOutputConfig, SignalSelect};
use canopy_core::conditional::ConditionalTable;
use canopy_core::core::shareable::Shareable;
use canopy_core::driver::registry::DriverRegistry;
use canopy_core::driver::{AcquisitionDriver, DriverError};
use canopy_core::input::{ControllerError, ControllerState, InputController};
use canopy_core::lock::{LockManager, ResourceKey};
use canopy_core::measurement::MeasurementSet;
use canopy_core::persistence::MeasurementSink;
use canopy_core::trace::trace_helper::TraceHelper;
use canopy_core::util::clock::{Clock, SystemClock};
use canopy_hal::gpio::{EdgeSource, Level};
use common::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn secs(s: f64) -> Duration
{
    Duration::from_secs_f64(s)
}

fn input(period: f64) -> InputChannelConfig
{
    InputChannelConfig::new("dht", "SCRIPTED", period)
}

fn periodic(id: &str, input_id: &str, period: f64) -> ConditionalConfig
{
    ConditionalConfig {
        unique_id: id.to_string(),
        input_id: input_id.to_string(),
        name: id.to_string(),
        is_activated: true,
        mode: ConditionalMode::Periodic { period },
        action: "notify".to_string()
    }
}

fn no_conditionals() -> ConditionalTable
{
    ConditionalTable::empty("dht", "dht")
}

fn foreign_locks(dir: &std::path::Path) -> LockManager
{
    LockManager::new(dir, 1, Duration::from_millis(1), Arc::new(SystemClock), TraceHelper::new("OTHER".to_string()))
}

#[test]
fn acquisition_cycle_with_transient_misses()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let log = CapturedLog::default();
    let driver = ScriptedDriver::new(vec![
        reading(22.5),
        Err(DriverError::NoData),
        Err(DriverError::NoData),
        reading(23.0)
    ]);
    let mut ctl = h.controller(input(2.0), driver.clone(), no_conditionals(), dir.path());

    tracing::subscriber::with_default(log.subscriber(), || {
        // cycle 1
        ctl.tick();
        assert_eq!(vec![22.5], h.sink.values());
        assert_eq!(0, ctl.status().consecutive_failures);

        // nothing happens between periods
        for _ in 0..19
        {
            h.tick_after(&mut ctl, secs(0.1));
        }
        assert_eq!(1, driver.calls());

        // cycles 2 and 3 fail quietly
        h.tick_after(&mut ctl, secs(0.1));
        assert_eq!(1, ctl.status().consecutive_failures);
        h.tick_after(&mut ctl, secs(2.0));
        assert_eq!(2, ctl.status().consecutive_failures);
        assert_eq!(vec![22.5], h.sink.values());
        assert!(log.errors().is_empty(), "{:?}", log.errors());

        // cycle 4 succeeds and resets the counter
        h.tick_after(&mut ctl, secs(2.0));
    });

    assert_eq!(vec![22.5, 23.0], h.sink.values());
    let status = ctl.status();
    assert_eq!(0, status.consecutive_failures);
    assert_eq!(4, status.cycles);
    assert_eq!(2, status.successes);
    assert_eq!(ControllerState::Idle, status.state);
    assert_eq!(4, driver.calls());
    assert!(log.errors().is_empty());
}

#[test]
fn every_third_miss_in_a_row_is_logged_as_error()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let log = CapturedLog::default();
    let mut ctl = h.controller(input(1.0), ScriptedDriver::new(vec![]), no_conditionals(), dir.path());

    tracing::subscriber::with_default(log.subscriber(), || {
        ctl.tick();
        h.tick_after(&mut ctl, secs(1.0));
        assert!(log.errors().is_empty());

        h.tick_after(&mut ctl, secs(1.0));
        assert_eq!(1, log.errors().len());
        assert!(log.errors()[0].contains("3 times in a row"));

        for _ in 0..3
        {
            h.tick_after(&mut ctl, secs(1.0));
        }
    });

    assert_eq!(6, ctl.status().consecutive_failures);
    assert_eq!(2, log.errors().len());
    assert!(log.errors()[1].contains("6 times in a row"));
}

#[test]
fn escaped_panic_is_reported_by_join()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut services = h.services();
    services.sink = Arc::new(PanickingSink) as Arc<dyn MeasurementSink>;
    let mut registry = DriverRegistry::new();
    let driver = ScriptedDriver::new(vec![reading(1.0)]);
    registry.register("SCRIPTED", move |_| Ok(Box::new(driver.clone()) as Box<dyn AcquisitionDriver>));

    let ctl = InputController::new(input(60.0), no_conditionals(), &registry, services, h.settings(dir.path())).unwrap();
    // the first cycle is due right away and its commit panics
    let mut handle = ctl.launch().unwrap();
    assert_eq!(Err("sink exploded".to_string()), handle.join());
    assert_eq!(Ok(()), handle.join());
}

#[test]
fn schedule_keeps_phase_after_overrun()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let t0 = h.clock.now();
    let driver = ScriptedDriver::new(vec![reading(1.0), reading(2.0), reading(3.0)]);
    let mut ctl = h.controller(input(2.0), driver.clone(), no_conditionals(), dir.path());

    ctl.tick();
    assert_eq!(t0 + secs(2.0), ctl.next_measurement());

    // the loop stalls for more than three periods
    h.tick_after(&mut ctl, secs(7.5));
    assert_eq!(t0 + secs(8.0), ctl.next_measurement());
    assert_eq!(2, driver.calls());

    h.tick_after(&mut ctl, secs(0.5));
    assert_eq!(t0 + secs(10.0), ctl.next_measurement());
    assert_eq!(3, driver.calls());
}

#[test]
fn first_measurement_waits_for_start_offset()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut cfg = input(2.0);
    cfg.start_offset = 5.0;
    let driver = ScriptedDriver::new(vec![reading(1.0)]);
    let mut ctl = h.controller(cfg, driver.clone(), no_conditionals(), dir.path());

    ctl.tick();
    h.tick_after(&mut ctl, secs(4.9));
    assert_eq!(0, driver.calls());
    h.tick_after(&mut ctl, secs(0.1));
    assert_eq!(1, driver.calls());
}

#[test]
fn forced_measurement_runs_on_next_iteration()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let driver = ScriptedDriver::new(vec![reading(1.0), reading(2.0)]);
    let mut ctl = h.controller(input(60.0), driver.clone(), no_conditionals(), dir.path());

    ctl.tick();
    ctl.force_measurement();
    h.tick_after(&mut ctl, secs(1.0));
    assert_eq!(2, driver.calls());
    assert_eq!(vec![1.0, 2.0], h.sink.values());
}

#[test]
fn pre_activation_gates_the_read()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut cfg = input(10.0);
    cfg.pre_output = Some(PreOutputConfig { output_id: "relay".to_string(), channel: 0, duration: 2.0, during_measure: false });
    let driver = ScriptedDriver::new(vec![reading(1.0)]);
    let mut ctl = h.controller(cfg, driver.clone(), no_conditionals(), dir.path());

    ctl.tick();
    assert_eq!(ControllerState::PreActivating, ctl.status().state);
    assert_eq!(vec![OutputCall::On("relay".to_string(), 0, Some(secs(2.0)))], h.outputs.calls.snapshot());

    h.tick_after(&mut ctl, secs(1.0));
    assert_eq!(0, driver.calls());
    h.tick_after(&mut ctl, secs(1.0));
    assert_eq!(1, driver.calls());
    assert_eq!(ControllerState::Idle, ctl.status().state);
    // the pre-output lock is gone after the read
    let key = ResourceKey::PreOutput { output_id: "relay".to_string(), channel: 0 };
    assert!(!dir.path().join(key.lock_name()).exists());
}

#[test]
fn pre_output_during_measure_is_switched_off_afterwards()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut cfg = input(10.0);
    cfg.pre_output = Some(PreOutputConfig { output_id: "relay".to_string(), channel: 2, duration: 0.5, during_measure: true });
    let driver = ScriptedDriver::new(vec![reading(1.0)]);
    let mut ctl = h.controller(cfg, driver.clone(), no_conditionals(), dir.path());

    ctl.tick();
    h.tick_after(&mut ctl, secs(0.5));
    assert_eq!(1, driver.calls());
    assert_eq!(vec![
        OutputCall::On("relay".to_string(), 2, None),
        OutputCall::Off("relay".to_string(), 2)
    ], h.outputs.calls.snapshot());
}

#[test]
fn busy_pre_output_aborts_the_cycle()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut cfg = input(10.0);
    cfg.pre_output = Some(PreOutputConfig { output_id: "relay".to_string(), channel: 0, duration: 1.0, during_measure: false });
    let driver = ScriptedDriver::new(vec![reading(1.0)]);
    let mut ctl = h.controller(cfg, driver.clone(), no_conditionals(), dir.path());

    let other = foreign_locks(dir.path());
    assert!(other.acquire(&ResourceKey::PreOutput { output_id: "relay".to_string(), channel: 0 }));

    ctl.tick();
    assert!(h.outputs.calls.lock().is_empty());
    assert_eq!(ControllerState::Idle, ctl.status().state);
    assert_eq!(1, ctl.status().cycles);
    assert_eq!(0, driver.calls());
}

#[test]
fn held_shared_resource_skips_the_read_until_next_period()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let key = ResourceKey::Adc { bus: 1, address: 0x48 };
    let mut cfg = input(2.0);
    cfg.resource = Some(key.clone());
    let driver = ScriptedDriver::new(vec![reading(1.0)]);
    let mut ctl = h.controller(cfg, driver.clone(), no_conditionals(), dir.path());

    let other = foreign_locks(dir.path());
    assert!(other.acquire(&key));
    ctl.tick();
    assert_eq!(0, driver.calls());
    assert_eq!(0, ctl.status().consecutive_failures);
    assert!(h.sink.values().is_empty());

    other.release(&key);
    h.tick_after(&mut ctl, secs(0.5));
    assert_eq!(0, driver.calls());
    h.tick_after(&mut ctl, secs(2.0));
    assert_eq!(1, driver.calls());
}

/// Sink that records whether the resource lock file existed when the
/// measurement was handed over.
#[derive(Clone)]
struct LockCheckingSink
{
    lock_file: PathBuf,
    seen_locked: Shareable<Vec<bool>>
}

impl MeasurementSink for LockCheckingSink
{
    fn persist(&self, _input_id: &str, _measurements: MeasurementSet)
    {
        self.seen_locked.lock().push(self.lock_file.exists());
    }
}

#[test]
fn resource_lock_is_released_before_persisting()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let key = ResourceKey::Adc { bus: 1, address: 0x48 };
    let mut cfg = input(2.0);
    cfg.resource = Some(key.clone());

    let sink = LockCheckingSink { lock_file: dir.path().join(key.lock_name()), seen_locked: Shareable::new(Vec::new()) };
    let mut services = h.services();
    services.sink = Arc::new(sink.clone()) as Arc<dyn MeasurementSink>;
    let driver = ScriptedDriver::new(vec![reading(1.0)]);
    let mut registry = DriverRegistry::new();
    registry.register("SCRIPTED", move |_| Ok(Box::new(driver.clone()) as Box<dyn AcquisitionDriver>));
    let mut ctl = InputController::new(cfg, no_conditionals(), &registry, services, h.settings(dir.path())).unwrap();

    ctl.tick();
    assert_eq!(vec![false], sink.seen_locked.snapshot());
}

#[test]
fn panicking_driver_does_not_kill_the_loop()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut registry = DriverRegistry::new();
    registry.register("SCRIPTED", |_| Ok(Box::new(PanickingDriver) as Box<dyn AcquisitionDriver>));
    let mut ctl = InputController::new(input(1.0), no_conditionals(), &registry, h.services(), h.settings(dir.path())).unwrap();

    ctl.tick();
    h.tick_after(&mut ctl, secs(1.0));
    let status = ctl.status();
    assert_eq!(2, status.cycles);
    assert_eq!(0, status.successes);
    assert_eq!(0, status.consecutive_failures);
}

#[test]
fn driver_faults_do_not_count_as_misses()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let driver = ScriptedDriver::new(vec![Err(DriverError::NoData), Err(DriverError::Fault("crc".to_string()))]);
    let mut ctl = h.controller(input(1.0), driver, no_conditionals(), dir.path());

    ctl.tick();
    h.tick_after(&mut ctl, secs(1.0));
    assert_eq!(1, ctl.status().consecutive_failures);
}

#[test]
fn unknown_device_refuses_to_start()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let result = InputController::new(InputChannelConfig::new("x", "NOPE", 1.0),
                                      no_conditionals(),
                                      &DriverRegistry::new(),
                                      h.services(),
                                      h.settings(dir.path()));
    assert!(matches!(result, Err(ControllerError::UnknownDevice { .. })));
}

#[test]
fn invalid_period_refuses_to_start()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let driver = ScriptedDriver::new(vec![]);
    let mut registry = DriverRegistry::new();
    registry.register("SCRIPTED", move |_| Ok(Box::new(driver.clone()) as Box<dyn AcquisitionDriver>));
    for period in [-1.0, 0.0, 1e-10].iter()
    {
        let result = InputController::new(input(*period), no_conditionals(), &registry, h.services(), h.settings(dir.path()));
        assert!(matches!(result, Err(ControllerError::Config(_))), "period {} accepted", period);
    }
}

#[test]
fn periodic_conditional_fires_after_successful_measurement_only()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let table = ConditionalTable::rebuild("dht", "dht", &[periodic("c1", "dht", 30.0)]);
    let driver = ScriptedDriver::new(vec![Err(DriverError::NoData), reading(20.0)]);
    let mut ctl = h.controller(input(2.0), driver, table, dir.path());

    ctl.tick();
    assert!(h.actions.ids().is_empty());

    h.tick_after(&mut ctl, secs(2.0));
    assert_eq!(vec!["c1".to_string()], h.actions.ids());

    // next evaluation only after the conditional's own period
    h.tick_after(&mut ctl, secs(2.0));
    assert_eq!(1, h.actions.ids().len());
    h.tick_after(&mut ctl, secs(28.0));
    assert_eq!(2, h.actions.ids().len());
}

fn edge_controller(h: &Harness, source: &ManualEdgeSource, table: ConditionalTable, lock_dir: &std::path::Path) -> InputController
{
    let mut cfg = InputChannelConfig::new("door", "EDGE", 5.0);
    cfg.gpio = Some(17);
    cfg.edge = Some(EdgeInputConfig { edge: EdgeDirection::Both, bouncetime_ms: 0, reset_period: 1.0 });
    let mut registry = DriverRegistry::new();
    let src = source.clone();
    registry.set_edge_source(move |_| Ok(Box::new(src.clone()) as Box<dyn EdgeSource>));
    let mut ctl = InputController::new(cfg, table, &registry, h.services(), h.settings(lock_dir)).unwrap();
    ctl.start_edge_detection().unwrap();
    ctl
}

#[test]
fn accepted_edges_are_persisted_and_debounced()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let source = ManualEdgeSource::default();
    let _ctl = edge_controller(&h, &source, ConditionalTable::empty("door", "door"), dir.path());
    assert!(source.is_subscribed());

    source.fire(Level::High);
    h.clock.advance(secs(0.999));
    source.fire(Level::Low);
    assert_eq!(vec![1.0], h.sink.values());

    h.clock.advance(secs(0.002));
    source.fire(Level::Low);
    assert_eq!(vec![1.0, -1.0], h.sink.values());
}

#[test]
fn edges_trigger_matching_edge_conditionals()
{
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let source = ManualEdgeSource::default();
    let edge_cond = |id: &str, direction: EdgeDirection| ConditionalConfig {
        unique_id: id.to_string(),
        input_id: "door".to_string(),
        name: id.to_string(),
        is_activated: true,
        mode: ConditionalMode::Edge { signal_select: SignalSelect::Edge, edge_direction: direction },
        action: "notify".to_string()
    };
    let table = ConditionalTable::rebuild("door", "door", &[
        edge_cond("opened", EdgeDirection::Rising),
        edge_cond("closed", EdgeDirection::Falling),
        periodic("watch", "door", 60.0)
    ]);
    let mut ctl = edge_controller(&h, &source, table, dir.path());

    source.fire(Level::High);
    assert_eq!(vec!["opened".to_string()], h.actions.ids());

    // a periodic conditional on an edge input runs once an edge was seen
    ctl.tick();
    assert_eq!(vec!["opened".to_string(), "watch".to_string()], h.actions.ids());

    h.clock.advance(secs(2.0));
    source.fire(Level::Low);
    assert_eq!("closed", h.actions.ids()[2]);
}
