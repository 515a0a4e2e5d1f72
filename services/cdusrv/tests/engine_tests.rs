//! End-to-end engine behaviour over the mock transport and a framed link

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use cdusrv::engine::{self, CduHandle, EngineConfig};
use cdusrv::error::TransportError;
use cdusrv::protocols::modbus::Framing;
use cdusrv::scheduler::{PollScheduler, PollState};
use cdusrv::store::LinkStatus;
use cdusrv::transport::mock::{MockCall, MockTransport};
use cdusrv::transport::{ModbusLink, Transport};
use cdusrv::{ByteOrder, CommandOutcome, Value};

use common::{test_map, FakeSlave, UNIT_ID};

fn mock_engine(config: EngineConfig) -> (CduHandle, PollScheduler, Arc<MockTransport>) {
    let mock = Arc::new(MockTransport::new());
    mock.set_registers(100, &[4250, 180]);
    mock.set_register(200, 12_000);
    let (handle, scheduler) = engine::build(Arc::new(test_map()), mock.clone(), config);
    (handle, scheduler, mock)
}

#[tokio::test]
async fn test_scaled_temperature_published() {
    let (handle, mut scheduler, _mock) = mock_engine(EngineConfig::default());
    scheduler.run_cycle().await;

    let status = handle.get_status();
    let field = status.snapshot.get("supply_temp").unwrap();
    assert_eq!(field.value, Value::Number(425.0));
    assert_eq!(field.unit, "°C");
    assert_eq!(status.snapshot.number("inlet_pressure"), Some(12.0));
    assert_eq!(status.health.status(), LinkStatus::Online);
}

#[tokio::test]
async fn test_failed_range_discards_whole_cycle() {
    let (handle, mut scheduler, mock) = mock_engine(EngineConfig::default());
    assert_eq!(scheduler.run_cycle().await, PollState::Success);
    let before = handle.get_status();

    // New values everywhere, but the second range (inlet_pressure) fails
    mock.set_registers(100, &[300, 310]);
    mock.set_register(200, 8000);
    mock.fail_reads_at(200, TransportError::Timeout("no answer".into()));
    assert_eq!(scheduler.run_cycle().await, PollState::Fault);

    let after = handle.get_status();
    assert!(Arc::ptr_eq(&before.snapshot, &after.snapshot));
    assert_eq!(after.snapshot.number("supply_temp"), Some(425.0));
    assert_eq!(after.health.consecutive_failures, 1);
    assert_eq!(after.health.status(), LinkStatus::Degraded);
    assert!(after.health.last_error.as_deref().unwrap().contains("no answer"));
}

#[tokio::test]
async fn test_stale_after_threshold_and_recovery() {
    // A silent device goes stale exactly like an unplugged cable
    let failures = [
        TransportError::Timeout("no response within 1s".into()),
        TransportError::ConnectionLost("reset by peer".into()),
        TransportError::LinkDown("cable unplugged".into()),
    ];
    for failure in failures {
        let (handle, mut scheduler, mock) = mock_engine(EngineConfig::default());
        scheduler.run_cycle().await;
        let last_success = handle.get_status().health.last_success;

        mock.fail_every_call(failure.clone());
        for expected in 1..=4 {
            assert_eq!(scheduler.run_cycle().await, PollState::Fault);
            let health = handle.get_status().health.clone();
            assert_eq!(health.consecutive_failures, expected, "{failure:?}");
            assert!(!health.is_stale(), "{failure:?}");
        }
        scheduler.run_cycle().await;
        let status = handle.get_status();
        assert_eq!(status.health.consecutive_failures, 5);
        assert!(status.health.is_stale(), "{failure:?}");
        assert_eq!(status.health.last_error.as_deref(), Some(failure.to_string().as_str()));
        assert_eq!(status.health.last_success, last_success);
        assert_eq!(status.snapshot.number("supply_temp"), Some(425.0));

        mock.clear_failures();
        scheduler.run_cycle().await;
        let health = handle.get_status().health.clone();
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.status(), LinkStatus::Online);
        assert!(health.last_success.is_some());
        assert!(health.last_success >= last_success);
    }
}

#[tokio::test]
async fn test_commands_apply_in_submission_order() {
    let (handle, mut scheduler, mock) = mock_engine(EngineConfig::default());
    let first = handle.enqueue("pump1_duty", Value::Number(10.0)).unwrap();
    let second = handle.enqueue("pump1_duty", Value::Number(20.0)).unwrap();
    scheduler.run_cycle().await;

    assert_eq!(first.outcome().await, CommandOutcome::Applied);
    assert_eq!(second.outcome().await, CommandOutcome::Applied);

    let writes: Vec<MockCall> = mock.calls().into_iter().filter(MockCall::is_write).collect();
    assert_eq!(
        writes,
        vec![
            MockCall::WriteRegister {
                address: 300,
                value: 1000
            },
            MockCall::WriteRegister {
                address: 300,
                value: 2000
            },
        ]
    );
    assert_eq!(handle.get_status().snapshot.number("pump1_duty"), Some(20.0));
}

#[tokio::test]
async fn test_unknown_register_never_reaches_transport() {
    let (handle, _scheduler, mock) = mock_engine(EngineConfig::default());
    let outcome = handle.submit_command("pump9_duty", Value::Number(10.0)).await;
    assert!(matches!(outcome, CommandOutcome::Rejected(ref reason) if reason.contains("pump9_duty")));
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_out_of_range_and_read_only_writes_rejected() {
    let (handle, mut scheduler, mock) = mock_engine(EngineConfig::default());
    let too_high = handle.enqueue("pump1_duty", Value::Number(120.0)).unwrap();
    let read_only = handle.enqueue("supply_temp", Value::Number(20.0)).unwrap();
    scheduler.run_cycle().await;

    assert!(matches!(too_high.outcome().await, CommandOutcome::Rejected(_)));
    assert!(matches!(read_only.outcome().await, CommandOutcome::Rejected(_)));
    assert!(!mock.calls().iter().any(MockCall::is_write));
}

#[tokio::test]
async fn test_two_word_write_honours_byte_order() {
    let config = EngineConfig {
        byte_order: ByteOrder::Cdab,
        ..EngineConfig::default()
    };
    let (handle, mut scheduler, mock) = mock_engine(config);
    // -1000.0 rpm at 0.1 scale is raw -10000 = 0xFFFF_D8F0
    let command = handle.enqueue("fan_setpoint", Value::Number(-1000.0)).unwrap();
    scheduler.run_cycle().await;

    assert_eq!(command.outcome().await, CommandOutcome::Applied);
    assert!(mock.calls().contains(&MockCall::WriteRegisters {
        start: 310,
        values: vec![0xD8F0, 0xFFFF]
    }));
    assert_eq!(handle.get_status().snapshot.number("fan_setpoint"), Some(-1000.0));
}

#[tokio::test]
async fn test_written_register_read_back_despite_cadence() {
    let (handle, mut scheduler, mock) = mock_engine(EngineConfig::default());
    scheduler.run_cycle().await;
    assert_eq!(handle.get_status().snapshot.number("pump_pwm_amplitude"), Some(0.0));

    // Cycle 1 would skip a poll_every = 10 register
    let command = handle.enqueue("pump_pwm_amplitude", Value::Number(3.3)).unwrap();
    mock.clear_calls();
    scheduler.run_cycle().await;
    assert_eq!(command.outcome().await, CommandOutcome::Applied);
    assert!(mock.calls().contains(&MockCall::ReadRegisters { start: 320, count: 1 }));
    assert_eq!(handle.get_status().snapshot.number("pump_pwm_amplitude"), Some(3.3));

    // And skipped again afterwards
    mock.clear_calls();
    scheduler.run_cycle().await;
    assert!(!mock.calls().contains(&MockCall::ReadRegisters { start: 320, count: 1 }));
}

#[tokio::test]
async fn test_slow_subscriber_sees_latest_state() {
    let (handle, mut scheduler, mock) = mock_engine(EngineConfig::default());
    let mut updates = Box::pin(handle.stream_status());

    for raw in [200, 210, 220, 230] {
        mock.set_register(100, raw);
        scheduler.run_cycle().await;
    }

    let latest = updates.next().await.unwrap();
    assert_eq!(latest.snapshot.number("supply_temp"), Some(23.0));
    assert_eq!(latest.snapshot.cycle, 3);
    let nothing = tokio::time::timeout(Duration::from_millis(50), updates.next()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_readers_do_not_block_on_slow_link() {
    let (handle, scheduler, mock) = mock_engine(EngineConfig::default());
    mock.set_latency(Duration::from_millis(200));
    let shutdown = CancellationToken::new();
    let poll = tokio::spawn(scheduler.run(shutdown.clone()));

    // The poll loop is mid-exchange; reads still return at once
    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = std::time::Instant::now();
    let _ = handle.get_status();
    assert!(started.elapsed() < Duration::from_millis(50));

    shutdown.cancel();
    poll.await.unwrap();
}

#[tokio::test]
async fn test_engine_over_framed_tcp_link() {
    let slave = FakeSlave::new(Framing::Tcp);
    slave.set_register(100, 4250);
    slave.set_register(200, 4000);
    let link: Arc<dyn Transport> = Arc::new(ModbusLink::new(slave.clone(), UNIT_ID, common::timings()));

    let shutdown = CancellationToken::new();
    let (handle, poll) = engine::spawn(
        Arc::new(test_map()),
        link,
        EngineConfig::default(),
        shutdown.clone(),
    );

    let outcome = handle.submit_command("pump1_run", Value::Bool(true)).await;
    assert_eq!(outcome, CommandOutcome::Applied);
    assert_eq!(slave.coil(784), Some(true));

    // The read-back lands in the publication that follows the write
    let mut updates = Box::pin(handle.stream_status());
    let mut status = handle.get_status();
    while status.snapshot.value("pump1_run") != Some(Value::Bool(true)) {
        status = tokio::time::timeout(Duration::from_secs(3), updates.next())
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(status.snapshot.number("supply_temp"), Some(425.0));
    assert_eq!(status.snapshot.number("inlet_pressure"), Some(4.0));

    shutdown.cancel();
    poll.await.unwrap();
    assert_eq!(slave.connects(), 1);
}
