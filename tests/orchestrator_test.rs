//! Measurement loop behaviour against the simulated analyzer.

use std::{
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use nrmx_pipeline::{
    config::MeasurementConfig,
    nrmx::{Error, LinkDirection, Measurement, SemStatus},
    orchestrator::{
        CARRIER_SIGNAL, OFFSETS_SIGNAL, Orchestrator, RunControl, RunOutcome,
        carrier_measurements, offsets_measurements,
    },
    sim::{Fault, Journal, Op, SimBehavior, SimDriver},
};

fn config(iterations: usize, direction: LinkDirection) -> MeasurementConfig {
    let mut config = MeasurementConfig {
        iterations,
        timeout: Duration::from_secs(1),
        ..Default::default()
    };
    config.carrier.link_direction = direction;
    config
}

fn fast() -> SimBehavior {
    SimBehavior {
        acquisition_time: Duration::ZERO,
        ..Default::default()
    }
}

fn run(config: MeasurementConfig, behavior: SimBehavior) -> (RunOutcome, Journal) {
    let driver = SimDriver::new(behavior);
    let journal = driver.journal();
    let outcome = Orchestrator::new(config, driver).execute(&RunControl::default());
    (outcome, journal)
}

const DOWNLINK_ONLY: [Op; 4] = [
    Op::GNodeBCategory,
    Op::DownlinkMaskType,
    Op::DeltaFMaximum,
    Op::RatedOutputPower,
];

#[test]
fn test_measurement_sets_per_signal() {
    let (outcome, journal) = run(config(3, LinkDirection::Uplink), fast());
    assert!(outcome.result.is_ok());

    assert!(offsets_measurements().is_disjoint(carrier_measurements()));

    let selections = |signal: &str| -> Vec<Op> {
        journal
            .ops_on(signal)
            .into_iter()
            .filter(|op| matches!(op, Op::SelectMeasurements(_)))
            .collect()
    };
    assert_eq!(
        selections(OFFSETS_SIGNAL),
        vec![Op::SelectMeasurements(offsets_measurements()); 3]
    );
    assert_eq!(
        selections(CARRIER_SIGNAL),
        vec![Op::SelectMeasurements(carrier_measurements()); 3]
    );
}

#[test]
fn test_uplink_takes_uplink_mask_path() {
    let (outcome, journal) = run(config(4, LinkDirection::Uplink), fast());
    assert!(outcome.result.is_ok());

    assert_eq!(journal.count_on(OFFSETS_SIGNAL, Op::UplinkMaskType), 4);
    for op in DOWNLINK_ONLY {
        assert_eq!(journal.count(op), 0, "{:?} must not be called for uplink", op);
    }
}

#[test]
fn test_downlink_takes_downlink_mask_path() {
    let (outcome, journal) = run(config(4, LinkDirection::Downlink), fast());
    assert!(outcome.result.is_ok());

    assert_eq!(journal.count(Op::UplinkMaskType), 0);
    for op in DOWNLINK_ONLY {
        assert_eq!(journal.count_on(OFFSETS_SIGNAL, op), 4, "{:?}", op);
        assert_eq!(journal.count_on(CARRIER_SIGNAL, op), 0, "{:?}", op);
    }
}

#[test]
fn test_sweep_time_and_averaging_on_owning_signal() {
    let (outcome, journal) = run(config(2, LinkDirection::Uplink), fast());
    assert!(outcome.result.is_ok());

    for measurement in [Measurement::Acp, Measurement::Sem] {
        assert_eq!(journal.count_on(OFFSETS_SIGNAL, Op::SweepTime(measurement)), 2);
        assert_eq!(journal.count_on(OFFSETS_SIGNAL, Op::Averaging(measurement)), 2);
    }
    for measurement in [Measurement::Chp, Measurement::Obw] {
        assert_eq!(journal.count_on(CARRIER_SIGNAL, Op::SweepTime(measurement)), 2);
        assert_eq!(journal.count_on(CARRIER_SIGNAL, Op::Averaging(measurement)), 2);
    }
    assert_eq!(journal.count(Op::SweepTime(Measurement::ModAcc)), 0);
    assert_eq!(journal.count_on(CARRIER_SIGNAL, Op::Averaging(Measurement::ModAcc)), 2);
    assert_eq!(journal.count_on(CARRIER_SIGNAL, Op::MeasurementInterval), 2);
}

#[test]
fn test_signals_acquired_once_and_reused() {
    let (outcome, journal) = run(config(5, LinkDirection::Uplink), fast());
    assert!(outcome.result.is_ok());

    assert_eq!(journal.count(Op::OpenSession), 1);
    assert_eq!(journal.count_on(OFFSETS_SIGNAL, Op::SignalConfiguration), 1);
    assert_eq!(journal.count_on(CARRIER_SIGNAL, Op::SignalConfiguration), 1);
    assert_eq!(journal.count(Op::ConfigureFrequencyReference), 5);
    assert_eq!(journal.count_on(OFFSETS_SIGNAL, Op::Commit), 5);
    assert_eq!(journal.count_on(CARRIER_SIGNAL, Op::Commit), 5);
}

#[test]
fn test_offsets_waited_before_its_fetches() {
    let (outcome, journal) = run(config(1, LinkDirection::Uplink), fast());
    assert!(outcome.result.is_ok());

    let ops = journal.ops_on(OFFSETS_SIGNAL);
    let position = |op: Op| ops.iter().position(|o| *o == op).unwrap();
    assert!(position(Op::Initiate) < position(Op::WaitForMeasurementComplete));
    assert!(position(Op::WaitForMeasurementComplete) < position(Op::Fetch(Measurement::Acp)));
    assert!(position(Op::WaitForMeasurementComplete) < position(Op::Fetch(Measurement::Sem)));

    // Carrier acquisition completes before offsets is started.
    let calls = journal.calls();
    let index = |signal: &str, op: Op| {
        calls
            .iter()
            .position(|c| c.signal.as_deref() == Some(signal) && c.op == op)
            .unwrap()
    };
    assert!(
        index(CARRIER_SIGNAL, Op::WaitForMeasurementComplete) < index(OFFSETS_SIGNAL, Op::Initiate)
    );
}

#[test]
fn test_timing_series_matches_iterations() {
    let (outcome, _journal) = run(config(100, LinkDirection::Uplink), fast());
    let summary = outcome.result.unwrap();

    assert_eq!(summary.timings.len(), 100);
    let total = summary.timings.total();
    let expected = Duration::from_nanos((total.as_nanos() / 100) as u64);
    assert_eq!(summary.timings.mean(), Some(expected));
}

#[test]
fn test_single_uplink_iteration() {
    let (outcome, journal) = run(config(1, LinkDirection::Uplink), fast());
    let summary = outcome.result.unwrap();

    assert_eq!(summary.timings.len(), 1);
    assert_eq!(journal.count(Op::UplinkMaskType), 1);
    for op in DOWNLINK_ONLY {
        assert_eq!(journal.count(op), 0);
    }
    assert_eq!(journal.count(Op::Close), 1);
    assert_eq!(journal.count(Op::Dispose), 2);

    // Teardown happens after the last fetch.
    let calls = journal.calls();
    let last_fetch = calls
        .iter()
        .rposition(|c| matches!(c.op, Op::Fetch(_)))
        .unwrap();
    let first_dispose = calls.iter().position(|c| c.op == Op::Dispose).unwrap();
    assert!(last_fetch < first_dispose);
    assert_eq!(calls.last().unwrap().op, Op::Close);
}

#[test]
fn test_results_hold_last_snapshot() {
    let (outcome, _journal) = run(config(2, LinkDirection::Uplink), fast());
    let results = outcome.result.unwrap().results;

    assert_eq!(results.acp_offsets.len(), 2);
    assert_eq!(results.sem_lower_offsets.len(), 4);
    assert_eq!(results.sem_upper_offsets.len(), 4);
    assert_eq!(results.sem_status, SemStatus::Pass);
    assert!(results.obw.start_frequency < results.obw.stop_frequency);
    assert!(results.modacc.composite_rms_evm_mean > 0.0);
}

#[test]
fn test_teardown_once_whatever_fails() {
    // (op, occurrence, offsets acquired, carrier acquired, session opened)
    let cases = [
        (Op::OpenSession, 1, false, false, false),
        (Op::ConfigureFrequencyReference, 2, true, true, true),
        (Op::SignalConfiguration, 1, false, false, true),
        (Op::SignalConfiguration, 2, true, false, true),
        (Op::ConfigureRf, 3, true, true, true),
        (Op::Commit, 4, true, true, true),
        (Op::Initiate, 1, true, true, true),
        (Op::WaitForMeasurementComplete, 2, true, true, true),
        (Op::Fetch(Measurement::Acp), 1, true, true, true),
        (Op::Fetch(Measurement::Sem), 5, true, true, true),
    ];

    for (op, occurrence, offsets, carrier, session) in cases {
        let behavior = SimBehavior {
            faults: vec![Fault { op, occurrence }],
            ..fast()
        };
        let (outcome, journal) = run(config(3, LinkDirection::Uplink), behavior);

        assert!(
            matches!(outcome.result, Err(Error::InstrumentFault(_))),
            "{:?} #{}",
            op,
            occurrence
        );
        assert!(outcome.teardown_errors.is_empty());
        assert_eq!(journal.count_on(OFFSETS_SIGNAL, Op::Dispose), offsets as usize, "{:?}", op);
        assert_eq!(journal.count_on(CARRIER_SIGNAL, Op::Dispose), carrier as usize, "{:?}", op);
        assert_eq!(journal.count(Op::Close), session as usize, "{:?}", op);
    }
}

#[test]
fn test_teardown_errors_are_reported_not_raised() {
    let behavior = SimBehavior {
        faults: vec![
            Fault {
                op: Op::Dispose,
                occurrence: 1,
            },
            Fault {
                op: Op::Close,
                occurrence: 1,
            },
        ],
        ..fast()
    };
    let (outcome, journal) = run(config(2, LinkDirection::Uplink), behavior);

    assert!(outcome.result.is_ok());
    assert_eq!(outcome.teardown_errors.len(), 2);
    // The carrier is still released after the offsets dispose failed.
    assert_eq!(journal.count(Op::Dispose), 2);
    assert_eq!(journal.count(Op::Close), 1);
}

#[test]
fn test_never_completing_wait_is_bounded() {
    let mut config = config(100, LinkDirection::Uplink);
    config.timeout = Duration::from_millis(50);
    let behavior = SimBehavior {
        hang_acquisitions: true,
        ..Default::default()
    };

    let start = Instant::now();
    let (outcome, journal) = run(config, behavior);
    let elapsed = start.elapsed();

    assert!(matches!(outcome.result, Err(Error::Timeout { .. })));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(journal.count(Op::WaitForMeasurementComplete), 1);
    assert_eq!(journal.count(Op::Close), 1);
}

#[test]
fn test_unknown_resource_needs_no_teardown() {
    let behavior = SimBehavior {
        resources: Some(vec!["BCN_01".to_string()]),
        ..fast()
    };
    let (outcome, journal) = run(config(3, LinkDirection::Uplink), behavior);

    assert!(matches!(outcome.result, Err(Error::ResourceNotFound(_))));
    assert!(outcome.teardown_errors.is_empty());
    assert_eq!(journal.count(Op::Close), 0);
    assert_eq!(journal.count(Op::Dispose), 0);
}

#[test]
fn test_stop_request_aborts_before_next_iteration() {
    let driver = SimDriver::new(fast());
    let journal = driver.journal();
    let control = RunControl::default();
    control.stop.store(true, Ordering::Relaxed);

    let outcome = Orchestrator::new(config(10, LinkDirection::Uplink), driver).execute(&control);

    assert!(matches!(outcome.result, Err(Error::Interrupted)));
    assert_eq!(control.completed.load(Ordering::Relaxed), 0);
    assert_eq!(journal.count(Op::Initiate), 0);
    assert_eq!(journal.count(Op::Close), 1);
}

#[test]
fn test_progress_counts_completed_cycles() {
    let driver = SimDriver::new(fast());
    let control = RunControl::default();
    let outcome = Orchestrator::new(config(7, LinkDirection::Uplink), driver).execute(&control);

    assert!(outcome.result.is_ok());
    assert_eq!(control.completed.load(Ordering::Relaxed), 7);
}

#[test]
fn test_drop_releases_handles() {
    let driver = SimDriver::new(SimBehavior {
        faults: vec![Fault {
            op: Op::Fetch(Measurement::Sem),
            occurrence: 1,
        }],
        ..fast()
    });
    let journal = driver.journal();

    let mut orchestrator = Orchestrator::new(config(3, LinkDirection::Uplink), driver);
    assert!(orchestrator.run(&RunControl::default()).is_err());
    assert_eq!(journal.count(Op::Close), 0);
    drop(orchestrator);

    assert_eq!(journal.count_on(OFFSETS_SIGNAL, Op::Dispose), 1);
    assert_eq!(journal.count_on(CARRIER_SIGNAL, Op::Dispose), 1);
    assert_eq!(journal.count(Op::Close), 1);
}

#[test]
fn test_invalid_config_rejected_before_opening_session() {
    let (outcome, journal) = run(config(0, LinkDirection::Uplink), fast());

    match outcome.result {
        Err(Error::ConfigurationRejected(reason)) => assert!(reason.contains("iterations")),
        other => panic!("expected ConfigurationRejected, got {:?}", other),
    }
    assert!(outcome.teardown_errors.is_empty());
    assert_eq!(journal.count(Op::OpenSession), 0);

    let mut config = config(3, LinkDirection::Uplink);
    config.timeout = Duration::ZERO;
    let (outcome, journal) = run(config, fast());
    assert!(matches!(outcome.result, Err(Error::ConfigurationRejected(_))));
    assert_eq!(journal.count(Op::OpenSession), 0);
}

#[test]
fn test_long_run_without_call_log() {
    let behavior = SimBehavior {
        record_calls: false,
        ..fast()
    };
    let (outcome, journal) = run(config(2000, LinkDirection::Uplink), behavior);

    assert_eq!(outcome.result.unwrap().timings.len(), 2000);
    assert!(journal.calls().is_empty());
    assert_eq!(journal.count(Op::Initiate), 4000);
    assert_eq!(journal.count(Op::Commit), 4000);
    assert_eq!(journal.count(Op::Dispose), 2);
    assert_eq!(journal.count(Op::Close), 1);
}
