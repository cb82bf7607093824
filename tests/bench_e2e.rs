//! End-to-end runs over loopback SCPI servers.
//!
//! The supply and meter drivers talk real TCP to the mock state machines, so
//! these tests cover plan parsing, transports, drivers, the runner and the
//! sinks together. They run on the real clock; holds are kept short.

use sigbench::config::BenchConfig;
#[cfg(feature = "storage_csv")]
use sigbench::data::{open_sink, RecordSink};
use sigbench::data::MemorySink;
use sigbench::experiment::{Plan, PlanRunner, RunContext, RunOutcome, RunState};
use sigbench::hardware::mock::{sdm_handler, sdm_handler_with, spd_handler, MockScpiServer};
use sigbench::hardware::target::{open_transport, Target, TransportOptions};
use sigbench::hardware::{Sdm3045x, Spd3303x};
#[cfg(feature = "storage_csv")]
use sigbench::transport::ProtocolLog;
use std::sync::Arc;

struct Bench {
    spd: MockScpiServer,
    sdm: MockScpiServer,
}

impl Bench {
    async fn start(sdm: MockScpiServer) -> Self {
        let spd = MockScpiServer::start(spd_handler()).await.unwrap();
        Self { spd, sdm }
    }

    fn context(&self, options: &TransportOptions<'_>) -> RunContext {
        let spd = Target::Tcp {
            host: self.spd.host(),
            port: self.spd.port(),
        };
        let sdm = Target::Tcp {
            host: self.sdm.host(),
            port: self.sdm.port(),
        };
        RunContext::new()
            .with_psu(Arc::new(Spd3303x::new(open_transport(&spd, "psu", options))))
            .with_dmm(Arc::new(Sdm3045x::new(open_transport(&sdm, "dmm", options))))
    }
}

/// Plain writes are not acknowledged, so give the server a moment to log them.
async fn wait_for_command(server: &MockScpiServer, command: &str) -> Vec<String> {
    for _ in 0..100 {
        let commands = server.commands();
        if commands.iter().any(|c| c == command) {
            return commands;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    server.commands()
}

const TWO_SECOND_PLAN: &str = r#"
sample_rate_hz: 5
steps:
  - psu: { ch: CH1, voltage: 5.0, current: 1.0, on: true }
    dmm: { function: "VOLT:DC" }
    hold_s: 2
"#;

#[tokio::test]
async fn test_full_stack_run_completes() {
    let bench = Bench::start(MockScpiServer::start(sdm_handler(5.0)).await.unwrap()).await;
    let config = BenchConfig::default();
    let options = TransportOptions {
        config: &config,
        tcp_oneshot: false,
        log: None,
    };

    let plan = Plan::from_yaml_str(TWO_SECOND_PLAN).unwrap();
    let mut sink = MemorySink::new();
    let mut runner = PlanRunner::new(plan, bench.context(&options));
    let outcome = runner.run(&mut sink).await.unwrap();

    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(runner.state(), &RunState::Completed);

    // 5 Hz for 2 s: ticks at 0.0, 0.2, ... 1.8 s. Every tick sleeps the full
    // interval after its I/O, so there is never an eleventh; losing the tenth
    // takes over 20 ms of loopback latency per tick.
    let records = sink.records();
    assert!(
        (9..=10).contains(&records.len()),
        "expected 10 records, got {}",
        records.len()
    );
    for record in &records {
        assert_eq!(record.v_set, Some(5.0));
        assert_eq!(record.v_meas, Some(5.0));
        assert_eq!(record.i_meas, Some(1.0));
        assert_eq!(record.temp_c, None);
    }
    assert!(records.windows(2).all(|w| w[0].t_s <= w[1].t_s));

    let commands = bench.spd.commands();
    assert!(commands.contains(&"CH1:VOLT 5".to_string()));
    assert!(commands.contains(&"OUTP CH1,ON".to_string()));
    assert!(!commands.contains(&"OUTP CH1,OFF".to_string()));
    // Persistent sessions: one connection per instrument.
    assert_eq!(bench.spd.connection_count(), 1);
    assert_eq!(bench.sdm.connection_count(), 1);
}

#[tokio::test]
async fn test_overvoltage_switches_supply_off() {
    let meter = MockScpiServer::start(sdm_handler_with(vec![5.0, 5.0, 18.0], 5.0))
        .await
        .unwrap();
    let bench = Bench::start(meter).await;
    let config = BenchConfig::default();
    let options = TransportOptions {
        config: &config,
        tcp_oneshot: false,
        log: None,
    };

    let plan = Plan::from_yaml_str(
        r#"
sample_rate_hz: 10
safety: { vmax: 17.0 }
steps:
  - psu: { voltage: 18.0, current: 0.5 }
    hold_s: 5
"#,
    )
    .unwrap();
    let mut sink = MemorySink::new();
    let mut runner = PlanRunner::new(plan, bench.context(&options));
    let outcome = runner.run(&mut sink).await.unwrap();

    let RunOutcome::Aborted { reason, step, ticks } = outcome else {
        panic!("expected an abort, got {:?}", outcome);
    };
    assert_eq!(reason.kind(), "vmax");
    assert_eq!(step, 0);
    assert_eq!(ticks, 3);

    // The triggering sample is still recorded.
    let records = sink.records();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].v_meas, Some(18.0));

    let commands = wait_for_command(&bench.spd, "OUTP CH1,OFF").await;
    let on = commands.iter().position(|c| c == "OUTP CH1,ON").unwrap();
    let off = commands.iter().rposition(|c| c == "OUTP CH1,OFF").unwrap();
    assert!(off > on);
}

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn test_oneshot_run_writes_csv_and_protocol_log() {
    let bench = Bench::start(MockScpiServer::start(sdm_handler(3.3)).await.unwrap()).await;
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("run.csv");
    let log_path = dir.path().join("scpi.ndjson");

    let config = BenchConfig::default();
    let options = TransportOptions {
        config: &config,
        tcp_oneshot: true,
        log: Some(ProtocolLog::append_to(&log_path).unwrap()),
    };

    let plan = Plan::from_yaml_str(
        r#"
sample_rate_hz: 4
steps:
  - psu: { voltage: 3.3, current: 0.2 }
    hold_s: 0.5
"#,
    )
    .unwrap();
    let mut sink = open_sink(&csv_path).unwrap();
    let mut runner = PlanRunner::new(plan, bench.context(&options));
    let outcome = runner.run(sink.as_mut()).await.unwrap();
    sink.finish().await.unwrap();

    let text = std::fs::read_to_string(&csv_path).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("t_s,v_set,i_set,v_meas,i_meas,scope_vpp,scope_vrms,temp_c,humidity_pct,ens_ok")
    );
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), outcome.ticks());
    assert!(rows.iter().all(|row| row.contains(",3.3,0.2,3.3,0.2,")));

    // One-shot mode: every command is a separate connection.
    for _ in 0..100 {
        if bench.sdm.connection_count() == bench.sdm.command_count() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(bench.sdm.connection_count(), bench.sdm.command_count());

    let log = std::fs::read_to_string(&log_path).unwrap();
    let opens = log.lines().filter(|l| l.contains("\"op\":\"open\"")).count();
    assert_eq!(opens, 2);
    assert!(log.contains("\"role\":\"psu\""));
    assert!(log.contains("\"role\":\"dmm\""));
    assert!(log.contains("READ?"));
}
