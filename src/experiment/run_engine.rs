//! Plan runner: configure, hold, sample, stop.
//!
//! The runner walks the plan's steps strictly in order. For each step it
//! configures the instruments, then samples once per tick until the hold
//! elapses or a safety condition fires:
//!
//! ```text
//! tick: max_hours? ─> DMM + PSU current ─> vmax / vmin_abort ─fire─> stop
//!       ─> scope (once per step) ─> sensor ─> maxtemp / slope / negdv ─fire─> stop
//!       ─> record, status line, sleep 1/sample_rate_hz
//!
//! stop: output off; condition aborts also emit the tick's record as measured
//! ```
//!
//! Every instrument call is awaited before the next one starts; nothing is
//! spawned. The sleep between ticks is the nominal interval regardless of how
//! long the tick's I/O took.
//!
//! Errors from the supply, meter or scope escape [`PlanRunner::run`] after a
//! best-effort output-off. Sensor errors never do: the tick records a degraded
//! reading instead.

use super::plan::{Plan, Step};
use super::state::{RunOutcome, RunState};
use crate::data::{OutputRecord, RecordSink};
use crate::hardware::capabilities::{
    ChannelSetup, HumiditySensor, Multimeter, Oscilloscope, PowerSupply, SensorReading,
};
use crate::safety::{AbortReason, SafetyMonitor, StepGates};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Instruments available to a run. Absent ones leave their columns empty.
#[derive(Clone, Default)]
pub struct RunContext {
    /// Power supply.
    pub psu: Option<Arc<dyn PowerSupply>>,
    /// Multimeter.
    pub dmm: Option<Arc<dyn Multimeter>>,
    /// Oscilloscope.
    pub scope: Option<Arc<dyn Oscilloscope>>,
    /// Temperature/humidity sensor.
    pub sensor: Option<Arc<dyn HumiditySensor>>,
}

impl RunContext {
    /// Context with no instruments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a power supply.
    pub fn with_psu(mut self, psu: Arc<dyn PowerSupply>) -> Self {
        self.psu = Some(psu);
        self
    }

    /// Attach a multimeter.
    pub fn with_dmm(mut self, dmm: Arc<dyn Multimeter>) -> Self {
        self.dmm = Some(dmm);
        self
    }

    /// Attach an oscilloscope.
    pub fn with_scope(mut self, scope: Arc<dyn Oscilloscope>) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Attach a sensor.
    pub fn with_sensor(mut self, sensor: Arc<dyn HumiditySensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }
}

/// Executes one plan against one set of instruments.
pub struct PlanRunner {
    plan: Plan,
    ctx: RunContext,
    monitor: SafetyMonitor,
    state: RunState,
    ticks: usize,
    /// Channel to switch off if the run stops.
    active_channel: Option<String>,
    last_status: Option<Instant>,
}

impl PlanRunner {
    /// Runner for `plan`. The plan is assumed validated.
    pub fn new(plan: Plan, ctx: RunContext) -> Self {
        let monitor = SafetyMonitor::new(plan.safety.clone());
        Self {
            plan,
            ctx,
            monitor,
            state: RunState::Idle,
            ticks: 0,
            active_channel: None,
            last_status: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Safety monitor, including its windows.
    pub fn monitor(&self) -> &SafetyMonitor {
        &self.monitor
    }

    /// Records emitted so far.
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    /// Execute the plan, appending one record per tick to `sink`.
    ///
    /// The sink is not finished here; the caller owns it.
    pub async fn run(&mut self, sink: &mut dyn RecordSink) -> Result<RunOutcome> {
        if self.plan.safety.negdv_unreachable() {
            warn!(
                window_s = self.plan.safety.negdv.window_s,
                require_s = self.plan.safety.negdv.require_s,
                "negdv window is shorter than require_s; negdv can never fire"
            );
        }
        info!(
            steps = self.plan.steps.len(),
            sample_rate_hz = self.plan.sample_rate_hz,
            nominal_s = self.plan.nominal_duration().as_secs_f64(),
            "run starting"
        );

        match self.run_steps(sink).await {
            Ok(outcome) => {
                self.state = match &outcome {
                    RunOutcome::Completed { .. } => RunState::Completed,
                    RunOutcome::Aborted { reason, .. } => RunState::Aborted(reason.clone()),
                };
                info!(ticks = outcome.ticks(), state = %self.state, "run finished");
                Ok(outcome)
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "run failed; switching output off");
                self.shutdown().await;
                self.state = RunState::Failed(format!("{:#}", e));
                Err(e)
            }
        }
    }

    async fn run_steps(&mut self, sink: &mut dyn RecordSink) -> Result<RunOutcome> {
        let plan_start = Instant::now();
        let interval = self.plan.sample_interval();
        let steps = self.plan.steps.clone();

        for (idx, step) in steps.iter().enumerate() {
            self.state = RunState::Configuring(idx);
            info!(
                step = idx,
                ch = %step.psu.ch,
                voltage = ?step.psu.voltage,
                on = step.psu.on,
                "configuring step"
            );
            self.configure(step)
                .await
                .with_context(|| format!("configuring step {}", idx))?;

            let hold = self.plan.hold_for(step);
            let step_start = Instant::now();
            // None: the hold outlasts the monotonic clock, so only an abort ends it.
            let step_end = step_start.checked_add(hold);
            if !step.accumulate_window {
                self.monitor.clear_voltage();
            }
            let gates = StepGates {
                vmin: step.enable_vmin_abort && step.psu.on,
                negdv: step.terminate_on_negdv,
            };
            let mut scope_reading: Option<(f64, f64)> = None;

            self.state = RunState::Sampling(idx);
            while step_end.map_or(true, |end| Instant::now() < end) {
                if let Some(reason) = self.monitor.check_elapsed(plan_start.elapsed()) {
                    self.stop(idx, &reason).await;
                    return Ok(self.aborted(idx, reason));
                }

                let ch = step.psu.ch.as_str();
                let v_meas = match &self.ctx.dmm {
                    Some(dmm) => Some(dmm.read().await.context("multimeter read")?),
                    None => None,
                };
                let i_meas = match &self.ctx.psu {
                    Some(psu) => Some(
                        psu.measure_current(ch)
                            .await
                            .with_context(|| format!("supply current readback on {}", ch))?,
                    ),
                    None => None,
                };

                let t_s = plan_start.elapsed().as_secs_f64();
                let mut record = OutputRecord {
                    t_s,
                    v_set: step.psu.voltage,
                    i_set: step.psu.current,
                    v_meas,
                    i_meas,
                    ..Default::default()
                };

                // Voltage limits go first, before any scope or sensor I/O can
                // fail or stall.
                if let Some(reason) = self.monitor.observe_voltage(t_s, v_meas, gates) {
                    self.stop(idx, &reason).await;
                    self.emit(sink, &record).await?;
                    return Ok(self.aborted(idx, reason));
                }

                if let (Some(cfg), Some(scope)) = (&step.scope, &self.ctx.scope) {
                    let settled = step_start.elapsed().as_secs_f64() >= cfg.delay_s;
                    if scope_reading.is_none() && settled {
                        let vpp = scope
                            .measure_vpp(&cfg.channel)
                            .await
                            .context("scope Vpp measurement")?;
                        let vrms = scope
                            .measure_vrms(&cfg.channel)
                            .await
                            .context("scope Vrms measurement")?;
                        scope_reading = Some((vpp, vrms));
                        if let Err(e) = scope.run().await {
                            debug!(error = %e, "scope re-arm failed");
                        }
                    }
                }

                let reading = self.read_sensor().await;
                record.scope_vpp = scope_reading.map(|(vpp, _)| vpp);
                record.scope_vrms = scope_reading.map(|(_, vrms)| vrms);
                let record = record.with_sensor(reading.as_ref());

                let temp_c = reading.as_ref().and_then(|r| r.temp_c);
                if let Some(reason) = self.monitor.observe_temperature(t_s, temp_c, gates) {
                    self.stop(idx, &reason).await;
                    self.emit(sink, &record).await?;
                    return Ok(self.aborted(idx, reason));
                }

                self.emit(sink, &record).await?;
                self.status_line(idx, &record);
                sleep(interval).await;
            }
            debug!(step = idx, ticks = self.ticks, "hold elapsed");
        }

        Ok(RunOutcome::Completed { ticks: self.ticks })
    }

    async fn configure(&mut self, step: &Step) -> Result<()> {
        let ch = step.psu.ch.as_str();
        if let Some(psu) = &self.ctx.psu {
            self.active_channel = Some(ch.to_string());
            if let Some(amps) = step.psu.current {
                psu.set_current(ch, amps).await?;
            }
            if let Some(volts) = step.psu.voltage {
                psu.set_voltage(ch, volts).await?;
            }
            if step.psu.on {
                psu.output_on(ch).await?;
            } else {
                psu.output_off(ch).await?;
            }
        }

        if let Some(dmm) = &self.ctx.dmm {
            dmm.set_function(&step.dmm.function, step.dmm.range).await?;
        }

        if let (Some(cfg), Some(scope)) = (&step.scope, &self.ctx.scope) {
            let setup = ChannelSetup {
                scale: cfg.scale,
                probe: cfg.probe,
                ..ChannelSetup::new(cfg.channel.clone())
            };
            scope.set_channel(&setup).await?;
            scope.set_timebase(cfg.tdiv, cfg.points).await?;
            scope
                .set_trigger_edge(&cfg.channel, cfg.trig_level, cfg.trig_slope)
                .await?;
        }
        Ok(())
    }

    async fn read_sensor(&self) -> Option<SensorReading> {
        let sensor = self.ctx.sensor.as_ref()?;
        match sensor.read().await {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!(error = %e, "sensor read failed; recording degraded reading");
                Some(SensorReading::degraded())
            }
        }
    }

    async fn stop(&self, step: usize, reason: &AbortReason) {
        warn!(step, kind = reason.kind(), "{}; turning off and aborting", reason);
        self.shutdown().await;
    }

    fn aborted(&self, step: usize, reason: AbortReason) -> RunOutcome {
        RunOutcome::Aborted {
            reason,
            step,
            ticks: self.ticks,
        }
    }

    /// Best-effort output-off on the active channel. Not retried.
    async fn shutdown(&self) {
        let (Some(psu), Some(ch)) = (&self.ctx.psu, &self.active_channel) else {
            return;
        };
        match psu.output_off(ch).await {
            Ok(()) => info!(ch = %ch, "output off"),
            Err(e) => error!(ch = %ch, error = %e, "output off failed; check the supply"),
        }
    }

    async fn emit(&mut self, sink: &mut dyn RecordSink, record: &OutputRecord) -> Result<()> {
        sink.append(record).await.context("writing output record")?;
        self.ticks += 1;
        Ok(())
    }

    fn status_line(&mut self, step: usize, record: &OutputRecord) {
        let Some(every) = self.plan.status_interval() else {
            return;
        };
        let now = Instant::now();
        if self.last_status.map_or(true, |last| now - last >= every) {
            info!(
                "t={:6.1}s step={} vset={:?} v={:?} i={:?} temp={:?}",
                record.t_s, step, record.v_set, record.v_meas, record.i_meas, record.temp_c
            );
            self.last_status = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemorySink;
    use crate::experiment::plan::{PsuStep, ScopeStep};
    use crate::hardware::mock::{MockMultimeter, MockOscilloscope, MockPowerSupply, MockSensor};
    use crate::safety::SafetyConfig;

    fn one_step_plan(hold_s: f64, rate: f64) -> Plan {
        Plan {
            steps: vec![Step {
                psu: PsuStep {
                    voltage: Some(5.0),
                    current: Some(1.0),
                    ..Default::default()
                },
                ..Default::default()
            }],
            sample_rate_hz: rate,
            hold_s,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_after_hold() {
        let psu = Arc::new(MockPowerSupply::new());
        let dmm = Arc::new(MockMultimeter::constant(5.0));
        let ctx = RunContext::new().with_psu(psu.clone()).with_dmm(dmm.clone());
        let mut runner = PlanRunner::new(one_step_plan(2.0, 5.0), ctx);
        let mut sink = MemorySink::new();

        let outcome = runner.run(&mut sink).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { ticks: 10 });
        assert_eq!(runner.state(), &RunState::Completed);

        let rows = sink.records();
        assert_eq!(rows.len(), 10);
        assert!(rows.iter().all(|r| r.v_meas == Some(5.0) && r.v_set == Some(5.0)));
        assert!(rows.iter().all(|r| r.i_meas == Some(1.0)));
        assert!(rows.iter().all(|r| r.temp_c.is_none() && r.ens_ok.is_none()));
        assert!(psu.is_on("CH1").await);
        assert_eq!(dmm.function().await, Some(("VOLT:DC".to_string(), None)));

        let commands = psu.commands().await;
        assert_eq!(&commands[..3], &["CH1:CURR 1", "CH1:VOLT 5", "OUTP CH1,ON"]);
    }

    #[tokio::test(start_paused = true)]
    async fn vmax_abort_turns_output_off_and_records_final_row() {
        let psu = Arc::new(MockPowerSupply::new());
        let dmm = Arc::new(MockMultimeter::scripted(vec![5.0, 5.0, 18.0], 5.0));
        let ctx = RunContext::new().with_psu(psu.clone()).with_dmm(dmm);
        let mut runner = PlanRunner::new(one_step_plan(2.0, 5.0), ctx);
        let mut sink = MemorySink::new();

        let outcome = runner.run(&mut sink).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Aborted {
                reason: AbortReason::OverVoltage { .. },
                step: 0,
                ticks: 3
            }
        ));
        assert_eq!(sink.records().last().unwrap().v_meas, Some(18.0));
        assert_eq!(psu.commands().await.last().unwrap(), "OUTP CH1,OFF");
        assert!(!psu.is_on("CH1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn vmax_fires_before_scope_and_sensor_io() {
        let psu = Arc::new(MockPowerSupply::new());
        let dmm = Arc::new(MockMultimeter::constant(18.0));
        let scope = Arc::new(MockOscilloscope::failing());
        let sensor = Arc::new(MockSensor::constant(25.0, 40.0));
        let mut plan = one_step_plan(5.0, 1.0);
        plan.steps[0].scope = Some(ScopeStep {
            channel: "C1".into(),
            ..Default::default()
        });
        let ctx = RunContext::new()
            .with_psu(psu.clone())
            .with_dmm(dmm)
            .with_scope(scope.clone())
            .with_sensor(sensor.clone());
        let mut runner = PlanRunner::new(plan, ctx);
        let mut sink = MemorySink::new();

        let outcome = runner.run(&mut sink).await.unwrap();
        assert_eq!(outcome.abort_reason().map(|r| r.kind()), Some("vmax"));
        assert_eq!(outcome.ticks(), 1);
        let rows = sink.records();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].v_meas, Some(18.0));
        assert_eq!(rows[0].scope_vpp, None);
        assert_eq!(rows[0].temp_c, None);

        assert_eq!(sensor.read_count(), 0);
        let calls = scope.calls().await;
        assert!(!calls.iter().any(|c| c.starts_with("measure_")));
        assert!(!psu.is_on("CH1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_limits_saturate_instead_of_panicking() {
        let psu = Arc::new(MockPowerSupply::new());
        // Built directly, so nothing has validated these.
        let mut plan = one_step_plan(1.0e20, 1.0);
        plan.safety.max_hours = 1.0e20;
        plan.status_every_s = 1.0e20;
        plan.steps.push(Step {
            hold_s: Some(2.0),
            ..plan.steps[0].clone()
        });
        plan.steps[0].hold_s = Some(3.0);
        let ctx = RunContext::new().with_psu(psu.clone());
        let mut runner = PlanRunner::new(plan, ctx);
        let mut sink = MemorySink::new();

        let outcome = runner.run(&mut sink).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { ticks: 5 });
        assert_eq!(runner.state(), &RunState::Completed);
        assert!(psu.is_on("CH1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_hold_ends_on_abort() {
        let psu = Arc::new(MockPowerSupply::new());
        let dmm = Arc::new(MockMultimeter::scripted(vec![5.0, 5.0, 5.0, 18.0], 5.0));
        let ctx = RunContext::new().with_psu(psu.clone()).with_dmm(dmm);
        let mut runner = PlanRunner::new(one_step_plan(f64::MAX, 1.0), ctx);
        let mut sink = MemorySink::new();

        let outcome = runner.run(&mut sink).await.unwrap();
        assert_eq!(outcome.abort_reason().map(|r| r.kind()), Some("vmax"));
        assert_eq!(outcome.ticks(), 4);
        assert!(!psu.is_on("CH1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_cap_aborts_without_final_record() {
        let psu = Arc::new(MockPowerSupply::new());
        let mut plan = one_step_plan(10.0, 1.0);
        plan.safety = SafetyConfig {
            max_hours: 2.5 / 3600.0,
            ..Default::default()
        };
        let ctx = RunContext::new().with_psu(psu.clone());
        let mut runner = PlanRunner::new(plan, ctx);
        let mut sink = MemorySink::new();

        let outcome = runner.run(&mut sink).await.unwrap();
        assert_eq!(outcome.abort_reason().map(|r| r.kind()), Some("max_hours"));
        // Ticks at 0, 1 and 2 s; the check at 3 s fires before sampling.
        assert_eq!(sink.records().len(), 3);
        assert_eq!(psu.commands().await.last().unwrap(), "OUTP CH1,OFF");
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_failure_degrades_record() {
        let sensor = Arc::new(MockSensor::scripted(vec![Some(24.0), None], 24.5, 40.0));
        let ctx = RunContext::new().with_sensor(sensor.clone());
        let mut runner = PlanRunner::new(one_step_plan(3.0, 1.0), ctx);
        let mut sink = MemorySink::new();

        runner.run(&mut sink).await.unwrap();
        let rows = sink.records();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].temp_c, Some(24.0));
        assert_eq!(rows[0].ens_ok, Some(true));
        assert_eq!(rows[1].temp_c, None);
        assert_eq!(rows[1].ens_ok, Some(false));
        assert_eq!(rows[2].humidity_pct, Some(40.0));
        assert!(rows.iter().all(|r| r.v_meas.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn temperature_ceiling_aborts() {
        let psu = Arc::new(MockPowerSupply::new());
        let sensor = Arc::new(MockSensor::scripted(vec![Some(30.0), Some(61.0)], 30.0, 40.0));
        let mut plan = one_step_plan(5.0, 1.0);
        plan.safety.maxtemp_c = Some(60.0);
        let ctx = RunContext::new().with_psu(psu.clone()).with_sensor(sensor);
        let mut runner = PlanRunner::new(plan, ctx);
        let mut sink = MemorySink::new();

        let outcome = runner.run(&mut sink).await.unwrap();
        assert_eq!(outcome.abort_reason().map(|r| r.kind()), Some("maxtemp_c"));
        assert_eq!(sink.records().last().unwrap().temp_c, Some(61.0));
        assert!(!psu.is_on("CH1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn vmin_only_on_enabled_step() {
        let psu = Arc::new(MockPowerSupply::new());
        let dmm = Arc::new(MockMultimeter::constant(2.0));
        let mut plan = one_step_plan(2.0, 1.0);
        plan.safety.vmin_abort = Some(3.0);
        let mut second = plan.steps[0].clone();
        second.enable_vmin_abort = true;
        plan.steps.push(second);

        let ctx = RunContext::new().with_psu(psu.clone()).with_dmm(dmm);
        let mut runner = PlanRunner::new(plan, ctx);
        let mut sink = MemorySink::new();

        let outcome = runner.run(&mut sink).await.unwrap();
        match outcome {
            RunOutcome::Aborted { reason, step, ticks } => {
                assert_eq!(reason.kind(), "vmin_abort");
                assert_eq!(step, 1);
                assert_eq!(ticks, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scope_measured_once_per_step_after_delay() {
        let scope = Arc::new(MockOscilloscope::new(3.2, 1.1));
        let mut plan = one_step_plan(4.0, 1.0);
        plan.steps[0].scope = Some(ScopeStep {
            channel: "C2".into(),
            delay_s: 1.5,
            ..Default::default()
        });
        let ctx = RunContext::new().with_scope(scope.clone());
        let mut runner = PlanRunner::new(plan, ctx);
        let mut sink = MemorySink::new();

        runner.run(&mut sink).await.unwrap();
        let rows = sink.records();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].scope_vpp, None);
        assert_eq!(rows[1].scope_vpp, None);
        assert_eq!(rows[2].scope_vpp, Some(3.2));
        assert_eq!(rows[3].scope_vrms, Some(1.1));

        let calls = scope.calls().await;
        assert_eq!(calls.iter().filter(|c| c.starts_with("measure_vpp")).count(), 1);
        assert_eq!(calls.last().map(String::as_str), Some("run"));
        assert!(calls.contains(&"set_trigger_edge C2 0.02 POS".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn instrument_fault_propagates_after_output_off() {
        let psu = Arc::new(MockPowerSupply::new());
        let dmm = Arc::new(
            MockMultimeter::constant(5.0)
                .fail_on_read(2, "no read data")
                .await,
        );
        let ctx = RunContext::new().with_psu(psu.clone()).with_dmm(dmm);
        let mut runner = PlanRunner::new(one_step_plan(5.0, 1.0), ctx);
        let mut sink = MemorySink::new();

        let err = runner.run(&mut sink).await.unwrap_err();
        assert!(format!("{:#}", err).contains("no read data"));
        assert!(matches!(runner.state(), RunState::Failed(_)));
        assert_eq!(sink.records().len(), 1);
        assert_eq!(psu.commands().await.last().unwrap(), "OUTP CH1,OFF");
    }

    #[tokio::test(start_paused = true)]
    async fn negdv_respects_step_window_reset() {
        let psu = Arc::new(MockPowerSupply::new());
        // Falls 10 mV per second.
        let script: Vec<f64> = (0..40).map(|i| 5.0 - 0.01 * i as f64).collect();
        let dmm = Arc::new(MockMultimeter::scripted(script, 4.6));
        let mut plan = one_step_plan(20.0, 1.0);
        plan.safety.negdv.enabled = true;
        plan.safety.negdv.window_s = 60.0;
        plan.safety.negdv.require_s = 10.0;
        plan.safety.negdv.threshold_v = -0.08;
        plan.steps[0].terminate_on_negdv = true;

        let ctx = RunContext::new().with_psu(psu.clone()).with_dmm(dmm);
        let mut runner = PlanRunner::new(plan, ctx);
        let mut sink = MemorySink::new();

        let outcome = runner.run(&mut sink).await.unwrap();
        assert_eq!(outcome.abort_reason().map(|r| r.kind()), Some("negdv"));
        // Tick 10 (t = 10 s) is the first with 10 s coverage and a 0.10 V drop.
        assert_eq!(outcome.ticks(), 11);
        assert!(!psu.is_on("CH1").await);
    }
}
