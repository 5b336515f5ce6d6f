use libsplice::host::ModuleSource;
use libsplice::{AbortCause, SimHost, UpdateStatus, REGISTRY};
use serde::Serialize;

use crate::scenario::{Scenario, Step};

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    index: usize,
    op: &'static str,
    success: bool,
    outcome: String,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub scenario: String,
    pub total_steps: usize,
    pub passed: usize,
    pub failed: usize,
    pub execution_time_ms: u64,
    pub steps: Vec<StepResult>,
    /// Final status of every update still registered
    pub updates: Vec<UpdateStatus>,
}

/// Drives one scenario's steps against its simulated host, through the
/// process-wide registry
pub struct ScenarioRunner<'s> {
    scenario: &'s Scenario,
    host: SimHost,
    results: Vec<StepResult>,
}

fn outcome(result: &libsplice::Result<()>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(err) => err.as_str().to_string(),
    }
}

impl<'s> ScenarioRunner<'s> {
    pub fn new(scenario: &'s Scenario, host: SimHost) -> Self {
        REGISTRY.lock().set_config(scenario.config.clone());
        Self {
            scenario,
            host,
            results: Vec::new(),
        }
    }

    pub fn run(&mut self) {
        let scenario = self.scenario;
        for (index, step) in scenario.steps.iter().enumerate() {
            self.run_step(index, step);
        }
    }

    fn run_step(&mut self, index: usize, step: &Step) {
        log::info!("Step {}: {}", index, step.op());
        println!("Step {}: {}", index, step.op());

        let step_start = std::time::Instant::now();
        let (outcome, expected) = match self.execute(step) {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("Step {} ({}) FAILED: {}", index, step.op(), e);
                println!("  ✗ FAILED: {}", e);
                self.results.push(StepResult {
                    index,
                    op: step.op(),
                    success: false,
                    outcome: "error".to_string(),
                    error: Some(e.to_string()),
                });
                return;
            }
        };

        let duration = step_start.elapsed();
        let success = outcome == expected;
        if success {
            log::info!("Step {} ({}) -> {} in {:?}", index, step.op(), outcome, duration);
            println!("  ✓ {}", outcome);
        } else {
            log::error!(
                "Step {} ({}) -> {}, expected {}",
                index,
                step.op(),
                outcome,
                expected
            );
            println!("  ✗ got {}, expected {}", outcome, expected);
        }

        self.results.push(StepResult {
            index,
            op: step.op(),
            success,
            error: (!success).then(|| format!("expected {}", expected)),
            outcome,
        });
    }

    /// Returns the step's outcome and the outcome it was expected to have
    fn execute(&mut self, step: &Step) -> anyhow::Result<(String, String)> {
        let ok = || "ok".to_string();
        let pair = match step {
            Step::Register { change } => {
                let change = self.scenario.change(change)?.clone();
                (outcome(&REGISTRY.lock().register_change(change)), ok())
            }
            Step::Unregister { kid, change } => {
                (outcome(&REGISTRY.lock().unregister_change(kid, change)), ok())
            }
            Step::Apply { kid, expect } => {
                let result = REGISTRY.lock().apply(kid, &self.host);
                self.print_conflicts(kid, &result);
                (outcome(&result), expect.clone())
            }
            Step::Reverse { kid, expect } => {
                let result = REGISTRY.lock().reverse(kid, &self.host);
                self.print_conflicts(kid, &result);
                (outcome(&result), expect.clone())
            }
            Step::Status { kid } => {
                let status = REGISTRY
                    .lock()
                    .status(kid)
                    .ok_or_else(|| anyhow::anyhow!("no update {}", kid))?;
                println!("{}", serde_json::to_string_pretty(&status)?);
                (ok(), ok())
            }
            Step::SetDebug { kid, level } => {
                (outcome(&REGISTRY.lock().set_debug(kid, *level)), ok())
            }
            Step::SetTasks { tasks } => {
                self.host.set_tasks(tasks.clone());
                (ok(), ok())
            }
            Step::HoldModule { module } => {
                if !self.host.hold_module(module) {
                    anyhow::bail!("module {} is not loaded", module);
                }
                (ok(), ok())
            }
            Step::ReleaseModule { module } => {
                self.host.module_put(module);
                (ok(), ok())
            }
        };
        Ok(pair)
    }

    fn print_conflicts(&self, kid: &str, result: &libsplice::Result<()>) {
        if !matches!(
            result,
            Err(AbortCause::CodeBusy | AbortCause::UnexpectedRunningTask)
        ) {
            return;
        }
        let status = REGISTRY.lock().status(kid);
        if let Some(status) = status {
            for line in &status.conflicts {
                log::warn!("conflict: {}", line);
                println!("    {}", line);
            }
        }
    }

    pub fn generate_report(&self, start_time: std::time::Instant) -> RunReport {
        let passed = self.results.iter().filter(|r| r.success).count();
        let failed = self.results.len() - passed;

        RunReport {
            scenario: self.scenario.name.clone(),
            total_steps: self.results.len(),
            passed,
            failed,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
            steps: self.results.clone(),
            updates: {
                let registry = REGISTRY.lock();
                registry
                    .kids()
                    .iter()
                    .filter_map(|kid| registry.status(kid))
                    .collect()
            },
        }
    }
}
