//! JSON exporter for run replay.
//!
//! Exports one frame per completed tick: barrier bookkeeping plus the
//! vehicle states accepted in that tick.

use crate::runner::{ScenarioResult, VehicleSample};
use ecloud_core::{RunDiagnostics, SessionIndex, TickId, TickReport};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// A single tick of run data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickFrame {
    pub tick_id: TickId,

    /// Virtual time at the end of the tick in seconds
    pub time_sec: f64,

    /// Sessions that answered
    pub replied: Vec<SessionIndex>,

    /// Sessions that left the barrier in this tick
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub completed: Vec<SessionIndex>,

    /// Sessions excused as unresponsive in this tick
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excused: Vec<SessionIndex>,

    pub active_remaining: usize,

    /// Wall time from STEP broadcast to barrier release
    pub elapsed_ms: f64,

    pub vehicles: Vec<VehiclePosition>,
}

/// Position of a vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub session_index: SessionIndex,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub speed: f64,
}

impl VehiclePosition {
    pub fn new(session_index: SessionIndex, pos: Vector3<f64>, speed: f64) -> Self {
        Self {
            session_index,
            x: pos.x,
            y: pos.y,
            z: pos.z,
            speed,
        }
    }
}

/// Complete run export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<TickFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<RunDiagnostics>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
            diagnostics: None,
        }
    }

    /// Builds an export from a finished run with world tick `world_tick`.
    pub fn from_result(result: &ScenarioResult, world_tick: Duration) -> Self {
        let mut export = Self::new(result.scenario.name(), result.seed);
        for (n, report) in result.reports.iter().enumerate() {
            let time_sec = world_tick.as_secs_f64() * (n + 1) as f64;
            export.add_report(report, time_sec, &result.samples);
        }
        export.finalize(
            result.passed,
            result.failure_reason.clone(),
            result.diagnostics.clone(),
        );
        export
    }

    /// Adds a frame for `report`, picking its vehicle states out of `samples`.
    pub fn add_report(&mut self, report: &TickReport, time_sec: f64, samples: &[VehicleSample]) {
        let mut vehicles: Vec<VehiclePosition> = samples
            .iter()
            .filter(|s| s.tick_id == report.tick_id)
            .map(|s| VehiclePosition::new(s.session_index, s.state.position, s.state.speed))
            .collect();
        vehicles.sort_by_key(|v| v.session_index);

        self.add_frame(TickFrame {
            tick_id: report.tick_id,
            time_sec,
            replied: report.replied.clone(),
            completed: report.completed.clone(),
            excused: report.excused.clone(),
            active_remaining: report.active_remaining,
            elapsed_ms: report.elapsed_ms,
            vehicles,
        });
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: TickFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(
        &mut self,
        passed: bool,
        failure_reason: Option<String>,
        diagnostics: Option<RunDiagnostics>,
    ) {
        self.passed = passed;
        self.failure_reason = failure_reason;
        self.diagnostics = diagnostics;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::VehicleState;
    use ecloud_core::Command;

    fn report(tick_id: TickId, replied: Vec<SessionIndex>) -> TickReport {
        TickReport {
            tick_id,
            command: Command::Step,
            replied,
            completed: Vec::new(),
            excused: Vec::new(),
            active_remaining: 2,
            elapsed_ms: 1.5,
            timestamps: Vec::new(),
        }
    }

    fn sample(tick_id: TickId, session_index: SessionIndex, x: f64) -> VehicleSample {
        VehicleSample {
            tick_id,
            session_index,
            state: VehicleState {
                tick_id,
                position: Vector3::new(x, 0.0, 0.0),
                speed: 10.0,
                distance: x,
            },
        }
    }

    #[test]
    fn test_frames_pick_their_own_tick() {
        let samples = vec![sample(0, 1, 0.5), sample(0, 0, 0.4), sample(1, 0, 0.9)];
        let mut export = SimExport::new("lockstep", 42);
        export.add_report(&report(0, vec![0, 1]), 0.05, &samples);
        export.add_report(&report(1, vec![0]), 0.10, &samples);

        assert_eq!(export.frames.len(), 2);
        assert_eq!(export.duration_sec, 0.10);

        let first: Vec<SessionIndex> = export.frames[0].vehicles.iter().map(|v| v.session_index).collect();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(export.frames[1].vehicles.len(), 1);
        assert_eq!(export.frames[1].vehicles[0].x, 0.9);
    }

    #[test]
    fn test_write_to_file() {
        let mut export = SimExport::new("mixed", 7);
        export.add_report(&report(0, vec![0]), 0.05, &[sample(0, 0, 0.5)]);
        export.finalize(false, Some("boom".to_string()), None);

        let path = std::env::temp_dir().join(format!("ecloud-export-{}.json", std::process::id()));
        export.write_to_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["scenario"], "mixed");
        assert_eq!(value["failure_reason"], "boom");
        assert_eq!(value["frames"][0]["vehicles"][0]["x"], 0.5);
        assert!(value.get("diagnostics").is_none());

        let _ = std::fs::remove_file(&path);
    }
}
