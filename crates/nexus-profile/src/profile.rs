//! Latency/memory profiles and the batch/duty-cycle plan solver
//!
//! A profile is a monotone schedule of batch sizes measured on one GPU
//! model: forward-pass latency (mean and std) and memory footprint per
//! batch, plus scalar pre/postprocessing latencies. The solver picks the
//! smallest batch whose sustained throughput covers a request rate while
//! keeping `duty_cycle + forward_latency` within the latency SLA.

use crate::{ModelDbError, Result};
use std::path::Path;

/// One measured batch size
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileEntry {
    /// Mean forward-pass latency in microseconds
    pub forward_mean_us: f64,

    /// Standard deviation of the forward-pass latency in microseconds
    pub forward_std_us: f64,

    /// GPU memory footprint in bytes when executing this batch size
    pub memory_bytes: u64,
}

/// Measured profile of one model on one GPU device
#[derive(Debug, Clone, PartialEq)]
pub struct ModelProfile {
    /// Profile identifier: `framework:model:version[:HxW]`
    pub profile_id: String,

    /// GPU device name the profile was measured on
    pub gpu_device: String,

    /// Batch schedule; index i holds batch size i + 1
    entries: Vec<ProfileEntry>,

    /// Mean preprocessing latency in microseconds
    pub preprocess_us: f64,

    /// Mean postprocessing latency in microseconds
    pub postprocess_us: f64,
}

/// A concrete batch/duty-cycle plan produced by the solver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstancePlan {
    /// Target batch size
    pub batch: u32,

    /// Largest batch feasible under the latency SLA
    pub max_batch: u32,

    /// Forward latency at the target batch, microseconds
    pub forward_latency_us: f64,

    /// Batch accumulation window, microseconds
    pub duty_cycle_us: f64,

    /// Sustained throughput in requests per second
    pub throughput: f64,

    /// Memory reserved for the instance (charged at max_batch), bytes
    pub memory_bytes: u64,
}

impl ModelProfile {
    /// Parse a profile file produced by the offline profiler.
    ///
    /// Format:
    /// ```text
    /// <profile id>
    /// <gpu device name>
    /// Forward latency
    /// batch,latency(us),std(us),memory(B)
    /// 1,<mean>,<std>,<bytes>
    /// ...
    /// Preprocess latency(us): <mean>,<std>
    /// Postprocess latency(us): <mean>,<std>
    /// ```
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&path.display().to_string(), &text)
    }

    fn parse(path: &str, text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let profile_id = lines
            .next()
            .ok_or_else(|| ModelDbError::invalid_profile(path, "missing profile id"))?
            .to_string();
        let gpu_device = lines
            .next()
            .ok_or_else(|| ModelDbError::invalid_profile(path, "missing gpu device"))?
            .to_string();

        let mut entries = Vec::new();
        let mut preprocess_us = 0.0;
        let mut postprocess_us = 0.0;
        for line in lines {
            if let Some(rest) = line.strip_prefix("Preprocess latency(us):") {
                preprocess_us = parse_latency_pair(path, rest)?;
            } else if let Some(rest) = line.strip_prefix("Postprocess latency(us):") {
                postprocess_us = parse_latency_pair(path, rest)?;
            } else if line.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                let fields: Vec<&str> = line.split(',').map(str::trim).collect();
                if fields.len() != 4 {
                    return Err(ModelDbError::invalid_profile(
                        path,
                        format!("expected 4 fields, got {}: {}", fields.len(), line),
                    ));
                }
                let batch: usize = fields[0]
                    .parse()
                    .map_err(|e| ModelDbError::invalid_profile(path, format!("batch: {}", e)))?;
                if batch != entries.len() + 1 {
                    return Err(ModelDbError::invalid_profile(
                        path,
                        format!("non-contiguous batch {}", batch),
                    ));
                }
                entries.push(ProfileEntry {
                    forward_mean_us: parse_f64(path, fields[1])?,
                    forward_std_us: parse_f64(path, fields[2])?,
                    memory_bytes: fields[3].parse().map_err(|e| {
                        ModelDbError::invalid_profile(path, format!("memory: {}", e))
                    })?,
                });
            }
            // Section headers ("Forward latency", the CSV header) fall through.
        }
        if entries.is_empty() {
            return Err(ModelDbError::invalid_profile(path, "no batch entries"));
        }
        for pair in entries.windows(2) {
            if pair[1].forward_mean_us < pair[0].forward_mean_us {
                return Err(ModelDbError::invalid_profile(
                    path,
                    "forward latency not monotone in batch size",
                ));
            }
        }
        Ok(Self {
            profile_id,
            gpu_device,
            entries,
            preprocess_us,
            postprocess_us,
        })
    }

    /// Construct a profile from in-memory entries (test and tooling use)
    pub fn from_entries(
        profile_id: impl Into<String>,
        gpu_device: impl Into<String>,
        entries: Vec<ProfileEntry>,
        preprocess_us: f64,
        postprocess_us: f64,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            gpu_device: gpu_device.into(),
            entries,
            preprocess_us,
            postprocess_us,
        }
    }

    /// Largest batch size in the schedule
    pub fn profiled_max_batch(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Planning forward latency for a batch size: mean plus one std
    pub fn forward_latency(&self, batch: u32) -> Option<f64> {
        self.entries
            .get(batch.checked_sub(1)? as usize)
            .map(|e| e.forward_mean_us + e.forward_std_us)
    }

    /// Memory footprint for a batch size
    pub fn memory_usage(&self, batch: u32) -> Option<u64> {
        self.entries
            .get(batch.checked_sub(1)? as usize)
            .map(|e| e.memory_bytes)
    }

    /// Largest batch feasible under the SLA: the duty cycle must fit the
    /// remaining budget and cover the forward pass.
    pub fn max_batch(&self, latency_sla_ms: u32) -> u32 {
        let sla_us = latency_sla_ms as f64 * 1000.0;
        let mut max_batch = 0;
        for b in 1..=self.profiled_max_batch() {
            let fwd = match self.forward_latency(b) {
                Some(fwd) => fwd,
                None => break,
            };
            if sla_us - fwd - self.postprocess_us >= fwd {
                max_batch = b;
            } else {
                break;
            }
        }
        max_batch
    }

    /// Solve for the smallest plan that sustains `request_rate` within the
    /// SLA. With `request_rate <= 0` (or when no batch reaches the rate)
    /// the plan maximising throughput is returned. `None` means no batch
    /// size fits the SLA at all.
    pub fn plan_for_rate(&self, latency_sla_ms: u32, request_rate: f64) -> Option<InstancePlan> {
        let sla_us = latency_sla_ms as f64 * 1000.0;
        let max_batch = self.max_batch(latency_sla_ms);
        if max_batch == 0 {
            return None;
        }
        let memory_bytes = self.memory_usage(max_batch)?;

        let mut best: Option<InstancePlan> = None;
        for b in 1..=max_batch {
            let fwd = self.forward_latency(b)?;
            let budget = sla_us - fwd - self.postprocess_us;
            let duty_cycle_us = if request_rate > 0.0 {
                (b as f64 / request_rate * 1e6).clamp(fwd, budget)
            } else {
                budget
            };
            let throughput = b as f64 * 1e6 / duty_cycle_us;
            let plan = InstancePlan {
                batch: b,
                max_batch,
                forward_latency_us: fwd,
                duty_cycle_us,
                throughput,
                memory_bytes,
            };
            if request_rate > 0.0 && throughput >= request_rate {
                return Some(plan);
            }
            if best.map_or(true, |p| throughput > p.throughput) {
                best = Some(plan);
            }
        }
        best
    }

    /// Plan with a fixed batch size: the duty cycle takes the full SLA
    /// budget. Used for statically configured workloads.
    pub fn plan_for_batch(&self, latency_sla_ms: u32, batch: u32) -> Option<InstancePlan> {
        let sla_us = latency_sla_ms as f64 * 1000.0;
        let max_batch = self.max_batch(latency_sla_ms);
        if batch == 0 || batch > max_batch {
            return None;
        }
        let fwd = self.forward_latency(batch)?;
        let duty_cycle_us = sla_us - fwd - self.postprocess_us;
        Some(InstancePlan {
            batch,
            max_batch,
            forward_latency_us: fwd,
            duty_cycle_us,
            throughput: batch as f64 * 1e6 / duty_cycle_us,
            memory_bytes: self.memory_usage(max_batch)?,
        })
    }
}

fn parse_latency_pair(path: &str, rest: &str) -> Result<f64> {
    let mean = rest
        .split(',')
        .next()
        .map(str::trim)
        .unwrap_or_default();
    parse_f64(path, mean)
}

fn parse_f64(path: &str, field: &str) -> Result<f64> {
    field
        .parse::<f64>()
        .map_err(|e| ModelDbError::invalid_profile(path, format!("{}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
tensorflow:resnet_50:1
TITAN_X_PASCAL
Forward latency
batch,latency(us),std(us),memory(B)
1,10000,500,1073741824
2,16000,500,1342177280
3,21000,500,1476395008
4,26000,1000,1610612736
Preprocess latency(us): 1500,100
Postprocess latency(us): 500,50
";

    fn sample_profile() -> ModelProfile {
        ModelProfile::parse("sample", SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_profile() {
        let profile = sample_profile();
        assert_eq!(profile.profile_id, "tensorflow:resnet_50:1");
        assert_eq!(profile.gpu_device, "TITAN_X_PASCAL");
        assert_eq!(profile.profiled_max_batch(), 4);
        assert_eq!(profile.forward_latency(1), Some(10_500.0));
        assert_eq!(profile.memory_usage(4), Some(1_610_612_736));
        assert_eq!(profile.preprocess_us, 1500.0);
        assert_eq!(profile.postprocess_us, 500.0);
    }

    #[test]
    fn test_parse_rejects_non_monotone() {
        let bad = "\
id
gpu
batch,latency(us),std(us),memory(B)
1,20000,0,1000
2,10000,0,2000
Preprocess latency(us): 0,0
Postprocess latency(us): 0,0
";
        assert!(matches!(
            ModelProfile::parse("bad", bad),
            Err(ModelDbError::InvalidProfile { .. })
        ));
    }

    #[test]
    fn test_max_batch_respects_sla() {
        let profile = sample_profile();
        // batch 4: fwd = 27000us, feasible when 2*27000 + 500 <= sla_us.
        assert_eq!(profile.max_batch(100), 4);
        // 40ms: batch 3 needs 2*21500 + 500 = 43500 > 40000, batch 2 fits.
        assert_eq!(profile.max_batch(40), 2);
        assert_eq!(profile.max_batch(10), 0);
    }

    #[test]
    fn test_plan_picks_smallest_sufficient_batch() {
        let profile = sample_profile();
        // 30 rps at batch 1: dc = 33333us within budget (100000 - 10500 - 500),
        // throughput exactly 30.
        let plan = profile.plan_for_rate(100, 30.0).unwrap();
        assert_eq!(plan.batch, 1);
        assert!(plan.throughput >= 30.0);
        assert!(plan.duty_cycle_us + plan.forward_latency_us <= 100_000.0);
    }

    #[test]
    fn test_plan_best_effort_when_rate_unreachable() {
        let profile = sample_profile();
        // Far beyond capacity: solver returns the max-throughput plan.
        let plan = profile.plan_for_rate(100, 10_000.0).unwrap();
        let peak = (1..=plan.max_batch)
            .map(|b| b as f64 * 1e6 / profile.forward_latency(b).unwrap())
            .fold(f64::MIN, f64::max);
        assert!(plan.throughput < 10_000.0);
        assert!((plan.throughput - peak).abs() < 1e-6);
    }

    #[test]
    fn test_plan_rate_zero_maximises_throughput() {
        let profile = sample_profile();
        let plan = profile.plan_for_rate(100, 0.0).unwrap();
        // Duty cycle takes the whole budget at some batch; pick the best.
        let best = (1..=plan.max_batch)
            .map(|b| {
                let fwd = profile.forward_latency(b).unwrap();
                b as f64 * 1e6 / (100_000.0 - fwd - 500.0)
            })
            .fold(f64::MIN, f64::max);
        assert!((plan.throughput - best).abs() < 1e-6);
    }

    #[test]
    fn test_plan_for_batch_fixed() {
        let profile = sample_profile();
        let plan = profile.plan_for_batch(100, 2).unwrap();
        assert_eq!(plan.batch, 2);
        assert!((plan.duty_cycle_us - (100_000.0 - 16_500.0 - 500.0)).abs() < 1e-6);
        assert!(profile.plan_for_batch(100, 99).is_none());
    }

    #[test]
    fn test_plan_memory_charged_at_max_batch() {
        let profile = sample_profile();
        let plan = profile.plan_for_rate(100, 30.0).unwrap();
        assert_eq!(plan.memory_bytes, profile.memory_usage(plan.max_batch).unwrap());
    }
}
