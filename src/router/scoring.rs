//! Pure candidate scoring for standard-tier (Ollama) routing. Kept free of
//! I/O and locks so the monotonicity/boundary properties are unit-testable
//! without a runtime.

use crate::constants::{RAM_CAP_MULTIPLIER, REPO_AFFINITY_BONUS, VRAM_ABSENT_FACTOR, WARM_MODEL_BONUS};
use crate::models::ResourceSnapshot;

pub struct ScoringInput<'a> {
    pub resources: &'a ResourceSnapshot,
    pub model: &'a str,
    pub model_loaded: bool,
    pub repo_affinity: bool,
    pub ram_baseline_mb: f64,
}

/// `score = 1.0 * load_factor * capacity_factor * vram_factor * bonuses`.
pub fn score_candidate(input: &ScoringInput) -> f64 {
    let mut score = 1.0;

    let load_factor = 1.0 - (input.resources.cpu_percent / 100.0).clamp(0.0, 1.0);
    score *= load_factor;

    let capacity_factor = if input.ram_baseline_mb > 0.0 {
        (input.resources.ram_total_mb / input.ram_baseline_mb).min(RAM_CAP_MULTIPLIER)
    } else {
        1.0
    };
    score *= capacity_factor;

    let vram_factor = match (input.resources.vram_used_mb, input.resources.vram_total_mb) {
        (Some(used), Some(total)) if total > 0.0 => 0.8 + 0.2 * (1.0 - (used / total).clamp(0.0, 1.0)),
        _ => VRAM_ABSENT_FACTOR,
    };
    score *= vram_factor;

    if input.model_loaded {
        score *= WARM_MODEL_BONUS;
    }
    if input.repo_affinity {
        score *= REPO_AFFINITY_BONUS;
    }

    score
}

pub fn model_is_loaded(resources: &ResourceSnapshot, model: &str) -> bool {
    resources.models_running.iter().any(|m| m == model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_resources() -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: 0.0,
            ram_used_mb: 1000.0,
            ram_total_mb: 16_000.0,
            vram_used_mb: None,
            vram_total_mb: None,
            models_running: vec![],
            last_updated: None,
        }
    }

    #[test]
    fn higher_cpu_load_never_scores_higher() {
        let low_load = base_resources();
        let mut high_load = base_resources();
        high_load.cpu_percent = 80.0;

        let low_input = ScoringInput {
            resources: &low_load,
            model: "llama3",
            model_loaded: false,
            repo_affinity: false,
            ram_baseline_mb: 8000.0,
        };
        let high_input = ScoringInput {
            resources: &high_load,
            model: "llama3",
            model_loaded: false,
            repo_affinity: false,
            ram_baseline_mb: 8000.0,
        };
        assert!(score_candidate(&low_input) > score_candidate(&high_input));
    }

    #[test]
    fn warm_model_bonus_strictly_increases_score() {
        let resources = base_resources();
        let cold = ScoringInput {
            resources: &resources,
            model: "llama3",
            model_loaded: false,
            repo_affinity: false,
            ram_baseline_mb: 8000.0,
        };
        let warm = ScoringInput {
            resources: &resources,
            model: "llama3",
            model_loaded: true,
            repo_affinity: false,
            ram_baseline_mb: 8000.0,
        };
        assert!(score_candidate(&warm) > score_candidate(&cold));
        assert!((score_candidate(&warm) / score_candidate(&cold) - WARM_MODEL_BONUS).abs() < 1e-9);
    }

    #[test]
    fn missing_vram_data_uses_fixed_factor() {
        let resources = base_resources();
        let input = ScoringInput {
            resources: &resources,
            model: "llama3",
            model_loaded: false,
            repo_affinity: false,
            ram_baseline_mb: resources.ram_total_mb,
        };
        let score = score_candidate(&input);
        assert!((score - VRAM_ABSENT_FACTOR).abs() < 1e-9);
    }

    #[test]
    fn capacity_factor_is_capped() {
        let mut huge_ram = base_resources();
        huge_ram.ram_total_mb = 1_000_000.0;
        let input = ScoringInput {
            resources: &huge_ram,
            model: "llama3",
            model_loaded: false,
            repo_affinity: false,
            ram_baseline_mb: 8_000.0,
        };
        let score = score_candidate(&input);
        assert!((score - RAM_CAP_MULTIPLIER * VRAM_ABSENT_FACTOR).abs() < 1e-6);
    }
}
