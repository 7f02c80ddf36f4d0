use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BanditArm {
    pub value: f64,
    pub count: u64,
    pub average_reward: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum BanditError {
    #[error("bandit needs at least one arm")]
    NoArms,
    #[error("arm value must be finite and > 0, got {0}")]
    InvalidArm(f64),
    #[error("exploration constant must be finite and >= 0, got {0}")]
    InvalidExploration(f64),
}

/// UCB1 over a fixed set of risk-aversion values.
///
/// Every arm is tried once before any arm is tried twice. After that the arm
/// maximizing `average_reward + c * sqrt(ln(total) / count)` is chosen, ties
/// going to the earliest arm. Rewards are credited to the arm most recently
/// selected.
#[derive(Debug, Clone)]
pub struct UcbBandit {
    arms: Vec<BanditArm>,
    exploration: f64,
    total_selections: u64,
    current: usize,
}

impl UcbBandit {
    pub fn new(values: &[f64], exploration: f64) -> Result<Self, BanditError> {
        if values.is_empty() {
            return Err(BanditError::NoArms);
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v <= 0.0) {
            return Err(BanditError::InvalidArm(*bad));
        }
        if !exploration.is_finite() || exploration < 0.0 {
            return Err(BanditError::InvalidExploration(exploration));
        }

        Ok(Self {
            arms: values
                .iter()
                .map(|&value| BanditArm {
                    value,
                    count: 0,
                    average_reward: 0.0,
                })
                .collect(),
            exploration,
            total_selections: 0,
            current: 0,
        })
    }

    pub fn arms(&self) -> &[BanditArm] {
        &self.arms
    }

    pub fn current_arm(&self) -> f64 {
        self.arms[self.current].value
    }

    pub fn total_selections(&self) -> u64 {
        self.total_selections
    }

    /// UCB score of arm `index`; `None` while that arm is untried.
    pub fn score(&self, index: usize) -> Option<f64> {
        let arm = self.arms.get(index)?;
        if arm.count == 0 {
            return None;
        }
        let total = self.total_selections.max(1) as f64;
        let bonus = self.exploration * (total.ln() / arm.count as f64).sqrt();
        Some(arm.average_reward + bonus)
    }

    pub fn select_arm(&mut self) -> f64 {
        if let Some(index) = self.arms.iter().position(|arm| arm.count == 0) {
            self.current = index;
            info!(gamma = self.arms[index].value, "bandit cold start");
            return self.arms[index].value;
        }

        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for index in 0..self.arms.len() {
            let score = self.score(index).unwrap_or(f64::NEG_INFINITY);
            if score > best_score {
                best = index;
                best_score = score;
            }
        }

        self.current = best;
        info!(gamma = self.arms[best].value, score = best_score, "bandit selected arm");
        self.arms[best].value
    }

    /// Credits `reward` to the current arm's running mean.
    pub fn update(&mut self, reward: f64) {
        if !reward.is_finite() {
            warn!(reward, "ignoring non-finite bandit reward");
            return;
        }

        let arm = &mut self.arms[self.current];
        arm.count += 1;
        arm.average_reward += (reward - arm.average_reward) / arm.count as f64;
        self.total_selections += 1;

        info!(
            gamma = arm.value,
            reward,
            average = arm.average_reward,
            count = arm.count,
            "bandit arm updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{BanditError, UcbBandit};
    use std::f64::consts::SQRT_2;

    #[test]
    fn rejects_bad_arm_sets() {
        assert_eq!(UcbBandit::new(&[], SQRT_2).unwrap_err(), BanditError::NoArms);
        assert_eq!(
            UcbBandit::new(&[0.1, -0.3], SQRT_2).unwrap_err(),
            BanditError::InvalidArm(-0.3)
        );
        assert!(UcbBandit::new(&[0.1], f64::NAN).is_err());
    }

    #[test]
    fn tries_every_arm_once_before_repeating() {
        let arms = [0.1, 0.3, 0.5, 0.7, 0.9];
        let mut bandit = UcbBandit::new(&arms, SQRT_2).unwrap();
        let mut seen = Vec::new();
        for reward in [5.0, -3.0, 0.0, 10.0, -1.0] {
            seen.push(bandit.select_arm());
            bandit.update(reward);
        }
        assert_eq!(seen, arms);
        assert!(bandit.arms().iter().all(|arm| arm.count == 1));
    }

    #[test]
    fn favors_best_average_after_cold_start() {
        let mut bandit = UcbBandit::new(&[0.1, 0.3, 0.5], SQRT_2).unwrap();
        for reward in [1.0, -1.0, 2.0] {
            bandit.select_arm();
            bandit.update(reward);
        }
        assert_eq!(bandit.total_selections(), 3);
        assert_eq!(bandit.select_arm(), 0.5);
        assert_eq!(bandit.current_arm(), 0.5);
    }

    #[test]
    fn selection_is_the_argmax_score() {
        let mut bandit = UcbBandit::new(&[0.1, 0.3, 0.5, 0.7], 0.5).unwrap();
        let rewards = [0.3, -0.2, 1.1, 0.4, -0.7, 0.9, 0.0, 0.2, 0.6, -0.1, 0.5, 0.8];
        for reward in rewards {
            let chosen = bandit.select_arm();
            if bandit.total_selections() >= 4 {
                let index = bandit.arms().iter().position(|a| a.value == chosen).unwrap();
                let chosen_score = bandit.score(index).unwrap();
                for other in 0..bandit.arms().len() {
                    assert!(bandit.score(other).unwrap() <= chosen_score);
                }
            }
            bandit.update(reward);
        }
    }

    #[test]
    fn running_mean_matches_arithmetic_mean() {
        let mut bandit = UcbBandit::new(&[0.5], SQRT_2).unwrap();
        let rewards = [3.0, -1.0, 4.0, 1.5, -2.5];
        for reward in rewards {
            bandit.select_arm();
            bandit.update(reward);
        }
        let mean = rewards.iter().sum::<f64>() / rewards.len() as f64;
        let arm = bandit.arms()[0];
        assert_eq!(arm.count, 5);
        assert!((arm.average_reward - mean).abs() < 1e-12);
    }

    #[test]
    fn non_finite_reward_is_ignored() {
        let mut bandit = UcbBandit::new(&[0.5], SQRT_2).unwrap();
        bandit.select_arm();
        bandit.update(f64::NAN);
        assert_eq!(bandit.total_selections(), 0);
        assert_eq!(bandit.arms()[0].count, 0);
    }
}
