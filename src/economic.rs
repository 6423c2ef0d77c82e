//! Economic rules: block reward schedule and supply accounting

use crate::params::ChainParams;
use crate::types::*;

/// NominalReward: ℕ → ℕ
///
/// For block height h:
/// 1. If h = 0: return 0 (genesis mints nothing)
/// 2. Let halvings = ⌊(h - 1) / H⌋
/// 3. If halvings ≥ 64: return 0
/// 4. Return R₀ >> halvings
///
/// Heights 1..=H pay the full initial reward, H+1..=2H half of it, and so on.
pub fn nominal_reward(height: Natural, params: &ChainParams) -> u64 {
    if height == 0 {
        return 0;
    }
    let halvings = (height - 1).checked_div(params.halving_interval).unwrap_or(0);
    if halvings >= 64 {
        return 0;
    }
    params.initial_reward >> halvings
}

/// CurrentReward: ℕ × ℕ → ℕ
///
/// The nominal reward clamped to what is left below the supply cap; when
/// the remainder is smaller than the nominal reward the remainder is paid.
pub fn current_reward(height: Natural, minted_supply: u64, params: &ChainParams) -> u64 {
    nominal_reward(height, params).min(params.max_supply.saturating_sub(minted_supply))
}

/// ScheduledSupply: ℕ → ℕ
///
/// Total minted by blocks 1..=height when every block claims its full
/// reward, capped at the maximum supply.
pub fn scheduled_supply(height: Natural, params: &ChainParams) -> u64 {
    if params.halving_interval == 0 {
        return params
            .initial_reward
            .saturating_mul(height)
            .min(params.max_supply);
    }
    let mut total: u64 = 0;
    let mut era_start: u64 = 1;
    let mut reward = params.initial_reward;
    while era_start <= height && reward > 0 {
        let era_end = era_start.saturating_add(params.halving_interval - 1).min(height);
        let blocks = era_end - era_start + 1;
        total = total.saturating_add(reward.saturating_mul(blocks));
        if total >= params.max_supply {
            return params.max_supply;
        }
        era_start = era_start.saturating_add(params.halving_interval);
        reward >>= 1;
    }
    total
}

/// First height paying a reduced nominal reward after `height`
pub fn next_halving_height(height: Natural, params: &ChainParams) -> Natural {
    if params.halving_interval == 0 {
        return Natural::MAX;
    }
    let eras_completed = height.saturating_sub(1) / params.halving_interval;
    (eras_completed + 1)
        .saturating_mul(params.halving_interval)
        .saturating_add(1)
}
