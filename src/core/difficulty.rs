use crate::core::Block;
use log::info;

/// Hard ceiling on leading zero bits. Anything higher is unmineable in
/// practice and would overflow nothing but patience.
pub const MAX_DIFFICULTY: u32 = 64;
pub const MIN_DIFFICULTY: u32 = 1;

/// How the required difficulty of the next block is derived. Every node must
/// run the same policy, since the validator rejects blocks whose difficulty
/// differs from what the policy demands at that height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyPolicy {
    /// Every block needs the same number of leading zero bits.
    Fixed(u32),
    /// Retarget every `period` blocks towards `target_block_time_ms`.
    Adjusting {
        initial: u32,
        period: u64,
        target_block_time_ms: u64,
        min: u32,
        max: u32,
    },
}

impl Default for DifficultyPolicy {
    fn default() -> Self {
        DifficultyPolicy::Fixed(16)
    }
}

impl DifficultyPolicy {
    /// Required difficulty for the block that would follow `prefix`.
    /// `prefix` always starts at genesis.
    pub fn next_difficulty(&self, prefix: &[Block]) -> u32 {
        match *self {
            DifficultyPolicy::Fixed(bits) => bits,
            DifficultyPolicy::Adjusting {
                initial,
                period,
                target_block_time_ms,
                min,
                max,
            } => {
                let height = prefix.len() as u64;
                let period = period.max(2);
                if height < period {
                    return initial;
                }

                // Genesis carries difficulty 0; never inherit it.
                let current = match prefix.last() {
                    Some(block) if !block.is_genesis() => block.get_difficulty(),
                    _ => initial,
                };
                if height % period != 0 {
                    return current;
                }

                let window = &prefix[prefix.len() - period as usize..];
                let first = window[0].get_timestamp();
                let last = window[window.len() - 1].get_timestamp();
                let actual = last.saturating_sub(first).max(0) as u64;
                let target = target_block_time_ms * (period - 1);
                let next = Self::adjust(current, actual, target).clamp(min, max);

                info!(
                    "Difficulty retarget at height {height}: {current} -> {next} (actual: {actual}ms, target: {target}ms)"
                );
                next
            }
        }
    }

    fn adjust(current: u32, actual_time: u64, target_time: u64) -> u32 {
        if target_time == 0 {
            return current;
        }
        let ratio = actual_time as f64 / target_time as f64;

        if ratio < 0.5 {
            current + 2
        } else if ratio < 0.75 {
            current + 1
        } else if ratio > 2.0 {
            current.saturating_sub(2)
        } else if ratio > 1.5 {
            current.saturating_sub(1)
        } else {
            current
        }
    }

    /// Bounds check used when loading configuration.
    pub fn is_within_bounds(&self) -> bool {
        match *self {
            DifficultyPolicy::Fixed(bits) => (MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&bits),
            DifficultyPolicy::Adjusting {
                initial, min, max, ..
            } => {
                min >= MIN_DIFFICULTY && max <= MAX_DIFFICULTY && min <= initial && initial <= max
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::block_at;

    fn policy() -> DifficultyPolicy {
        DifficultyPolicy::Adjusting {
            initial: 4,
            period: 5,
            target_block_time_ms: 10_000,
            min: 1,
            max: 12,
        }
    }

    fn prefix_with_spacing(len: u64, spacing_ms: i64, difficulty: u32) -> Vec<Block> {
        let mut blocks = vec![crate::core::genesis_block().clone()];
        for i in 1..len {
            blocks.push(block_at(i, i as i64 * spacing_ms, difficulty));
        }
        blocks
    }

    #[test]
    fn test_fixed_policy() {
        let prefix = prefix_with_spacing(20, 1, 3);
        assert_eq!(DifficultyPolicy::Fixed(3).next_difficulty(&prefix), 3);
    }

    #[test]
    fn test_initial_difficulty_before_first_period() {
        let prefix = prefix_with_spacing(3, 1_000, 4);
        assert_eq!(policy().next_difficulty(&prefix), 4);
    }

    #[test]
    fn test_fast_blocks_raise_difficulty() {
        // 4 gaps of 1s against a 40s target
        let prefix = prefix_with_spacing(10, 1_000, 4);
        assert_eq!(policy().next_difficulty(&prefix), 6);
    }

    #[test]
    fn test_slow_blocks_lower_difficulty() {
        // 4 gaps of 25s = 100s against 40s
        let prefix = prefix_with_spacing(10, 25_000, 4);
        assert_eq!(policy().next_difficulty(&prefix), 2);
    }

    #[test]
    fn test_between_retargets_keeps_last_difficulty() {
        let prefix = prefix_with_spacing(7, 1_000, 5);
        assert_eq!(policy().next_difficulty(&prefix), 5);
    }

    #[test]
    fn test_bounds() {
        assert!(DifficultyPolicy::Fixed(8).is_within_bounds());
        assert!(!DifficultyPolicy::Fixed(0).is_within_bounds());
        assert!(!DifficultyPolicy::Fixed(65).is_within_bounds());
        assert!(policy().is_within_bounds());
    }
}
