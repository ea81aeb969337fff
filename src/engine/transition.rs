//! Cell transition calculation
//!
//! `Transition` encodes the before/after status of one cell for one key
//! in one batch. `calc_transition` maps the per-row existence, validity,
//! and equality flags to a code through a prioritized rule chain; the
//! three `backout_*` switches suppress individual rules.

use super::config::EngineConfig;
use serde::{Deserialize, Serialize};

/// Cell-level value transition codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Transition {
    /// Absent before and after
    EqFf = 0,
    /// Present and equal
    EqTt = 1,
    /// Newly present
    NeqFt = 2,
    /// Removed
    NeqTf = 3,
    /// Present, value changed
    NeqTt = 4,
    /// Present, newly valid
    NveqFt = 5,
    /// Present after an in-batch delete + insert
    NeqTdt = 6,
    /// Delete of a previously present row
    NeqTdf = 7,
}

impl Transition {
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Transition> {
        use Transition::*;
        match v {
            0 => Some(EqFf),
            1 => Some(EqTt),
            2 => Some(NeqFt),
            3 => Some(NeqTf),
            4 => Some(NeqTt),
            5 => Some(NveqFt),
            6 => Some(NeqTdt),
            7 => Some(NeqTdf),
            _ => None,
        }
    }
}

/// Compute the transition code for one cell.
///
/// First matching rule wins. Total over all inputs; the trailing
/// `prev_pkey_eq` arm covers a delete-then-insert collapsed in the same
/// batch, and anything past it is an internal invariant violation.
#[allow(clippy::too_many_arguments)]
pub fn calc_transition(
    config: &EngineConfig,
    prev_existed: bool,
    row_pre_existed: bool,
    exists: bool,
    prev_valid: bool,
    cur_valid: bool,
    prev_cur_eq: bool,
    prev_pkey_eq: bool,
) -> Transition {
    if !row_pre_existed && !cur_valid && !config.backout_invalid_neq_ft {
        Transition::NeqFt
    } else if row_pre_existed && !prev_valid && !cur_valid && !config.backout_eq_invalid_invalid {
        Transition::EqTt
    } else if !prev_existed && !exists {
        Transition::EqFf
    } else if row_pre_existed && exists && !prev_valid && cur_valid && !config.backout_nveq_ft {
        Transition::NveqFt
    } else if prev_existed && exists && prev_cur_eq {
        Transition::EqTt
    } else if !prev_existed && exists {
        Transition::NeqFt
    } else if prev_existed && !exists {
        Transition::NeqTf
    } else if prev_existed && exists && !prev_cur_eq {
        Transition::NeqTt
    } else if prev_pkey_eq {
        // Previous op in the batch was a delete of this key
        Transition::NeqTdt
    } else {
        panic!(
            "transition fall-through: prev_existed={prev_existed} \
             row_pre_existed={row_pre_existed} exists={exists} \
             prev_valid={prev_valid} cur_valid={cur_valid} \
             prev_cur_eq={prev_cur_eq} prev_pkey_eq={prev_pkey_eq}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc(
        prev_existed: bool,
        row_pre_existed: bool,
        exists: bool,
        prev_valid: bool,
        cur_valid: bool,
        prev_cur_eq: bool,
    ) -> Transition {
        calc_transition(
            &EngineConfig::default(),
            prev_existed,
            row_pre_existed,
            exists,
            prev_valid,
            cur_valid,
            prev_cur_eq,
            false,
        )
    }

    #[test]
    fn test_new_row_valid_cell() {
        // Fresh insert, cell valid
        assert_eq!(calc(false, false, true, false, true, false), Transition::NeqFt);
    }

    #[test]
    fn test_new_row_invalid_cell() {
        // Rule 1: fresh insert, cell invalid
        assert_eq!(calc(false, false, false, false, false, false), Transition::NeqFt);
    }

    #[test]
    fn test_new_row_invalid_cell_backed_out() {
        let cfg = EngineConfig {
            backout_invalid_neq_ft: true,
            ..Default::default()
        };
        assert_eq!(
            calc_transition(&cfg, false, false, false, false, false, false, false),
            Transition::EqFf
        );
    }

    #[test]
    fn test_invalid_to_invalid_is_equal() {
        // Rule 2: existing row, both sides invalid
        assert_eq!(calc(false, true, false, false, false, false), Transition::EqTt);
    }

    #[test]
    fn test_invalid_to_invalid_backed_out() {
        let cfg = EngineConfig {
            backout_eq_invalid_invalid: true,
            ..Default::default()
        };
        // Falls through to the absent-absent rule
        assert_eq!(
            calc_transition(&cfg, false, true, false, false, false, false, false),
            Transition::EqFf
        );
    }

    #[test]
    fn test_newly_valid() {
        // Rule 4: row existed, cell was invalid, now valid
        assert_eq!(calc(false, true, true, false, true, false), Transition::NveqFt);
    }

    #[test]
    fn test_newly_valid_backed_out() {
        let cfg = EngineConfig {
            backout_nveq_ft: true,
            ..Default::default()
        };
        // prev_existed false, exists -> newly present
        assert_eq!(
            calc_transition(&cfg, false, true, true, false, true, false, false),
            Transition::NeqFt
        );
    }

    #[test]
    fn test_equal_values() {
        assert_eq!(calc(true, true, true, true, true, true), Transition::EqTt);
    }

    #[test]
    fn test_changed_values() {
        assert_eq!(calc(true, true, true, true, true, false), Transition::NeqTt);
    }

    #[test]
    fn test_removed_cell() {
        assert_eq!(calc(true, true, false, true, false, false), Transition::NeqTf);
    }

    #[test]
    fn test_round_trip_codes() {
        for code in 0u8..8 {
            let t = Transition::from_u8(code).unwrap();
            assert_eq!(t.as_u8(), code);
        }
        assert_eq!(Transition::from_u8(8), None);
    }
}
