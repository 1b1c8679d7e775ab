//! Position state machine
//!
//! Four states: CASH, LONG, SHORT, TIMEOUT. Everything that moves between
//! them goes through [`StateMachine::transition`], which rejects forbidden
//! moves and records every accepted one. Timeout-exit decisions are a pure
//! function of their inputs so the behaviour is deterministic and directly
//! testable.

use crate::config::{AlgoType, TimeoutMode};
use crate::error::BacktestError;
use crate::types::{
    PositionState, TimeoutContext, TimeoutReason, TradeDirection, TransitionReason,
};

/// One accepted state transition.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: PositionState,
    pub to: PositionState,
    pub timestamp: i64,
    pub bar_index: usize,
    pub reason: TransitionReason,
    pub direction: Option<TradeDirection>,
    /// Timeout context after the transition, when the machine is in TIMEOUT.
    pub timeout: Option<TimeoutContext>,
}

/// The state machine itself. Starts in CASH.
#[derive(Debug)]
pub struct StateMachine {
    state: PositionState,
    timeout: Option<TimeoutContext>,
    transitions: Vec<TransitionRecord>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine {
            state: PositionState::Cash,
            timeout: None,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> PositionState {
        self.state
    }

    pub fn timeout_context(&self) -> Option<TimeoutContext> {
        self.timeout
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Restore to the initial CASH state, dropping history.
    pub fn reset(&mut self) {
        self.state = PositionState::Cash;
        self.timeout = None;
        self.transitions.clear();
    }

    /// Increment the bar counter while parked in TIMEOUT.
    pub fn tick_timeout(&mut self) {
        if let Some(ctx) = self.timeout.as_mut() {
            ctx.bars_in_timeout += 1;
        }
    }

    fn is_allowed(from: PositionState, to: PositionState) -> bool {
        use PositionState::*;
        matches!(
            (from, to),
            (Cash, Long)
                | (Cash, Short)
                | (Cash, Timeout)
                | (Long, Timeout)
                | (Short, Timeout)
                | (Timeout, Cash)
                | (Timeout, Long)
                | (Timeout, Short)
        )
    }

    /// Attempt a transition; forbidden moves fail with `IllegalTransition`.
    pub fn transition(
        &mut self,
        to: PositionState,
        bar_index: usize,
        timestamp: i64,
        reason: TransitionReason,
        direction: Option<TradeDirection>,
    ) -> Result<TransitionRecord, BacktestError> {
        let from = self.state();
        if !Self::is_allowed(from, to) {
            return Err(BacktestError::IllegalTransition { from, to });
        }

        self.timeout = if to == PositionState::Timeout {
            let timeout_reason = if reason == TransitionReason::Ambiguity {
                TimeoutReason::Ambiguity
            } else {
                TimeoutReason::PostTrade
            };
            Some(TimeoutContext {
                reason: timeout_reason,
                previous_direction: direction,
                bars_in_timeout: 0,
            })
        } else {
            None
        };
        self.state = to;

        let record = TransitionRecord {
            from,
            to,
            timestamp,
            bar_index,
            reason,
            direction,
            timeout: self.timeout,
        };
        self.transitions.push(record.clone());
        Ok(record)
    }
}

/// Inputs to one timeout-exit evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutInputs {
    pub reason: TimeoutReason,
    pub mode: TimeoutMode,
    pub cooldown_bars: u32,
    pub bars_in_timeout: u32,
    /// Long-entry condition met on this bar (already gated on the algo
    /// allowing longs).
    pub long_signal: bool,
    pub short_signal: bool,
    pub previous_direction: Option<TradeDirection>,
    pub algo_type: AlgoType,
}

/// What the machine should do on this bar of TIMEOUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutVerdict {
    Stay,
    ToCash,
    Enter(TradeDirection),
}

/// Pure timeout-exit rule. Identical inputs always give the identical
/// verdict.
pub fn evaluate_timeout(inputs: &TimeoutInputs) -> TimeoutVerdict {
    let long = inputs.long_signal && inputs.algo_type.allows_long();
    let short = inputs.short_signal && inputs.algo_type.allows_short();

    match inputs.reason {
        TimeoutReason::Ambiguity => {
            // stay while the signals still contradict each other
            match (long, short) {
                (true, true) => TimeoutVerdict::Stay,
                (true, false) => TimeoutVerdict::Enter(TradeDirection::Long),
                (false, true) => TimeoutVerdict::Enter(TradeDirection::Short),
                (false, false) => TimeoutVerdict::ToCash,
            }
        }
        TimeoutReason::PostTrade => {
            let cooldown_met = inputs.bars_in_timeout >= inputs.cooldown_bars;
            if !cooldown_met {
                return TimeoutVerdict::Stay;
            }
            match inputs.mode {
                TimeoutMode::CooldownOnly => TimeoutVerdict::ToCash,
                TimeoutMode::Regular => {
                    let opposite = match inputs.previous_direction {
                        Some(TradeDirection::Long) if short => Some(TradeDirection::Short),
                        Some(TradeDirection::Short) if long => Some(TradeDirection::Long),
                        _ => None,
                    };
                    if let Some(direction) = opposite {
                        return TimeoutVerdict::Enter(direction);
                    }
                    let same_signal = match inputs.previous_direction {
                        Some(TradeDirection::Long) => long,
                        Some(TradeDirection::Short) => short,
                        None => false,
                    };
                    if same_signal {
                        TimeoutVerdict::Stay
                    } else {
                        TimeoutVerdict::ToCash
                    }
                }
                TimeoutMode::Strict => {
                    if !long && !short {
                        TimeoutVerdict::ToCash
                    } else {
                        TimeoutVerdict::Stay
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_trade(
        mode: TimeoutMode,
        bars: u32,
        long: bool,
        short: bool,
        prev: TradeDirection,
    ) -> TimeoutInputs {
        TimeoutInputs {
            reason: TimeoutReason::PostTrade,
            mode,
            cooldown_bars: 3,
            bars_in_timeout: bars,
            long_signal: long,
            short_signal: short,
            previous_direction: Some(prev),
            algo_type: AlgoType::Both,
        }
    }

    #[test]
    fn test_machine_starts_in_cash() {
        let machine = StateMachine::new();
        assert_eq!(machine.state(), PositionState::Cash);
        assert!(machine.timeout_context().is_none());
    }

    #[test]
    fn test_forbidden_transitions_rejected() {
        let mut machine = StateMachine::new();
        machine
            .transition(
                PositionState::Long,
                0,
                0,
                TransitionReason::EntrySignal,
                Some(TradeDirection::Long),
            )
            .unwrap();

        // LONG -> SHORT must go through TIMEOUT
        let err = machine.transition(
            PositionState::Short,
            1,
            60,
            TransitionReason::EntrySignal,
            Some(TradeDirection::Short),
        );
        assert!(matches!(
            err,
            Err(BacktestError::IllegalTransition {
                from: PositionState::Long,
                to: PositionState::Short,
            })
        ));

        // LONG -> CASH is forbidden too
        assert!(machine
            .transition(PositionState::Cash, 1, 60, TransitionReason::ExitSignal, None)
            .is_err());
    }

    #[test]
    fn test_transition_chain_is_connected() {
        let mut machine = StateMachine::new();
        machine
            .transition(
                PositionState::Long,
                0,
                0,
                TransitionReason::EntrySignal,
                Some(TradeDirection::Long),
            )
            .unwrap();
        machine
            .transition(
                PositionState::Timeout,
                5,
                300,
                TransitionReason::StopLoss,
                Some(TradeDirection::Long),
            )
            .unwrap();
        machine
            .transition(PositionState::Cash, 8, 480, TransitionReason::CooldownElapsed, None)
            .unwrap();

        let transitions = machine.transitions();
        assert_eq!(transitions[0].from, PositionState::Cash);
        for pair in transitions.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
    }

    #[test]
    fn test_timeout_context_lifecycle() {
        let mut machine = StateMachine::new();
        machine
            .transition(
                PositionState::Long,
                0,
                0,
                TransitionReason::EntrySignal,
                Some(TradeDirection::Long),
            )
            .unwrap();
        machine
            .transition(
                PositionState::Timeout,
                3,
                180,
                TransitionReason::ExitSignal,
                Some(TradeDirection::Long),
            )
            .unwrap();

        let ctx = machine.timeout_context().unwrap();
        assert_eq!(ctx.reason, TimeoutReason::PostTrade);
        assert_eq!(ctx.previous_direction, Some(TradeDirection::Long));
        assert_eq!(ctx.bars_in_timeout, 0);

        machine.tick_timeout();
        machine.tick_timeout();
        assert_eq!(machine.timeout_context().unwrap().bars_in_timeout, 2);

        machine
            .transition(PositionState::Cash, 6, 360, TransitionReason::CooldownElapsed, None)
            .unwrap();
        assert!(machine.timeout_context().is_none());
    }

    #[test]
    fn test_ambiguity_timeout_rules() {
        let base = TimeoutInputs {
            reason: TimeoutReason::Ambiguity,
            mode: TimeoutMode::Regular,
            cooldown_bars: 0,
            bars_in_timeout: 1,
            long_signal: true,
            short_signal: true,
            previous_direction: None,
            algo_type: AlgoType::Both,
        };
        assert_eq!(evaluate_timeout(&base), TimeoutVerdict::Stay);

        let long_only = TimeoutInputs {
            short_signal: false,
            ..base
        };
        assert_eq!(
            evaluate_timeout(&long_only),
            TimeoutVerdict::Enter(TradeDirection::Long)
        );

        let short_only = TimeoutInputs {
            long_signal: false,
            ..base
        };
        assert_eq!(
            evaluate_timeout(&short_only),
            TimeoutVerdict::Enter(TradeDirection::Short)
        );

        let neither = TimeoutInputs {
            long_signal: false,
            short_signal: false,
            ..base
        };
        assert_eq!(evaluate_timeout(&neither), TimeoutVerdict::ToCash);
    }

    #[test]
    fn test_cooldown_only_mode() {
        let before = post_trade(TimeoutMode::CooldownOnly, 2, true, true, TradeDirection::Long);
        assert_eq!(evaluate_timeout(&before), TimeoutVerdict::Stay);

        let after = post_trade(TimeoutMode::CooldownOnly, 3, true, true, TradeDirection::Long);
        assert_eq!(evaluate_timeout(&after), TimeoutVerdict::ToCash);
    }

    #[test]
    fn test_regular_mode_prefers_opposite_entry() {
        // opposite fires immediately once the cooldown is met
        let flip = post_trade(TimeoutMode::Regular, 3, false, true, TradeDirection::Long);
        assert_eq!(
            evaluate_timeout(&flip),
            TimeoutVerdict::Enter(TradeDirection::Short)
        );

        // same-direction signal still true: stay
        let hold = post_trade(TimeoutMode::Regular, 3, true, false, TradeDirection::Long);
        assert_eq!(evaluate_timeout(&hold), TimeoutVerdict::Stay);

        // both quiet: back to cash
        let quiet = post_trade(TimeoutMode::Regular, 3, false, false, TradeDirection::Long);
        assert_eq!(evaluate_timeout(&quiet), TimeoutVerdict::ToCash);
    }

    #[test]
    fn test_strict_mode_waits_for_silence() {
        // cooldown met but the long signal is still live
        let live = post_trade(TimeoutMode::Strict, 3, true, false, TradeDirection::Long);
        assert_eq!(evaluate_timeout(&live), TimeoutVerdict::Stay);

        let live_short = post_trade(TimeoutMode::Strict, 5, false, true, TradeDirection::Long);
        assert_eq!(evaluate_timeout(&live_short), TimeoutVerdict::Stay);

        let silent = post_trade(TimeoutMode::Strict, 3, false, false, TradeDirection::Long);
        assert_eq!(evaluate_timeout(&silent), TimeoutVerdict::ToCash);
    }

    #[test]
    fn test_timeout_evaluation_is_deterministic() {
        // identical inputs always give the identical verdict
        let inputs = post_trade(TimeoutMode::Regular, 4, true, false, TradeDirection::Short);
        let first = evaluate_timeout(&inputs);
        for _ in 0..10 {
            assert_eq!(evaluate_timeout(&inputs), first);
        }
    }

    #[test]
    fn test_directional_gating_respects_algo_type() {
        // a long-only algo never exits an ambiguity timeout into SHORT
        let inputs = TimeoutInputs {
            reason: TimeoutReason::Ambiguity,
            mode: TimeoutMode::Regular,
            cooldown_bars: 0,
            bars_in_timeout: 1,
            long_signal: false,
            short_signal: true,
            previous_direction: None,
            algo_type: AlgoType::Long,
        };
        assert_eq!(evaluate_timeout(&inputs), TimeoutVerdict::ToCash);
    }
}
