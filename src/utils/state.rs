//! 会话状态管理
//!
//! 提供会话状态转换校验，并记录会话的最终结果码。
//!
//! ## 状态转换规则
//! - Idle -> Starting, Terminated
//! - Starting -> Running, Terminated
//! - Running -> Terminated
//! - Terminated -> (终态，不能转换)

use crate::rpc::types::{Outcome, SessionState};
use crate::utils::error::ConfiguratorError;

/// 状态转换结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionResult {
    /// 转换成功
    Success,
    /// 转换无效（当前状态不允许转换到目标状态）
    Invalid {
        from: SessionState,
        to: SessionState,
        reason: String,
    },
}

impl StateTransitionResult {
    /// 检查转换是否成功
    pub fn is_success(&self) -> bool {
        matches!(self, StateTransitionResult::Success)
    }

    /// 转为结果，无效转换映射为 `InvalidState` 错误
    pub fn into_result(self) -> Result<(), ConfiguratorError> {
        match self {
            StateTransitionResult::Success => Ok(()),
            StateTransitionResult::Invalid { reason, .. } => {
                Err(ConfiguratorError::InvalidState(reason))
            }
        }
    }
}

/// 会话状态管理器
///
/// 管理单个会话的状态转换，确保状态转换的有效性。
#[derive(Debug, Clone)]
pub struct SessionStateManager {
    /// 当前状态
    current_state: SessionState,
    /// 会话 ID（用于日志）
    session_id: String,
    /// 终止时发给客户端的结果码
    outcome: Option<Outcome>,
}

impl SessionStateManager {
    /// 创建新的状态管理器
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            current_state: SessionState::Idle,
            session_id: session_id.into(),
            outcome: None,
        }
    }

    /// 获取当前状态
    pub fn state(&self) -> SessionState {
        self.current_state
    }

    /// 获取最终结果码
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// 尝试转换到目标状态
    ///
    /// 如果转换有效，更新状态并返回 Success。
    /// 如果转换无效，保持当前状态并返回 Invalid。
    pub fn transition_to(&mut self, target: SessionState) -> StateTransitionResult {
        if Self::is_valid_transition(self.current_state, target) {
            let from = self.current_state;
            self.current_state = target;

            tracing::debug!(
                "会话 {} 状态转换: {:?} -> {:?}",
                self.session_id,
                from,
                target
            );

            StateTransitionResult::Success
        } else {
            let reason = Self::get_invalid_transition_reason(self.current_state, target);
            tracing::warn!(
                "会话 {} 无效状态转换: {:?} -> {:?}, 原因: {}",
                self.session_id,
                self.current_state,
                target,
                reason
            );

            StateTransitionResult::Invalid {
                from: self.current_state,
                to: target,
                reason,
            }
        }
    }

    /// 转换到终止状态并记录结果码
    ///
    /// 任何状态都可以终止；已终止时保留第一次记录的结果码。
    pub fn terminate(&mut self, outcome: Option<Outcome>) {
        if self.is_terminal() {
            return;
        }
        let from = self.current_state;
        self.current_state = SessionState::Terminated;
        self.outcome = outcome;

        match outcome {
            Some(outcome) => tracing::info!(
                "会话 {} 终止: {:?} -> Terminated, 结果: {:?}",
                self.session_id,
                from,
                outcome
            ),
            None => tracing::info!("会话 {} 终止: {:?} -> Terminated", self.session_id, from),
        }
    }

    /// 检查状态转换是否有效
    ///
    /// 状态只能前进，重复进入同一状态也是无效的。
    pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
        match from {
            SessionState::Idle => matches!(to, SessionState::Starting | SessionState::Terminated),
            SessionState::Starting => {
                matches!(to, SessionState::Running | SessionState::Terminated)
            }
            SessionState::Running => matches!(to, SessionState::Terminated),
            SessionState::Terminated => false, // 终态
        }
    }

    /// 获取无效转换的原因
    fn get_invalid_transition_reason(from: SessionState, to: SessionState) -> String {
        match from {
            SessionState::Terminated => "会话已终止，不能再转换状态".to_string(),
            _ if from == to => format!("会话已处于 {:?} 状态", from),
            _ => format!("不允许从 {:?} 转换到 {:?}", from, to),
        }
    }

    /// 检查会话是否处于终态
    pub fn is_terminal(&self) -> bool {
        self.current_state == SessionState::Terminated
    }

    /// 配置器是否已经启动过（主题不能再修改）
    pub fn has_started(&self) -> bool {
        self.current_state != SessionState::Idle
    }
}

impl Default for SessionStateManager {
    fn default() -> Self {
        Self::new("unknown")
    }
}

/// 依次转换到指定状态，用于测试
#[cfg(test)]
fn manager_in(state: SessionState) -> SessionStateManager {
    let mut manager = SessionStateManager::new("test");
    let path: &[SessionState] = match state {
        SessionState::Idle => &[],
        SessionState::Starting => &[SessionState::Starting],
        SessionState::Running => &[SessionState::Starting, SessionState::Running],
        SessionState::Terminated => &[SessionState::Terminated],
    };
    for target in path {
        manager.transition_to(*target);
    }
    manager
}


/// 会话状态机的属性测试
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn state_strategy() -> impl Strategy<Value = SessionState> {
        prop_oneof![
            Just(SessionState::Idle),
            Just(SessionState::Starting),
            Just(SessionState::Running),
            Just(SessionState::Terminated),
        ]
    }

    fn outcome_strategy() -> impl Strategy<Value = Option<Outcome>> {
        prop_oneof![
            Just(None),
            Just(Some(Outcome::Ready)),
            Just(Some(Outcome::ConfiguratorPrepareFailed)),
            Just(Some(Outcome::ConfiguratorTerminated)),
        ]
    }

    fn rank(state: SessionState) -> u8 {
        match state {
            SessionState::Idle => 0,
            SessionState::Starting => 1,
            SessionState::Running => 2,
            SessionState::Terminated => 3,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// 任意转换序列下状态只前进不后退
        #[test]
        fn prop_state_never_moves_backwards(
            targets in prop::collection::vec(state_strategy(), 1..20)
        ) {
            let mut manager = SessionStateManager::new("prop");
            for target in targets {
                let before = manager.state();
                manager.transition_to(target);
                prop_assert!(rank(manager.state()) >= rank(before));
            }
        }

        /// Terminated 是终态
        #[test]
        fn prop_terminated_is_absorbing(
            start in state_strategy(),
            outcome in outcome_strategy(),
            targets in prop::collection::vec(state_strategy(), 0..10)
        ) {
            let mut manager = manager_in(start);
            manager.terminate(outcome);
            let recorded = manager.outcome();

            for target in targets {
                let result = manager.transition_to(target);
                prop_assert!(!result.is_success());
                manager.terminate(Some(Outcome::Ready));
            }

            prop_assert_eq!(manager.state(), SessionState::Terminated);
            prop_assert_eq!(manager.outcome(), recorded);
        }

        /// 主题只能在 Idle 状态修改
        #[test]
        fn prop_started_iff_not_idle(state in state_strategy()) {
            let manager = manager_in(state);
            prop_assert_eq!(manager.has_started(), state != SessionState::Idle);
        }
    }
}
