//! The valid-edge relation of the execution state machine.

use squad_types::WorkflowState;

/// States reachable from `from` by a single transition.
///
/// `Blocked` is absent here: its successors depend on the persisted
/// pre-block state and are resolved by the engine.
pub fn successors(from: WorkflowState) -> &'static [WorkflowState] {
    use WorkflowState::*;
    match from {
        Pending => &[Analyzing],
        Analyzing => &[Planning, Failed, Blocked],
        Planning => &[Delegated, Blocked, Failed],
        Delegated => &[InProgress, Blocked],
        InProgress => &[Reviewing, Blocked, Failed],
        Reviewing => &[Testing, InProgress, Blocked, Failed],
        Testing => &[Completed, InProgress, Failed],
        Completed | Failed | Blocked => &[],
    }
}

/// Whether `from -> to` is a valid edge outside of block/resume handling.
pub fn is_valid(from: WorkflowState, to: WorkflowState) -> bool {
    successors(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use squad_types::WorkflowState::*;

    const ALL: [squad_types::WorkflowState; 10] = [
        Pending, Analyzing, Planning, Delegated, InProgress, Reviewing, Testing, Completed,
        Blocked, Failed,
    ];

    #[test]
    fn happy_path_is_valid() {
        let path = [
            Pending, Analyzing, Planning, Delegated, InProgress, Reviewing, Testing, Completed,
        ];
        for pair in path.windows(2) {
            assert!(is_valid(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn rework_edges_are_valid() {
        assert!(is_valid(Reviewing, InProgress));
        assert!(is_valid(Testing, InProgress));
    }

    #[test]
    fn terminal_states_have_no_successors() {
        assert!(successors(Completed).is_empty());
        assert!(successors(Failed).is_empty());
    }

    #[test]
    fn pending_cannot_block_or_fail_directly() {
        assert!(!is_valid(Pending, Blocked));
        assert!(!is_valid(Pending, Failed));
    }

    proptest! {
        #[test]
        fn self_loops_are_never_valid(i in 0usize..10) {
            let state = ALL[i];
            prop_assert!(!is_valid(state, state));
        }

        #[test]
        fn nothing_leads_back_to_pending(i in 0usize..10) {
            prop_assert!(!is_valid(ALL[i], Pending));
        }
    }
}
