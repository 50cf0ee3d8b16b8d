use crate::LoopError;

/// How a backend executes tensor operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Operations run immediately and their results can be read back on the host.
    #[default]
    Eager,
    /// Operations are recorded into a deferred graph.
    Graph,
}

/// Run `body` on the loop state while `cond` holds and return the final state.
///
/// ```text
/// while cond(state):
///     state = body(state)
/// ```
///
/// Only [eager](ExecutionMode::Eager) execution is supported: a graph mode loop needs native
/// looping from the backend, so it fails instead of unrolling.
pub fn while_loop<S, C, F>(
    mode: ExecutionMode,
    mut cond: C,
    mut body: F,
    initial: S,
) -> Result<S, LoopError>
where
    C: FnMut(&S) -> bool,
    F: FnMut(S) -> S,
{
    try_while_loop(mode, &mut cond, |state| Ok(body(state)), initial)
}

/// Same as [while_loop], with a fallible body whose first error stops the loop.
pub fn try_while_loop<S, C, F>(
    mode: ExecutionMode,
    mut cond: C,
    mut body: F,
    initial: S,
) -> Result<S, LoopError>
where
    C: FnMut(&S) -> bool,
    F: FnMut(S) -> Result<S, LoopError>,
{
    match mode {
        ExecutionMode::Eager => {
            let mut state = initial;
            let mut iterations = 0usize;
            while cond(&state) {
                state = body(state)?;
                iterations += 1;
            }
            log::trace!("while_loop finished after {iterations} iterations");
            Ok(state)
        }
        ExecutionMode::Graph => Err(LoopError::NotImplemented(mode)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eager_loop_runs_until_condition_fails() {
        let result = while_loop(ExecutionMode::Eager, |i: &u32| *i < 5, |i| i + 1, 0).unwrap();

        assert_eq!(result, 5);
    }

    #[test]
    fn false_condition_returns_initial_state() {
        let mut calls = 0;

        let result = while_loop(
            ExecutionMode::Eager,
            |_: &i32| false,
            |s| {
                calls += 1;
                s
            },
            7,
        )
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls, 0);
    }

    #[test]
    fn graph_mode_is_rejected() {
        let result = while_loop(ExecutionMode::Graph, |_: &i32| true, |s| s, 0);

        assert_eq!(
            result,
            Err(LoopError::NotImplemented(ExecutionMode::Graph))
        );
    }

    #[test]
    fn body_error_stops_the_loop() {
        let result = try_while_loop(
            ExecutionMode::Eager,
            |_: &i32| true,
            |s| {
                if s == 3 {
                    Err(LoopError::InvalidArguments("stop".into()))
                } else {
                    Ok(s + 1)
                }
            },
            0,
        );

        assert!(matches!(result, Err(LoopError::InvalidArguments(_))));
    }
}
