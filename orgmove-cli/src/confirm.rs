//! Confirm-or-abort decision points
//!
//! Issue-laden steps suspend for an external decision instead of failing.
//! The decision threads back through the call chain as a value: [`Flow`]
//! at each decision point, [`RunOutcome`] at the job boundary. Choosing to
//! stop is a normal termination, never an error.

use anyhow::Result;
use colored::Colorize;

/// Decision taken at one confirmation point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Abort,
}

/// How a whole job run ended, short of a hard failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Stopped at a confirmation point; callers treat this as normal
    /// completion, not failure
    Aborted,
}

/// Ask whether to proceed past a detected problem. With prompts suppressed
/// the answer is always to continue, and the question is logged instead.
pub fn confirm_continue(message: &str, assume_yes: bool) -> Result<Flow> {
    if assume_yes {
        log::warn!("{} -- continuing (prompts suppressed)", message);
        return Ok(Flow::Continue);
    }
    let proceed = dialoguer::Confirm::new()
        .with_prompt(format!("{}", message.yellow()))
        .default(false)
        .interact()?;
    Ok(if proceed { Flow::Continue } else { Flow::Abort })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppressed_prompt_continues() {
        let flow = confirm_continue("3 issues found, continue?", true).unwrap();
        assert_eq!(flow, Flow::Continue);
    }

    #[test]
    fn test_abort_maps_to_normal_outcome() {
        // The job boundary translation: an abort decision becomes a normal
        // early-termination outcome rather than an error
        let outcome = match Flow::Abort {
            Flow::Continue => RunOutcome::Completed,
            Flow::Abort => RunOutcome::Aborted,
        };
        assert_eq!(outcome, RunOutcome::Aborted);
    }
}
