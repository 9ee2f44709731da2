//! Booking wizard state machine: tracks which step the user is on.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The steps of the booking wizard.
///
/// Progresses linearly: Welcome → OnBehalfOf → Identity → Payer → Provider →
/// Slot → Confirm → Submitted. `OnBehalfOf` is skipped when the requester is
/// booking for themself. `Abandoned` can be reached from any live step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BookingStep {
    Welcome,
    OnBehalfOf,
    Identity,
    Payer,
    Provider,
    Slot,
    Confirm,
    Submitted,
    Abandoned,
}

impl BookingStep {
    /// Whether this step is terminal (no further input accepted).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Submitted | Self::Abandoned)
    }

    /// The step after this one for the given requester type, if any.
    pub fn next(&self, for_self: bool) -> Option<BookingStep> {
        use BookingStep::*;
        match self {
            Welcome if for_self => Some(Identity),
            Welcome => Some(OnBehalfOf),
            OnBehalfOf => Some(Identity),
            Identity => Some(Payer),
            Payer => Some(Provider),
            Provider => Some(Slot),
            Slot => Some(Confirm),
            Confirm => Some(Submitted),
            Submitted | Abandoned => None,
        }
    }

    /// The step before this one for the given requester type, if any.
    pub fn previous(&self, for_self: bool) -> Option<BookingStep> {
        use BookingStep::*;
        match self {
            Welcome => None,
            OnBehalfOf => Some(Welcome),
            Identity if for_self => Some(Welcome),
            Identity => Some(OnBehalfOf),
            Payer => Some(Identity),
            Provider => Some(Payer),
            Slot => Some(Provider),
            Confirm => Some(Slot),
            Submitted | Abandoned => None,
        }
    }

    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: BookingStep, for_self: bool) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == BookingStep::Abandoned
            || self.next(for_self) == Some(target)
            || self.previous(for_self) == Some(target)
    }

    /// The full ordered path through the wizard for a requester type,
    /// from `Welcome` to `Submitted`.
    pub fn path(for_self: bool) -> Vec<BookingStep> {
        let mut steps = vec![BookingStep::Welcome];
        let mut current = BookingStep::Welcome;
        while let Some(next) = current.next(for_self) {
            steps.push(next);
            current = next;
        }
        steps
    }
}

impl Default for BookingStep {
    fn default() -> Self {
        Self::Welcome
    }
}

impl std::fmt::Display for BookingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Welcome => "welcome",
            Self::OnBehalfOf => "on_behalf_of",
            Self::Identity => "identity",
            Self::Payer => "payer",
            Self::Provider => "provider",
            Self::Slot => "slot",
            Self::Confirm => "confirm",
            Self::Submitted => "submitted",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

/// Wizard position: the current step and which steps have passed
/// validation. Owned by a single flow controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WizardState {
    pub step: BookingStep,
    pub validated: BTreeSet<BookingStep>,
}

impl WizardState {
    /// Mark the current step valid and move forward. Returns the new step,
    /// or `None` if there is nowhere to go.
    pub fn advance(&mut self, for_self: bool) -> Option<BookingStep> {
        let next = self.step.next(for_self)?;
        if !self.step.can_transition_to(next, for_self) {
            return None;
        }
        self.validated.insert(self.step);
        self.step = next;
        Some(next)
    }

    /// Move back one step. Returns the new step, or `None` at the first
    /// step or a terminal step.
    pub fn retreat(&mut self, for_self: bool) -> Option<BookingStep> {
        let previous = self.step.previous(for_self)?;
        if !self.step.can_transition_to(previous, for_self) {
            return None;
        }
        self.step = previous;
        Some(previous)
    }

    /// Leave the wizard without booking. Returns `false` if the current
    /// step is already terminal.
    pub fn abandon(&mut self) -> bool {
        if !self.step.can_transition_to(BookingStep::Abandoned, true) {
            return false;
        }
        self.step = BookingStep::Abandoned;
        true
    }

    /// Drop validity for `step` and every step after it.
    pub fn invalidate_from(&mut self, step: BookingStep) {
        self.validated.retain(|s| *s < step);
    }

    /// Position of the current step on the path, as `(index, total)`.
    /// Terminal `Abandoned` has no position.
    pub fn position(&self, for_self: bool) -> Option<(usize, usize)> {
        let path = BookingStep::path(for_self);
        let index = path.iter().position(|s| *s == self.step)?;
        Some((index, path.len()))
    }

    pub fn is_validated(&self, step: BookingStep) -> bool {
        self.validated.contains(&step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_path_skips_on_behalf_of() {
        use BookingStep::*;
        assert_eq!(
            BookingStep::path(true),
            vec![Welcome, Identity, Payer, Provider, Slot, Confirm, Submitted]
        );
    }

    #[test]
    fn dependent_path_includes_on_behalf_of() {
        use BookingStep::*;
        assert_eq!(
            BookingStep::path(false),
            vec![Welcome, OnBehalfOf, Identity, Payer, Provider, Slot, Confirm, Submitted]
        );
    }

    #[test]
    fn previous_inverts_next() {
        for for_self in [true, false] {
            let path = BookingStep::path(for_self);
            for pair in path.windows(2) {
                assert_eq!(pair[0].next(for_self), Some(pair[1]));
                if pair[1] != BookingStep::Submitted {
                    assert_eq!(pair[1].previous(for_self), Some(pair[0]));
                }
            }
        }
    }

    #[test]
    fn invalid_transitions() {
        use BookingStep::*;
        // Skip steps
        assert!(!Welcome.can_transition_to(Payer, true));
        assert!(!Identity.can_transition_to(Slot, false));
        // Skip on_behalf_of only when booking for self
        assert!(Welcome.can_transition_to(Identity, true));
        assert!(!Welcome.can_transition_to(Identity, false));
        // Terminal
        assert!(!Submitted.can_transition_to(Confirm, true));
        assert!(!Abandoned.can_transition_to(Welcome, true));
        // Self-transition
        assert!(!Payer.can_transition_to(Payer, true));
        // Abandon from anywhere live
        assert!(Slot.can_transition_to(Abandoned, false));
    }

    #[test]
    fn is_terminal() {
        use BookingStep::*;
        assert!(Submitted.is_terminal());
        assert!(Abandoned.is_terminal());
        assert!(!Welcome.is_terminal());
        assert!(!Confirm.is_terminal());
    }

    #[test]
    fn display_matches_serde() {
        use BookingStep::*;
        let steps = [
            Welcome, OnBehalfOf, Identity, Payer, Provider, Slot, Confirm, Submitted, Abandoned,
        ];
        for step in steps {
            let display = format!("{step}");
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(
                format!("\"{display}\""),
                json,
                "Display and serde should match for {step:?}"
            );
        }
    }

    #[test]
    fn wizard_advance_marks_validated() {
        let mut state = WizardState::default();
        assert_eq!(state.advance(true), Some(BookingStep::Identity));
        assert!(state.is_validated(BookingStep::Welcome));
        assert_eq!(state.advance(true), Some(BookingStep::Payer));
        assert!(state.is_validated(BookingStep::Identity));
        assert_eq!(state.position(true), Some((2, 7)));
    }

    #[test]
    fn wizard_retreat_stops_at_welcome() {
        let mut state = WizardState::default();
        assert_eq!(state.retreat(true), None);
        assert_eq!(state.step, BookingStep::Welcome);

        state.advance(false);
        assert_eq!(state.step, BookingStep::OnBehalfOf);
        assert_eq!(state.retreat(false), Some(BookingStep::Welcome));
    }

    #[test]
    fn wizard_abandon_only_from_live_steps() {
        let mut state = WizardState::default();
        state.advance(true);
        assert!(state.abandon());
        assert_eq!(state.step, BookingStep::Abandoned);

        assert!(!state.abandon());
        assert_eq!(state.advance(true), None);
        assert_eq!(state.retreat(true), None);
        assert!(state.validated.contains(&BookingStep::Welcome));
        assert!(!state.validated.contains(&BookingStep::Abandoned));
    }

    #[test]
    fn invalidate_from_drops_later_steps() {
        let mut state = WizardState::default();
        for _ in 0..4 {
            state.advance(true);
        }
        assert_eq!(state.step, BookingStep::Slot);
        state.invalidate_from(BookingStep::Payer);
        assert!(state.is_validated(BookingStep::Identity));
        assert!(!state.is_validated(BookingStep::Payer));
        assert!(!state.is_validated(BookingStep::Provider));
    }

    #[test]
    fn wizard_state_serde_roundtrip() {
        let mut state = WizardState::default();
        state.advance(false);
        state.advance(false);

        let json = serde_json::to_string(&state).unwrap();
        let parsed: WizardState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
        assert_eq!(parsed.step, BookingStep::Identity);
    }
}
