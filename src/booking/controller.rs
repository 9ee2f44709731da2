//! BookingFlow: sequences the wizard steps and gates forward progress on
//! per-step validity.
//!
//! The controller is a plain `&mut self` state machine. Remote work is split
//! into begin/complete pairs (`begin_fetch`/`complete_fetch`,
//! `begin_submit`/`complete_submit`) so a caller that shares the flow behind
//! a lock can release it while the directory call is in flight. Callers that
//! own the flow outright can use `load_current` and `submit`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    BookingDraft, BookingId, BookingRequest, ContactInfo, PatientDetails, Payer, Provider,
    ProviderFilter, Slot,
};
use super::state::{BookingStep, WizardState};
use super::validation::{StepContext, validate_step};
use crate::config::FlowConfig;
use crate::directory::BookingDirectory;
use crate::error::{DirectoryError, FieldError, FlowError, SubmissionError, ValidationError};

/// Which remote list a step depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    Payers,
    Providers,
    Slots,
}

impl FetchKind {
    /// The list that must be loaded before `step` can be completed.
    pub fn for_step(step: BookingStep) -> Option<FetchKind> {
        match step {
            BookingStep::Payer => Some(Self::Payers),
            BookingStep::Provider => Some(Self::Providers),
            BookingStep::Slot => Some(Self::Slots),
            _ => None,
        }
    }

    pub fn step(&self) -> BookingStep {
        match self {
            Self::Payers => BookingStep::Payer,
            Self::Providers => BookingStep::Provider,
            Self::Slots => BookingStep::Slot,
        }
    }
}

/// Load status of a remote list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ListStatus {
    Idle,
    Loading,
    Loaded,
    Failed { message: String, retryable: bool },
}

/// A list fetched from the directory for one step.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteList<T> {
    #[serde(flatten)]
    pub status: ListStatus,
    pub items: Vec<T>,
    #[serde(skip)]
    generation: u64,
}

impl<T> Default for RemoteList<T> {
    fn default() -> Self {
        Self {
            status: ListStatus::Idle,
            items: Vec::new(),
            generation: 0,
        }
    }
}

impl<T> RemoteList<T> {
    fn reset(&mut self) {
        self.status = ListStatus::Idle;
        self.items.clear();
        self.generation += 1;
    }
}

/// The directory call a fetch ticket stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRequest {
    Payers,
    Providers(ProviderFilter),
    Slots {
        provider_id: String,
        from: DateTime<Utc>,
    },
}

impl FetchRequest {
    /// Perform the directory call.
    pub async fn run(&self, directory: &dyn BookingDirectory) -> Result<Fetched, DirectoryError> {
        match self {
            Self::Payers => directory.list_payers().await.map(Fetched::Payers),
            Self::Providers(filter) => directory.list_providers(filter).await.map(Fetched::Providers),
            Self::Slots { provider_id, from } => directory
                .list_slots(provider_id, *from)
                .await
                .map(Fetched::Slots),
        }
    }
}

/// Items returned by a [`FetchRequest`].
#[derive(Debug, Clone)]
pub enum Fetched {
    Payers(Vec<Payer>),
    Providers(Vec<Provider>),
    Slots(Vec<Slot>),
}

/// Handed out by [`BookingFlow::begin_fetch`]; must be given back to
/// [`BookingFlow::complete_fetch`] with the outcome.
#[derive(Debug, Clone)]
pub struct FetchTicket {
    pub kind: FetchKind,
    pub request: FetchRequest,
    generation: u64,
}

/// What went wrong on the current step, kept until new input arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    Validation(ValidationError),
    Fetch {
        list: FetchKind,
        message: String,
        retryable: bool,
    },
    Submission(SubmissionError),
}

/// Serializable view of a flow for front ends.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub id: Uuid,
    pub step: BookingStep,
    /// `(index, total)` on the requester's path; absent once abandoned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<(usize, usize)>,
    pub validated: Vec<BookingStep>,
    pub draft: BookingDraft,
    pub payers: RemoteList<Payer>,
    pub providers: RemoteList<Provider>,
    pub slots: RemoteList<Slot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub submitting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<BookingId>,
}

/// One user's booking wizard: step state, the draft, and the lists the
/// steps render.
#[derive(Debug, Clone)]
pub struct BookingFlow {
    id: Uuid,
    config: FlowConfig,
    wizard: WizardState,
    draft: BookingDraft,
    payers: RemoteList<Payer>,
    providers: RemoteList<Provider>,
    slots: RemoteList<Slot>,
    step_error: Option<StepError>,
    submitting: bool,
    booking_id: Option<BookingId>,
}

impl BookingFlow {
    pub fn new(config: FlowConfig) -> Self {
        Self::with_id(Uuid::new_v4(), config)
    }

    pub fn with_id(id: Uuid, config: FlowConfig) -> Self {
        Self {
            id,
            config,
            wizard: WizardState::default(),
            draft: BookingDraft::default(),
            payers: RemoteList::default(),
            providers: RemoteList::default(),
            slots: RemoteList::default(),
            step_error: None,
            submitting: false,
            booking_id: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn step(&self) -> BookingStep {
        self.wizard.step
    }

    pub fn wizard(&self) -> &WizardState {
        &self.wizard
    }

    pub fn draft(&self) -> &BookingDraft {
        &self.draft
    }

    pub fn step_error(&self) -> Option<&StepError> {
        self.step_error.as_ref()
    }

    pub fn booking_id(&self) -> Option<&BookingId> {
        self.booking_id.as_ref()
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting
    }

    /// A submission or list fetch has been started and not yet completed.
    pub fn has_request_in_flight(&self) -> bool {
        self.submitting
            || [FetchKind::Payers, FetchKind::Providers, FetchKind::Slots]
                .into_iter()
                .any(|kind| self.list_status(kind) == &ListStatus::Loading)
    }

    pub fn list_status(&self, kind: FetchKind) -> &ListStatus {
        match kind {
            FetchKind::Payers => &self.payers.status,
            FetchKind::Providers => &self.providers.status,
            FetchKind::Slots => &self.slots.status,
        }
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            id: self.id,
            step: self.wizard.step,
            position: self.wizard.position(self.draft.for_self()),
            validated: self.wizard.validated.iter().copied().collect(),
            draft: self.draft.clone(),
            payers: self.payers.clone(),
            providers: self.providers.clone(),
            slots: self.slots.clone(),
            error: self.step_error.clone(),
            submitting: self.submitting,
            booking_id: self.booking_id.clone(),
        }
    }

    // ── Navigation ──────────────────────────────────────────────────

    /// Record who the appointment is for and move past the welcome step.
    pub fn select_intent(&mut self, is_for_self: bool) -> Result<BookingStep, FlowError> {
        self.ensure_step("select_intent", BookingStep::Welcome)?;

        if self.draft.is_for_self != Some(is_for_self) {
            self.wizard.invalidate_from(BookingStep::Welcome);
            if is_for_self {
                self.draft.patient = None;
            }
        }
        self.draft.is_for_self = Some(is_for_self);
        self.step_error = None;

        let next = self.move_forward()?;
        info!(flow_id = %self.id, is_for_self, step = %next, "Booking intent selected");
        Ok(next)
    }

    /// Move to the next step if the current one is complete.
    ///
    /// On failure nothing but the recorded step error changes.
    pub fn advance(&mut self) -> Result<BookingStep, FlowError> {
        self.ensure_live()?;
        let step = self.wizard.step;
        if step == BookingStep::Confirm {
            return Err(FlowError::WrongStep {
                operation: "advance",
                current: step,
            });
        }

        if let Some(kind) = FetchKind::for_step(step) {
            self.ensure_loaded(kind)?;
        }

        if let Err(err) = self.validate(step) {
            debug!(flow_id = %self.id, step = %step, error = %err, "Advance blocked");
            self.step_error = Some(StepError::Validation(err.clone()));
            return Err(err.into());
        }

        self.step_error = None;
        let next = self.move_forward()?;
        info!(flow_id = %self.id, from = %step, to = %next, "Booking step advanced");
        Ok(next)
    }

    /// Move to the previous step. A no-op on the first step.
    pub fn back(&mut self) -> Result<BookingStep, FlowError> {
        self.ensure_live()?;
        self.step_error = None;
        match self.wizard.retreat(self.draft.for_self()) {
            Some(previous) => {
                debug!(flow_id = %self.id, to = %previous, "Booking step back");
                Ok(previous)
            }
            None => Ok(self.wizard.step),
        }
    }

    /// End the flow without booking. The draft is discarded.
    pub fn abandon(&mut self) {
        let from = self.wizard.step;
        if !self.wizard.abandon() {
            return;
        }
        info!(flow_id = %self.id, step = %from, "Booking flow abandoned");
        self.draft = BookingDraft::default();
        self.payers.reset();
        self.providers.reset();
        self.slots.reset();
        self.step_error = None;
    }

    // ── Draft input ─────────────────────────────────────────────────

    pub fn set_patient(&mut self, patient: PatientDetails) -> Result<(), FlowError> {
        self.ensure_step("set_patient", BookingStep::OnBehalfOf)?;
        self.draft.patient = Some(patient);
        self.touched(BookingStep::OnBehalfOf);
        Ok(())
    }

    pub fn set_contact(&mut self, contact: ContactInfo) -> Result<(), FlowError> {
        self.ensure_step("set_contact", BookingStep::Identity)?;
        self.draft.contact = Some(contact);
        self.touched(BookingStep::Identity);
        Ok(())
    }

    /// Choose the payer. A different payer invalidates the provider and
    /// slot choices along with their lists.
    pub fn select_payer(
        &mut self,
        payer_id: impl Into<String>,
        member_id: Option<String>,
    ) -> Result<(), FlowError> {
        self.ensure_step("select_payer", BookingStep::Payer)?;
        let payer_id = payer_id.into();
        if self.draft.payer_id.as_deref() != Some(payer_id.as_str()) {
            self.draft.clear_provider();
            self.providers.reset();
            self.slots.reset();
        }
        self.draft.payer_id = Some(payer_id);
        self.draft.member_id = member_id.filter(|m| !m.is_empty());
        self.touched(BookingStep::Payer);
        Ok(())
    }

    /// Choose the provider. A different provider invalidates the slot
    /// choice and slot list.
    pub fn select_provider(&mut self, provider_id: impl Into<String>) -> Result<(), FlowError> {
        self.ensure_step("select_provider", BookingStep::Provider)?;
        let provider_id = provider_id.into();
        if self.draft.provider_id.as_deref() != Some(provider_id.as_str()) {
            self.draft.slot = None;
            self.slots.reset();
        }
        self.draft.provider_id = Some(provider_id);
        self.touched(BookingStep::Provider);
        Ok(())
    }

    /// Choose a slot from the loaded slot list.
    pub fn select_slot(&mut self, slot_id: &str) -> Result<(), FlowError> {
        self.ensure_step("select_slot", BookingStep::Slot)?;
        let Some(slot) = self.slots.items.iter().find(|s| s.id == slot_id).cloned() else {
            let err = ValidationError {
                step: BookingStep::Slot,
                fields: vec![FieldError::new("slot", "slot is no longer offered")],
            };
            self.step_error = Some(StepError::Validation(err.clone()));
            return Err(err.into());
        };
        self.draft.slot = Some(slot);
        self.touched(BookingStep::Slot);
        Ok(())
    }

    pub fn set_reason(&mut self, reason: Option<String>) -> Result<(), FlowError> {
        self.ensure_step("set_reason", BookingStep::Confirm)?;
        self.draft.reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        self.step_error = None;
        Ok(())
    }

    // ── Remote lists ────────────────────────────────────────────────

    /// Mark the current step's list as loading and describe the call to
    /// make.
    pub fn begin_fetch(&mut self) -> Result<FetchTicket, FlowError> {
        self.ensure_live()?;
        let step = self.wizard.step;
        let kind = FetchKind::for_step(step).ok_or(FlowError::NothingToLoad { step })?;

        if self.list_status(kind) == &ListStatus::Loading {
            return Err(FlowError::FetchInFlight { step });
        }

        let now = Utc::now();
        let request = match kind {
            FetchKind::Payers => FetchRequest::Payers,
            FetchKind::Providers => {
                let payer_id = self.draft.payer_id.clone().ok_or_else(|| {
                    FlowError::Validation(missing(BookingStep::Payer, "payer_id"))
                })?;
                let mut filter = ProviderFilter::for_payer(payer_id);
                if self.config.only_available_providers {
                    filter = filter.available_after(now);
                }
                FetchRequest::Providers(filter)
            }
            FetchKind::Slots => {
                let provider_id = self.draft.provider_id.clone().ok_or_else(|| {
                    FlowError::Validation(missing(BookingStep::Provider, "provider_id"))
                })?;
                FetchRequest::Slots {
                    provider_id,
                    from: now,
                }
            }
        };

        let generation = match kind {
            FetchKind::Payers => start_loading(&mut self.payers),
            FetchKind::Providers => start_loading(&mut self.providers),
            FetchKind::Slots => start_loading(&mut self.slots),
        };
        if matches!(self.step_error, Some(StepError::Fetch { list, .. }) if list == kind) {
            self.step_error = None;
        }

        debug!(flow_id = %self.id, list = ?kind, "Fetch started");
        Ok(FetchTicket {
            kind,
            request,
            generation,
        })
    }

    /// Store the outcome of a fetch. Returns `Ok(false)` when the ticket is
    /// stale (the list was reset meanwhile) and the outcome was dropped.
    pub fn complete_fetch(
        &mut self,
        ticket: FetchTicket,
        outcome: Result<Fetched, DirectoryError>,
    ) -> Result<bool, FlowError> {
        let current_generation = match ticket.kind {
            FetchKind::Payers => self.payers.generation,
            FetchKind::Providers => self.providers.generation,
            FetchKind::Slots => self.slots.generation,
        };
        if current_generation != ticket.generation
            || self.list_status(ticket.kind) != &ListStatus::Loading
        {
            debug!(flow_id = %self.id, list = ?ticket.kind, "Discarding stale fetch result");
            return Ok(false);
        }

        match outcome {
            Ok(fetched) => {
                let count = match fetched {
                    Fetched::Payers(items) => finish_loading(&mut self.payers, items),
                    Fetched::Providers(items) => finish_loading(&mut self.providers, items),
                    Fetched::Slots(items) => finish_loading(&mut self.slots, items),
                };
                debug!(flow_id = %self.id, list = ?ticket.kind, count, "Fetch complete");
                Ok(true)
            }
            Err(err) => {
                let message = err.to_string();
                let retryable = err.is_retryable();
                warn!(flow_id = %self.id, list = ?ticket.kind, error = %message, "Fetch failed");
                let failed = ListStatus::Failed {
                    message: message.clone(),
                    retryable,
                };
                match ticket.kind {
                    FetchKind::Payers => self.payers.status = failed,
                    FetchKind::Providers => self.providers.status = failed,
                    FetchKind::Slots => self.slots.status = failed,
                }
                let step = ticket.kind.step();
                if self.wizard.step == step {
                    self.step_error = Some(StepError::Fetch {
                        list: ticket.kind,
                        message: message.clone(),
                        retryable,
                    });
                }
                Err(FlowError::FetchFailed {
                    step,
                    message,
                    retryable,
                })
            }
        }
    }

    /// Load the current step's list, holding the flow for the whole call.
    pub async fn load_current(&mut self, directory: &dyn BookingDirectory) -> Result<(), FlowError> {
        let ticket = self.begin_fetch()?;
        let outcome = ticket.request.run(directory).await;
        self.complete_fetch(ticket, outcome).map(|_| ())
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Validate the whole draft and mark a submission in flight.
    pub fn begin_submit(&mut self) -> Result<BookingRequest, FlowError> {
        if self.submitting {
            return Err(FlowError::SubmissionInFlight);
        }
        self.ensure_step("submit", BookingStep::Confirm)?;

        if let Err(err) = self.validate(BookingStep::Confirm) {
            self.step_error = Some(StepError::Validation(err.clone()));
            return Err(err.into());
        }
        let request = BookingRequest::from_draft(&self.draft)
            .ok_or_else(|| FlowError::Validation(missing(BookingStep::Confirm, "draft")))?;

        self.submitting = true;
        self.step_error = None;
        info!(
            flow_id = %self.id,
            provider_id = %request.provider_id,
            slot_id = %request.slot.id,
            "Submitting booking"
        );
        Ok(request)
    }

    /// Record the outcome of a submission. On failure the flow stays on
    /// the confirm step with the draft intact.
    pub fn complete_submit(
        &mut self,
        outcome: Result<BookingId, DirectoryError>,
    ) -> Result<BookingId, FlowError> {
        self.submitting = false;
        match outcome {
            Ok(booking_id) => {
                if self.wizard.step != BookingStep::Confirm {
                    warn!(
                        flow_id = %self.id,
                        booking_id = %booking_id,
                        step = %self.wizard.step,
                        "Booking created after flow left the confirm step"
                    );
                    return Ok(booking_id);
                }
                self.wizard.advance(self.draft.for_self());
                self.booking_id = Some(booking_id.clone());
                info!(flow_id = %self.id, booking_id = %booking_id, "Booking submitted");
                Ok(booking_id)
            }
            Err(err) => {
                let submission = SubmissionError::from(&err);
                warn!(
                    flow_id = %self.id,
                    error = %submission.message,
                    retryable = submission.retryable,
                    "Booking submission failed"
                );
                if self.wizard.step == BookingStep::Confirm {
                    self.step_error = Some(StepError::Submission(submission.clone()));
                }
                Err(submission.into())
            }
        }
    }

    /// Submit the draft, holding the flow for the whole call.
    pub async fn submit(&mut self, directory: &dyn BookingDirectory) -> Result<BookingId, FlowError> {
        let request = self.begin_submit()?;
        let outcome = directory.create_booking(&request).await;
        self.complete_submit(outcome)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn validate(&self, step: BookingStep) -> Result<(), ValidationError> {
        let ctx = StepContext {
            payers: &self.payers.items,
            providers: &self.providers.items,
            slots: &self.slots.items,
            now: Utc::now(),
        };
        validate_step(step, &self.draft, &ctx)
    }

    fn move_forward(&mut self) -> Result<BookingStep, FlowError> {
        let current = self.wizard.step;
        self.wizard
            .advance(self.draft.for_self())
            .ok_or(FlowError::Finished { step: current })
    }

    fn ensure_live(&self) -> Result<(), FlowError> {
        if self.wizard.step.is_terminal() {
            return Err(FlowError::Finished {
                step: self.wizard.step,
            });
        }
        if self.submitting {
            return Err(FlowError::SubmissionInFlight);
        }
        Ok(())
    }

    fn ensure_step(&self, operation: &'static str, expected: BookingStep) -> Result<(), FlowError> {
        self.ensure_live()?;
        if self.wizard.step != expected {
            return Err(FlowError::WrongStep {
                operation,
                current: self.wizard.step,
            });
        }
        Ok(())
    }

    fn ensure_loaded(&self, kind: FetchKind) -> Result<(), FlowError> {
        let step = kind.step();
        match self.list_status(kind) {
            ListStatus::Loaded => Ok(()),
            ListStatus::Loading => Err(FlowError::FetchInFlight { step }),
            ListStatus::Idle => Err(FlowError::NotLoaded { step }),
            ListStatus::Failed { message, retryable } => Err(FlowError::FetchFailed {
                step,
                message: message.clone(),
                retryable: *retryable,
            }),
        }
    }

    /// New input on `step`: its validity (and everything after) is stale.
    fn touched(&mut self, step: BookingStep) {
        self.wizard.invalidate_from(step);
        self.step_error = None;
    }
}

fn start_loading<T>(list: &mut RemoteList<T>) -> u64 {
    list.generation += 1;
    list.status = ListStatus::Loading;
    list.generation
}

fn finish_loading<T>(list: &mut RemoteList<T>, items: Vec<T>) -> usize {
    list.items = items;
    list.status = ListStatus::Loaded;
    list.items.len()
}

fn missing(step: BookingStep, field: &'static str) -> ValidationError {
    ValidationError {
        step,
        fields: vec![FieldError::new(field, "required")],
    }
}
