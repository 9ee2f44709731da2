//! Booking wizard: the patient-facing appointment booking flow.
//!
//! A user moves through intent, (optionally) on-behalf-of details, identity,
//! payer, provider and slot steps, then confirms and submits. The
//! controller owns the step state and the draft; the session registry keeps
//! one controller per live session and talks to the booking directory.

pub mod controller;
pub mod model;
pub mod routes;
pub mod session;
pub mod state;
pub mod validation;

pub use controller::{BookingFlow, FetchKind, FlowSnapshot, ListStatus, StepError};
pub use model::{
    BookingDraft, BookingId, BookingRequest, ContactInfo, PatientDetails, Payer, Provider,
    ProviderFilter, Slot,
};
pub use routes::{BookingRouteState, booking_routes};
pub use session::{SessionRegistry, spawn_expiry_task};
pub use state::{BookingStep, WizardState};
