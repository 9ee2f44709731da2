//! Per-step validation rules for the booking wizard.
//!
//! Every rule that gates forward progress lives here so the controller and
//! any front end agree on what "complete" means for a step.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

use super::model::{BookingDraft, ContactInfo, PatientDetails, Payer, Provider, Slot};
use super::state::BookingStep;
use crate::error::{FieldError, ValidationError};

/// Maximum length of the free-text reason for visit.
pub const MAX_REASON_LEN: usize = 500;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+?[0-9 ().\-]+$").unwrap());

/// Lists loaded from the directory that selections are checked against.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub payers: &'a [Payer],
    pub providers: &'a [Provider],
    pub slots: &'a [Slot],
    pub now: DateTime<Utc>,
}

/// Check that `step`'s required fields are present and well-formed.
pub fn validate_step(
    step: BookingStep,
    draft: &BookingDraft,
    ctx: &StepContext<'_>,
) -> Result<(), ValidationError> {
    let mut fields = Vec::new();
    match step {
        BookingStep::Welcome => {
            if draft.is_for_self.is_none() {
                fields.push(FieldError::new("is_for_self", "choose who the appointment is for"));
            }
        }
        BookingStep::OnBehalfOf => match &draft.patient {
            Some(patient) => check_patient(patient, ctx.now, &mut fields),
            None => fields.push(FieldError::new("patient", "required")),
        },
        BookingStep::Identity => match &draft.contact {
            Some(contact) => check_contact(contact, draft.for_self(), ctx.now, &mut fields),
            None => fields.push(FieldError::new("contact", "required")),
        },
        BookingStep::Payer => match draft.payer_id.as_deref() {
            None => fields.push(FieldError::new("payer_id", "required")),
            Some(id) => match ctx.payers.iter().find(|p| p.id == id) {
                None => fields.push(FieldError::new("payer_id", "unknown payer")),
                Some(payer) if !payer.active => {
                    fields.push(FieldError::new("payer_id", "payer is not accepting bookings"))
                }
                Some(_) => {
                    if let Some(member_id) = draft.member_id.as_deref() {
                        if member_id.trim().is_empty() {
                            fields.push(FieldError::new("member_id", "must not be blank"));
                        }
                    }
                }
            },
        },
        BookingStep::Provider => match draft.provider_id.as_deref() {
            None => fields.push(FieldError::new("provider_id", "required")),
            Some(id) if !ctx.providers.iter().any(|p| p.id == id) => {
                fields.push(FieldError::new("provider_id", "provider not bookable for payer"))
            }
            Some(_) => {}
        },
        BookingStep::Slot => match &draft.slot {
            None => fields.push(FieldError::new("slot", "required")),
            Some(slot) => {
                if !ctx.slots.iter().any(|s| s.id == slot.id) {
                    fields.push(FieldError::new("slot", "slot is no longer offered"));
                } else if Some(slot.provider_id.as_str()) != draft.provider_id.as_deref() {
                    fields.push(FieldError::new("slot", "slot belongs to another provider"));
                } else if slot.starts_at <= ctx.now {
                    fields.push(FieldError::new("slot", "slot has already started"));
                }
            }
        },
        BookingStep::Confirm => {
            let path = BookingStep::path(draft.for_self());
            for earlier in path.into_iter().take_while(|s| *s != BookingStep::Confirm) {
                if let Err(err) = validate_step(earlier, draft, ctx) {
                    fields.extend(err.fields);
                }
            }
            if let Some(reason) = &draft.reason {
                if reason.chars().count() > MAX_REASON_LEN {
                    fields.push(FieldError::new(
                        "reason",
                        format!("must be at most {MAX_REASON_LEN} characters"),
                    ));
                }
            }
        }
        BookingStep::Submitted | BookingStep::Abandoned => {}
    }

    if fields.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { step, fields })
    }
}

fn check_patient(patient: &PatientDetails, now: DateTime<Utc>, fields: &mut Vec<FieldError>) {
    require_text("patient.first_name", &patient.first_name, fields);
    require_text("patient.last_name", &patient.last_name, fields);
    require_text("patient.relationship", &patient.relationship, fields);
    check_birth_date("patient.date_of_birth", patient.date_of_birth, now, fields);
}

fn check_contact(
    contact: &ContactInfo,
    for_self: bool,
    now: DateTime<Utc>,
    fields: &mut Vec<FieldError>,
) {
    require_text("contact.first_name", &contact.first_name, fields);
    require_text("contact.last_name", &contact.last_name, fields);

    let email = contact.email.trim();
    if email.is_empty() {
        fields.push(FieldError::new("contact.email", "required"));
    } else if !is_valid_email(email) {
        fields.push(FieldError::new("contact.email", "invalid email address"));
    }

    let phone = contact.phone.trim();
    if phone.is_empty() {
        fields.push(FieldError::new("contact.phone", "required"));
    } else if !is_valid_phone(phone) {
        fields.push(FieldError::new("contact.phone", "invalid phone number"));
    }

    if for_self {
        check_birth_date("contact.date_of_birth", contact.date_of_birth, now, fields);
    }
}

fn require_text(field: &'static str, value: &str, fields: &mut Vec<FieldError>) {
    if value.trim().is_empty() {
        fields.push(FieldError::new(field, "required"));
    }
}

fn check_birth_date(
    field: &'static str,
    date: Option<NaiveDate>,
    now: DateTime<Utc>,
    fields: &mut Vec<FieldError>,
) {
    match date {
        None => fields.push(FieldError::new(field, "required")),
        Some(d) if d > now.date_naive() => fields.push(FieldError::new(field, "is in the future")),
        Some(d) if d < NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN) => {
            fields.push(FieldError::new(field, "is too far in the past"))
        }
        Some(_) => {}
    }
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Accepts common punctuation; requires 7 to 15 digits (E.164 bound).
pub fn is_valid_phone(phone: &str) -> bool {
    if !PHONE_RE.is_match(phone) {
        return false;
    }
    let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
    (7..=15).contains(&digits)
}
