//! Booking draft and directory data models.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// An insurance payer selectable during booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// A provider that can be scheduled under some payer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    #[serde(default = "default_true")]
    pub accepting_new_patients: bool,
}

/// An open appointment slot for a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: String,
    pub provider_id: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl Slot {
    pub fn duration_minutes(&self) -> i64 {
        (self.ends_at - self.starts_at).num_minutes()
    }
}

/// Filter for listing bookable providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFilter {
    /// Only providers with an active contract for this payer.
    pub payer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    /// Only providers with at least one open slot starting after this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_after: Option<DateTime<Utc>>,
}

impl ProviderFilter {
    pub fn for_payer(payer_id: impl Into<String>) -> Self {
        Self {
            payer_id: payer_id.into(),
            specialty: None,
            available_after: None,
        }
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = Some(specialty.into());
        self
    }

    pub fn available_after(mut self, at: DateTime<Utc>) -> Self {
        self.available_after = Some(at);
        self
    }
}

/// The person the appointment is for, when booking on someone's behalf.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientDetails {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<NaiveDate>,
    /// Relationship of the requester to the patient, e.g. "parent".
    #[serde(default)]
    pub relationship: String,
}

/// Contact details of the person making the booking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    /// Required when booking for self.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<NaiveDate>,
}

/// Selections accumulated across the wizard steps.
///
/// Mutated one step at a time by the flow controller; turned into a
/// [`BookingRequest`] at submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDraft {
    /// `None` until intent is chosen on the welcome step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_for_self: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient: Option<PatientDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<Slot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BookingDraft {
    /// Booking for self unless intent says otherwise.
    pub fn for_self(&self) -> bool {
        self.is_for_self.unwrap_or(true)
    }

    /// Clear the provider selection and everything that depends on it.
    pub fn clear_provider(&mut self) {
        self.provider_id = None;
        self.slot = None;
    }
}

/// A finalized draft, ready to hand to the booking directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub booked_for_self: bool,
    pub patient: PatientDetails,
    pub contact: ContactInfo,
    pub payer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    pub provider_id: String,
    pub slot: Slot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BookingRequest {
    /// Build a request from a draft. Returns `None` if any required
    /// selection is missing; field-level checks belong to validation.
    pub fn from_draft(draft: &BookingDraft) -> Option<Self> {
        let booked_for_self = draft.is_for_self?;
        let contact = draft.contact.clone()?;
        let patient = if booked_for_self {
            PatientDetails {
                first_name: contact.first_name.clone(),
                last_name: contact.last_name.clone(),
                date_of_birth: contact.date_of_birth,
                relationship: "self".to_string(),
            }
        } else {
            draft.patient.clone()?
        };

        Some(Self {
            booked_for_self,
            patient,
            contact,
            payer_id: draft.payer_id.clone()?,
            member_id: draft.member_id.clone(),
            provider_id: draft.provider_id.clone()?,
            slot: draft.slot.clone()?,
            reason: draft.reason.clone(),
        })
    }
}

/// Opaque identifier returned when a booking is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingId(pub String);

impl std::fmt::Display for BookingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_true() -> bool {
    true
}
