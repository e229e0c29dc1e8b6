//! Wizard state machine: step cursor plus the data captured so far.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::destinations::DestinationNode;
use crate::error::{SubmitError, ValidationError};

/// Maximum number of additional photos per visit.
pub const MAX_ADDITIONAL_PHOTOS: usize = 3;

/// Opaque reference to an image held by the host (file path, upload id...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(pub String);

impl ImageRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Visitor identity as printed on the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFields {
    #[serde(default, alias = "nombre")]
    pub first_name: String,
    #[serde(default, alias = "apellido_paterno")]
    pub paternal_surname: String,
    #[serde(default, alias = "apellido_materno")]
    pub maternal_surname: String,
}

impl IdentityFields {
    pub fn new(
        first_name: impl Into<String>,
        paternal_surname: impl Into<String>,
        maternal_surname: impl Into<String>,
    ) -> Self {
        Self {
            first_name: first_name.into(),
            paternal_surname: paternal_surname.into(),
            maternal_surname: maternal_surname.into(),
        }
    }

    /// First required field that is blank. The maternal surname is optional.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.first_name.trim().is_empty() {
            Some("first_name")
        } else if self.paternal_surname.trim().is_empty() {
            Some("paternal_surname")
        } else {
            None
        }
    }

    pub fn is_blank(&self) -> bool {
        self.first_name.trim().is_empty()
            && self.paternal_surname.trim().is_empty()
            && self.maternal_surname.trim().is_empty()
    }

    /// Fill blank fields from `other`, keeping anything already typed.
    pub fn fill_blanks_from(&mut self, other: &IdentityFields) {
        for (mine, theirs) in [
            (&mut self.first_name, &other.first_name),
            (&mut self.paternal_surname, &other.paternal_surname),
            (&mut self.maternal_surname, &other.maternal_surname),
        ] {
            if mine.trim().is_empty() {
                *mine = theirs.trim().to_string();
            }
        }
    }
}

/// The destination chosen in the tree, copied out of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedDestination {
    pub id: i64,
    pub name: String,
    /// Names from the root down to this node.
    pub path: Vec<String>,
}

impl SelectedDestination {
    pub fn from_path(nodes: &[&DestinationNode]) -> Option<Self> {
        let last = nodes.last()?;
        Some(Self {
            id: last.id,
            name: last.name.clone(),
            path: nodes.iter().map(|n| n.name.clone()).collect(),
        })
    }
}

/// Where the final submission stands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubmissionState {
    #[default]
    NotSubmitted,
    Submitting,
    Submitted,
    Failed(SubmitError),
}

/// One registration session.
///
/// `current_step` is 1-based and ranges over `1..=total_steps + 1`, where
/// `total_steps + 1` is the terminal "complete" slot. Step guards live in the
/// flow policy; the transitions here only enforce the bounds.
#[derive(Debug, Clone)]
pub struct WizardState {
    session_id: Uuid,
    current_step: usize,
    total_steps: usize,
    phone: String,
    phone_verified: bool,
    identity: IdentityFields,
    document_image: Option<ImageRef>,
    additional_photos: Vec<ImageRef>,
    selected_destination: Option<SelectedDestination>,
    free_text_destination: String,
    submission: SubmissionState,
    last_error: Option<String>,
}

impl WizardState {
    pub fn new(total_steps: usize) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            current_step: 1,
            total_steps: total_steps.max(1),
            phone: String::new(),
            phone_verified: false,
            identity: IdentityFields::default(),
            document_image: None,
            additional_photos: Vec::new(),
            selected_destination: None,
            free_text_destination: String::new(),
            submission: SubmissionState::NotSubmitted,
            last_error: None,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn is_complete(&self) -> bool {
        self.current_step == self.total_steps + 1
    }

    pub fn phone(&self) -> &str {
        &self.phone
    }

    pub fn phone_verified(&self) -> bool {
        self.phone_verified
    }

    pub fn identity(&self) -> &IdentityFields {
        &self.identity
    }

    pub fn document_image(&self) -> Option<&ImageRef> {
        self.document_image.as_ref()
    }

    pub fn additional_photos(&self) -> &[ImageRef] {
        &self.additional_photos
    }

    pub fn selected_destination(&self) -> Option<&SelectedDestination> {
        self.selected_destination.as_ref()
    }

    pub fn free_text_destination(&self) -> &str {
        &self.free_text_destination
    }

    pub fn submission(&self) -> &SubmissionState {
        &self.submission
    }

    /// Last failure, as text for the current step to display.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether a destination is present in some form.
    pub fn has_any_destination(&self) -> bool {
        self.selected_destination.is_some() || !self.free_text_destination.trim().is_empty()
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Move one step forward, up to the terminal slot. Returns `false` when
    /// already complete.
    pub fn advance(&mut self) -> bool {
        if self.is_complete() {
            return false;
        }
        self.current_step += 1;
        true
    }

    /// Move one step back. No-op at step 1, while submitting, or once
    /// complete.
    pub fn retreat(&mut self) -> bool {
        if self.current_step <= 1
            || self.is_complete()
            || self.submission == SubmissionState::Submitting
        {
            return false;
        }
        self.current_step -= 1;
        true
    }

    /// Discard everything and return to step 1 under a fresh session id.
    pub fn reset(&mut self) {
        *self = Self::new(self.total_steps);
    }

    // ── Setters ─────────────────────────────────────────────────────

    /// Store a normalized phone. Changing the number drops verification.
    pub fn set_phone(&mut self, phone: String) {
        if phone != self.phone {
            self.phone = phone;
            self.phone_verified = false;
        }
    }

    pub fn mark_phone_verified(&mut self) {
        self.phone_verified = !self.phone.is_empty();
    }

    pub fn set_identity(&mut self, identity: IdentityFields) {
        self.identity = identity;
    }

    pub(crate) fn identity_mut(&mut self) -> &mut IdentityFields {
        &mut self.identity
    }

    pub fn set_document_image(&mut self, image: Option<ImageRef>) {
        self.document_image = image;
    }

    pub fn add_photo(&mut self, image: ImageRef) -> Result<(), ValidationError> {
        if self.additional_photos.len() >= MAX_ADDITIONAL_PHOTOS {
            return Err(ValidationError::TooManyPhotos {
                max: MAX_ADDITIONAL_PHOTOS,
            });
        }
        self.additional_photos.push(image);
        Ok(())
    }

    pub fn remove_photo(&mut self, index: usize) -> Result<ImageRef, ValidationError> {
        if index >= self.additional_photos.len() {
            return Err(ValidationError::NoSuchPhoto(index));
        }
        Ok(self.additional_photos.remove(index))
    }

    pub fn select_destination(&mut self, destination: Option<SelectedDestination>) {
        self.selected_destination = destination;
    }

    pub fn set_free_text_destination(&mut self, text: impl Into<String>) {
        self.free_text_destination = text.into();
    }

    pub fn set_last_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Enter `Submitting`. Rejected while a submission is in flight or after
    /// success.
    pub(crate) fn begin_submission(&mut self) -> Result<(), ValidationError> {
        match self.submission {
            SubmissionState::Submitting => Err(ValidationError::SubmissionInFlight),
            SubmissionState::Submitted => Err(ValidationError::AlreadyComplete),
            SubmissionState::NotSubmitted | SubmissionState::Failed(_) => {
                self.submission = SubmissionState::Submitting;
                Ok(())
            }
        }
    }

    /// Record the outcome. Success moves to the terminal slot; failure stays
    /// on the current step with every captured field intact.
    pub(crate) fn finish_submission(&mut self, outcome: Result<(), SubmitError>) {
        match outcome {
            Ok(()) => {
                self.submission = SubmissionState::Submitted;
                self.last_error = None;
                self.current_step = self.total_steps + 1;
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                self.submission = SubmissionState::Failed(e);
            }
        }
    }
}
