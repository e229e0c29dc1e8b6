//! Flow policies: what differs between the generic and kiosk wizards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::ValidationError;
use crate::session::SessionContext;

use super::state::WizardState;
use super::submit::VisitPayload;

/// What a given step captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Phone,
    Document,
    Identity,
    Destination,
    DestinationLabel,
    Photos,
    Confirmation,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Phone => "phone",
            Self::Document => "document",
            Self::Identity => "identity",
            Self::Destination => "destination",
            Self::DestinationLabel => "destination_label",
            Self::Photos => "photos",
            Self::Confirmation => "confirmation",
        };
        write!(f, "{s}")
    }
}

/// How the visit destination must be supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationRule {
    /// A leaf of the tree must be selected; free text is ignored.
    LeafOnly,
    /// Any tree node, or free text alone.
    TreeOrFreeText,
    /// A tree node plus a free-text label (e.g. house number).
    TreeAndFreeText,
}

impl DestinationRule {
    /// Whether a non-leaf node may be confirmed as the destination.
    pub fn allows_inner_nodes(&self) -> bool {
        !matches!(self, Self::LeafOnly)
    }

    /// Check the destination captured in `state` against this rule.
    pub fn check(&self, state: &WizardState) -> Result<(), ValidationError> {
        let has_tree = state.selected_destination().is_some();
        let has_text = !state.free_text_destination().trim().is_empty();
        match self {
            Self::LeafOnly if !has_tree => Err(ValidationError::MissingDestination),
            Self::TreeOrFreeText if !state.has_any_destination() => {
                Err(ValidationError::MissingDestination)
            }
            Self::TreeAndFreeText if !has_tree => Err(ValidationError::MissingDestination),
            Self::TreeAndFreeText if !has_text => Err(ValidationError::MissingDestinationLabel),
            _ => Ok(()),
        }
    }
}

/// Parameters of one wizard flow.
pub trait WizardPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Ordered steps; step `n` is `steps()[n - 1]`.
    fn steps(&self) -> &[StepKind];

    fn destination_rule(&self) -> DestinationRule;

    /// Absolute URL the visit is posted to.
    fn endpoint(&self, config: &BackendConfig) -> String;

    /// Build the outbound request from a ready state.
    fn build_payload(
        &self,
        state: &WizardState,
        session: &SessionContext,
        now: DateTime<Utc>,
    ) -> Result<VisitPayload, ValidationError>;

    fn total_steps(&self) -> usize {
        self.steps().len()
    }

    /// Kind of the 1-based `step`, `None` for the terminal slot.
    fn step_kind(&self, step: usize) -> Option<StepKind> {
        step.checked_sub(1).and_then(|i| self.steps().get(i)).copied()
    }

    /// Whether `state` may leave its current step.
    ///
    /// Leaving into the confirmation step also requires the whole visit to be
    /// ready, so confirmation is never reached without a destination.
    fn check_advance(&self, state: &WizardState) -> Result<(), ValidationError> {
        let step = state.current_step();
        match self.step_kind(step) {
            Some(StepKind::Phone) if !state.phone_verified() => {
                return Err(ValidationError::PhoneNotVerified);
            }
            Some(StepKind::Document) if state.document_image().is_none() => {
                return Err(ValidationError::MissingDocument);
            }
            Some(StepKind::Identity) => {
                if let Some(field) = state.identity().missing_field() {
                    return Err(ValidationError::MissingIdentity { field });
                }
            }
            Some(StepKind::Destination) => match self.destination_rule().check(state) {
                // The label has its own step when the flow has one.
                Err(ValidationError::MissingDestinationLabel)
                    if self.steps().contains(&StepKind::DestinationLabel) => {}
                other => other?,
            },
            Some(StepKind::DestinationLabel) if state.free_text_destination().trim().is_empty() => {
                return Err(ValidationError::MissingDestinationLabel);
            }
            None => return Err(ValidationError::AlreadyComplete),
            _ => {}
        }

        if self.step_kind(step + 1) == Some(StepKind::Confirmation) {
            self.check_ready(state)?;
        }
        Ok(())
    }

    /// Full check run before confirmation and before submitting.
    fn check_ready(&self, state: &WizardState) -> Result<(), ValidationError> {
        if !state.phone_verified() {
            return Err(ValidationError::PhoneNotVerified);
        }
        if self.steps().contains(&StepKind::Document) && state.document_image().is_none() {
            return Err(ValidationError::MissingDocument);
        }
        if let Some(field) = state.identity().missing_field() {
            return Err(ValidationError::MissingIdentity { field });
        }
        self.destination_rule().check(state)
    }
}

/// Which registration endpoint a flow posts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitEndpoint {
    Standard,
    Kiosk,
}

/// Data-driven `WizardPolicy`; variants differ only in their fields.
#[derive(Debug, Clone)]
pub struct FlowPolicy {
    name: String,
    steps: Vec<StepKind>,
    destination_rule: DestinationRule,
    endpoint: VisitEndpoint,
    origin: Option<String>,
}

impl FlowPolicy {
    pub fn new(
        name: impl Into<String>,
        steps: Vec<StepKind>,
        destination_rule: DestinationRule,
        endpoint: VisitEndpoint,
    ) -> Self {
        Self {
            name: name.into(),
            steps,
            destination_rule,
            endpoint,
            origin: None,
        }
    }

    /// Guard-house flow: six steps, destination from the tree or typed.
    pub fn generic() -> Self {
        Self::new(
            "generic",
            vec![
                StepKind::Phone,
                StepKind::Document,
                StepKind::Identity,
                StepKind::Destination,
                StepKind::Photos,
                StepKind::Confirmation,
            ],
            DestinationRule::TreeOrFreeText,
            VisitEndpoint::Standard,
        )
    }

    /// Lomas Country walk-up kiosk: the phone is picked from pre-registered
    /// numbers and the tree selection is followed by a label step.
    pub fn lomas_country() -> Self {
        Self::new(
            "lomas_country",
            vec![
                StepKind::Phone,
                StepKind::Document,
                StepKind::Identity,
                StepKind::Destination,
                StepKind::DestinationLabel,
                StepKind::Photos,
                StepKind::Confirmation,
            ],
            DestinationRule::TreeAndFreeText,
            VisitEndpoint::Kiosk,
        )
        .with_origin("kiosco")
    }

    pub fn with_destination_rule(mut self, rule: DestinationRule) -> Self {
        self.destination_rule = rule;
        self
    }

    /// Tag sent as `origen` with every visit.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

impl WizardPolicy for FlowPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn steps(&self) -> &[StepKind] {
        &self.steps
    }

    fn destination_rule(&self) -> DestinationRule {
        self.destination_rule
    }

    fn endpoint(&self, config: &BackendConfig) -> String {
        match self.endpoint {
            VisitEndpoint::Standard => config.url(&config.visit_path),
            VisitEndpoint::Kiosk => config.url(&config.kiosk_visit_path),
        }
    }

    fn build_payload(
        &self,
        state: &WizardState,
        session: &SessionContext,
        now: DateTime<Utc>,
    ) -> Result<VisitPayload, ValidationError> {
        self.check_ready(state)?;

        let identity = state.identity();
        let label = state.free_text_destination().trim();
        let destination_label = match self.destination_rule {
            DestinationRule::LeafOnly => None,
            _ if label.is_empty() => None,
            _ => Some(label.to_string()),
        };

        Ok(VisitPayload {
            first_name: identity.first_name.trim().to_string(),
            paternal_surname: identity.paternal_surname.trim().to_string(),
            maternal_surname: identity.maternal_surname.trim().to_string(),
            phone: state.phone().to_string(),
            destination_id: state.selected_destination().map(|d| d.id),
            destination_label,
            document: state.document_image().map(|d| d.as_str().to_string()),
            photos: state
                .additional_photos()
                .iter()
                .map(|p| p.as_str().to_string())
                .collect(),
            registered_at: now,
            registered_by: session.user_id,
            origin: self.origin.clone(),
        })
    }
}
