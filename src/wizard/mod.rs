//! Visit-registration wizard.
//!
//! A registration walks a fixed list of steps (phone, document, identity,
//! destination, photos, confirmation). The step list, destination rule and
//! submission endpoint come from a `WizardPolicy`, so the guard-house and
//! kiosk flows share one state machine. `RegistrationWizard` is the object a
//! screen talks to; `WizardState` is the plain data it renders.

pub mod policy;
pub mod session;
pub mod state;
pub mod submit;

pub use policy::{DestinationRule, FlowPolicy, StepKind, VisitEndpoint, WizardPolicy};
pub use session::{AdvanceOutcome, RegistrationWizard};
pub use state::{
    IdentityFields, ImageRef, MAX_ADDITIONAL_PHOTOS, SelectedDestination, SubmissionState,
    WizardState,
};
pub use submit::{
    HttpVisitService, PreparedVisit, RegistrationSubmitter, VisitPayload, VisitService,
};
