//! RegistrationWizard: coordinates wizard state, the destination selector,
//! phone capture and the final submission for one screen context.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, PollerConfig};
use crate::destinations::{NavigationPath, TreeFetcher};
use crate::document::DocumentRecognizer;
use crate::error::{
    FetchError, NavigationError, RecognitionError, SubmitError, ValidationError, VerificationError,
};
use crate::phone::{CandidateSnapshot, PhonePoller, PhoneVerifier, normalize_phone};
use crate::session::SessionContext;

use super::policy::{StepKind, WizardPolicy};
use super::state::{IdentityFields, ImageRef, SelectedDestination, SubmissionState, WizardState};
use super::submit::RegistrationSubmitter;

/// Result of a forward action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Moved to `step`.
    Moved { step: usize },
    /// The visit was registered; the wizard is on its closing slot.
    Submitted,
    /// A submission is already in flight; nothing changed.
    InFlight,
    /// The wizard was reset while waiting on the backend; the response was
    /// dropped.
    Discarded,
}

struct Inner {
    state: WizardState,
    browse: Option<NavigationPath>,
}

/// One active registration flow.
pub struct RegistrationWizard {
    policy: Arc<dyn WizardPolicy>,
    session: Arc<SessionContext>,
    submitter: RegistrationSubmitter,
    inner: RwLock<Inner>,
    /// Bumped by `reset`; responses that arrive under an older epoch are
    /// ignored.
    epoch: AtomicU64,
    poller: Option<PhonePoller>,
}

impl RegistrationWizard {
    pub fn new(
        policy: Arc<dyn WizardPolicy>,
        session: Arc<SessionContext>,
        submitter: RegistrationSubmitter,
    ) -> Self {
        let state = WizardState::new(policy.total_steps());
        info!(
            session_id = %state.session_id(),
            flow = policy.name(),
            steps = policy.total_steps(),
            "Registration wizard created"
        );
        Self {
            policy,
            session,
            submitter,
            inner: RwLock::new(Inner {
                state,
                browse: None,
            }),
            epoch: AtomicU64::new(0),
            poller: None,
        }
    }

    /// Wire a wizard to the backend named by the environment. A phone poller
    /// is attached when `BITACORA_PHONE_ENDPOINTS` lists any endpoint.
    pub fn from_env(
        policy: Arc<dyn WizardPolicy>,
        session: Arc<SessionContext>,
    ) -> crate::error::Result<Self> {
        let backend = BackendConfig::from_env()?;
        let poller_config = PollerConfig::from_env();
        let wizard = Self::new(
            policy,
            Arc::clone(&session),
            RegistrationSubmitter::http(backend.clone()),
        );
        if poller_config.endpoints.is_empty() {
            return Ok(wizard);
        }
        let poller = PhonePoller::from_config(&poller_config, &backend, session);
        Ok(wizard.with_phone_poller(poller))
    }

    /// Attach the kiosk phone-candidate poller. It is not started here.
    pub fn with_phone_poller(mut self, poller: PhonePoller) -> Self {
        self.poller = Some(poller);
        self
    }

    pub fn policy(&self) -> &dyn WizardPolicy {
        &*self.policy
    }

    /// Copy of the current state for rendering.
    pub async fn snapshot(&self) -> WizardState {
        self.inner.read().await.state.clone()
    }

    pub async fn current_step(&self) -> usize {
        self.inner.read().await.state.current_step()
    }

    /// Kind of the current step, `None` once complete.
    pub async fn current_step_kind(&self) -> Option<StepKind> {
        self.policy.step_kind(self.current_step().await)
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Keep `message` for display unless the wizard was reset since `epoch`.
    async fn record_error(&self, epoch: u64, message: String) {
        let mut inner = self.inner.write().await;
        if self.current_epoch() != epoch {
            debug!("Wizard reset while waiting; dropping error: {message}");
            return;
        }
        inner.state.set_last_error(Some(message));
    }

    /// Captured data is frozen while a submission is in flight.
    fn is_frozen(state: &WizardState) -> bool {
        *state.submission() == SubmissionState::Submitting
    }

    fn ensure_editable(state: &WizardState) -> Result<(), ValidationError> {
        if Self::is_frozen(state) {
            return Err(ValidationError::SubmissionInFlight);
        }
        Ok(())
    }

    // ── Step transitions ────────────────────────────────────────────

    /// Guarded single-step move that never submits.
    fn move_forward(&self, state: &mut WizardState) -> Result<AdvanceOutcome, ValidationError> {
        if let Err(e) = self.policy.check_advance(state) {
            debug!(step = state.current_step(), "Advance blocked: {e}");
            state.set_last_error(Some(e.to_string()));
            return Err(e);
        }
        state.advance();
        state.set_last_error(None);
        info!(
            session_id = %state.session_id(),
            flow = self.policy.name(),
            step = state.current_step(),
            "Wizard advanced"
        );
        Ok(AdvanceOutcome::Moved {
            step: state.current_step(),
        })
    }

    /// Leave the current step. On the confirmation step this submits the
    /// visit instead; a second call while that submission is pending is a
    /// no-op.
    pub async fn advance(&self) -> Result<AdvanceOutcome, SubmitError> {
        let (epoch, visit) = {
            let mut inner = self.inner.write().await;
            let state = &mut inner.state;

            if *state.submission() == SubmissionState::Submitting {
                debug!(session_id = %state.session_id(), "Submission in flight; ignoring advance");
                return Ok(AdvanceOutcome::InFlight);
            }

            if self.policy.step_kind(state.current_step()) != Some(StepKind::Confirmation) {
                return Ok(self.move_forward(state)?);
            }

            let visit = match self.submitter.prepare(&*self.policy, state, &self.session) {
                Ok(visit) => visit,
                Err(e) => {
                    state.set_last_error(Some(e.to_string()));
                    return Err(e.into());
                }
            };
            state.begin_submission()?;
            info!(session_id = %state.session_id(), flow = self.policy.name(), "Submitting visit");
            (self.current_epoch(), visit)
        };

        let result = self.submitter.send(&self.session, &visit).await;

        let mut inner = self.inner.write().await;
        if self.current_epoch() != epoch {
            warn!("Wizard was reset during submission; dropping response");
            return Ok(AdvanceOutcome::Discarded);
        }
        inner.state.finish_submission(result.clone());
        result.map(|()| AdvanceOutcome::Submitted)
    }

    /// Go back one step. Returns the step the wizard is on afterwards.
    pub async fn retreat(&self) -> usize {
        let mut inner = self.inner.write().await;
        if inner.state.retreat() {
            inner.state.set_last_error(None);
            debug!(step = inner.state.current_step(), "Wizard went back");
        }
        inner.state.current_step()
    }

    /// Discard the session: every field, the loaded tree, any pending
    /// submission result, and the phone poller.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(poller) = &self.poller {
            poller.stop();
        }
        let old = inner.state.session_id();
        inner.state.reset();
        inner.browse = None;
        info!(
            old_session = %old,
            session_id = %inner.state.session_id(),
            "Wizard reset"
        );
    }

    /// Close a completed registration and start over. Returns `false` if the
    /// wizard was not complete.
    pub async fn finish(&self) -> bool {
        if !self.inner.read().await.state.is_complete() {
            return false;
        }
        self.reset().await;
        true
    }

    // ── Phone ───────────────────────────────────────────────────────

    /// Store a typed phone number after normalizing it.
    pub async fn set_phone(&self, raw: &str) -> Result<(), ValidationError> {
        let mut inner = self.inner.write().await;
        Self::ensure_editable(&inner.state)?;
        match normalize_phone(raw) {
            Ok(phone) => {
                inner.state.set_phone(phone);
                inner.state.set_last_error(None);
                Ok(())
            }
            Err(e) => {
                inner.state.set_last_error(Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn phone_for_verification(&self) -> Result<String, ValidationError> {
        let phone = self.inner.read().await.state.phone().to_string();
        if phone.is_empty() {
            return Err(ValidationError::InvalidPhone(phone));
        }
        Ok(phone)
    }

    /// Send a verification code to the stored phone.
    pub async fn request_verification(
        &self,
        verifier: &dyn PhoneVerifier,
    ) -> Result<(), VerificationError> {
        let phone = self.phone_for_verification().await?;
        let epoch = self.current_epoch();
        if let Err(e) = verifier.request_code(&self.session, &phone).await {
            self.record_error(epoch, e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Check `code` and, on success, leave the phone step in the same action.
    pub async fn verify_and_advance(
        &self,
        verifier: &dyn PhoneVerifier,
        code: &str,
    ) -> Result<AdvanceOutcome, VerificationError> {
        let phone = self.phone_for_verification().await?;
        let epoch = self.current_epoch();

        let accepted = match verifier.confirm_code(&self.session, &phone, code).await {
            Ok(accepted) => accepted,
            Err(e) => {
                self.record_error(epoch, e.to_string()).await;
                return Err(e);
            }
        };
        if !accepted {
            self.record_error(epoch, VerificationError::CodeRejected.to_string())
                .await;
            return Err(VerificationError::CodeRejected);
        }

        let mut inner = self.inner.write().await;
        if self.current_epoch() != epoch || inner.state.phone() != phone {
            warn!("Phone changed during verification; dropping result");
            return Ok(AdvanceOutcome::Discarded);
        }
        Self::ensure_editable(&inner.state)?;
        inner.state.mark_phone_verified();
        info!(session_id = %inner.state.session_id(), "Phone verified");

        let state = &mut inner.state;
        if self.policy.step_kind(state.current_step()) == Some(StepKind::Phone) {
            Ok(self.move_forward(state)?)
        } else {
            Ok(AdvanceOutcome::Moved {
                step: state.current_step(),
            })
        }
    }

    // ── Kiosk phone candidates ──────────────────────────────────────

    /// Start polling candidate numbers. `false` if there is no poller or it
    /// was already running.
    pub fn start_phone_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(PhonePoller::start)
    }

    pub fn stop_phone_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(PhonePoller::stop)
    }

    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(PhonePoller::is_running)
    }

    pub async fn phone_candidates(&self) -> Option<CandidateSnapshot> {
        match &self.poller {
            Some(poller) => Some(poller.snapshot().await),
            None => None,
        }
    }

    /// Pick a polled number. The poller is stopped before the number is
    /// written, and the number counts as verified.
    pub async fn choose_candidate(&self, phone: &str) -> Result<(), ValidationError> {
        let poller = self
            .poller
            .as_ref()
            .ok_or_else(|| ValidationError::InvalidPhone(phone.to_string()))?;
        let chosen = normalize_phone(phone)?;

        let offered = poller
            .snapshot()
            .await
            .phones
            .iter()
            .any(|p| normalize_phone(p).is_ok_and(|n| n == chosen));
        if !offered {
            return Err(ValidationError::InvalidPhone(phone.to_string()));
        }

        let mut inner = self.inner.write().await;
        Self::ensure_editable(&inner.state)?;
        poller.stop();
        inner.state.set_phone(chosen);
        inner.state.mark_phone_verified();
        inner.state.set_last_error(None);
        info!(session_id = %inner.state.session_id(), "Kiosk phone chosen");
        Ok(())
    }

    /// Screen left: stop polling.
    pub fn on_suspend(&self) {
        self.stop_phone_polling();
    }

    /// Screen back: resume polling only if no number has been chosen.
    pub async fn on_resume(&self) -> bool {
        if self.inner.read().await.state.phone_verified() {
            return false;
        }
        self.start_phone_polling()
    }

    // ── Document, identity, photos ──────────────────────────────────

    pub async fn set_document(&self, image: Option<ImageRef>) -> Result<(), ValidationError> {
        let mut inner = self.inner.write().await;
        Self::ensure_editable(&inner.state)?;
        inner.state.set_document_image(image);
        Ok(())
    }

    /// Store the document image and pre-fill blank identity fields from it.
    ///
    /// The image is kept even when recognition fails, so the visitor can
    /// type the fields by hand.
    pub async fn capture_document(
        &self,
        image: ImageRef,
        recognizer: &dyn DocumentRecognizer,
    ) -> Result<IdentityFields, RecognitionError> {
        let epoch = self.current_epoch();
        self.set_document(Some(image.clone())).await?;

        let recognized = match recognizer.recognize(&self.session, &image).await {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Document recognition failed: {e}");
                self.record_error(epoch, e.to_string()).await;
                return Err(e);
            }
        };

        let mut inner = self.inner.write().await;
        if self.current_epoch() != epoch || inner.state.document_image() != Some(&image) {
            debug!("Document replaced during recognition; not applying fields");
            return Ok(recognized);
        }
        Self::ensure_editable(&inner.state)?;
        inner.state.identity_mut().fill_blanks_from(&recognized);
        inner.state.set_last_error(None);
        Ok(inner.state.identity().clone())
    }

    pub async fn set_identity(&self, identity: IdentityFields) -> Result<(), ValidationError> {
        let mut inner = self.inner.write().await;
        Self::ensure_editable(&inner.state)?;
        inner.state.set_identity(identity);
        Ok(())
    }

    pub async fn add_photo(&self, image: ImageRef) -> Result<(), ValidationError> {
        let mut inner = self.inner.write().await;
        Self::ensure_editable(&inner.state)?;
        inner.state.add_photo(image)
    }

    pub async fn remove_photo(&self, index: usize) -> Result<ImageRef, ValidationError> {
        let mut inner = self.inner.write().await;
        Self::ensure_editable(&inner.state)?;
        inner.state.remove_photo(index)
    }

    // ── Destination ─────────────────────────────────────────────────

    /// Fetch the tree for the session's root perimeter and start browsing
    /// at its root. On failure the error is kept for display and the call
    /// may simply be repeated. A tree that arrives after a reset is returned
    /// but not installed.
    pub async fn load_destinations(
        &self,
        fetcher: &dyn TreeFetcher,
    ) -> Result<NavigationPath, FetchError> {
        let root_id = self.session.root_perimeter_id;
        let epoch = self.current_epoch();
        let tree = match fetcher.fetch_tree(&self.session, root_id).await {
            Ok(tree) => tree,
            Err(e) => {
                warn!(root_id, "Destination tree fetch failed: {e}");
                self.record_error(epoch, e.to_string()).await;
                return Err(e);
            }
        };

        let path = NavigationPath::new(&tree);
        let mut inner = self.inner.write().await;
        if self.current_epoch() != epoch {
            debug!(root_id, "Wizard reset during tree fetch; not installing");
            return Ok(path);
        }
        inner.browse = Some(path.clone());
        inner.state.set_last_error(None);
        Ok(path)
    }

    pub async fn browse_path(&self) -> Option<NavigationPath> {
        self.inner.read().await.browse.clone()
    }

    pub async fn breadcrumbs(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .browse
            .as_ref()
            .map(|p| p.breadcrumbs().into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub async fn browse_into(&self, child_id: i64) -> Result<NavigationPath, NavigationError> {
        let mut inner = self.inner.write().await;
        if Self::is_frozen(&inner.state) {
            return Err(NavigationError::SubmissionInFlight);
        }
        let path = inner.browse.as_mut().ok_or(NavigationError::NoTreeLoaded)?;
        path.descend(child_id)?;
        Ok(path.clone())
    }

    pub async fn browse_back(&self) -> Result<NavigationPath, NavigationError> {
        let mut inner = self.inner.write().await;
        if Self::is_frozen(&inner.state) {
            return Err(NavigationError::SubmissionInFlight);
        }
        let path = inner.browse.as_mut().ok_or(NavigationError::NoTreeLoaded)?;
        path.ascend()?;
        Ok(path.clone())
    }

    /// Whether the node being browsed may be confirmed in this flow.
    pub async fn can_confirm_current(&self) -> bool {
        let inner = self.inner.read().await;
        inner.browse.as_ref().is_some_and(|p| {
            self.policy.destination_rule().allows_inner_nodes() || p.current().is_leaf()
        })
    }

    /// Select the node being browsed as the visit destination.
    pub async fn confirm_current_destination(
        &self,
    ) -> Result<SelectedDestination, NavigationError> {
        let mut inner = self.inner.write().await;
        if Self::is_frozen(&inner.state) {
            return Err(NavigationError::SubmissionInFlight);
        }
        let path = inner.browse.as_ref().ok_or(NavigationError::NoTreeLoaded)?;
        let current = path.current();
        if !self.policy.destination_rule().allows_inner_nodes() && !current.is_leaf() {
            return Err(NavigationError::NotSelectable { id: current.id });
        }

        let selected =
            SelectedDestination::from_path(&path.nodes()).ok_or(NavigationError::NoTreeLoaded)?;
        inner.state.select_destination(Some(selected.clone()));
        inner.state.set_last_error(None);
        info!(destination_id = selected.id, destination = %selected.name, "Destination selected");
        Ok(selected)
    }

    pub async fn clear_destination(&self) -> Result<(), ValidationError> {
        let mut inner = self.inner.write().await;
        Self::ensure_editable(&inner.state)?;
        inner.state.select_destination(None);
        Ok(())
    }

    pub async fn set_free_text_destination(&self, text: &str) -> Result<(), ValidationError> {
        let mut inner = self.inner.write().await;
        Self::ensure_editable(&inner.state)?;
        inner.state.set_free_text_destination(text.trim());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::config::BackendConfig;
    use crate::destinations::{DestinationNode, DestinationTree};
    use crate::phone::PhoneSource;
    use crate::wizard::policy::{DestinationRule, FlowPolicy};
    use crate::wizard::submit::{VisitPayload, VisitService};

    // ── Stubs ───────────────────────────────────────────────────────

    struct GatedService {
        gate: Notify,
        gated: bool,
        calls: AtomicUsize,
        result: Result<(), SubmitError>,
    }

    impl GatedService {
        fn immediate(result: Result<(), SubmitError>) -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                gated: false,
                calls: AtomicUsize::new(0),
                result,
            })
        }

        fn gated(result: Result<(), SubmitError>) -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                gated: true,
                calls: AtomicUsize::new(0),
                result,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VisitService for GatedService {
        async fn register_visit(
            &self,
            _session: &SessionContext,
            _endpoint: &str,
            _payload: &VisitPayload,
        ) -> Result<(), SubmitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.gated {
                self.gate.notified().await;
            }
            self.result.clone()
        }
    }

    struct CodeVerifier;

    #[async_trait]
    impl PhoneVerifier for CodeVerifier {
        async fn request_code(
            &self,
            _session: &SessionContext,
            _phone: &str,
        ) -> Result<(), VerificationError> {
            Ok(())
        }

        async fn confirm_code(
            &self,
            _session: &SessionContext,
            _phone: &str,
            code: &str,
        ) -> Result<bool, VerificationError> {
            Ok(code == "1234")
        }
    }

    struct StaticTree(Result<DestinationNode, u16>);

    #[async_trait]
    impl TreeFetcher for StaticTree {
        async fn fetch_tree(
            &self,
            _session: &SessionContext,
            _root_id: i64,
        ) -> Result<DestinationTree, FetchError> {
            match &self.0 {
                Ok(root) => Ok(DestinationTree::from_root(root.clone()).unwrap()),
                Err(status) => Err(FetchError::Server {
                    url: "stub".to_string(),
                    status: *status,
                }),
            }
        }
    }

    struct StubRecognizer(Result<IdentityFields, ()>);

    #[async_trait]
    impl DocumentRecognizer for StubRecognizer {
        async fn recognize(
            &self,
            _session: &SessionContext,
            _image: &ImageRef,
        ) -> Result<IdentityFields, RecognitionError> {
            self.0
                .clone()
                .map_err(|_| RecognitionError::Unreadable("blurry".to_string()))
        }
    }

    /// Parks every call on `gate`. Trees come back from `tree` when set;
    /// everything else fails with a network error.
    struct Stalled {
        gate: Notify,
        calls: AtomicUsize,
        tree: Option<DestinationNode>,
    }

    impl Stalled {
        fn failing() -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                calls: AtomicUsize::new(0),
                tree: None,
            })
        }

        fn with_tree(root: DestinationNode) -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                calls: AtomicUsize::new(0),
                tree: Some(root),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn park(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
        }
    }

    #[async_trait]
    impl PhoneVerifier for Stalled {
        async fn request_code(
            &self,
            _session: &SessionContext,
            _phone: &str,
        ) -> Result<(), VerificationError> {
            self.park().await;
            Err(VerificationError::Network("timeout".to_string()))
        }

        async fn confirm_code(
            &self,
            _session: &SessionContext,
            _phone: &str,
            _code: &str,
        ) -> Result<bool, VerificationError> {
            self.park().await;
            Err(VerificationError::Network("timeout".to_string()))
        }
    }

    #[async_trait]
    impl DocumentRecognizer for Stalled {
        async fn recognize(
            &self,
            _session: &SessionContext,
            _image: &ImageRef,
        ) -> Result<IdentityFields, RecognitionError> {
            self.park().await;
            Err(RecognitionError::Network("timeout".to_string()))
        }
    }

    #[async_trait]
    impl TreeFetcher for Stalled {
        async fn fetch_tree(
            &self,
            _session: &SessionContext,
            _root_id: i64,
        ) -> Result<DestinationTree, FetchError> {
            self.park().await;
            match &self.tree {
                Some(root) => Ok(DestinationTree::from_root(root.clone()).unwrap()),
                None => Err(FetchError::Network {
                    url: "stub".to_string(),
                    reason: "timeout".to_string(),
                }),
            }
        }
    }

    struct FixedPhones(Vec<String>);

    #[async_trait]
    impl PhoneSource for FixedPhones {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch(&self, _session: &SessionContext) -> Result<Vec<String>, FetchError> {
            Ok(self.0.clone())
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn lomas() -> DestinationNode {
        DestinationNode::new(1, "Lomas", 0)
            .with_child(DestinationNode::new(2, "Torre A", 1))
            .with_child(
                DestinationNode::new(3, "Torre B", 1)
                    .with_child(DestinationNode::new(4, "Depto 101", 2)),
            )
    }

    fn session() -> Arc<SessionContext> {
        Arc::new(SessionContext::new(9, 1, "token"))
    }

    fn wizard_with(policy: FlowPolicy, service: Arc<GatedService>) -> RegistrationWizard {
        RegistrationWizard::new(
            Arc::new(policy),
            session(),
            RegistrationSubmitter::new(service, BackendConfig::default()),
        )
    }

    fn generic(service: Arc<GatedService>) -> RegistrationWizard {
        wizard_with(FlowPolicy::generic(), service)
    }

    /// Walk the generic flow up to its confirmation step.
    async fn fill_to_confirmation(wizard: &RegistrationWizard) {
        wizard.set_phone("55 1234 5678").await.unwrap();
        wizard.verify_and_advance(&CodeVerifier, "1234").await.unwrap();
        wizard.set_document(Some(ImageRef::new("ine.jpg"))).await.unwrap();
        wizard.advance().await.unwrap();
        wizard
            .set_identity(IdentityFields::new("Ana", "López", "Ruiz"))
            .await
            .unwrap();
        wizard.advance().await.unwrap();
        wizard.load_destinations(&StaticTree(Ok(lomas()))).await.unwrap();
        wizard.browse_into(2).await.unwrap();
        wizard.confirm_current_destination().await.unwrap();
        wizard.advance().await.unwrap();
        wizard.add_photo(ImageRef::new("placa.jpg")).await.unwrap();
        let outcome = wizard.advance().await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Moved { step: 6 });
        assert_eq!(
            wizard.current_step_kind().await,
            Some(StepKind::Confirmation)
        );
    }

    async fn wait_until(what: &str, done: impl Fn() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn wait_for_calls(service: &GatedService, n: usize) {
        wait_until("visit service calls", || service.calls() >= n).await;
    }

    // ── Phone step ──────────────────────────────────────────────────

    #[tokio::test]
    async fn phone_step_blocks_until_verified() {
        let wizard = generic(GatedService::immediate(Ok(())));
        let err = wizard.advance().await.unwrap_err();
        assert_eq!(err, SubmitError::Validation(ValidationError::PhoneNotVerified));
        assert_eq!(wizard.current_step().await, 1);
        assert!(wizard.snapshot().await.last_error().is_some());

        wizard.set_phone("5512345678").await.unwrap();
        assert!(matches!(
            wizard.verify_and_advance(&CodeVerifier, "0000").await,
            Err(VerificationError::CodeRejected)
        ));
        assert_eq!(wizard.current_step().await, 1);

        let outcome = wizard.verify_and_advance(&CodeVerifier, "1234").await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Moved { step: 2 });
        assert!(wizard.snapshot().await.phone_verified());
    }

    #[tokio::test]
    async fn invalid_phone_is_rejected() {
        let wizard = generic(GatedService::immediate(Ok(())));
        assert!(matches!(
            wizard.set_phone("12-34").await,
            Err(ValidationError::InvalidPhone(_))
        ));
        assert!(matches!(
            wizard.request_verification(&CodeVerifier).await,
            Err(VerificationError::Validation(ValidationError::InvalidPhone(_)))
        ));
    }

    #[tokio::test]
    async fn retreat_from_first_step_is_noop() {
        let wizard = generic(GatedService::immediate(Ok(())));
        wizard.set_phone("5512345678").await.unwrap();
        let before = wizard.snapshot().await;
        assert_eq!(wizard.retreat().await, 1);
        let after = wizard.snapshot().await;
        assert_eq!(after.phone(), before.phone());
        assert_eq!(after.session_id(), before.session_id());
    }

    // ── Destination step ────────────────────────────────────────────

    #[tokio::test]
    async fn destination_step_blocks_without_destination() {
        let wizard = generic(GatedService::immediate(Ok(())));
        wizard.set_phone("5512345678").await.unwrap();
        wizard.verify_and_advance(&CodeVerifier, "1234").await.unwrap();
        wizard.set_document(Some(ImageRef::new("ine.jpg"))).await.unwrap();
        wizard.advance().await.unwrap();
        wizard
            .set_identity(IdentityFields::new("Ana", "López", ""))
            .await
            .unwrap();
        wizard.advance().await.unwrap();
        assert_eq!(wizard.current_step_kind().await, Some(StepKind::Destination));

        let err = wizard.advance().await.unwrap_err();
        assert_eq!(err, SubmitError::Validation(ValidationError::MissingDestination));
        assert_eq!(wizard.current_step().await, 4);

        wizard.set_free_text_destination("  Casa club ").await.unwrap();
        assert_eq!(
            wizard.advance().await.unwrap(),
            AdvanceOutcome::Moved { step: 5 }
        );
        assert_eq!(wizard.snapshot().await.free_text_destination(), "Casa club");
    }

    #[tokio::test]
    async fn browsing_the_tree() {
        let wizard = generic(GatedService::immediate(Ok(())));
        assert_eq!(
            wizard.browse_into(2).await.unwrap_err(),
            NavigationError::NoTreeLoaded
        );

        wizard.load_destinations(&StaticTree(Ok(lomas()))).await.unwrap();
        let path = wizard.browse_into(2).await.unwrap();
        assert!(path.current().is_leaf());
        assert_eq!(
            wizard.browse_into(4).await.unwrap_err(),
            NavigationError::NotAChild { parent: 2, child: 4 }
        );

        wizard.browse_back().await.unwrap();
        wizard.browse_into(3).await.unwrap();
        wizard.browse_into(4).await.unwrap();
        assert_eq!(wizard.breadcrumbs().await, ["Lomas", "Torre B", "Depto 101"]);

        let selected = wizard.confirm_current_destination().await.unwrap();
        assert_eq!(selected.id, 4);
        assert_eq!(selected.path, ["Lomas", "Torre B", "Depto 101"]);

        wizard.browse_back().await.unwrap();
        wizard.browse_back().await.unwrap();
        assert_eq!(
            wizard.browse_back().await.unwrap_err(),
            NavigationError::AtRoot
        );
    }

    #[tokio::test]
    async fn leaf_only_flow_rejects_inner_nodes() {
        let wizard = wizard_with(
            FlowPolicy::generic().with_destination_rule(DestinationRule::LeafOnly),
            GatedService::immediate(Ok(())),
        );
        wizard.load_destinations(&StaticTree(Ok(lomas()))).await.unwrap();
        assert!(!wizard.can_confirm_current().await);
        assert_eq!(
            wizard.confirm_current_destination().await.unwrap_err(),
            NavigationError::NotSelectable { id: 1 }
        );

        wizard.browse_into(2).await.unwrap();
        assert!(wizard.can_confirm_current().await);
        assert_eq!(wizard.confirm_current_destination().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn single_node_tree_is_confirmable_immediately() {
        let wizard = wizard_with(
            FlowPolicy::generic().with_destination_rule(DestinationRule::LeafOnly),
            GatedService::immediate(Ok(())),
        );
        wizard
            .load_destinations(&StaticTree(Ok(DestinationNode::new(7, "Caseta", 0))))
            .await
            .unwrap();
        assert!(wizard.can_confirm_current().await);
        assert_eq!(wizard.confirm_current_destination().await.unwrap().id, 7);
    }

    #[tokio::test]
    async fn tree_fetch_failure_is_retryable() {
        let wizard = generic(GatedService::immediate(Ok(())));
        let err = wizard.load_destinations(&StaticTree(Err(503))).await.unwrap_err();
        assert!(matches!(err, FetchError::Server { status: 503, .. }));
        assert!(wizard.snapshot().await.last_error().is_some());
        assert!(wizard.browse_path().await.is_none());

        wizard.load_destinations(&StaticTree(Ok(lomas()))).await.unwrap();
        assert!(wizard.snapshot().await.last_error().is_none());
        assert_eq!(wizard.breadcrumbs().await, ["Lomas"]);
    }

    // ── Document ────────────────────────────────────────────────────

    #[tokio::test]
    async fn recognized_fields_fill_blanks() {
        let wizard = generic(GatedService::immediate(Ok(())));
        wizard
            .set_identity(IdentityFields::new("Ana", "", ""))
            .await
            .unwrap();
        let fields = wizard
            .capture_document(
                ImageRef::new("ine.jpg"),
                &StubRecognizer(Ok(IdentityFields::new("ANA MARIA", "LOPEZ", "RUIZ"))),
            )
            .await
            .unwrap();
        assert_eq!(fields, IdentityFields::new("Ana", "LOPEZ", "RUIZ"));
        assert_eq!(wizard.snapshot().await.identity(), &fields);
    }

    #[tokio::test]
    async fn recognition_failure_keeps_document() {
        let wizard = generic(GatedService::immediate(Ok(())));
        let err = wizard
            .capture_document(ImageRef::new("ine.jpg"), &StubRecognizer(Err(())))
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::Unreadable(_)));
        let snap = wizard.snapshot().await;
        assert_eq!(snap.document_image(), Some(&ImageRef::new("ine.jpg")));
        assert!(snap.last_error().is_some());
    }

    // ── Submission ──────────────────────────────────────────────────

    #[tokio::test]
    async fn successful_submission_completes_then_finish_resets() {
        let service = GatedService::immediate(Ok(()));
        let wizard = generic(service.clone());
        fill_to_confirmation(&wizard).await;

        assert_eq!(wizard.advance().await.unwrap(), AdvanceOutcome::Submitted);
        let snap = wizard.snapshot().await;
        assert!(snap.is_complete());
        assert_eq!(snap.current_step(), 7);
        assert_eq!(snap.submission(), &SubmissionState::Submitted);
        assert_eq!(service.calls(), 1);

        assert_eq!(
            wizard.advance().await.unwrap_err(),
            SubmitError::Validation(ValidationError::AlreadyComplete)
        );
        assert!(wizard.finish().await);
        assert_eq!(wizard.current_step().await, 1);
        assert!(!wizard.finish().await);
    }

    #[tokio::test]
    async fn server_error_keeps_everything_for_retry() {
        let service = GatedService::immediate(Err(SubmitError::Server {
            status: 500,
            body: "error interno".to_string(),
        }));
        let wizard = generic(service.clone());
        fill_to_confirmation(&wizard).await;

        let err = wizard.advance().await.unwrap_err();
        assert!(matches!(err, SubmitError::Server { status: 500, .. }));

        let snap = wizard.snapshot().await;
        assert_eq!(snap.current_step(), 6);
        assert!(matches!(
            snap.submission(),
            SubmissionState::Failed(SubmitError::Server { status: 500, .. })
        ));
        assert_eq!(snap.phone(), "5512345678");
        assert_eq!(snap.identity().first_name, "Ana");
        assert_eq!(snap.selected_destination().map(|d| d.id), Some(2));
        assert_eq!(snap.additional_photos().len(), 1);

        // Manual retry issues a new request.
        let _ = wizard.advance().await;
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn missing_destination_at_confirmation_is_a_validation_error() {
        let service = GatedService::immediate(Ok(()));
        let wizard = generic(service.clone());
        fill_to_confirmation(&wizard).await;
        wizard.clear_destination().await.unwrap();

        let err = wizard.advance().await.unwrap_err();
        assert_eq!(err, SubmitError::Validation(ValidationError::MissingDestination));
        let snap = wizard.snapshot().await;
        assert_eq!(snap.submission(), &SubmissionState::NotSubmitted);
        assert_eq!(snap.current_step(), 6);
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn advance_while_submitting_is_noop() {
        let service = GatedService::gated(Ok(()));
        let wizard = Arc::new(generic(service.clone()));
        fill_to_confirmation(&wizard).await;

        let first = tokio::spawn({
            let wizard = Arc::clone(&wizard);
            async move { wizard.advance().await }
        });
        wait_for_calls(&service, 1).await;

        assert_eq!(wizard.advance().await.unwrap(), AdvanceOutcome::InFlight);
        assert_eq!(wizard.retreat().await, 6);
        assert_eq!(service.calls(), 1);

        service.gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), AdvanceOutcome::Submitted);
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn captured_fields_are_frozen_while_submitting() {
        let service = GatedService::gated(Ok(()));
        let wizard = Arc::new(generic(service.clone()));
        fill_to_confirmation(&wizard).await;

        let pending = tokio::spawn({
            let wizard = Arc::clone(&wizard);
            async move { wizard.advance().await }
        });
        wait_for_calls(&service, 1).await;

        let frozen: Result<(), ValidationError> = Err(ValidationError::SubmissionInFlight);
        assert_eq!(wizard.set_phone("5587654321").await, frozen);
        assert_eq!(wizard.clear_destination().await, frozen);
        assert_eq!(wizard.set_free_text_destination("").await, frozen);
        assert_eq!(wizard.set_document(None).await, frozen);
        assert_eq!(wizard.set_identity(IdentityFields::default()).await, frozen);
        assert_eq!(wizard.add_photo(ImageRef::new("otra.jpg")).await, frozen);
        assert_eq!(
            wizard.remove_photo(0).await.unwrap_err(),
            ValidationError::SubmissionInFlight
        );
        assert_eq!(
            wizard.browse_back().await.unwrap_err(),
            NavigationError::SubmissionInFlight
        );
        assert_eq!(
            wizard.confirm_current_destination().await.unwrap_err(),
            NavigationError::SubmissionInFlight
        );

        service.gate.notify_one();
        assert_eq!(pending.await.unwrap().unwrap(), AdvanceOutcome::Submitted);

        let snap = wizard.snapshot().await;
        assert!(snap.is_complete());
        assert_eq!(snap.phone(), "5512345678");
        assert!(snap.phone_verified());
        assert_eq!(snap.document_image(), Some(&ImageRef::new("ine.jpg")));
        assert_eq!(snap.identity().first_name, "Ana");
        assert_eq!(snap.selected_destination().map(|d| d.id), Some(2));
        assert_eq!(snap.additional_photos(), [ImageRef::new("placa.jpg")]);
    }

    #[tokio::test]
    async fn late_errors_do_not_reach_a_reset_wizard() {
        let wizard = Arc::new(generic(GatedService::immediate(Ok(()))));
        wizard.set_phone("5512345678").await.unwrap();
        let stalled = Stalled::failing();

        let verify = tokio::spawn({
            let (wizard, stalled) = (Arc::clone(&wizard), Arc::clone(&stalled));
            async move { wizard.verify_and_advance(&*stalled, "1234").await }
        });
        let recognize = tokio::spawn({
            let (wizard, stalled) = (Arc::clone(&wizard), Arc::clone(&stalled));
            async move {
                wizard
                    .capture_document(ImageRef::new("ine.jpg"), &*stalled)
                    .await
            }
        });
        let load = tokio::spawn({
            let (wizard, stalled) = (Arc::clone(&wizard), Arc::clone(&stalled));
            async move { wizard.load_destinations(&*stalled).await }
        });
        wait_until("all three calls to park", || stalled.calls() == 3).await;

        wizard.reset().await;
        stalled.gate.notify_waiters();

        assert!(matches!(
            verify.await.unwrap(),
            Err(VerificationError::Network(_))
        ));
        assert!(matches!(
            recognize.await.unwrap(),
            Err(RecognitionError::Network(_))
        ));
        assert!(matches!(
            load.await.unwrap(),
            Err(FetchError::Network { .. })
        ));

        let snap = wizard.snapshot().await;
        assert_eq!(snap.last_error(), None);
        assert!(snap.phone().is_empty());
        assert!(snap.document_image().is_none());
    }

    #[tokio::test]
    async fn tree_arriving_after_reset_is_not_installed() {
        let wizard = Arc::new(generic(GatedService::immediate(Ok(()))));
        let stalled = Stalled::with_tree(lomas());

        let load = tokio::spawn({
            let (wizard, stalled) = (Arc::clone(&wizard), Arc::clone(&stalled));
            async move { wizard.load_destinations(&*stalled).await }
        });
        wait_until("the tree fetch to park", || stalled.calls() == 1).await;

        wizard.reset().await;
        stalled.gate.notify_one();

        let path = load.await.unwrap().unwrap();
        assert_eq!(path.current().id, 1);
        assert!(wizard.browse_path().await.is_none());
        assert!(wizard.breadcrumbs().await.is_empty());
    }

    #[tokio::test]
    async fn reset_drops_late_submission_response() {
        let service = GatedService::gated(Ok(()));
        let wizard = Arc::new(generic(service.clone()));
        fill_to_confirmation(&wizard).await;

        let pending = tokio::spawn({
            let wizard = Arc::clone(&wizard);
            async move { wizard.advance().await }
        });
        wait_for_calls(&service, 1).await;

        wizard.reset().await;
        service.gate.notify_one();
        assert_eq!(pending.await.unwrap().unwrap(), AdvanceOutcome::Discarded);

        let snap = wizard.snapshot().await;
        assert_eq!(snap.current_step(), 1);
        assert_eq!(snap.submission(), &SubmissionState::NotSubmitted);
        assert!(snap.phone().is_empty());
        assert!(wizard.browse_path().await.is_none());
    }

    #[tokio::test]
    async fn reset_clears_a_populated_wizard() {
        let wizard = generic(GatedService::immediate(Ok(())));
        fill_to_confirmation(&wizard).await;
        let old = wizard.snapshot().await.session_id();

        wizard.reset().await;
        let snap = wizard.snapshot().await;
        assert_eq!(snap.current_step(), 1);
        assert!(snap.phone().is_empty());
        assert!(!snap.phone_verified());
        assert!(snap.document_image().is_none());
        assert!(snap.identity().is_blank());
        assert!(snap.additional_photos().is_empty());
        assert!(snap.selected_destination().is_none());
        assert!(snap.free_text_destination().is_empty());
        assert_ne!(snap.session_id(), old);
    }

    // ── Kiosk ───────────────────────────────────────────────────────

    fn kiosk(phones: &[&str]) -> RegistrationWizard {
        let session = session();
        let source: Arc<dyn PhoneSource> =
            Arc::new(FixedPhones(phones.iter().map(|s| s.to_string()).collect()));
        let poller = PhonePoller::new(
            vec![source],
            Arc::clone(&session),
            Duration::from_secs(2),
        );
        RegistrationWizard::new(
            Arc::new(FlowPolicy::lomas_country()),
            session,
            RegistrationSubmitter::new(GatedService::immediate(Ok(())), BackendConfig::default()),
        )
        .with_phone_poller(poller)
    }

    #[tokio::test(start_paused = true)]
    async fn choosing_a_candidate_stops_polling_and_verifies() {
        let wizard = kiosk(&["5512345678", "5587654321"]);
        assert!(wizard.start_phone_polling());
        assert!(!wizard.start_phone_polling());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snap = wizard.phone_candidates().await.unwrap();
        assert_eq!(snap.phones.len(), 2);

        assert!(matches!(
            wizard.choose_candidate("5500000000").await,
            Err(ValidationError::InvalidPhone(_))
        ));
        assert!(wizard.is_polling());

        wizard.choose_candidate("5587654321").await.unwrap();
        assert!(!wizard.is_polling());
        let state = wizard.snapshot().await;
        assert_eq!(state.phone(), "5587654321");
        assert!(state.phone_verified());

        assert_eq!(
            wizard.advance().await.unwrap(),
            AdvanceOutcome::Moved { step: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resume_restarts_only_without_a_chosen_number() {
        let wizard = kiosk(&["5512345678"]);
        wizard.start_phone_polling();
        wizard.on_suspend();
        assert!(!wizard.is_polling());

        assert!(wizard.on_resume().await);
        assert!(wizard.is_polling());

        tokio::time::sleep(Duration::from_millis(100)).await;
        wizard.choose_candidate("5512345678").await.unwrap();
        wizard.on_suspend();
        assert!(!wizard.on_resume().await);
        assert!(!wizard.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_stops_the_poller() {
        let wizard = kiosk(&["5512345678"]);
        wizard.start_phone_polling();
        wizard.reset().await;
        assert!(!wizard.is_polling());
    }

    #[tokio::test]
    async fn generic_flow_has_no_candidates() {
        let wizard = generic(GatedService::immediate(Ok(())));
        assert!(!wizard.start_phone_polling());
        assert!(wizard.phone_candidates().await.is_none());
        assert!(wizard.choose_candidate("5512345678").await.is_err());
    }
}
