//! The Access/Quota Controller.
//!
//! # Architecture
//! - Async entry points (`purchase`, `analyze`, `upload`, ...) talk to the
//!   gateway, then feed the outcome into `apply`, the single reducer through
//!   which every state change flows. Nothing mutates controller state outside
//!   `apply`.
//! - A 401 from any operation lands in `check_auth`, the one place session
//!   invalidation happens as a side effect: the stored credential is removed
//!   and the in-memory session torn down.
//! - In-flight guards (`Unlocking`, `analysis_in_flight`, `Purchasing`)
//!   reject a second purchase or analysis for the same note/session while one
//!   is pending, so double-submission cannot double-debit.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::auth::{Session, SessionStore};
use crate::errors::AppError;
use crate::models::note::{ConversationEntry, Note};
use crate::models::user::UserProfile;
use crate::upload::{validate_draft, NoteDraft, PendingAnalysis};

use super::gateway::MarketGateway;
use super::quota::{PackOffer, PoolCounts, QuotaFlow, FREE_POOL_CAP};

/// Client-side access state for a single note, per viewing session.
#[derive(Debug, Clone)]
pub enum NoteAccessState {
    /// No file URL resolved; purchase is the offered action.
    Locked,
    /// Purchase request in flight; the trigger is disabled.
    Unlocking,
    /// File URL resolved and cached for this view. Terminal: purchase is
    /// withdrawn for this note/session.
    Unlocked { file_url: String },
    /// File fetch was refused despite held access: a server-side
    /// inconsistency, distinct from "not yet purchased". Never auto-retried.
    AccessDenied,
}

/// A note open in this session, with its transcript.
#[derive(Debug, Clone)]
pub struct NoteView {
    pub note: Note,
    pub access: NoteAccessState,
    pub transcript: Vec<ConversationEntry>,
}

/// Result of a user-initiated purchase.
#[derive(Debug)]
pub enum PurchaseOutcome {
    /// Purchase confirmed, file URL resolved, profile refreshed.
    Unlocked { file_url: String, credits: u32 },
    /// No valid session; the caller should route to login. The server was
    /// not contacted.
    LoginRequired,
    /// Access is already held; purchase is not offered again.
    AlreadyOwned,
}

/// Result of requesting an analysis.
#[derive(Debug)]
pub enum AnalyzeOutcome {
    Analyzed(AnalysisReport),
    /// Combined pool exhausted; an explicit confirmation is required before
    /// any debit.
    PurchaseRequired(PackOffer),
}

#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub analysis_id: String,
    pub quality_score: f64,
    pub summary: String,
    pub counts: PoolCounts,
}

#[derive(Debug, Clone, Copy)]
pub struct PackPurchaseReceipt {
    pub credits: u32,
    pub counts: PoolCounts,
}

/// Every state transition the controller can make. Async operations build
/// events from server responses; `apply` is the only writer.
#[derive(Debug)]
enum Event {
    SessionAttached { session: Session },
    SessionCleared,
    ProfileRefreshed { profile: UserProfile },
    NoteLoaded { note: Note },
    PurchaseStarted { note_id: String },
    PurchaseConfirmed { note_id: String },
    PurchaseFailed { note_id: String },
    FileUrlResolved { note_id: String, file_url: String },
    FileAccessDenied { note_id: String },
    AnalysisStarted,
    AnalysisSettled,
    AnalysisCompleted { pending: PendingAnalysis, counts: PoolCounts },
    CountsAdopted { counts: PoolCounts },
    PromptOpened,
    PromptDeclined,
    PackPurchaseStarted,
    PackPurchased { credits: u32, counts: PoolCounts },
    PackPurchaseFailed,
    AnalysisConsumed,
    QuestionAnswered { note_id: String, entry: ConversationEntry },
}

pub struct AccessController {
    gateway: Arc<dyn MarketGateway>,
    store: SessionStore,
    session: Option<Session>,
    profile: Option<UserProfile>,
    views: HashMap<String, NoteView>,
    counts: PoolCounts,
    quota_flow: QuotaFlow,
    pending_analysis: Option<PendingAnalysis>,
    analysis_in_flight: bool,
}

impl AccessController {
    /// Builds a controller, restoring any persisted session from the store.
    pub fn new(gateway: Arc<dyn MarketGateway>, store: SessionStore) -> Result<Self, AppError> {
        let session = store.load()?;
        Ok(Self {
            gateway,
            store,
            session,
            profile: None,
            views: HashMap::new(),
            counts: PoolCounts::clamped(FREE_POOL_CAP, 0),
            quota_flow: QuotaFlow::Idle,
            pending_analysis: None,
            analysis_in_flight: false,
        })
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref()
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.counts
    }

    pub fn quota_flow(&self) -> QuotaFlow {
        self.quota_flow
    }

    pub fn note_view(&self, note_id: &str) -> Option<&NoteView> {
        self.views.get(note_id)
    }

    /// Replaces the session wholesale and persists the credential.
    pub fn attach_session(&mut self, session: Session) -> Result<(), AppError> {
        self.store.save(&session)?;
        self.apply(Event::SessionAttached { session });
        Ok(())
    }

    pub fn logout(&mut self) -> Result<(), AppError> {
        self.store.clear()?;
        self.apply(Event::SessionCleared);
        Ok(())
    }

    /// Tears down the session after an authorization failure: removes the
    /// stored credential and clears all per-session beliefs.
    pub fn invalidate_session(&mut self) {
        if let Err(e) = self.store.clear() {
            warn!("failed to remove stored credential: {e}");
        }
        self.apply(Event::SessionCleared);
    }

    pub async fn refresh_profile(&mut self) -> Result<UserProfile, AppError> {
        let token = self.require_token()?;
        let res = self.gateway.fetch_profile(&token).await;
        let profile = self.check_auth(res)?;
        self.apply(Event::ProfileRefreshed {
            profile: profile.clone(),
        });
        Ok(profile)
    }

    /// Fetches a note and, when access is already held, resolves its file
    /// URL so the view opens unlocked.
    pub async fn open_note(&mut self, note_id: &str) -> Result<&NoteView, AppError> {
        let token = self.live_token();
        let res = self.gateway.fetch_note(token.as_deref(), note_id).await;
        let note = self.check_auth(res)?;
        let has_access = note.has_access;
        self.apply(Event::NoteLoaded { note });
        if has_access && token.is_some() {
            self.resolve_file_url(note_id).await?;
        }
        self.views
            .get(note_id)
            .ok_or_else(|| AppError::NotFound(format!("note {note_id}")))
    }

    /// Resolves the content locator for a note. Legal at any time once access
    /// is held; a refusal while access is believed held marks the view
    /// `AccessDenied` and is not retried automatically.
    pub async fn resolve_file_url(&mut self, note_id: &str) -> Result<String, AppError> {
        let token = self.require_token()?;
        let believed_owned = self
            .views
            .get(note_id)
            .map(|v| {
                v.note.has_access
                    || matches!(
                        v.access,
                        NoteAccessState::Unlocked { .. } | NoteAccessState::Unlocking
                    )
            })
            .unwrap_or(false);
        let res = self.gateway.fetch_file_url(&token, note_id).await;
        match self.check_auth(res) {
            Ok(file_url) => {
                self.apply(Event::FileUrlResolved {
                    note_id: note_id.to_string(),
                    file_url: file_url.clone(),
                });
                Ok(file_url)
            }
            Err(AppError::AccessDenied(_)) if believed_owned => {
                self.apply(Event::FileAccessDenied {
                    note_id: note_id.to_string(),
                });
                Err(AppError::AccessDenied(
                    "access to this note was revoked server-side".to_string(),
                ))
            }
            Err(AppError::AccessDenied(_)) => Err(AppError::AccessDenied(
                "this note has not been purchased yet".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    /// User-initiated purchase of a note. Without a valid session this
    /// short-circuits to `LoginRequired` before any network call.
    pub async fn purchase(&mut self, note_id: &str) -> Result<PurchaseOutcome, AppError> {
        let token = match self.live_token() {
            Some(t) => t,
            None => return Ok(PurchaseOutcome::LoginRequired),
        };

        if !self.views.contains_key(note_id) {
            let res = self.gateway.fetch_note(Some(&token), note_id).await;
            let note = self.check_auth(res)?;
            self.apply(Event::NoteLoaded { note });
        }
        let view = self
            .views
            .get(note_id)
            .ok_or_else(|| AppError::NotFound(format!("note {note_id}")))?;

        if view.note.has_access || matches!(view.access, NoteAccessState::Unlocked { .. }) {
            return Ok(PurchaseOutcome::AlreadyOwned);
        }
        match view.access {
            NoteAccessState::Unlocking => return Err(AppError::RequestPending("purchase")),
            NoteAccessState::AccessDenied => {
                return Err(AppError::AccessDenied(
                    "access to this note was revoked server-side".to_string(),
                ))
            }
            _ => {}
        }

        self.apply(Event::PurchaseStarted {
            note_id: note_id.to_string(),
        });
        let res = self.gateway.purchase_note(&token, note_id).await;
        match self.check_auth(res) {
            Ok(()) => {
                self.apply(Event::PurchaseConfirmed {
                    note_id: note_id.to_string(),
                });
                // Both awaited before the outcome is reported: the balance
                // shown next must reflect the debit exactly once.
                let file_url = self.resolve_file_url(note_id).await?;
                let profile = self.refresh_profile().await?;
                Ok(PurchaseOutcome::Unlocked {
                    file_url,
                    credits: profile.credits,
                })
            }
            Err(e) => {
                self.apply(Event::PurchaseFailed {
                    note_id: note_id.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Submits a file for quality scoring. Pool counts are adopted from the
    /// server's response; the client never guesses which pool was drawn.
    pub async fn analyze(
        &mut self,
        file_name: &str,
        file: Bytes,
        title: &str,
    ) -> Result<AnalyzeOutcome, AppError> {
        let token = self.require_token()?;
        if self.analysis_in_flight {
            return Err(AppError::RequestPending("analysis"));
        }
        if self.quota_flow == QuotaFlow::Purchasing {
            return Err(AppError::RequestPending("analysis purchase"));
        }
        if self.counts.is_exhausted() {
            return self.offer_pack().map(AnalyzeOutcome::PurchaseRequired);
        }

        self.apply(Event::AnalysisStarted);
        let res = self
            .gateway
            .analyze_file(&token, file_name, file.clone(), title)
            .await;
        self.apply(Event::AnalysisSettled);
        match self.check_auth(res) {
            Ok(resp) => {
                let counts = PoolCounts::clamped(
                    resp.free_analyses_remaining,
                    resp.purchased_analyses_remaining,
                );
                self.apply(Event::AnalysisCompleted {
                    pending: PendingAnalysis {
                        analysis_id: resp.analysis_id.clone(),
                        digest: blake3::hash(&file),
                        quality_score: resp.quality_score,
                    },
                    counts,
                });
                Ok(AnalyzeOutcome::Analyzed(AnalysisReport {
                    analysis_id: resp.analysis_id,
                    quality_score: resp.quality_score,
                    summary: resp.summary,
                    counts,
                }))
            }
            Err(AppError::QuotaExhausted) => {
                // Server truth wins over drifted local counters.
                self.apply(Event::CountsAdopted {
                    counts: PoolCounts { free: 0, purchased: 0 },
                });
                self.offer_pack().map(AnalyzeOutcome::PurchaseRequired)
            }
            Err(e) => Err(e),
        }
    }

    /// Opens the pack-purchase prompt directly (the standalone buy flow).
    pub fn request_pack_offer(&mut self) -> Result<PackOffer, AppError> {
        self.require_token()?;
        self.offer_pack()
    }

    /// Second step of the prompt: the user has explicitly confirmed the
    /// debit. Counters and balance update together from one response, or not
    /// at all.
    pub async fn confirm_pack_purchase(&mut self) -> Result<PackPurchaseReceipt, AppError> {
        if self.quota_flow != QuotaFlow::PromptOffered {
            return Err(AppError::Validation(
                "No analysis purchase has been offered".to_string(),
            ));
        }
        let token = self.require_token()?;
        self.apply(Event::PackPurchaseStarted);
        let res = self.gateway.purchase_analyses(&token).await;
        match self.check_auth(res) {
            Ok(p) => {
                let counts =
                    PoolCounts::clamped(p.free_analyses_remaining, p.purchased_analyses_remaining);
                self.apply(Event::PackPurchased {
                    credits: p.credits,
                    counts,
                });
                Ok(PackPurchaseReceipt {
                    credits: p.credits,
                    counts,
                })
            }
            Err(e) => {
                self.apply(Event::PackPurchaseFailed);
                Err(e)
            }
        }
    }

    /// Declining the prompt returns to the prior state with no side effects.
    pub fn decline_pack_purchase(&mut self) {
        if self.quota_flow == QuotaFlow::PromptOffered {
            self.apply(Event::PromptDeclined);
        }
    }

    /// Publishes a note. Validation runs locally first; a draft that fails
    /// never reaches the network. The pending analysis is consumed by this
    /// one attempt, successful or not.
    pub async fn upload(&mut self, draft: NoteDraft) -> Result<String, AppError> {
        let token = self.require_token()?;
        let upload = validate_draft(&draft, self.pending_analysis.as_ref())?;
        self.apply(Event::AnalysisConsumed);
        let res = self.gateway.upload_note(&token, upload).await;
        self.check_auth(res)
    }

    /// Asks a question about a note's content and appends the exchange to
    /// the view's transcript.
    pub async fn ask(
        &mut self,
        note_id: &str,
        question: &str,
    ) -> Result<ConversationEntry, AppError> {
        let token = self.require_token()?;
        let question = question.trim();
        if question.is_empty() {
            return Err(AppError::Validation("Please enter a question".to_string()));
        }
        let res = self.gateway.ask_question(&token, note_id, question).await;
        let answer = self.check_auth(res)?;
        let entry = ConversationEntry {
            question: question.to_string(),
            answer,
        };
        self.apply(Event::QuestionAnswered {
            note_id: note_id.to_string(),
            entry: entry.clone(),
        });
        Ok(entry)
    }

    fn offer_pack(&mut self) -> Result<PackOffer, AppError> {
        let offer = PackOffer::standard();
        let balance = self.profile.as_ref().map(|p| p.credits).unwrap_or(0);
        if balance < offer.price {
            return Err(AppError::InsufficientBalance(format!(
                "purchasing {} analyses costs {} CNX Token, balance is {balance}",
                offer.pack_size, offer.price
            )));
        }
        if self.quota_flow != QuotaFlow::PromptOffered {
            self.apply(Event::PromptOpened);
        }
        Ok(offer)
    }

    /// Returns the bearer token of a live session, tearing the session down
    /// if it expired locally.
    fn require_token(&mut self) -> Result<String, AppError> {
        match &self.session {
            Some(s) if !s.is_expired() => Ok(s.token().to_string()),
            Some(_) => {
                self.invalidate_session();
                Err(AppError::Unauthorized)
            }
            None => Err(AppError::Unauthorized),
        }
    }

    fn live_token(&self) -> Option<String> {
        self.session
            .as_ref()
            .filter(|s| !s.is_expired())
            .map(|s| s.token().to_string())
    }

    /// Funnels every gateway result past the one authorization check: a 401
    /// from any endpoint clears the session and removes the credential.
    fn check_auth<T>(&mut self, result: Result<T, AppError>) -> Result<T, AppError> {
        if matches!(result, Err(AppError::Unauthorized)) {
            self.invalidate_session();
        }
        result
    }

    /// The single reducer. All controller state changes happen here.
    fn apply(&mut self, event: Event) {
        debug!(?event, "state transition");
        match event {
            Event::SessionAttached { session } => {
                self.session = Some(session);
                self.reset_session_state();
            }
            Event::SessionCleared => {
                self.session = None;
                self.reset_session_state();
            }
            Event::ProfileRefreshed { profile } => {
                self.counts = PoolCounts::clamped(
                    profile.free_analyses_remaining,
                    profile.purchased_analyses_remaining,
                );
                self.profile = Some(profile);
            }
            Event::NoteLoaded { note } => match self.views.get_mut(&note.id) {
                Some(view) => {
                    // Access never reverts within a session, whatever a
                    // refetch claims.
                    let held = view.note.has_access;
                    view.note = note;
                    view.note.has_access |= held;
                }
                None => {
                    self.views.insert(
                        note.id.clone(),
                        NoteView {
                            note,
                            access: NoteAccessState::Locked,
                            transcript: Vec::new(),
                        },
                    );
                }
            },
            Event::PurchaseStarted { note_id } => {
                if let Some(view) = self.views.get_mut(&note_id) {
                    view.access = NoteAccessState::Unlocking;
                }
            }
            Event::PurchaseConfirmed { note_id } => {
                if let Some(view) = self.views.get_mut(&note_id) {
                    view.note.has_access = true;
                }
            }
            Event::PurchaseFailed { note_id } => {
                if let Some(view) = self.views.get_mut(&note_id) {
                    if matches!(view.access, NoteAccessState::Unlocking) {
                        view.access = NoteAccessState::Locked;
                    }
                }
            }
            Event::FileUrlResolved { note_id, file_url } => {
                if let Some(view) = self.views.get_mut(&note_id) {
                    view.note.has_access = true;
                    view.access = NoteAccessState::Unlocked { file_url };
                }
            }
            Event::FileAccessDenied { note_id } => {
                if let Some(view) = self.views.get_mut(&note_id) {
                    view.access = NoteAccessState::AccessDenied;
                }
            }
            Event::AnalysisStarted => self.analysis_in_flight = true,
            Event::AnalysisSettled => self.analysis_in_flight = false,
            Event::AnalysisCompleted { pending, counts } => {
                self.counts = counts;
                self.pending_analysis = Some(pending);
                self.sync_profile_counts();
            }
            Event::CountsAdopted { counts } => {
                self.counts = counts;
                self.sync_profile_counts();
            }
            Event::PromptOpened => self.quota_flow = QuotaFlow::PromptOffered,
            Event::PromptDeclined => self.quota_flow = QuotaFlow::Idle,
            Event::PackPurchaseStarted => self.quota_flow = QuotaFlow::Purchasing,
            Event::PackPurchased { credits, counts } => {
                self.counts = counts;
                if let Some(p) = self.profile.as_mut() {
                    p.credits = credits;
                }
                self.sync_profile_counts();
                self.quota_flow = QuotaFlow::Idle;
            }
            Event::PackPurchaseFailed => self.quota_flow = QuotaFlow::PromptOffered,
            Event::AnalysisConsumed => self.pending_analysis = None,
            Event::QuestionAnswered { note_id, entry } => {
                match self.views.get_mut(&note_id) {
                    Some(view) => view.transcript.push(entry),
                    None => debug!("dropping transcript entry for unopened note {note_id}"),
                }
            }
        }
    }

    fn reset_session_state(&mut self) {
        self.profile = None;
        self.views.clear();
        self.counts = PoolCounts::clamped(FREE_POOL_CAP, 0);
        self.quota_flow = QuotaFlow::Idle;
        self.pending_analysis = None;
        self.analysis_in_flight = false;
    }

    fn sync_profile_counts(&mut self) {
        if let Some(p) = self.profile.as_mut() {
            p.free_analyses_remaining = self.counts.free;
            p.purchased_analyses_remaining = self.counts.purchased;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::encode_token;
    use crate::models::analysis::{AnalysesPurchase, AnalyzeResponse};
    use crate::upload::NoteUpload;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const ANALYSIS_ID: &str = "64b5f3a2c9e77a0012345678";

    /// Scripted gateway: each method pops the next queued response and
    /// panics when called unexpectedly, so "no network call" assertions
    /// fall out for free.
    #[derive(Default)]
    struct FakeGateway {
        profiles: Mutex<VecDeque<Result<UserProfile, AppError>>>,
        notes: Mutex<VecDeque<Result<Note, AppError>>>,
        purchases: Mutex<VecDeque<Result<(), AppError>>>,
        file_urls: Mutex<VecDeque<Result<String, AppError>>>,
        analyses: Mutex<VecDeque<Result<AnalyzeResponse, AppError>>>,
        pack_purchases: Mutex<VecDeque<Result<AnalysesPurchase, AppError>>>,
        uploads: Mutex<VecDeque<Result<String, AppError>>>,
        answers: Mutex<VecDeque<Result<String, AppError>>>,
        purchase_calls: AtomicUsize,
        pack_calls: AtomicUsize,
        upload_calls: AtomicUsize,
    }

    impl FakeGateway {
        fn pop<T>(queue: &Mutex<VecDeque<Result<T, AppError>>>, what: &str) -> Result<T, AppError> {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected {what} call"))
        }

        fn push_profile(&self, r: Result<UserProfile, AppError>) {
            self.profiles.lock().unwrap().push_back(r);
        }
        fn push_note(&self, r: Result<Note, AppError>) {
            self.notes.lock().unwrap().push_back(r);
        }
        fn push_purchase(&self, r: Result<(), AppError>) {
            self.purchases.lock().unwrap().push_back(r);
        }
        fn push_file_url(&self, r: Result<String, AppError>) {
            self.file_urls.lock().unwrap().push_back(r);
        }
        fn push_analysis(&self, r: Result<AnalyzeResponse, AppError>) {
            self.analyses.lock().unwrap().push_back(r);
        }
        fn push_pack(&self, r: Result<AnalysesPurchase, AppError>) {
            self.pack_purchases.lock().unwrap().push_back(r);
        }
        fn push_upload(&self, r: Result<String, AppError>) {
            self.uploads.lock().unwrap().push_back(r);
        }
        fn push_answer(&self, r: Result<String, AppError>) {
            self.answers.lock().unwrap().push_back(r);
        }
    }

    #[async_trait]
    impl MarketGateway for FakeGateway {
        async fn fetch_profile(&self, _token: &str) -> Result<UserProfile, AppError> {
            Self::pop(&self.profiles, "fetch_profile")
        }
        async fn fetch_note(&self, _token: Option<&str>, _id: &str) -> Result<Note, AppError> {
            Self::pop(&self.notes, "fetch_note")
        }
        async fn purchase_note(&self, _token: &str, _id: &str) -> Result<(), AppError> {
            self.purchase_calls.fetch_add(1, Ordering::SeqCst);
            Self::pop(&self.purchases, "purchase_note")
        }
        async fn fetch_file_url(&self, _token: &str, _id: &str) -> Result<String, AppError> {
            Self::pop(&self.file_urls, "fetch_file_url")
        }
        async fn analyze_file(
            &self,
            _token: &str,
            _file_name: &str,
            _file: Bytes,
            _title: &str,
        ) -> Result<AnalyzeResponse, AppError> {
            Self::pop(&self.analyses, "analyze_file")
        }
        async fn purchase_analyses(&self, _token: &str) -> Result<AnalysesPurchase, AppError> {
            self.pack_calls.fetch_add(1, Ordering::SeqCst);
            Self::pop(&self.pack_purchases, "purchase_analyses")
        }
        async fn upload_note(&self, _token: &str, _upload: NoteUpload) -> Result<String, AppError> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            Self::pop(&self.uploads, "upload_note")
        }
        async fn ask_question(
            &self,
            _token: &str,
            _id: &str,
            _question: &str,
        ) -> Result<String, AppError> {
            Self::pop(&self.answers, "ask_question")
        }
    }

    fn test_session() -> Session {
        let token = encode_token(&json!({
            "sub": "64b5f3a2c9e77a00deadbeef",
            "name": "Ada",
            "exp": Utc::now().timestamp() + 3600,
        }));
        Session::from_token(&token).unwrap()
    }

    fn profile(credits: u32, free: u8, purchased: u32) -> UserProfile {
        UserProfile {
            id: "64b5f3a2c9e77a00deadbeef".to_string(),
            name: "Ada".to_string(),
            email: "ada@campus.edu".to_string(),
            credits,
            is_premium: false,
            free_analyses_remaining: free,
            purchased_analyses_remaining: purchased,
        }
    }

    fn note(id: &str, price: u32, has_access: bool) -> Note {
        Note {
            id: id.to_string(),
            title: format!("Note {id}"),
            description: None,
            price,
            uploader: None,
            has_access,
        }
    }

    fn analyzed(score: f64, free: u8, purchased: u32) -> AnalyzeResponse {
        AnalyzeResponse {
            analysis_id: ANALYSIS_ID.to_string(),
            quality_score: score,
            summary: "Well structured notes".to_string(),
            free_analyses_remaining: free,
            purchased_analyses_remaining: purchased,
            credits: None,
        }
    }

    fn pdf() -> Bytes {
        Bytes::from_static(b"%PDF-1.4 test body")
    }

    fn draft() -> NoteDraft {
        NoteDraft {
            title: "Linear Algebra Week 3".to_string(),
            description: None,
            price: 5,
            file_name: "week3.pdf".to_string(),
            file: pdf(),
        }
    }

    struct Harness {
        controller: AccessController,
        fake: std::sync::Arc<FakeGateway>,
        _dir: tempfile::TempDir,
    }

    fn harness(logged_in: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(Some(dir.path().join("session"))).unwrap();
        let fake = std::sync::Arc::new(FakeGateway::default());
        let mut controller = AccessController::new(fake.clone(), store).unwrap();
        if logged_in {
            controller.attach_session(test_session()).unwrap();
        }
        Harness {
            controller,
            fake,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_purchase_without_session_short_circuits() {
        let mut h = harness(false);
        let outcome = h.controller.purchase("n1").await.unwrap();
        assert!(matches!(outcome, PurchaseOutcome::LoginRequired));
        assert_eq!(h.fake.purchase_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_purchase_unlocks_and_refreshes_balance() {
        let mut h = harness(true);
        h.fake.push_profile(Ok(profile(12, 3, 0)));
        h.controller.refresh_profile().await.unwrap();

        h.fake.push_note(Ok(note("n1", 5, false)));
        h.fake.push_purchase(Ok(()));
        h.fake.push_file_url(Ok("ipfs://bafy123".to_string()));
        h.fake.push_profile(Ok(profile(7, 3, 0)));

        let outcome = h.controller.purchase("n1").await.unwrap();
        match outcome {
            PurchaseOutcome::Unlocked { file_url, credits } => {
                assert_eq!(file_url, "ipfs://bafy123");
                assert_eq!(credits, 7);
            }
            other => panic!("expected Unlocked, got {other:?}"),
        }
        let view = h.controller.note_view("n1").unwrap();
        assert!(view.note.has_access);
        assert!(matches!(view.access, NoteAccessState::Unlocked { .. }));

        // Purchase is withdrawn for this note/session.
        let again = h.controller.purchase("n1").await.unwrap();
        assert!(matches!(again, PurchaseOutcome::AlreadyOwned));
        assert_eq!(h.fake.purchase_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_purchase_failure_reverts_to_locked() {
        let mut h = harness(true);
        h.fake.push_note(Ok(note("n1", 50, false)));
        h.fake
            .push_purchase(Err(AppError::InsufficientBalance("need 50".to_string())));

        let err = h.controller.purchase("n1").await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientBalance(_)));
        let view = h.controller.note_view("n1").unwrap();
        assert!(!view.note.has_access);
        assert!(matches!(view.access, NoteAccessState::Locked));

        // The trigger re-enables: a later attempt can succeed.
        h.fake.push_purchase(Ok(()));
        h.fake.push_file_url(Ok("ipfs://bafy456".to_string()));
        h.fake.push_profile(Ok(profile(0, 3, 0)));
        let outcome = h.controller.purchase("n1").await.unwrap();
        assert!(matches!(outcome, PurchaseOutcome::Unlocked { .. }));
    }

    #[tokio::test]
    async fn test_file_denied_after_access_marks_access_denied() {
        let mut h = harness(true);
        h.fake.push_note(Ok(note("n1", 5, true)));
        h.fake
            .push_file_url(Err(AppError::AccessDenied("Not purchased".to_string())));

        let err = h.controller.open_note("n1").await.unwrap_err();
        assert!(matches!(err, AppError::AccessDenied(m) if m.contains("revoked")));
        let view = h.controller.note_view("n1").unwrap();
        assert!(matches!(view.access, NoteAccessState::AccessDenied));

        // Purchase is not offered for a denied note.
        let outcome = h.controller.purchase("n1").await.unwrap();
        assert!(matches!(outcome, PurchaseOutcome::AlreadyOwned));
    }

    #[tokio::test]
    async fn test_file_denied_without_access_stays_locked() {
        let mut h = harness(true);
        h.fake.push_note(Ok(note("n1", 5, false)));
        h.controller.open_note("n1").await.unwrap();

        h.fake
            .push_file_url(Err(AppError::AccessDenied("Not purchased".to_string())));
        let err = h.controller.resolve_file_url("n1").await.unwrap_err();
        assert!(matches!(err, AppError::AccessDenied(m) if m.contains("not been purchased")));
        let view = h.controller.note_view("n1").unwrap();
        assert!(matches!(view.access, NoteAccessState::Locked));
    }

    #[tokio::test]
    async fn test_unauthorized_clears_session_and_credential() {
        let mut h = harness(true);
        h.fake.push_note(Ok(note("n1", 5, false)));
        h.fake.push_purchase(Err(AppError::Unauthorized));

        let err = h.controller.purchase("n1").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
        assert!(h.controller.session().is_none());
        assert!(h.controller.profile().is_none());

        // The persisted credential is gone too.
        let store = SessionStore::open(Some(h._dir.path().join("session"))).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_analyze_adopts_server_counts_without_drift() {
        let mut h = harness(true);
        h.fake.push_profile(Ok(profile(100, 2, 0)));
        h.controller.refresh_profile().await.unwrap();

        h.fake.push_analysis(Ok(analyzed(7.0, 1, 0)));
        h.controller.analyze("a.pdf", pdf(), "A").await.unwrap();
        assert_eq!(h.controller.pool_counts(), PoolCounts { free: 1, purchased: 0 });

        h.fake.push_analysis(Ok(analyzed(7.0, 0, 0)));
        h.controller.analyze("a.pdf", pdf(), "A").await.unwrap();
        assert_eq!(h.controller.pool_counts(), PoolCounts { free: 0, purchased: 0 });

        // Profile mirror follows the adopted counts.
        assert_eq!(h.controller.profile().unwrap().free_analyses_remaining, 0);
    }

    #[tokio::test]
    async fn test_analyze_failure_leaves_counters_untouched() {
        let mut h = harness(true);
        h.fake.push_profile(Ok(profile(100, 2, 0)));
        h.controller.refresh_profile().await.unwrap();

        h.fake.push_analysis(Err(AppError::Api {
            status: 500,
            message: "boom".to_string(),
        }));
        let err = h.controller.analyze("a.pdf", pdf(), "A").await.unwrap_err();
        assert!(matches!(err, AppError::Api { .. }));
        assert_eq!(h.controller.pool_counts(), PoolCounts { free: 2, purchased: 0 });

        // The in-flight guard released: a retry reaches the gateway.
        h.fake.push_analysis(Ok(analyzed(7.0, 1, 0)));
        assert!(h.controller.analyze("a.pdf", pdf(), "A").await.is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_pool_prompts_then_purchase_then_analyze() {
        let mut h = harness(true);
        h.fake.push_profile(Ok(profile(20, 0, 0)));
        h.controller.refresh_profile().await.unwrap();

        // No network call: local counters already show exhaustion.
        let outcome = h.controller.analyze("a.pdf", pdf(), "A").await.unwrap();
        let offer = match outcome {
            AnalyzeOutcome::PurchaseRequired(offer) => offer,
            other => panic!("expected PurchaseRequired, got {other:?}"),
        };
        assert_eq!(offer.price, 15);
        assert_eq!(h.controller.quota_flow(), QuotaFlow::PromptOffered);

        h.fake.push_pack(Ok(AnalysesPurchase {
            credits: 5,
            free_analyses_remaining: 0,
            purchased_analyses_remaining: 3,
        }));
        let receipt = h.controller.confirm_pack_purchase().await.unwrap();
        assert_eq!(receipt.credits, 5);
        assert_eq!(receipt.counts, PoolCounts { free: 0, purchased: 3 });
        assert_eq!(h.controller.profile().unwrap().credits, 5);
        assert_eq!(h.controller.quota_flow(), QuotaFlow::Idle);

        h.fake.push_analysis(Ok(analyzed(8.0, 0, 2)));
        let outcome = h.controller.analyze("a.pdf", pdf(), "A").await.unwrap();
        assert!(matches!(outcome, AnalyzeOutcome::Analyzed(_)));
        assert_eq!(h.controller.pool_counts(), PoolCounts { free: 0, purchased: 2 });
    }

    #[tokio::test]
    async fn test_server_reported_exhaustion_overrides_local_counts() {
        let mut h = harness(true);
        h.fake.push_profile(Ok(profile(20, 1, 0)));
        h.controller.refresh_profile().await.unwrap();

        // Local counters say one left; the server disagrees.
        h.fake.push_analysis(Err(AppError::QuotaExhausted));
        let outcome = h.controller.analyze("a.pdf", pdf(), "A").await.unwrap();
        assert!(matches!(outcome, AnalyzeOutcome::PurchaseRequired(_)));
        assert_eq!(h.controller.pool_counts(), PoolCounts { free: 0, purchased: 0 });
    }

    #[tokio::test]
    async fn test_offer_rejected_when_balance_below_price() {
        let mut h = harness(true);
        h.fake.push_profile(Ok(profile(10, 0, 0)));
        h.controller.refresh_profile().await.unwrap();

        let err = h.controller.analyze("a.pdf", pdf(), "A").await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientBalance(_)));
        // Rejected before the confirmation dialog: no prompt, no request,
        // balance and pools unchanged.
        assert_eq!(h.controller.quota_flow(), QuotaFlow::Idle);
        assert_eq!(h.fake.pack_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.controller.profile().unwrap().credits, 10);
        assert_eq!(h.controller.pool_counts(), PoolCounts { free: 0, purchased: 0 });
    }

    #[tokio::test]
    async fn test_declining_prompt_has_no_side_effects() {
        let mut h = harness(true);
        h.fake.push_profile(Ok(profile(20, 0, 0)));
        h.controller.refresh_profile().await.unwrap();

        let outcome = h.controller.analyze("a.pdf", pdf(), "A").await.unwrap();
        assert!(matches!(outcome, AnalyzeOutcome::PurchaseRequired(_)));

        h.controller.decline_pack_purchase();
        assert_eq!(h.controller.quota_flow(), QuotaFlow::Idle);
        assert_eq!(h.fake.pack_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.controller.profile().unwrap().credits, 20);
    }

    #[tokio::test]
    async fn test_confirm_without_offer_is_rejected() {
        let mut h = harness(true);
        let err = h.controller.confirm_pack_purchase().await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(h.fake.pack_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_pack_purchase_updates_nothing() {
        let mut h = harness(true);
        h.fake.push_profile(Ok(profile(20, 0, 0)));
        h.controller.refresh_profile().await.unwrap();
        h.controller.request_pack_offer().unwrap();

        h.fake.push_pack(Err(AppError::Api {
            status: 500,
            message: "boom".to_string(),
        }));
        let err = h.controller.confirm_pack_purchase().await.unwrap_err();
        assert!(matches!(err, AppError::Api { .. }));
        // Atomicity: neither the balance nor the counters moved.
        assert_eq!(h.controller.profile().unwrap().credits, 20);
        assert_eq!(h.controller.pool_counts(), PoolCounts { free: 0, purchased: 0 });
        assert_eq!(h.controller.quota_flow(), QuotaFlow::PromptOffered);
    }

    #[tokio::test]
    async fn test_upload_without_analysis_never_reaches_network() {
        let mut h = harness(true);
        let err = h.controller.upload(draft()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(h.fake.upload_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_upload_below_threshold_never_reaches_network() {
        let mut h = harness(true);
        h.fake.push_profile(Ok(profile(20, 3, 0)));
        h.controller.refresh_profile().await.unwrap();
        h.fake.push_analysis(Ok(analyzed(4.2, 2, 0)));
        h.controller.analyze("week3.pdf", pdf(), "T").await.unwrap();

        let err = h.controller.upload(draft()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(m) if m.contains("threshold")));
        assert_eq!(h.fake.upload_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_upload_consumes_analysis_exactly_once() {
        let mut h = harness(true);
        h.fake.push_profile(Ok(profile(20, 3, 0)));
        h.controller.refresh_profile().await.unwrap();
        h.fake.push_analysis(Ok(analyzed(8.0, 2, 0)));
        h.controller.analyze("week3.pdf", pdf(), "T").await.unwrap();

        h.fake.push_upload(Ok("64b5f3a2c9e77a00aaaaaaaa".to_string()));
        let note_id = h.controller.upload(draft()).await.unwrap();
        assert_eq!(note_id, "64b5f3a2c9e77a00aaaaaaaa");

        // The analysis is spent: a second attempt is rejected locally.
        let err = h.controller.upload(draft()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(h.fake.upload_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upload_rejects_different_file_than_analyzed() {
        let mut h = harness(true);
        h.fake.push_profile(Ok(profile(20, 3, 0)));
        h.controller.refresh_profile().await.unwrap();
        h.fake.push_analysis(Ok(analyzed(8.0, 2, 0)));
        h.controller
            .analyze("other.pdf", Bytes::from_static(b"%PDF-1.4 other"), "T")
            .await
            .unwrap();

        let err = h.controller.upload(draft()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(m) if m.contains("Re-run")));
        assert_eq!(h.fake.upload_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ask_appends_transcript_in_order() {
        let mut h = harness(true);
        h.fake.push_note(Ok(note("n1", 5, false)));
        h.controller.open_note("n1").await.unwrap();

        h.fake.push_answer(Ok("Answer one".to_string()));
        h.controller.ask("n1", "What is covered?").await.unwrap();
        h.fake.push_answer(Ok("Answer two".to_string()));
        h.controller.ask("n1", "Any examples?").await.unwrap();

        let transcript = &h.controller.note_view("n1").unwrap().transcript;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].question, "What is covered?");
        assert_eq!(transcript[0].answer, "Answer one");
        assert_eq!(transcript[1].question, "Any examples?");
    }

    #[tokio::test]
    async fn test_ask_rejects_empty_question() {
        let mut h = harness(true);
        let err = h.controller.ask("n1", "   ").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(m) if m.contains("question")));
    }

    #[tokio::test]
    async fn test_open_note_with_access_resolves_file_url() {
        let mut h = harness(true);
        h.fake.push_note(Ok(note("n1", 5, true)));
        h.fake.push_file_url(Ok("ipfs://bafy789".to_string()));

        let view = h.controller.open_note("n1").await.unwrap();
        match &view.access {
            NoteAccessState::Unlocked { file_url } => assert_eq!(file_url, "ipfs://bafy789"),
            other => panic!("expected Unlocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refetch_never_revokes_held_access() {
        let mut h = harness(true);
        h.fake.push_note(Ok(note("n1", 5, true)));
        h.fake.push_file_url(Ok("ipfs://bafy789".to_string()));
        h.controller.open_note("n1").await.unwrap();

        // Server now claims no access; the session's belief must not revert.
        h.fake.push_note(Ok(note("n1", 5, false)));
        h.fake.push_file_url(Ok("ipfs://bafy789".to_string()));
        let view = h.controller.open_note("n1").await.unwrap();
        assert!(view.note.has_access);
        assert!(matches!(view.access, NoteAccessState::Unlocked { .. }));
    }

    #[tokio::test]
    async fn test_expired_session_is_torn_down_on_use() {
        let mut h = harness(false);
        let expired = encode_token(&json!({
            "sub": "64b5f3a2c9e77a00deadbeef",
            "exp": Utc::now().timestamp() - 10,
        }));
        // Bypass attach_session's store write; inject directly.
        h.controller.session = Session::from_token(&expired).ok();

        let err = h.controller.refresh_profile().await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
        assert!(h.controller.session().is_none());
    }
}
