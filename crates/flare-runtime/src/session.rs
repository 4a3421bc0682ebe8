//! Session-establishment service
//!
//! Drives the client from cold start to an authenticated session: connect,
//! fetch the server's credential policy, collect credentials from the user,
//! then register or log in. Transport failures detour through a bounded
//! reconnection state and resume where they left off; explicit server
//! denials return to credential collection; trust violations abort.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flare_core::credentials::{
    evaluate_password, screen_username, CredentialRequirements, Credentials, PasswordStrength,
    UsernameStatus,
};
use flare_core::crypto::{
    salt_entropy_bits, MIN_MEMORY_COST_KIB, MIN_SALT_ENTROPY_BITS, MIN_TIME_COST,
};
use flare_core::errors::{DenialError, FlareError, Result, TransportError, TrustError};
use flare_core::fsm::Fsm;
use flare_core::identity::{IdentityKeyPair, IdentityStore};
use flare_core::transport::UnaryTransport;
use flare_core::wire::{
    HashParams, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse, TokenHealth,
    UnaryRequest, UnaryResponse, UsernameOpinion, AUTH_METADATA_KEY,
};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::service::Service;

// ----------------------------------------------------------------------------
// States and Commands
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Initialized,
    Connecting,
    ReceivingRequirements,
    SettingCredentials,
    Registering,
    LoggingIn,
    Reconnecting,
    EndedSuccessfully,
    Ended,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SessionCommand {
    Run,
    Proceed,
    TokenVerified,
    Register,
    Login,
    Succeed,
    Deny,
    Fail,
    RetryConnect,
    RetryFetch,
    RetrySet,
    RetryRegister,
    RetryLogin,
    GiveUp,
    Abort,
    Restart,
}

fn session_fsm() -> Fsm<SessionState, SessionCommand> {
    use SessionCommand as C;
    use SessionState as S;

    let mut fsm = Fsm::new(S::Initialized);
    fsm.register(S::Initialized, C::Run, S::Connecting)
        .register(S::Connecting, C::Proceed, S::ReceivingRequirements)
        .register(S::Connecting, C::Login, S::LoggingIn)
        .register(S::Connecting, C::TokenVerified, S::EndedSuccessfully)
        .register(S::Connecting, C::Fail, S::Reconnecting)
        .register(S::ReceivingRequirements, C::Proceed, S::SettingCredentials)
        .register(S::ReceivingRequirements, C::Fail, S::Reconnecting)
        .register(S::SettingCredentials, C::Register, S::Registering)
        .register(S::SettingCredentials, C::Login, S::LoggingIn)
        .register(S::SettingCredentials, C::Fail, S::Reconnecting)
        .register(S::SettingCredentials, C::Abort, S::Aborted)
        .register(S::Registering, C::Succeed, S::EndedSuccessfully)
        .register(S::Registering, C::Deny, S::SettingCredentials)
        .register(S::Registering, C::Fail, S::Reconnecting)
        .register(S::Registering, C::Abort, S::Aborted)
        .register(S::LoggingIn, C::Succeed, S::EndedSuccessfully)
        .register(S::LoggingIn, C::Deny, S::SettingCredentials)
        .register(S::LoggingIn, C::Fail, S::Reconnecting)
        .register(S::LoggingIn, C::Abort, S::Aborted)
        .register(S::Reconnecting, C::RetryConnect, S::Connecting)
        .register(S::Reconnecting, C::RetryFetch, S::ReceivingRequirements)
        .register(S::Reconnecting, C::RetrySet, S::SettingCredentials)
        .register(S::Reconnecting, C::RetryRegister, S::Registering)
        .register(S::Reconnecting, C::RetryLogin, S::LoggingIn)
        .register(S::Reconnecting, C::GiveUp, S::Ended)
        .register(S::Aborted, C::Restart, S::Initialized);
    fsm
}

// ----------------------------------------------------------------------------
// Inputs and Outputs
// ----------------------------------------------------------------------------

/// Whether the collected credentials should create an account or resume one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIntent {
    Register,
    Login,
}

/// A credential submission from the client facade.
#[derive(Debug, Clone)]
pub struct CredentialUpdate {
    pub username: String,
    pub password: String,
    pub intent: SessionIntent,
}

/// Events the session service reports back to the facade.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    RequirementsReceived(CredentialRequirements),
    UsernameRejected(UsernameStatus),
    PasswordRejected(PasswordStrength),
    Denied(DenialError),
    TokenIssued,
    GaveUp,
    Aborted(String),
}

// ----------------------------------------------------------------------------
// Session Service
// ----------------------------------------------------------------------------

pub struct SessionService {
    transport: Arc<dyn UnaryTransport>,
    config: ClientConfig,
    fsm: Fsm<SessionState, SessionCommand>,
    credentials: Arc<Mutex<Credentials>>,
    identity: Arc<Mutex<IdentityStore>>,
    requirements: Option<CredentialRequirements>,
    /// Update that was being processed when the transport failed; replayed
    /// after the reconnection detour.
    pending_update: Option<CredentialUpdate>,
    /// Where a successful reconnection resumes.
    resume: SessionCommand,
    token_tx: watch::Sender<Option<String>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    updates: mpsc::UnboundedReceiver<CredentialUpdate>,
}

impl SessionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn UnaryTransport>,
        config: ClientConfig,
        credentials: Arc<Mutex<Credentials>>,
        identity: Arc<Mutex<IdentityStore>>,
        token_tx: watch::Sender<Option<String>>,
        events: mpsc::UnboundedSender<SessionEvent>,
        updates: mpsc::UnboundedReceiver<CredentialUpdate>,
    ) -> Self {
        Self {
            transport,
            config,
            fsm: session_fsm(),
            credentials,
            identity,
            requirements: None,
            pending_update: None,
            resume: SessionCommand::RetryConnect,
            token_tx,
            events,
            updates,
        }
    }

    pub fn state(&self) -> SessionState {
        self.fsm.state()
    }

    /// Return an aborted service to its initial state for a fresh
    /// establishment run.
    pub fn restart(&mut self) -> Result<()> {
        self.advance(SessionCommand::Restart)?;
        self.pending_update = None;
        self.resume = SessionCommand::RetryConnect;
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        // The facade may have been dropped during shutdown.
        let _ = self.events.send(event);
    }

    fn advance(&mut self, command: SessionCommand) -> Result<()> {
        let next = self.fsm.advance(command)?;
        debug!(?next, ?command, "session transition");
        Ok(())
    }

    /// Record the resume point and detour through reconnection.
    fn fail_over(&mut self, resume: SessionCommand, error: &TransportError) -> Result<()> {
        warn!(%error, "session transport failure, reconnecting");
        self.resume = resume;
        self.advance(SessionCommand::Fail)
    }

    fn credentials_snapshot(&self) -> Credentials {
        self.credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn store_token(&self, token: String) {
        {
            let mut creds = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
            creds.auth_token = token.clone();
        }
        let _ = self.token_tx.send(Some(token));
    }

    async fn call(
        &self,
        request: UnaryRequest,
        authenticated: bool,
    ) -> core::result::Result<UnaryResponse, TransportError> {
        let token = if authenticated {
            self.credentials_snapshot().auth_token
        } else {
            String::new()
        };
        let metadata: Vec<(&str, &str)> = if authenticated {
            vec![(AUTH_METADATA_KEY, token.as_str())]
        } else {
            Vec::new()
        };
        match timeout(self.config.call_timeout, self.transport.call(request, &metadata)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                duration_ms: self.config.call_timeout.as_millis() as u64,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Per-State Handlers
    // ------------------------------------------------------------------------

    async fn handle_connecting(&mut self) -> Result<()> {
        match timeout(self.config.connect_timeout, self.transport.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.fail_over(SessionCommand::RetryConnect, &e),
            Err(_) => {
                let e = TransportError::Timeout {
                    duration_ms: self.config.connect_timeout.as_millis() as u64,
                };
                return self.fail_over(SessionCommand::RetryConnect, &e);
            }
        }

        let creds = self.credentials_snapshot();
        if creds.has_token() {
            return self.verify_held_token().await;
        }
        if creds.filled() {
            info!("stored credentials present, proceeding straight to login");
            return self.advance(SessionCommand::Login);
        }
        self.advance(SessionCommand::Proceed)
    }

    /// A token from a previous session may still be honored; check it before
    /// putting the user through credential collection again.
    async fn verify_held_token(&mut self) -> Result<()> {
        match self.call(UnaryRequest::TokenHealth, true).await {
            Ok(UnaryResponse::TokenHealth(TokenHealth::Ok)) => {
                let token = self.credentials_snapshot().auth_token;
                let _ = self.token_tx.send(Some(token));
                self.emit(SessionEvent::TokenIssued);
                self.advance(SessionCommand::TokenVerified)
            }
            Ok(UnaryResponse::TokenHealth(TokenHealth::Expired)) => {
                match self.call(UnaryRequest::RenewToken, true).await {
                    Ok(UnaryResponse::RenewToken(token)) => {
                        self.store_token(token);
                        self.emit(SessionEvent::TokenIssued);
                        self.advance(SessionCommand::TokenVerified)
                    }
                    Ok(_) | Err(_) => self.discard_token_and_proceed(),
                }
            }
            Ok(UnaryResponse::TokenHealth(TokenHealth::Invalid)) | Ok(_) => {
                self.discard_token_and_proceed()
            }
            Err(e) => self.fail_over(SessionCommand::RetryConnect, &e),
        }
    }

    fn discard_token_and_proceed(&mut self) -> Result<()> {
        info!("held auth token is no longer honored, starting fresh establishment");
        {
            let mut creds = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
            creds.auth_token.clear();
        }
        let _ = self.token_tx.send(None);
        self.advance(SessionCommand::Proceed)
    }

    async fn handle_receiving_requirements(&mut self) -> Result<()> {
        match self.call(UnaryRequest::Requirements, false).await {
            Ok(UnaryResponse::Requirements(requirements)) => {
                self.emit(SessionEvent::RequirementsReceived(requirements.clone()));
                self.requirements = Some(requirements);
                self.advance(SessionCommand::Proceed)
            }
            Ok(other) => {
                warn!(?other, "unexpected response to requirements request");
                let e = TransportError::ReceiveFailed {
                    reason: "unexpected response record".into(),
                };
                self.fail_over(SessionCommand::RetryFetch, &e)
            }
            Err(e) => self.fail_over(SessionCommand::RetryFetch, &e),
        }
    }

    async fn handle_setting_credentials(&mut self) -> Result<()> {
        let update = match self.pending_update.take() {
            Some(update) => update,
            None => match timeout(self.config.credential_wait_timeout, self.updates.recv()).await {
                Ok(Some(update)) => update,
                // Closed channel: the facade is gone, nothing more to wait for.
                Ok(None) => {
                    self.emit(SessionEvent::Aborted("credential source closed".into()));
                    return self.advance(SessionCommand::Abort);
                }
                // Benign; keep waiting.
                Err(_) => return Ok(()),
            },
        };

        let requirements = self.requirements.clone().unwrap_or_default();

        // Local screen first: obviously bad candidates never hit the network.
        let local = screen_username(&requirements.username, &update.username);
        if !local.is_acceptable() {
            self.emit(SessionEvent::UsernameRejected(local));
            return Ok(());
        }

        if update.intent == SessionIntent::Register {
            match self
                .call(
                    UnaryRequest::UsernameOpinion {
                        username: update.username.clone(),
                    },
                    false,
                )
                .await
            {
                Ok(UnaryResponse::UsernameOpinion(UsernameOpinion::Available)) => {}
                Ok(UnaryResponse::UsernameOpinion(UsernameOpinion::Taken)) => {
                    self.emit(SessionEvent::UsernameRejected(UsernameStatus::Taken));
                    return Ok(());
                }
                Ok(UnaryResponse::UsernameOpinion(UsernameOpinion::NonCompliant)) | Ok(_) => {
                    self.emit(SessionEvent::UsernameRejected(UsernameStatus::NonCompliant));
                    return Ok(());
                }
                Err(e) => {
                    self.pending_update = Some(update);
                    return self.fail_over(SessionCommand::RetrySet, &e);
                }
            }
        }

        let strength = evaluate_password(&requirements.password, &update.password);
        if !strength.is_acceptable() {
            self.emit(SessionEvent::PasswordRejected(strength));
            return Ok(());
        }

        {
            let mut creds = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
            creds.username = update.username;
            creds.password = update.password;
        }
        match update.intent {
            SessionIntent::Register => self.advance(SessionCommand::Register),
            SessionIntent::Login => self.advance(SessionCommand::Login),
        }
    }

    async fn handle_registering(&mut self) -> Result<()> {
        let request = {
            let mut creds = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
            creds.memory_cost_kib = self.config.argon_memory_cost_kib;
            creds.time_cost = self.config.argon_time_cost;
            creds.derive_hash_for_registration(&self.config.server_host)?;

            let mut identity = self.identity.lock().unwrap_or_else(|e| e.into_inner());
            if identity.local().is_none() {
                identity.set_local(IdentityKeyPair::generate());
            }
            let public_key = identity
                .local()
                .map(IdentityKeyPair::public_key_bytes)
                .unwrap_or_default();

            RegisterRequest {
                username: creds.username.clone(),
                password_hash: creds.password_hash().to_owned(),
                hash_params: HashParams {
                    memory_cost_kib: u64::from(creds.memory_cost_kib),
                    time_cost: u64::from(creds.time_cost),
                    salt: creds.random_salt.clone(),
                },
                public_key,
            }
        };

        match self.call(UnaryRequest::Register(request), false).await {
            Ok(UnaryResponse::Register(RegisterResponse::Token(token))) => {
                info!("registration accepted");
                self.store_token(token);
                self.emit(SessionEvent::TokenIssued);
                self.advance(SessionCommand::Succeed)
            }
            Ok(UnaryResponse::Register(RegisterResponse::Deny(reason))) => {
                let denial = DenialError::from(reason);
                warn!(%denial, "registration denied");
                self.emit(SessionEvent::Denied(denial));
                self.advance(SessionCommand::Deny)
            }
            Ok(other) => {
                warn!(?other, "unexpected response to registration");
                let e = TransportError::ReceiveFailed {
                    reason: "unexpected response record".into(),
                };
                self.fail_over(SessionCommand::RetryRegister, &e)
            }
            Err(e) => self.fail_over(SessionCommand::RetryRegister, &e),
        }
    }

    async fn handle_logging_in(&mut self) -> Result<()> {
        let username = self.credentials_snapshot().username;
        let params = match self
            .call(UnaryRequest::ClientHashParams { username: username.clone() }, false)
            .await
        {
            Ok(UnaryResponse::ClientHashParams(params)) => params,
            Ok(UnaryResponse::Deny(reason)) => {
                let denial = DenialError::from(reason);
                self.emit(SessionEvent::Denied(denial));
                return self.advance(SessionCommand::Deny);
            }
            Ok(other) => {
                warn!(?other, "unexpected response to hash-parameter request");
                let e = TransportError::ReceiveFailed {
                    reason: "unexpected response record".into(),
                };
                return self.fail_over(SessionCommand::RetryLogin, &e);
            }
            Err(e) => return self.fail_over(SessionCommand::RetryLogin, &e),
        };

        // Never hash under parameters weaker than the trust floor; a server
        // asking for that is not a server worth logging in to.
        if let Err(violation) = check_trust_floor(&params) {
            self.emit(SessionEvent::Aborted(violation.to_string()));
            self.advance(SessionCommand::Abort)?;
            return Err(FlareError::from(violation));
        }

        let request = {
            let mut creds = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
            creds.derive_hash_for_login(
                &self.config.server_host,
                &params.salt,
                params.memory_cost_kib as u32,
                params.time_cost as u32,
            )?;
            LoginRequest {
                username: creds.username.clone(),
                password_hash: creds.password_hash().to_owned(),
            }
        };

        match self.call(UnaryRequest::Login(request), false).await {
            Ok(UnaryResponse::Login(LoginResponse::Token(token))) => {
                info!("login accepted");
                self.store_token(token);
                {
                    let mut identity = self.identity.lock().unwrap_or_else(|e| e.into_inner());
                    if identity.local().is_none() {
                        identity.set_local(IdentityKeyPair::generate());
                    }
                }
                self.emit(SessionEvent::TokenIssued);
                self.advance(SessionCommand::Succeed)
            }
            Ok(UnaryResponse::Login(LoginResponse::Deny(reason))) => {
                let denial = DenialError::from(reason);
                warn!(%denial, "login denied");
                self.emit(SessionEvent::Denied(denial));
                self.advance(SessionCommand::Deny)
            }
            Ok(other) => {
                warn!(?other, "unexpected response to login");
                let e = TransportError::ReceiveFailed {
                    reason: "unexpected response record".into(),
                };
                self.fail_over(SessionCommand::RetryLogin, &e)
            }
            Err(e) => self.fail_over(SessionCommand::RetryLogin, &e),
        }
    }

    async fn handle_reconnecting(&mut self) -> Result<()> {
        for attempt in 1..=self.config.reconnect_attempts {
            debug!(attempt, "reconnection attempt");
            if let Ok(Ok(())) =
                timeout(self.config.connect_timeout, self.transport.connect()).await
            {
                info!(attempt, "reconnected");
                return self.advance(self.resume);
            }
            tokio::time::sleep(self.config.reconnect_pause).await;
        }
        warn!(
            attempts = self.config.reconnect_attempts,
            "reconnection attempts exhausted, giving up"
        );
        self.emit(SessionEvent::GaveUp);
        self.advance(SessionCommand::GiveUp)
    }
}

#[async_trait]
impl Service for SessionService {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn step(&mut self) -> Result<()> {
        match self.fsm.state() {
            SessionState::Initialized => self.advance(SessionCommand::Run),
            SessionState::Connecting => self.handle_connecting().await,
            SessionState::ReceivingRequirements => self.handle_receiving_requirements().await,
            SessionState::SettingCredentials => self.handle_setting_credentials().await,
            SessionState::Registering => self.handle_registering().await,
            SessionState::LoggingIn => self.handle_logging_in().await,
            SessionState::Reconnecting => self.handle_reconnecting().await,
            SessionState::EndedSuccessfully | SessionState::Ended | SessionState::Aborted => Ok(()),
        }
    }

    fn ended(&self) -> bool {
        matches!(
            self.fsm.state(),
            SessionState::EndedSuccessfully | SessionState::Ended | SessionState::Aborted
        ) || self.transport.connection_lost()
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Reject server-supplied hash parameters weaker than the local floor.
fn check_trust_floor(params: &HashParams) -> core::result::Result<(), TrustError> {
    if params.memory_cost_kib < MIN_MEMORY_COST_KIB {
        return Err(TrustError::MemoryCostBelowFloor {
            got: params.memory_cost_kib,
            floor: MIN_MEMORY_COST_KIB,
        });
    }
    if params.time_cost < MIN_TIME_COST {
        return Err(TrustError::TimeCostBelowFloor {
            got: params.time_cost,
            floor: MIN_TIME_COST,
        });
    }
    let bits = salt_entropy_bits(&params.salt);
    if bits < MIN_SALT_ENTROPY_BITS as f64 {
        return Err(TrustError::SaltBelowFloor {
            bits,
            floor: MIN_SALT_ENTROPY_BITS,
        });
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_floor_accepts_the_minimum_exactly() {
        let params = HashParams {
            memory_cost_kib: MIN_MEMORY_COST_KIB,
            time_cost: MIN_TIME_COST,
            // Six bits per character, so six characters clear the 31-bit floor.
            salt: "abcdef".into(),
        };
        assert!(check_trust_floor(&params).is_ok());
    }

    #[test]
    fn trust_floor_rejects_weak_memory_cost() {
        let params = HashParams {
            memory_cost_kib: MIN_MEMORY_COST_KIB - 1,
            time_cost: MIN_TIME_COST,
            salt: "abcdefgh".into(),
        };
        assert!(matches!(
            check_trust_floor(&params),
            Err(TrustError::MemoryCostBelowFloor { .. })
        ));
    }

    #[test]
    fn trust_floor_rejects_short_salt() {
        let params = HashParams {
            memory_cost_kib: MIN_MEMORY_COST_KIB,
            time_cost: MIN_TIME_COST,
            salt: "abcd".into(),
        };
        assert!(matches!(
            check_trust_floor(&params),
            Err(TrustError::SaltBelowFloor { .. })
        ));
    }

    #[test]
    fn fsm_denial_returns_to_credential_collection() {
        let mut fsm = session_fsm();
        fsm.advance(SessionCommand::Run).unwrap();
        fsm.advance(SessionCommand::Proceed).unwrap();
        fsm.advance(SessionCommand::Proceed).unwrap();
        fsm.advance(SessionCommand::Register).unwrap();
        assert_eq!(
            fsm.advance(SessionCommand::Deny).unwrap(),
            SessionState::SettingCredentials
        );
    }

    #[test]
    fn fsm_reconnection_resumes_the_interrupted_state() {
        let mut fsm = session_fsm();
        fsm.advance(SessionCommand::Run).unwrap();
        fsm.advance(SessionCommand::Proceed).unwrap();
        fsm.advance(SessionCommand::Fail).unwrap();
        assert_eq!(
            fsm.advance(SessionCommand::RetryFetch).unwrap(),
            SessionState::ReceivingRequirements
        );
    }

    #[test]
    fn fsm_connecting_can_go_straight_to_logging_in() {
        let mut fsm = session_fsm();
        fsm.advance(SessionCommand::Run).unwrap();
        assert_eq!(
            fsm.advance(SessionCommand::Login).unwrap(),
            SessionState::LoggingIn
        );
    }

    #[test]
    fn fsm_aborted_restarts_to_initialized() {
        let mut fsm = session_fsm();
        fsm.advance(SessionCommand::Run).unwrap();
        fsm.advance(SessionCommand::Proceed).unwrap();
        fsm.advance(SessionCommand::Proceed).unwrap();
        fsm.advance(SessionCommand::Abort).unwrap();
        assert_eq!(
            fsm.advance(SessionCommand::Restart).unwrap(),
            SessionState::Initialized
        );
    }

    #[test]
    fn fsm_rejects_nonsense_transitions() {
        let mut fsm = session_fsm();
        assert!(fsm.advance(SessionCommand::Succeed).is_err());
        // The failed advance leaves the machine where it was.
        assert_eq!(fsm.state(), SessionState::Initialized);
    }
}
