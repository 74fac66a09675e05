//! Authenticated session gate.
//!
//! Two states, [`SessionState::Anonymous`] and
//! [`SessionState::Authenticated`]. Sign-in resolves the user's profile
//! before the state changes, so observers never see an identity without a
//! profile.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::SyncError;
use crate::model::{CollectionName, Profile, Record, RecordId, Role};
use crate::service::{DataService, ServiceError, fetch_one};

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub profile: Profile,
}

impl Identity {
    #[must_use]
    pub const fn role(&self) -> Role {
        self.profile.role
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Anonymous,
    Authenticated(Arc<Identity>),
}

impl SessionState {
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    #[must_use]
    pub fn identity(&self) -> Option<Arc<Identity>> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated(identity) => Some(Arc::clone(identity)),
        }
    }
}

#[derive(Debug)]
pub struct SessionGate {
    state: watch::Sender<SessionState>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(SessionState::Anonymous),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    #[must_use]
    pub fn identity(&self) -> Option<Arc<Identity>> {
        self.state.borrow().identity()
    }

    /// Current identity, or [`SyncError::NotAuthenticated`].
    pub fn require_identity(&self) -> Result<Arc<Identity>, SyncError> {
        self.identity().ok_or(SyncError::NotAuthenticated)
    }

    /// Resolve `user_id`'s profile and enter the authenticated state.
    ///
    /// On failure the gate is left exactly as it was.
    pub async fn sign_in(
        &self,
        service: &dyn DataService,
        user_id: &str,
    ) -> Result<Arc<Identity>, SyncError> {
        let id = RecordId::from(user_id);
        let record = fetch_one(service, CollectionName::Profiles, &id)
            .await
            .map_err(|e| match e {
                ServiceError::NotFound { collection, id } => {
                    SyncError::MissingRelation { collection, id }
                }
                other => SyncError::from(other),
            })?;
        let profile = Profile::extract(&record)
            .cloned()
            .ok_or_else(|| SyncError::MissingRelation {
                collection: CollectionName::Profiles,
                id: id.clone(),
            })?;

        let identity = Arc::new(Identity {
            user_id: user_id.to_string(),
            profile,
        });
        self.state
            .send_replace(SessionState::Authenticated(Arc::clone(&identity)));
        tracing::info!(user_id, role = %identity.role(), "signed in");
        Ok(identity)
    }

    /// Return to anonymous. Returns whether a session was open.
    pub fn sign_out(&self) -> bool {
        let previous = self.state.send_replace(SessionState::Anonymous);
        if let SessionState::Authenticated(identity) = &previous {
            tracing::info!(user_id = %identity.user_id, "signed out");
        }
        previous.is_authenticated()
    }

    /// Replace the identity's profile if `profile` belongs to the signed-in user.
    pub fn apply_profile_change(&self, profile: &Profile) -> bool {
        self.state.send_if_modified(|state| match state {
            SessionState::Authenticated(identity)
                if identity.user_id == profile.id && identity.profile != *profile =>
            {
                *identity = Arc::new(Identity {
                    user_id: identity.user_id.clone(),
                    profile: profile.clone(),
                });
                true
            }
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionGate, SessionState};
    use crate::error::SyncError;
    use crate::model::{AnyRecord, Profile, Role};
    use crate::service::MemoryBackend;
    use chrono::Utc;

    fn profile(id: &str, role: Role) -> Profile {
        Profile {
            id: id.into(),
            full_name: format!("User {id}"),
            email: format!("{id}@example.com"),
            role,
            avatar_url: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sign_in_requires_profile() {
        let backend = MemoryBackend::new();
        let gate = SessionGate::new();
        let mut watcher = gate.watch();

        let err = gate
            .sign_in(&backend.connect("ghost"), "ghost")
            .await
            .expect_err("no profile row");
        assert!(matches!(err, SyncError::MissingRelation { .. }));
        assert_eq!(gate.state(), SessionState::Anonymous);
        assert!(!watcher.has_changed().expect("gate alive"));

        backend.seed(AnyRecord::Profiles(profile("user-a", Role::Manager)));
        let identity = gate
            .sign_in(&backend.connect("user-a"), "user-a")
            .await
            .expect("sign in");
        assert_eq!(identity.role(), Role::Manager);
        assert!(gate.is_authenticated());
        assert!(watcher.has_changed().expect("gate alive"));
    }

    #[tokio::test]
    async fn offline_sign_in_is_transient() {
        let backend = MemoryBackend::new();
        backend.seed(AnyRecord::Profiles(profile("user-a", Role::Employee)));
        backend.set_offline(true);

        let gate = SessionGate::new();
        let err = gate
            .sign_in(&backend.connect("user-a"), "user-a")
            .await
            .expect_err("offline");
        assert!(err.is_transient());
        assert!(gate.require_identity().is_err());
    }

    #[tokio::test]
    async fn profile_change_only_for_current_user() {
        let backend = MemoryBackend::new();
        backend.seed(AnyRecord::Profiles(profile("user-a", Role::Employee)));
        let gate = SessionGate::new();
        gate.sign_in(&backend.connect("user-a"), "user-a")
            .await
            .expect("sign in");

        assert!(!gate.apply_profile_change(&profile("user-b", Role::Admin)));

        let mut promoted = profile("user-a", Role::Manager);
        promoted.full_name = "Promoted".into();
        assert!(gate.apply_profile_change(&promoted));
        assert_eq!(gate.require_identity().expect("identity").role(), Role::Manager);

        assert!(gate.sign_out());
        assert!(!gate.sign_out());
        assert!(!gate.apply_profile_change(&promoted));
    }
}
