mod memory;
mod sqlite;

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trustroute_core::{
    default_operators, Booking, BookingDetails, BusOperator, ConversationSession,
    OperatorWithPolicy, PolicyError, RefundPolicy, RefundRules, RefundStatus, RefundTransaction,
    TransitionError, User,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("stored policy is invalid: {0}")]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A signed-in browser session. Only the SHA-256 of the cookie token is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub token_hash: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A policy about to become the operator's current one. The store assigns
/// the id, the next version number and the creation time.
#[derive(Debug, Clone)]
pub struct PolicyDraft {
    pub operator_id: String,
    pub rules: RefundRules,
    pub cancellation_summary: String,
    pub reschedule_summary: String,
}

pub trait UserRepository: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the email is taken.
    async fn create_user(&self, user: &User) -> StoreResult<()>;
    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn update_profile(
        &self,
        user_id: &str,
        name: Option<String>,
        phone_number: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<User>;
    async fn update_password(
        &self,
        user_id: &str,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

pub trait AuthSessionRepository: Send + Sync {
    async fn create_auth_session(&self, session: &AuthSession) -> StoreResult<()>;
    async fn find_auth_session(&self, token_hash: &str) -> StoreResult<Option<AuthSession>>;
    async fn delete_auth_session(&self, token_hash: &str) -> StoreResult<()>;
    async fn purge_expired_auth_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

pub trait OperatorRepository: Send + Sync {
    async fn create_operator(&self, operator: &BusOperator) -> StoreResult<()>;
    async fn find_operator_by_name(&self, name: &str) -> StoreResult<Option<BusOperator>>;
    /// Demotes the operator's current policy and stores `draft` as the new one.
    async fn publish_policy(&self, draft: PolicyDraft) -> StoreResult<RefundPolicy>;
    async fn find_policy(&self, policy_id: &str) -> StoreResult<Option<RefundPolicy>>;
    /// Operators that have a current policy, ordered by name.
    async fn list_operators(&self) -> StoreResult<Vec<OperatorWithPolicy>>;
    async fn find_operator(&self, operator_id: &str) -> StoreResult<Option<OperatorWithPolicy>>;
}

pub trait BookingRepository: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the seat is already held on that day.
    async fn create_booking(&self, booking: &Booking) -> StoreResult<()>;
    async fn booking_details(&self, booking_id: &str) -> StoreResult<Option<BookingDetails>>;
    /// Newest first.
    async fn list_bookings_for_user(&self, user_id: &str) -> StoreResult<Vec<BookingDetails>>;
    async fn occupied_seats(
        &self,
        operator_id: &str,
        travel_date: NaiveDate,
    ) -> StoreResult<HashSet<String>>;
    /// Moves the booking from CONFIRMED to CANCELLED and records `refund` in
    /// one step. A second call for the same booking is a conflict.
    async fn cancel_booking(
        &self,
        booking_id: &str,
        cancelled_at: DateTime<Utc>,
        refund: &RefundTransaction,
    ) -> StoreResult<()>;
    async fn find_refund(&self, booking_id: &str) -> StoreResult<Option<RefundTransaction>>;
    async fn update_refund_status(
        &self,
        booking_id: &str,
        status: RefundStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<RefundTransaction>;
}

pub trait ConversationRepository: Send + Sync {
    async fn load_conversation(&self, session_id: &str)
        -> StoreResult<Option<ConversationSession>>;
    async fn upsert_conversation(&self, session: &ConversationSession) -> StoreResult<()>;
    async fn purge_expired_conversations(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

pub(crate) fn travel_date(booking: &Booking) -> Option<NaiveDate> {
    booking.departure_at.map(|at| at.date_naive())
}

#[derive(Clone)]
pub enum Store {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl Store {
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    pub async fn sqlite(database_url: &str) -> StoreResult<Self> {
        let sqlite = SqliteStore::connect(database_url).await?;
        Ok(Self::Sqlite(sqlite))
    }

    /// `memory` (or nothing) selects the in-process store, anything else is a SQLite URL.
    pub async fn from_url(database_url: Option<&str>) -> StoreResult<Self> {
        match database_url.map(str::trim) {
            None | Some("") | Some("memory") => Ok(Self::memory()),
            Some(url) => Self::sqlite(url).await,
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Store::Memory(_) => "memory",
            Store::Sqlite(_) => "sqlite",
        }
    }

    pub async fn ping(&self) -> StoreResult<()> {
        match self {
            Store::Memory(_) => Ok(()),
            Store::Sqlite(store) => store.ping().await,
        }
    }
}

impl UserRepository for Store {
    async fn create_user(&self, user: &User) -> StoreResult<()> {
        match self {
            Store::Memory(store) => store.create_user(user).await,
            Store::Sqlite(store) => store.create_user(user).await,
        }
    }

    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        match self {
            Store::Memory(store) => store.find_user(user_id).await,
            Store::Sqlite(store) => store.find_user(user_id).await,
        }
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        match self {
            Store::Memory(store) => store.find_user_by_email(email).await,
            Store::Sqlite(store) => store.find_user_by_email(email).await,
        }
    }

    async fn update_profile(
        &self,
        user_id: &str,
        name: Option<String>,
        phone_number: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<User> {
        match self {
            Store::Memory(store) => store.update_profile(user_id, name, phone_number, at).await,
            Store::Sqlite(store) => store.update_profile(user_id, name, phone_number, at).await,
        }
    }

    async fn update_password(
        &self,
        user_id: &str,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        match self {
            Store::Memory(store) => store.update_password(user_id, password_hash, at).await,
            Store::Sqlite(store) => store.update_password(user_id, password_hash, at).await,
        }
    }
}

impl AuthSessionRepository for Store {
    async fn create_auth_session(&self, session: &AuthSession) -> StoreResult<()> {
        match self {
            Store::Memory(store) => store.create_auth_session(session).await,
            Store::Sqlite(store) => store.create_auth_session(session).await,
        }
    }

    async fn find_auth_session(&self, token_hash: &str) -> StoreResult<Option<AuthSession>> {
        match self {
            Store::Memory(store) => store.find_auth_session(token_hash).await,
            Store::Sqlite(store) => store.find_auth_session(token_hash).await,
        }
    }

    async fn delete_auth_session(&self, token_hash: &str) -> StoreResult<()> {
        match self {
            Store::Memory(store) => store.delete_auth_session(token_hash).await,
            Store::Sqlite(store) => store.delete_auth_session(token_hash).await,
        }
    }

    async fn purge_expired_auth_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        match self {
            Store::Memory(store) => store.purge_expired_auth_sessions(now).await,
            Store::Sqlite(store) => store.purge_expired_auth_sessions(now).await,
        }
    }
}

impl OperatorRepository for Store {
    async fn create_operator(&self, operator: &BusOperator) -> StoreResult<()> {
        match self {
            Store::Memory(store) => store.create_operator(operator).await,
            Store::Sqlite(store) => store.create_operator(operator).await,
        }
    }

    async fn find_operator_by_name(&self, name: &str) -> StoreResult<Option<BusOperator>> {
        match self {
            Store::Memory(store) => store.find_operator_by_name(name).await,
            Store::Sqlite(store) => store.find_operator_by_name(name).await,
        }
    }

    async fn publish_policy(&self, draft: PolicyDraft) -> StoreResult<RefundPolicy> {
        match self {
            Store::Memory(store) => store.publish_policy(draft).await,
            Store::Sqlite(store) => store.publish_policy(draft).await,
        }
    }

    async fn find_policy(&self, policy_id: &str) -> StoreResult<Option<RefundPolicy>> {
        match self {
            Store::Memory(store) => store.find_policy(policy_id).await,
            Store::Sqlite(store) => store.find_policy(policy_id).await,
        }
    }

    async fn list_operators(&self) -> StoreResult<Vec<OperatorWithPolicy>> {
        match self {
            Store::Memory(store) => store.list_operators().await,
            Store::Sqlite(store) => store.list_operators().await,
        }
    }

    async fn find_operator(&self, operator_id: &str) -> StoreResult<Option<OperatorWithPolicy>> {
        match self {
            Store::Memory(store) => store.find_operator(operator_id).await,
            Store::Sqlite(store) => store.find_operator(operator_id).await,
        }
    }
}

impl BookingRepository for Store {
    async fn create_booking(&self, booking: &Booking) -> StoreResult<()> {
        match self {
            Store::Memory(store) => store.create_booking(booking).await,
            Store::Sqlite(store) => store.create_booking(booking).await,
        }
    }

    async fn booking_details(&self, booking_id: &str) -> StoreResult<Option<BookingDetails>> {
        match self {
            Store::Memory(store) => store.booking_details(booking_id).await,
            Store::Sqlite(store) => store.booking_details(booking_id).await,
        }
    }

    async fn list_bookings_for_user(&self, user_id: &str) -> StoreResult<Vec<BookingDetails>> {
        match self {
            Store::Memory(store) => store.list_bookings_for_user(user_id).await,
            Store::Sqlite(store) => store.list_bookings_for_user(user_id).await,
        }
    }

    async fn occupied_seats(
        &self,
        operator_id: &str,
        travel_date: NaiveDate,
    ) -> StoreResult<HashSet<String>> {
        match self {
            Store::Memory(store) => store.occupied_seats(operator_id, travel_date).await,
            Store::Sqlite(store) => store.occupied_seats(operator_id, travel_date).await,
        }
    }

    async fn cancel_booking(
        &self,
        booking_id: &str,
        cancelled_at: DateTime<Utc>,
        refund: &RefundTransaction,
    ) -> StoreResult<()> {
        match self {
            Store::Memory(store) => store.cancel_booking(booking_id, cancelled_at, refund).await,
            Store::Sqlite(store) => store.cancel_booking(booking_id, cancelled_at, refund).await,
        }
    }

    async fn find_refund(&self, booking_id: &str) -> StoreResult<Option<RefundTransaction>> {
        match self {
            Store::Memory(store) => store.find_refund(booking_id).await,
            Store::Sqlite(store) => store.find_refund(booking_id).await,
        }
    }

    async fn update_refund_status(
        &self,
        booking_id: &str,
        status: RefundStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<RefundTransaction> {
        match self {
            Store::Memory(store) => store.update_refund_status(booking_id, status, at).await,
            Store::Sqlite(store) => store.update_refund_status(booking_id, status, at).await,
        }
    }
}

impl ConversationRepository for Store {
    async fn load_conversation(
        &self,
        session_id: &str,
    ) -> StoreResult<Option<ConversationSession>> {
        match self {
            Store::Memory(store) => store.load_conversation(session_id).await,
            Store::Sqlite(store) => store.load_conversation(session_id).await,
        }
    }

    async fn upsert_conversation(&self, session: &ConversationSession) -> StoreResult<()> {
        match self {
            Store::Memory(store) => store.upsert_conversation(session).await,
            Store::Sqlite(store) => store.upsert_conversation(session).await,
        }
    }

    async fn purge_expired_conversations(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        match self {
            Store::Memory(store) => store.purge_expired_conversations(now).await,
            Store::Sqlite(store) => store.purge_expired_conversations(now).await,
        }
    }
}

/// Inserts every default operator that is not present yet, each with a
/// version 1 policy. Returns how many were added.
pub async fn seed_default_operators<S: OperatorRepository>(store: &S) -> StoreResult<usize> {
    let mut inserted = 0;
    for seed in default_operators() {
        if store.find_operator_by_name(seed.name).await?.is_some() {
            continue;
        }

        let operator = BusOperator {
            operator_id: uuid::Uuid::new_v4().to_string(),
            name: seed.name.to_string(),
            created_at: Utc::now(),
        };
        store.create_operator(&operator).await?;
        store
            .publish_policy(PolicyDraft {
                operator_id: operator.operator_id.clone(),
                rules: seed.rules,
                cancellation_summary: seed.cancellation_summary.to_string(),
                reschedule_summary: seed.reschedule_summary.to_string(),
            })
            .await?;
        inserted += 1;
    }

    if inserted > 0 {
        tracing::info!(inserted, "seeded default bus operators");
    }
    Ok(inserted)
}
