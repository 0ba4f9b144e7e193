use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use trustroute_core::{
    advance_timeline, Booking, BookingDetails, BookingStatus, BusOperator, ConversationSession,
    OperatorWithPolicy, RefundPolicy, RefundStatus, RefundTransaction, User,
};

use crate::{
    travel_date, AuthSession, AuthSessionRepository, BookingRepository, ConversationRepository,
    OperatorRepository, PolicyDraft, StoreError, StoreResult, UserRepository,
};

#[derive(Clone, Default)]
pub struct MemoryStore {
    users: Arc<RwLock<HashMap<String, User>>>,
    auth_sessions: Arc<RwLock<HashMap<String, AuthSession>>>,
    operators: Arc<RwLock<HashMap<String, BusOperator>>>,
    policies: Arc<RwLock<HashMap<String, RefundPolicy>>>,
    bookings: Arc<RwLock<HashMap<String, Booking>>>,
    // keyed by booking id
    refunds: Arc<RwLock<HashMap<String, RefundTransaction>>>,
    conversations: Arc<RwLock<HashMap<String, ConversationSession>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_policy(&self, operator_id: &str) -> Option<RefundPolicy> {
        self.policies
            .read()
            .values()
            .find(|policy| policy.operator_id == operator_id && policy.is_current)
            .cloned()
    }

    fn details(
        &self,
        booking: &Booking,
        refunds: &HashMap<String, RefundTransaction>,
    ) -> StoreResult<BookingDetails> {
        let operator_name = self
            .operators
            .read()
            .get(&booking.operator_id)
            .map(|operator| operator.name.clone())
            .ok_or_else(|| {
                StoreError::Corrupt(format!("booking {} has no operator", booking.booking_id))
            })?;
        let policy = self
            .policies
            .read()
            .get(&booking.policy_id)
            .cloned()
            .ok_or_else(|| {
                StoreError::Corrupt(format!("booking {} has no policy", booking.booking_id))
            })?;

        Ok(BookingDetails {
            booking: booking.clone(),
            operator_name,
            policy_version: policy.version,
            rules: policy.rules,
            refund: refunds.get(&booking.booking_id).cloned(),
        })
    }
}

impl UserRepository for MemoryStore {
    async fn create_user(&self, user: &User) -> StoreResult<()> {
        let mut users = self.users.write();
        if users
            .values()
            .any(|existing| existing.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(StoreError::Conflict(format!("{} is already registered", user.email)));
        }
        users.insert(user.user_id.clone(), user.clone());
        Ok(())
    }

    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        Ok(self.users.read().get(user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .users
            .read()
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn update_profile(
        &self,
        user_id: &str,
        name: Option<String>,
        phone_number: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<User> {
        let mut users = self.users.write();
        let user = users.get_mut(user_id).ok_or(StoreError::NotFound("user"))?;
        if name.is_some() {
            user.name = name;
        }
        if phone_number.is_some() {
            user.phone_number = phone_number;
        }
        user.updated_at = at;
        Ok(user.clone())
    }

    async fn update_password(
        &self,
        user_id: &str,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut users = self.users.write();
        let user = users.get_mut(user_id).ok_or(StoreError::NotFound("user"))?;
        user.password_hash = password_hash.to_string();
        user.updated_at = at;
        Ok(())
    }
}

impl AuthSessionRepository for MemoryStore {
    async fn create_auth_session(&self, session: &AuthSession) -> StoreResult<()> {
        self.auth_sessions
            .write()
            .insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    async fn find_auth_session(&self, token_hash: &str) -> StoreResult<Option<AuthSession>> {
        Ok(self.auth_sessions.read().get(token_hash).cloned())
    }

    async fn delete_auth_session(&self, token_hash: &str) -> StoreResult<()> {
        self.auth_sessions.write().remove(token_hash);
        Ok(())
    }

    async fn purge_expired_auth_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut removed = 0_u64;
        self.auth_sessions.write().retain(|_, session| {
            let keep = session.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

impl OperatorRepository for MemoryStore {
    async fn create_operator(&self, operator: &BusOperator) -> StoreResult<()> {
        let mut operators = self.operators.write();
        if operators.values().any(|existing| existing.name == operator.name) {
            return Err(StoreError::Conflict(format!(
                "operator {} already exists",
                operator.name
            )));
        }
        operators.insert(operator.operator_id.clone(), operator.clone());
        Ok(())
    }

    async fn find_operator_by_name(&self, name: &str) -> StoreResult<Option<BusOperator>> {
        Ok(self
            .operators
            .read()
            .values()
            .find(|operator| operator.name == name)
            .cloned())
    }

    async fn publish_policy(&self, draft: PolicyDraft) -> StoreResult<RefundPolicy> {
        draft.rules.validate()?;
        if !self.operators.read().contains_key(&draft.operator_id) {
            return Err(StoreError::NotFound("operator"));
        }

        let mut policies = self.policies.write();
        let mut latest_version = 0;
        for policy in policies
            .values_mut()
            .filter(|policy| policy.operator_id == draft.operator_id)
        {
            latest_version = latest_version.max(policy.version);
            policy.is_current = false;
        }

        let policy = RefundPolicy {
            policy_id: uuid::Uuid::new_v4().to_string(),
            operator_id: draft.operator_id,
            version: latest_version + 1,
            is_current: true,
            rules: draft.rules,
            cancellation_summary: draft.cancellation_summary,
            reschedule_summary: draft.reschedule_summary,
            created_at: Utc::now(),
        };
        policies.insert(policy.policy_id.clone(), policy.clone());
        Ok(policy)
    }

    async fn find_policy(&self, policy_id: &str) -> StoreResult<Option<RefundPolicy>> {
        Ok(self.policies.read().get(policy_id).cloned())
    }

    async fn list_operators(&self) -> StoreResult<Vec<OperatorWithPolicy>> {
        let operators = self.operators.read().values().cloned().collect::<Vec<_>>();
        let mut listed = operators
            .into_iter()
            .filter_map(|operator| {
                self.current_policy(&operator.operator_id)
                    .map(|policy| OperatorWithPolicy { operator, policy })
            })
            .collect::<Vec<_>>();
        listed.sort_by(|a, b| a.operator.name.cmp(&b.operator.name));
        Ok(listed)
    }

    async fn find_operator(&self, operator_id: &str) -> StoreResult<Option<OperatorWithPolicy>> {
        let Some(operator) = self.operators.read().get(operator_id).cloned() else {
            return Ok(None);
        };
        Ok(self
            .current_policy(operator_id)
            .map(|policy| OperatorWithPolicy { operator, policy }))
    }
}

impl BookingRepository for MemoryStore {
    async fn create_booking(&self, booking: &Booking) -> StoreResult<()> {
        let mut bookings = self.bookings.write();
        if bookings.contains_key(&booking.booking_id) {
            return Err(StoreError::Conflict(format!(
                "booking {} already exists",
                booking.booking_id
            )));
        }

        let date = travel_date(booking);
        let seat_taken = date.is_some()
            && bookings.values().any(|existing| {
                existing.status == BookingStatus::Confirmed
                    && existing.operator_id == booking.operator_id
                    && existing.seat_number == booking.seat_number
                    && travel_date(existing) == date
            });
        if seat_taken {
            return Err(StoreError::Conflict(format!(
                "seat {} is already booked",
                booking.seat_number
            )));
        }

        bookings.insert(booking.booking_id.clone(), booking.clone());
        Ok(())
    }

    async fn booking_details(&self, booking_id: &str) -> StoreResult<Option<BookingDetails>> {
        let bookings = self.bookings.read();
        let Some(booking) = bookings.get(booking_id) else {
            return Ok(None);
        };
        let refunds = self.refunds.read();
        self.details(booking, &refunds).map(Some)
    }

    async fn list_bookings_for_user(&self, user_id: &str) -> StoreResult<Vec<BookingDetails>> {
        let bookings = self.bookings.read();
        let refunds = self.refunds.read();
        let mut owned = bookings
            .values()
            .filter(|booking| booking.user_id == user_id)
            .collect::<Vec<_>>();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned
            .into_iter()
            .map(|booking| self.details(booking, &refunds))
            .collect()
    }

    async fn occupied_seats(
        &self,
        operator_id: &str,
        travel_date_filter: NaiveDate,
    ) -> StoreResult<HashSet<String>> {
        Ok(self
            .bookings
            .read()
            .values()
            .filter(|booking| {
                booking.status == BookingStatus::Confirmed
                    && booking.operator_id == operator_id
                    && travel_date(booking) == Some(travel_date_filter)
            })
            .map(|booking| booking.seat_number.clone())
            .collect())
    }

    async fn cancel_booking(
        &self,
        booking_id: &str,
        cancelled_at: DateTime<Utc>,
        refund: &RefundTransaction,
    ) -> StoreResult<()> {
        let mut bookings = self.bookings.write();
        let mut refunds = self.refunds.write();

        let booking = bookings
            .get_mut(booking_id)
            .ok_or(StoreError::NotFound("booking"))?;
        if booking.status != BookingStatus::Confirmed || refunds.contains_key(booking_id) {
            return Err(StoreError::Conflict(format!(
                "booking {booking_id} is already {}",
                booking.status
            )));
        }

        booking.status = booking.status.transition(BookingStatus::Cancelled)?;
        booking.cancelled_at = Some(cancelled_at);
        refunds.insert(booking_id.to_string(), refund.clone());
        Ok(())
    }

    async fn find_refund(&self, booking_id: &str) -> StoreResult<Option<RefundTransaction>> {
        Ok(self.refunds.read().get(booking_id).cloned())
    }

    async fn update_refund_status(
        &self,
        booking_id: &str,
        status: RefundStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<RefundTransaction> {
        let mut refunds = self.refunds.write();
        let refund = refunds
            .get_mut(booking_id)
            .ok_or(StoreError::NotFound("refund"))?;
        refund.status = refund.status.transition(status)?;
        advance_timeline(&mut refund.timeline, status, at);
        refund.updated_at = at;
        Ok(refund.clone())
    }
}

impl ConversationRepository for MemoryStore {
    async fn load_conversation(
        &self,
        session_id: &str,
    ) -> StoreResult<Option<ConversationSession>> {
        Ok(self.conversations.read().get(session_id).cloned())
    }

    async fn upsert_conversation(&self, session: &ConversationSession) -> StoreResult<()> {
        self.conversations
            .write()
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn purge_expired_conversations(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut removed = 0_u64;
        self.conversations.write().retain(|_, value| {
            let keep = value.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}
