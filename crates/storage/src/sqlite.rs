use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use trustroute_core::{
    advance_timeline, Booking, BookingDetails, BookingStatus, BusOperator, ConversationSession,
    Locale, OperatorWithPolicy, RefundPolicy, RefundRules, RefundStatus, RefundTransaction, User,
};

use crate::{
    travel_date, AuthSession, AuthSessionRepository, BookingRepository, ConversationRepository,
    OperatorRepository, PolicyDraft, StoreError, StoreResult, UserRepository,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
      user_id TEXT PRIMARY KEY,
      email TEXT NOT NULL UNIQUE COLLATE NOCASE,
      name TEXT,
      phone_number TEXT,
      password_hash TEXT NOT NULL,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auth_sessions (
      token_hash TEXT PRIMARY KEY,
      user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
      created_at TEXT NOT NULL,
      expires_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bus_operators (
      operator_id TEXT PRIMARY KEY,
      name TEXT NOT NULL UNIQUE,
      created_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS refund_policies (
      policy_id TEXT PRIMARY KEY,
      operator_id TEXT NOT NULL REFERENCES bus_operators(operator_id),
      version INTEGER NOT NULL,
      is_current INTEGER NOT NULL,
      rules_json TEXT NOT NULL,
      cancellation_summary TEXT NOT NULL,
      reschedule_summary TEXT NOT NULL,
      created_at TEXT NOT NULL,
      UNIQUE (operator_id, version)
    );
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS refund_policies_one_current
      ON refund_policies (operator_id) WHERE is_current = 1;
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bookings (
      booking_id TEXT PRIMARY KEY,
      user_id TEXT NOT NULL REFERENCES users(user_id),
      operator_id TEXT NOT NULL REFERENCES bus_operators(operator_id),
      policy_id TEXT NOT NULL REFERENCES refund_policies(policy_id),
      amount REAL NOT NULL,
      status TEXT NOT NULL,
      seat_number TEXT NOT NULL,
      passenger_name TEXT NOT NULL,
      route TEXT,
      departure_label TEXT,
      departure_at TEXT,
      travel_date TEXT,
      created_at TEXT NOT NULL,
      cancelled_at TEXT
    );
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS bookings_one_confirmed_seat
      ON bookings (operator_id, travel_date, seat_number)
      WHERE status = 'CONFIRMED' AND travel_date IS NOT NULL;
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS bookings_by_user ON bookings (user_id, created_at);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS refund_transactions (
      refund_id TEXT PRIMARY KEY,
      booking_id TEXT NOT NULL UNIQUE REFERENCES bookings(booking_id),
      refund_amount REAL NOT NULL,
      deduction_total REAL NOT NULL,
      breakdown_json TEXT NOT NULL,
      cancellation_slot TEXT NOT NULL,
      status TEXT NOT NULL,
      timeline_json TEXT NOT NULL,
      initiated_at TEXT NOT NULL,
      updated_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
      session_id TEXT PRIMARY KEY,
      user_id TEXT,
      locale TEXT NOT NULL,
      expires_at TEXT NOT NULL,
      turns_json TEXT NOT NULL
    );
    "#,
];

const BOOKING_DETAILS_SELECT: &str = r#"
    SELECT b.booking_id, b.user_id, b.operator_id, b.policy_id, b.amount, b.status,
           b.seat_number, b.passenger_name, b.route, b.departure_label, b.departure_at,
           b.created_at, b.cancelled_at,
           o.name AS operator_name, p.version AS policy_version, p.rules_json,
           r.refund_id, r.refund_amount, r.deduction_total, r.breakdown_json,
           r.cancellation_slot, r.status AS refund_status, r.timeline_json,
           r.initiated_at, r.updated_at AS refund_updated_at
    FROM bookings b
    JOIN bus_operators o ON o.operator_id = b.operator_id
    JOIN refund_policies p ON p.policy_id = b.policy_id
    LEFT JOIN refund_transactions r ON r.booking_id = b.booking_id
"#;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database lives only as long as its single connection.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };
        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        tracing::debug!(database_url, "sqlite store ready");
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn current_policy(&self, operator_id: &str) -> StoreResult<Option<RefundPolicy>> {
        let row = sqlx::query(
            r#"
            SELECT policy_id, operator_id, version, is_current, rules_json,
                   cancellation_summary, reschedule_summary, created_at
            FROM refund_policies
            WHERE operator_id = ?1 AND is_current = 1
            "#,
        )
        .bind(operator_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(policy_from_row).transpose()
    }
}

fn to_conflict(error: sqlx::Error, what: impl Into<String>) -> StoreError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(what.into()),
        _ => StoreError::Database(error),
    }
}

fn parse_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|error| StoreError::Corrupt(format!("bad timestamp {raw:?}: {error}")))
}

fn parse_optional_time(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

fn user_from_row(row: &SqliteRow) -> StoreResult<User> {
    Ok(User {
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        phone_number: row.try_get("phone_number")?,
        password_hash: row.try_get("password_hash")?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn operator_from_row(row: &SqliteRow) -> StoreResult<BusOperator> {
    Ok(BusOperator {
        operator_id: row.try_get("operator_id")?,
        name: row.try_get("name")?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn policy_from_row(row: &SqliteRow) -> StoreResult<RefundPolicy> {
    let rules_json: String = row.try_get("rules_json")?;
    Ok(RefundPolicy {
        policy_id: row.try_get("policy_id")?,
        operator_id: row.try_get("operator_id")?,
        version: row.try_get("version")?,
        is_current: row.try_get::<i64, _>("is_current")? == 1,
        rules: RefundRules::from_json_str(&rules_json)?,
        cancellation_summary: row.try_get("cancellation_summary")?,
        reschedule_summary: row.try_get("reschedule_summary")?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn booking_status(raw: &str) -> StoreResult<BookingStatus> {
    BookingStatus::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("booking status {raw}")))
}

fn refund_status(raw: &str) -> StoreResult<RefundStatus> {
    RefundStatus::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("refund status {raw}")))
}

fn booking_from_row(row: &SqliteRow) -> StoreResult<Booking> {
    Ok(Booking {
        booking_id: row.try_get("booking_id")?,
        user_id: row.try_get("user_id")?,
        operator_id: row.try_get("operator_id")?,
        policy_id: row.try_get("policy_id")?,
        amount: row.try_get("amount")?,
        status: booking_status(&row.try_get::<String, _>("status")?)?,
        seat_number: row.try_get("seat_number")?,
        passenger_name: row.try_get("passenger_name")?,
        route: row.try_get("route")?,
        departure_label: row.try_get("departure_label")?,
        departure_at: parse_optional_time(row.try_get("departure_at")?)?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        cancelled_at: parse_optional_time(row.try_get("cancelled_at")?)?,
    })
}

fn refund_from_row(row: &SqliteRow, status_column: &str, updated_column: &str) -> StoreResult<RefundTransaction> {
    Ok(RefundTransaction {
        refund_id: row.try_get("refund_id")?,
        booking_id: row.try_get("booking_id")?,
        refund_amount: row.try_get("refund_amount")?,
        deduction_total: row.try_get("deduction_total")?,
        breakdown: serde_json::from_str(&row.try_get::<String, _>("breakdown_json")?)?,
        cancellation_slot: row.try_get("cancellation_slot")?,
        status: refund_status(&row.try_get::<String, _>(status_column)?)?,
        timeline: serde_json::from_str(&row.try_get::<String, _>("timeline_json")?)?,
        initiated_at: parse_time(&row.try_get::<String, _>("initiated_at")?)?,
        updated_at: parse_time(&row.try_get::<String, _>(updated_column)?)?,
    })
}

fn details_from_row(row: &SqliteRow) -> StoreResult<BookingDetails> {
    let rules_json: String = row.try_get("rules_json")?;
    let refund_id: Option<String> = row.try_get("refund_id")?;
    let refund = match refund_id {
        Some(_) => Some(refund_from_row(row, "refund_status", "refund_updated_at")?),
        None => None,
    };

    Ok(BookingDetails {
        booking: booking_from_row(row)?,
        operator_name: row.try_get("operator_name")?,
        policy_version: row.try_get("policy_version")?,
        rules: RefundRules::from_json_str(&rules_json)?,
        refund,
    })
}

impl UserRepository for SqliteStore {
    async fn create_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, email, name, phone_number, password_hash, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&user.user_id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.phone_number)
        .bind(&user.password_hash)
        .bind(user.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(user.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await
        .map_err(|error| to_conflict(error, format!("{} is already registered", user.email)))?;

        Ok(())
    }

    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn update_profile(
        &self,
        user_id: &str,
        name: Option<String>,
        phone_number: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<User> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
              name = COALESCE(?2, name),
              phone_number = COALESCE(?3, phone_number),
              updated_at = ?4
            WHERE user_id = ?1
            "#,
        )
        .bind(user_id)
        .bind(name)
        .bind(phone_number)
        .bind(at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("user"));
        }
        self.find_user(user_id)
            .await?
            .ok_or(StoreError::NotFound("user"))
    }

    async fn update_password(
        &self,
        user_id: &str,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE users SET password_hash = ?2, updated_at = ?3 WHERE user_id = ?1")
                .bind(user_id)
                .bind(password_hash)
                .bind(at.to_rfc3339_opts(SecondsFormat::Micros, true))
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("user"));
        }
        Ok(())
    }
}

impl AuthSessionRepository for SqliteStore {
    async fn create_auth_session(&self, session: &AuthSession) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_sessions (token_hash, user_id, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&session.token_hash)
        .bind(&session.user_id)
        .bind(session.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(session.expires_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_auth_session(&self, token_hash: &str) -> StoreResult<Option<AuthSession>> {
        let row = sqlx::query(
            "SELECT token_hash, user_id, created_at, expires_at FROM auth_sessions WHERE token_hash = ?1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(AuthSession {
            token_hash: row.try_get("token_hash")?,
            user_id: row.try_get("user_id")?,
            created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
            expires_at: parse_time(&row.try_get::<String, _>("expires_at")?)?,
        }))
    }

    async fn delete_auth_session(&self, token_hash: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE token_hash = ?1")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired_auth_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM auth_sessions WHERE expires_at < ?1")
            .bind(now.to_rfc3339_opts(SecondsFormat::Micros, true))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl OperatorRepository for SqliteStore {
    async fn create_operator(&self, operator: &BusOperator) -> StoreResult<()> {
        sqlx::query("INSERT INTO bus_operators (operator_id, name, created_at) VALUES (?1, ?2, ?3)")
            .bind(&operator.operator_id)
            .bind(&operator.name)
            .bind(operator.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
            .execute(&self.pool)
            .await
            .map_err(|error| to_conflict(error, format!("operator {} already exists", operator.name)))?;
        Ok(())
    }

    async fn find_operator_by_name(&self, name: &str) -> StoreResult<Option<BusOperator>> {
        let row = sqlx::query("SELECT operator_id, name, created_at FROM bus_operators WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(operator_from_row).transpose()
    }

    async fn publish_policy(&self, draft: PolicyDraft) -> StoreResult<RefundPolicy> {
        draft.rules.validate()?;
        let rules_json = serde_json::to_string(&draft.rules)?;
        let created_at = Utc::now();
        let policy_id = uuid::Uuid::new_v4().to_string();

        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM bus_operators WHERE operator_id = ?1")
            .bind(&draft.operator_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound("operator"));
        }

        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM refund_policies WHERE operator_id = ?1")
                .bind(&draft.operator_id)
                .fetch_one(&mut *tx)
                .await?;
        let version = latest.unwrap_or(0) + 1;

        sqlx::query("UPDATE refund_policies SET is_current = 0 WHERE operator_id = ?1")
            .bind(&draft.operator_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO refund_policies (policy_id, operator_id, version, is_current, rules_json,
                                         cancellation_summary, reschedule_summary, created_at)
            VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&policy_id)
        .bind(&draft.operator_id)
        .bind(version)
        .bind(rules_json)
        .bind(&draft.cancellation_summary)
        .bind(&draft.reschedule_summary)
        .bind(created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&mut *tx)
        .await
        .map_err(|error| to_conflict(error, "policy was published concurrently"))?;

        tx.commit().await?;

        Ok(RefundPolicy {
            policy_id,
            operator_id: draft.operator_id,
            version,
            is_current: true,
            rules: draft.rules,
            cancellation_summary: draft.cancellation_summary,
            reschedule_summary: draft.reschedule_summary,
            created_at,
        })
    }

    async fn find_policy(&self, policy_id: &str) -> StoreResult<Option<RefundPolicy>> {
        let row = sqlx::query(
            r#"
            SELECT policy_id, operator_id, version, is_current, rules_json,
                   cancellation_summary, reschedule_summary, created_at
            FROM refund_policies
            WHERE policy_id = ?1
            "#,
        )
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(policy_from_row).transpose()
    }

    async fn list_operators(&self) -> StoreResult<Vec<OperatorWithPolicy>> {
        let rows = sqlx::query(
            r#"
            SELECT o.operator_id, o.name, o.created_at AS operator_created_at,
                   p.policy_id, p.version, p.is_current, p.rules_json,
                   p.cancellation_summary, p.reschedule_summary, p.created_at
            FROM bus_operators o
            JOIN refund_policies p ON p.operator_id = o.operator_id AND p.is_current = 1
            ORDER BY o.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<OperatorWithPolicy> {
                Ok(OperatorWithPolicy {
                    operator: BusOperator {
                        operator_id: row.try_get("operator_id")?,
                        name: row.try_get("name")?,
                        created_at: parse_time(&row.try_get::<String, _>("operator_created_at")?)?,
                    },
                    policy: policy_from_row(row)?,
                })
            })
            .collect()
    }

    async fn find_operator(&self, operator_id: &str) -> StoreResult<Option<OperatorWithPolicy>> {
        let row = sqlx::query(
            "SELECT operator_id, name, created_at FROM bus_operators WHERE operator_id = ?1",
        )
        .bind(operator_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let operator = operator_from_row(&row)?;
        Ok(self
            .current_policy(operator_id)
            .await?
            .map(|policy| OperatorWithPolicy { operator, policy }))
    }
}

impl BookingRepository for SqliteStore {
    async fn create_booking(&self, booking: &Booking) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bookings (booking_id, user_id, operator_id, policy_id, amount, status,
                                  seat_number, passenger_name, route, departure_label,
                                  departure_at, travel_date, created_at, cancelled_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&booking.booking_id)
        .bind(&booking.user_id)
        .bind(&booking.operator_id)
        .bind(&booking.policy_id)
        .bind(booking.amount)
        .bind(booking.status.as_str())
        .bind(&booking.seat_number)
        .bind(&booking.passenger_name)
        .bind(&booking.route)
        .bind(&booking.departure_label)
        .bind(booking.departure_at.map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true)))
        .bind(travel_date(booking).map(|date| date.to_string()))
        .bind(booking.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(booking.cancelled_at.map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true)))
        .execute(&self.pool)
        .await
        .map_err(|error| to_conflict(error, format!("seat {} is already booked", booking.seat_number)))?;
        Ok(())
    }

    async fn booking_details(&self, booking_id: &str) -> StoreResult<Option<BookingDetails>> {
        let row = sqlx::query(&format!("{BOOKING_DETAILS_SELECT} WHERE b.booking_id = ?1"))
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(details_from_row).transpose()
    }

    async fn list_bookings_for_user(&self, user_id: &str) -> StoreResult<Vec<BookingDetails>> {
        let rows = sqlx::query(&format!(
            "{BOOKING_DETAILS_SELECT} WHERE b.user_id = ?1 ORDER BY b.created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(details_from_row).collect()
    }

    async fn occupied_seats(
        &self,
        operator_id: &str,
        travel_date: NaiveDate,
    ) -> StoreResult<HashSet<String>> {
        let seats: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT seat_number FROM bookings
            WHERE operator_id = ?1 AND travel_date = ?2 AND status = 'CONFIRMED'
            "#,
        )
        .bind(operator_id)
        .bind(travel_date.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(seats.into_iter().collect())
    }

    async fn cancel_booking(
        &self,
        booking_id: &str,
        cancelled_at: DateTime<Utc>,
        refund: &RefundTransaction,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE bookings SET status = ?2, cancelled_at = ?3
            WHERE booking_id = ?1 AND status = 'CONFIRMED'
            "#,
        )
        .bind(booking_id)
        .bind(BookingStatus::Cancelled.as_str())
        .bind(cancelled_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM bookings WHERE booking_id = ?1")
                    .bind(booking_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return match status {
                None => Err(StoreError::NotFound("booking")),
                Some(status) => Err(StoreError::Conflict(format!(
                    "booking {booking_id} is already {status}"
                ))),
            };
        }

        sqlx::query(
            r#"
            INSERT INTO refund_transactions (refund_id, booking_id, refund_amount, deduction_total,
                                             breakdown_json, cancellation_slot, status,
                                             timeline_json, initiated_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&refund.refund_id)
        .bind(booking_id)
        .bind(refund.refund_amount)
        .bind(refund.deduction_total)
        .bind(serde_json::to_string(&refund.breakdown)?)
        .bind(&refund.cancellation_slot)
        .bind(refund.status.as_str())
        .bind(serde_json::to_string(&refund.timeline)?)
        .bind(refund.initiated_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(refund.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&mut *tx)
        .await
        .map_err(|error| to_conflict(error, format!("booking {booking_id} already has a refund")))?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_refund(&self, booking_id: &str) -> StoreResult<Option<RefundTransaction>> {
        let row = sqlx::query("SELECT * FROM refund_transactions WHERE booking_id = ?1")
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(|row| refund_from_row(row, "status", "updated_at"))
            .transpose()
    }

    async fn update_refund_status(
        &self,
        booking_id: &str,
        status: RefundStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<RefundTransaction> {
        let mut refund = self
            .find_refund(booking_id)
            .await?
            .ok_or(StoreError::NotFound("refund"))?;
        let previous = refund.status;
        refund.status = previous.transition(status)?;
        advance_timeline(&mut refund.timeline, status, at);
        refund.updated_at = at;

        // Guarded on the previous status so a racing update cannot be overwritten.
        let result = sqlx::query(
            r#"
            UPDATE refund_transactions SET status = ?2, timeline_json = ?3, updated_at = ?4
            WHERE booking_id = ?1 AND status = ?5
            "#,
        )
        .bind(booking_id)
        .bind(refund.status.as_str())
        .bind(serde_json::to_string(&refund.timeline)?)
        .bind(at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(previous.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "refund for booking {booking_id} changed concurrently"
            )));
        }
        Ok(refund)
    }
}

impl ConversationRepository for SqliteStore {
    async fn load_conversation(
        &self,
        session_id: &str,
    ) -> StoreResult<Option<ConversationSession>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, user_id, locale, expires_at, turns_json
            FROM conversations
            WHERE session_id = ?1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let locale = Locale::from_optional_str(Some(row.try_get::<String, _>("locale")?.as_str()));
        let turns_json: String = row.try_get("turns_json")?;

        Ok(Some(ConversationSession {
            session_id: row.try_get("session_id")?,
            user_id: row.try_get("user_id")?,
            locale,
            expires_at: parse_time(&row.try_get::<String, _>("expires_at")?)?,
            turns: serde_json::from_str(&turns_json)?,
        }))
    }

    async fn upsert_conversation(&self, session: &ConversationSession) -> StoreResult<()> {
        let turns_json = serde_json::to_string(&session.turns)?;

        sqlx::query(
            r#"
            INSERT INTO conversations (session_id, user_id, locale, expires_at, turns_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(session_id) DO UPDATE SET
              user_id=excluded.user_id,
              locale=excluded.locale,
              expires_at=excluded.expires_at,
              turns_json=excluded.turns_json
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.user_id)
        .bind(session.locale.as_code())
        .bind(session.expires_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(turns_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_expired_conversations(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM conversations WHERE expires_at < ?1")
            .bind(now.to_rfc3339_opts(SecondsFormat::Micros, true))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
