//! libSQL directory: local `BookingDirectory` implementation.
//!
//! Owns its own schema (payers, providers, contracts, slots, bookings).
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::BookingDirectory;
use super::migrations;
use crate::booking::model::{BookingId, BookingRequest, Payer, Provider, ProviderFilter, Slot};
use crate::error::{DatabaseError, DirectoryError};

/// Contract status that makes a provider bookable under a payer.
const ACTIVE_CONTRACT: &str = "active";

/// Upper bound on slots returned per provider.
const MAX_SLOTS: i64 = 200;

/// libSQL-backed booking directory.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlDirectory {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlDirectory {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let directory = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&directory.conn).await?;
        info!(path = %path.display(), "Directory database opened");
        Ok(directory)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let directory = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&directory.conn).await?;
        Ok(directory)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Catalog maintenance ─────────────────────────────────────────

    pub async fn upsert_payer(&self, payer: &Payer) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO payers (id, name, active) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, active = excluded.active",
                params![payer.id.as_str(), payer.name.as_str(), payer.active as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_payer: {e}")))?;
        Ok(())
    }

    pub async fn upsert_provider(&self, provider: &Provider) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO providers (id, display_name, specialty, credentials, accepting_new_patients)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    display_name = excluded.display_name,
                    specialty = excluded.specialty,
                    credentials = excluded.credentials,
                    accepting_new_patients = excluded.accepting_new_patients",
                params![
                    provider.id.as_str(),
                    provider.display_name.as_str(),
                    opt_text(provider.specialty.as_deref()),
                    opt_text(provider.credentials.as_deref()),
                    provider.accepting_new_patients as i64
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_provider: {e}")))?;
        Ok(())
    }

    /// Record (or update) the contract between a provider and a payer.
    pub async fn set_contract(
        &self,
        provider_id: &str,
        payer_id: &str,
        status: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO provider_payer_contracts (id, provider_id, payer_id, status)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(provider_id, payer_id) DO UPDATE SET status = excluded.status",
                params![Uuid::new_v4().to_string(), provider_id, payer_id, status],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_contract: {e}")))?;
        Ok(())
    }

    pub async fn add_slot(&self, slot: &Slot) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO slots (id, provider_id, starts_at, ends_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    slot.id.as_str(),
                    slot.provider_id.as_str(),
                    format_datetime(&slot.starts_at),
                    format_datetime(&slot.ends_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Constraint(format!("add_slot {}: {e}", slot.id)))?;
        Ok(())
    }

    /// Load a small catalog for local development: three payers (one
    /// inactive), four providers, contracts in various states, and open
    /// slots over the next week. Safe to run repeatedly; existing slots keep
    /// their status.
    pub async fn seed_demo_data(&self) -> Result<(), DatabaseError> {
        let payers = [
            ("payer-northwind", "Northwind Health", true),
            ("payer-lakeside", "Lakeside Mutual", true),
            ("payer-retired", "Retired Plan Co", false),
        ];
        for (id, name, active) in payers {
            self.upsert_payer(&Payer {
                id: id.to_string(),
                name: name.to_string(),
                active,
            })
            .await?;
        }

        let providers = [
            ("prov-amara", "Dr. Amara Okafor", "psychiatry", "MD", true),
            ("prov-chen", "Lin Chen", "therapy", "LCSW", true),
            ("prov-ibarra", "Dr. Sofia Ibarra", "psychiatry", "DO", false),
            ("prov-novak", "Tomas Novak", "therapy", "PsyD", true),
        ];
        for (id, name, specialty, credentials, accepting) in providers {
            self.upsert_provider(&Provider {
                id: id.to_string(),
                display_name: name.to_string(),
                specialty: Some(specialty.to_string()),
                credentials: Some(credentials.to_string()),
                accepting_new_patients: accepting,
            })
            .await?;
        }

        let contracts = [
            ("prov-amara", "payer-northwind", ACTIVE_CONTRACT),
            ("prov-chen", "payer-northwind", ACTIVE_CONTRACT),
            ("prov-chen", "payer-lakeside", ACTIVE_CONTRACT),
            ("prov-ibarra", "payer-northwind", "terminated"),
            ("prov-ibarra", "payer-retired", ACTIVE_CONTRACT),
            ("prov-novak", "payer-lakeside", "pending"),
        ];
        for (provider, payer, status) in contracts {
            self.set_contract(provider, payer, status).await?;
        }

        let today = Utc::now().date_naive();
        for provider in ["prov-amara", "prov-chen", "prov-ibarra", "prov-novak"] {
            for day in 1..=7 {
                let date = today + Duration::days(day);
                for hour in [9u32, 11, 14] {
                    let Some(time) = NaiveTime::from_hms_opt(hour, 0, 0) else {
                        continue;
                    };
                    let starts_at = date.and_time(time).and_utc();
                    self.add_slot(&Slot {
                        id: format!("{provider}-{}-{hour:02}", date.format("%Y%m%d")),
                        provider_id: provider.to_string(),
                        starts_at,
                        ends_at: starts_at + Duration::minutes(50),
                    })
                    .await?;
                }
            }
        }

        info!("Seeded demo directory data");
        Ok(())
    }

    /// Whether the provider holds an active contract with an active payer
    /// at `at`.
    async fn is_bookable(
        &self,
        provider_id: &str,
        payer_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*)
                 FROM provider_payer_contracts c
                 JOIN payers y ON y.id = c.payer_id
                 JOIN providers p ON p.id = c.provider_id
                 WHERE c.provider_id = ?1 AND c.payer_id = ?2
                   AND c.status = ?3 AND y.active = 1 AND p.active = 1
                   AND (c.effective_from IS NULL OR c.effective_from <= ?4)
                   AND (c.effective_to IS NULL OR c.effective_to > ?4)",
                params![provider_id, payer_id, ACTIVE_CONTRACT, format_datetime(&at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_bookable: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("is_bookable: {e}"))),
        }
    }

    /// Number of bookings recorded (for tests and diagnostics).
    pub async fn booking_count(&self) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM bookings", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("booking_count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("booking_count: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("booking_count: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical stored form. Fixed width so text comparison orders correctly.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_to_payer(row: &libsql::Row) -> Result<Payer, libsql::Error> {
    Ok(Payer {
        id: row.get(0)?,
        name: row.get(1)?,
        active: row.get::<i64>(2)? != 0,
    })
}

fn row_to_provider(row: &libsql::Row) -> Result<Provider, libsql::Error> {
    Ok(Provider {
        id: row.get(0)?,
        display_name: row.get(1)?,
        specialty: row.get(2).ok(),
        credentials: row.get(3).ok(),
        accepting_new_patients: row.get::<i64>(4)? != 0,
    })
}

fn row_to_slot(row: &libsql::Row) -> Result<Slot, libsql::Error> {
    let starts_at: String = row.get(2)?;
    let ends_at: String = row.get(3)?;
    Ok(Slot {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        starts_at: parse_datetime(&starts_at),
        ends_at: parse_datetime(&ends_at),
    })
}

fn storage(e: DatabaseError) -> DirectoryError {
    DirectoryError::Storage(e)
}

// ── BookingDirectory implementation ─────────────────────────────────

#[async_trait]
impl BookingDirectory for LibSqlDirectory {
    fn name(&self) -> &str {
        "libsql"
    }

    async fn list_payers(&self) -> Result<Vec<Payer>, DirectoryError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, active FROM payers WHERE active = 1 ORDER BY name ASC",
                (),
            )
            .await
            .map_err(|e| storage(DatabaseError::Query(format!("list_payers: {e}"))))?;

        let mut payers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_payer(&row) {
                Ok(payer) => payers.push(payer),
                Err(e) => warn!("Skipping payer row: {e}"),
            }
        }
        Ok(payers)
    }

    /// Bookable providers: active contract with an active payer, optionally
    /// narrowed by specialty and by having an open slot ahead.
    async fn list_providers(
        &self,
        filter: &ProviderFilter,
    ) -> Result<Vec<Provider>, DirectoryError> {
        let now = format_datetime(&Utc::now());
        let available_after = filter.available_after.as_ref().map(format_datetime);

        let mut rows = self
            .conn()
            .query(
                "SELECT p.id, p.display_name, p.specialty, p.credentials, p.accepting_new_patients
                 FROM providers p
                 JOIN provider_payer_contracts c ON c.provider_id = p.id
                 JOIN payers y ON y.id = c.payer_id
                 WHERE c.payer_id = ?1
                   AND c.status = ?2 AND y.active = 1 AND p.active = 1
                   AND (c.effective_from IS NULL OR c.effective_from <= ?3)
                   AND (c.effective_to IS NULL OR c.effective_to > ?3)
                   AND (?4 IS NULL OR p.specialty = ?4)
                   AND (?5 IS NULL OR EXISTS (
                        SELECT 1 FROM slots s
                        WHERE s.provider_id = p.id AND s.status = 'open' AND s.starts_at > ?5))
                 ORDER BY p.display_name ASC",
                params![
                    filter.payer_id.as_str(),
                    ACTIVE_CONTRACT,
                    now,
                    opt_text(filter.specialty.as_deref()),
                    opt_text(available_after.as_deref())
                ],
            )
            .await
            .map_err(|e| storage(DatabaseError::Query(format!("list_providers: {e}"))))?;

        let mut providers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_provider(&row) {
                Ok(provider) => providers.push(provider),
                Err(e) => warn!("Skipping provider row: {e}"),
            }
        }
        debug!(payer_id = %filter.payer_id, count = providers.len(), "Listed bookable providers");
        Ok(providers)
    }

    async fn list_slots(
        &self,
        provider_id: &str,
        from: DateTime<Utc>,
    ) -> Result<Vec<Slot>, DirectoryError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, provider_id, starts_at, ends_at FROM slots
                 WHERE provider_id = ?1 AND status = 'open' AND starts_at > ?2
                 ORDER BY starts_at ASC LIMIT ?3",
                params![provider_id, format_datetime(&from), MAX_SLOTS],
            )
            .await
            .map_err(|e| storage(DatabaseError::Query(format!("list_slots: {e}"))))?;

        let mut slots = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_slot(&row) {
                Ok(slot) => slots.push(slot),
                Err(e) => warn!("Skipping slot row: {e}"),
            }
        }
        Ok(slots)
    }

    /// Claim the slot and record the booking. A slot can only be claimed
    /// once; a second claim is a conflict.
    async fn create_booking(&self, request: &BookingRequest) -> Result<BookingId, DirectoryError> {
        let conn = self.conn();
        let slot = &request.slot;

        if slot.provider_id != request.provider_id {
            return Err(DirectoryError::Conflict(format!(
                "slot {} belongs to provider {}, not {}",
                slot.id, slot.provider_id, request.provider_id
            )));
        }

        if !self
            .is_bookable(&request.provider_id, &request.payer_id, Utc::now())
            .await
            .map_err(storage)?
        {
            return Err(DirectoryError::Conflict(format!(
                "provider {} is not bookable under payer {}",
                request.provider_id, request.payer_id
            )));
        }

        let patient = serde_json::to_string(&request.patient)
            .map_err(|e| storage(DatabaseError::Serialization(e.to_string())))?;
        let contact = serde_json::to_string(&request.contact)
            .map_err(|e| storage(DatabaseError::Serialization(e.to_string())))?;
        let booking_id = format!("bk_{}", Uuid::new_v4().simple());

        // Claim and insert commit together or not at all.
        let tx = conn
            .transaction()
            .await
            .map_err(|e| storage(DatabaseError::Query(format!("begin booking: {e}"))))?;

        let claimed = tx
            .execute(
                "UPDATE slots SET status = 'booked'
                 WHERE id = ?1 AND provider_id = ?2 AND status = 'open'",
                params![slot.id.as_str(), request.provider_id.as_str()],
            )
            .await
            .map_err(|e| storage(DatabaseError::Query(format!("claim slot: {e}"))))?;

        if claimed == 0 {
            let mut rows = tx
                .query("SELECT status FROM slots WHERE id = ?1", params![slot.id.as_str()])
                .await
                .map_err(|e| storage(DatabaseError::Query(format!("slot lookup: {e}"))))?;
            let exists = matches!(rows.next().await, Ok(Some(_)));
            drop(rows);
            tx.rollback()
                .await
                .map_err(|e| storage(DatabaseError::Query(format!("rollback booking: {e}"))))?;
            return Err(if exists {
                DirectoryError::Conflict(format!("slot {} is no longer available", slot.id))
            } else {
                DirectoryError::NotFound {
                    entity: "slot".to_string(),
                    id: slot.id.clone(),
                }
            });
        }

        let inserted = tx
            .execute(
                "INSERT INTO bookings
                    (id, slot_id, provider_id, payer_id, member_id, booked_for_self, patient, contact, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    booking_id.as_str(),
                    slot.id.as_str(),
                    request.provider_id.as_str(),
                    request.payer_id.as_str(),
                    opt_text(request.member_id.as_deref()),
                    request.booked_for_self as i64,
                    patient,
                    contact,
                    opt_text(request.reason.as_deref())
                ],
            )
            .await;

        if let Err(e) = inserted {
            tx.rollback()
                .await
                .map_err(|e| storage(DatabaseError::Query(format!("rollback booking: {e}"))))?;
            return Err(storage(DatabaseError::Constraint(format!(
                "insert booking: {e}"
            ))));
        }

        tx.commit()
            .await
            .map_err(|e| storage(DatabaseError::Query(format!("commit booking: {e}"))))?;

        info!(
            booking_id = %booking_id,
            slot_id = %slot.id,
            provider_id = %request.provider_id,
            "Booking recorded"
        );
        Ok(BookingId(booking_id))
    }
}
