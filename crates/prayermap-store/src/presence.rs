use rusqlite::{params, OptionalExtension};

use prayermap_shared::{DeviceId, OnlineStats, PrayerId, PresenceRecord, PresenceStatus, UserId};

use crate::database::{conversion_error, parse_timestamp, Database};
use crate::error::Result;

impl Database {
    /// Insert or replace the presence row for `record.user_id`.
    pub fn upsert_presence(&self, record: &PresenceRecord) -> Result<()> {
        let task_ids = serde_json::to_string(&record.active_task_ids)?;
        self.conn().execute(
            "INSERT INTO user_presence
                (user_id, status, last_seen, custom_status, active_task_ids, device_id, connection_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                status = excluded.status,
                last_seen = excluded.last_seen,
                custom_status = excluded.custom_status,
                active_task_ids = excluded.active_task_ids,
                device_id = excluded.device_id,
                connection_count = excluded.connection_count",
            params![
                record.user_id.as_str(),
                record.status.as_str(),
                record.last_seen.to_rfc3339(),
                record.custom_status,
                task_ids,
                record.device_id.0,
                record.connection_count,
            ],
        )?;
        Ok(())
    }

    pub fn get_presence(&self, user_id: &UserId) -> Result<Option<PresenceRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT user_id, status, last_seen, custom_status, active_task_ids,
                        device_id, connection_count
                 FROM user_presence WHERE user_id = ?1",
                params![user_id.as_str()],
                row_to_presence,
            )
            .optional()?;
        Ok(record)
    }

    /// Counts per live status. Offline rows are not counted.
    pub fn online_stats(&self) -> Result<OnlineStats> {
        let mut stmt = self
            .conn()
            .prepare("SELECT status, COUNT(*) FROM user_presence GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((status, count as u64))
        })?;

        let mut stats = OnlineStats::default();
        for row in rows {
            let (status, count) = row?;
            match status.parse::<PresenceStatus>() {
                Ok(PresenceStatus::Online) => stats.online_count += count,
                Ok(PresenceStatus::ActiveTask) => stats.active_task_count += count,
                Ok(PresenceStatus::Away) => stats.away_count += count,
                Ok(PresenceStatus::Offline) => {}
                Err(e) => tracing::warn!(error = %e, "skipping unknown presence status"),
            }
        }
        Ok(stats)
    }

    /// Flip a user to offline, keeping their last custom status.
    pub fn mark_offline(&self, user_id: &UserId, device_id: &DeviceId) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE user_presence
             SET status = 'offline', last_seen = ?2, active_task_ids = '[]', connection_count = 0
             WHERE user_id = ?1 AND device_id = ?3",
            params![user_id.as_str(), chrono::Utc::now().to_rfc3339(), device_id.0],
        )?;
        Ok(updated > 0)
    }
}

fn row_to_presence(row: &rusqlite::Row<'_>) -> rusqlite::Result<PresenceRecord> {
    let user_id: String = row.get(0)?;
    let status: String = row.get(1)?;
    let last_seen: String = row.get(2)?;
    let task_ids: String = row.get(4)?;
    let connection_count: i64 = row.get(6)?;

    let active_task_ids: Vec<PrayerId> =
        serde_json::from_str(&task_ids).map_err(|e| conversion_error(4, e))?;

    Ok(PresenceRecord {
        user_id: UserId::new(user_id).map_err(|e| conversion_error(0, e))?,
        status: status.parse().map_err(|e| conversion_error(1, e))?,
        last_seen: parse_timestamp(2, &last_seen)?,
        custom_status: row.get(3)?,
        active_task_ids,
        device_id: DeviceId(row.get(5)?),
        connection_count: u32::try_from(connection_count).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn record(user: &str, status: PresenceStatus) -> PresenceRecord {
        PresenceRecord {
            user_id: UserId::new(user).unwrap(),
            status,
            last_seen: Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap(),
            custom_status: Some("praying".into()),
            active_task_ids: Vec::new(),
            device_id: DeviceId("phone".into()),
            connection_count: 1,
        }
    }

    #[test]
    fn upsert_then_get() {
        let (_dir, db) = open();
        let mut rec = record("ana", PresenceStatus::ActiveTask);
        rec.active_task_ids = vec![PrayerId::new(), PrayerId::new()];

        db.upsert_presence(&rec).unwrap();
        assert_eq!(db.get_presence(&rec.user_id).unwrap(), Some(rec));
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let (_dir, db) = open();
        db.upsert_presence(&record("ana", PresenceStatus::Online)).unwrap();
        db.upsert_presence(&record("ana", PresenceStatus::Away)).unwrap();

        let stored = db.get_presence(&UserId::new("ana").unwrap()).unwrap().unwrap();
        assert_eq!(stored.status, PresenceStatus::Away);
    }

    #[test]
    fn unknown_user_has_no_presence() {
        let (_dir, db) = open();
        assert_eq!(db.get_presence(&UserId::new("ghost").unwrap()).unwrap(), None);
    }

    #[test]
    fn stats_count_live_statuses() {
        let (_dir, db) = open();
        db.upsert_presence(&record("a", PresenceStatus::Online)).unwrap();
        db.upsert_presence(&record("b", PresenceStatus::Online)).unwrap();
        db.upsert_presence(&record("c", PresenceStatus::ActiveTask)).unwrap();
        db.upsert_presence(&record("d", PresenceStatus::Away)).unwrap();
        db.upsert_presence(&record("e", PresenceStatus::Offline)).unwrap();

        assert_eq!(
            db.online_stats().unwrap(),
            OnlineStats {
                online_count: 2,
                active_task_count: 1,
                away_count: 1,
            }
        );
    }

    #[test]
    fn mark_offline_matches_device() {
        let (_dir, db) = open();
        let rec = record("ana", PresenceStatus::Online);
        db.upsert_presence(&rec).unwrap();

        assert!(!db.mark_offline(&rec.user_id, &DeviceId("laptop".into())).unwrap());
        assert!(db.mark_offline(&rec.user_id, &rec.device_id).unwrap());

        let stored = db.get_presence(&rec.user_id).unwrap().unwrap();
        assert_eq!(stored.status, PresenceStatus::Offline);
        assert_eq!(stored.connection_count, 0);
        assert_eq!(stored.custom_status.as_deref(), Some("praying"));
    }
}
