use rusqlite::{params, OptionalExtension};

use prayermap_shared::{ConnectionId, GeoPoint, PrayerConnection, PrayerId, UserId};

use crate::database::{conversion_error, parse_timestamp, parse_uuid, Database};
use crate::error::{Result, StoreError};

const SELECT_COLUMNS: &str = "SELECT id, prayer_id, requester_id, responder_id,
        requester_lat, requester_lng, responder_lat, responder_lng, created_at, expires_at
     FROM prayer_connections";

impl Database {
    /// Persist a memorial line.
    ///
    /// Returns `false` when a line with the same id already exists; the
    /// stored row is left untouched.
    pub fn insert_connection(&self, connection: &PrayerConnection) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO prayer_connections
                (id, prayer_id, requester_id, responder_id,
                 requester_lat, requester_lng, responder_lat, responder_lng,
                 created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                connection.id.to_string(),
                connection.prayer_id.to_string(),
                connection.requester_id.as_str(),
                connection.responder_id.as_str(),
                connection.requester_location.lat,
                connection.requester_location.lng,
                connection.responder_location.lat,
                connection.responder_location.lng,
                connection.created_at.to_rfc3339(),
                connection.expires_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_connection(&self, id: ConnectionId) -> Result<PrayerConnection> {
        self.conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                row_to_connection,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Lines where `user_id` is either side, newest first.
    pub fn list_connections_for_user(&self, user_id: &UserId, limit: u32) -> Result<Vec<PrayerConnection>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE requester_id = ?1 OR responder_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![user_id.as_str(), limit], row_to_connection)?;

        let mut connections = Vec::new();
        for row in rows {
            connections.push(row?);
        }
        Ok(connections)
    }

    pub fn list_connections_for_prayer(&self, prayer_id: PrayerId) -> Result<Vec<PrayerConnection>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS} WHERE prayer_id = ?1 ORDER BY created_at ASC"
        ))?;

        let rows = stmt.query_map(params![prayer_id.to_string()], row_to_connection)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    pub fn count_connections(&self) -> Result<u64> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM prayer_connections", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn row_to_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrayerConnection> {
    let id: String = row.get(0)?;
    let prayer_id: String = row.get(1)?;
    let requester_id: String = row.get(2)?;
    let responder_id: String = row.get(3)?;
    let created_at: String = row.get(8)?;
    let expires_at: Option<String> = row.get(9)?;

    Ok(PrayerConnection {
        id: ConnectionId(parse_uuid(0, &id)?),
        prayer_id: PrayerId(parse_uuid(1, &prayer_id)?),
        requester_id: UserId::new(requester_id).map_err(|e| conversion_error(2, e))?,
        responder_id: UserId::new(responder_id).map_err(|e| conversion_error(3, e))?,
        requester_location: GeoPoint {
            lat: row.get(4)?,
            lng: row.get(5)?,
        },
        responder_location: GeoPoint {
            lat: row.get(6)?,
            lng: row.get(7)?,
        },
        created_at: parse_timestamp(8, &created_at)?,
        expires_at: expires_at
            .as_deref()
            .map(|raw| parse_timestamp(9, raw))
            .transpose()?,
    })
}
