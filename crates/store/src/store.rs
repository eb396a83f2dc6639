//! Store handle and queries. A single WAL connection behind a mutex is
//! enough for the write rates a tracking pixel sees; reads stay short.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pixel_core::types::{EventDraft, Pixel, Project, Session, SyncStatus, TrackingEvent, Visitor};
use pixel_core::{PixelError, PixelResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::schema::SCHEMA_SQL;

const EVENT_COLUMNS: &str = "id, project_id, pixel_id, visitor_id, session_id, event_type, \
     page_url, referrer_url, page_title, user_agent, ip, country, region, city, \
     utm_source, utm_medium, utm_campaign, utm_content, utm_term, \
     gclid, fbclid, msclkid, ttclid, twclid, li_fat_id, sc_click_id, \
     campaign_region, ad_group, ad_id, search_query, \
     screen_resolution, device_type, operating_system, form_data, \
     pipedrive_sync_status, pipedrive_sync_at, pipedrive_person_id, \
     pipedrive_retry_count, pipedrive_last_retry_at, archived, created_at";

const SESSION_COLUMNS: &str = "id, visitor_id, pixel_id, session_cookie, started_at, \
     last_activity, page_views, utm_source, utm_medium, utm_campaign, utm_content, \
     utm_term, campaign_region, ad_group, ad_id, search_query";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> PixelResult<Self> {
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(sql_err)?;
        info!(path = path, "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> PixelResult<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ─── Projects & Pixels ──────────────────────────────────────────────

    pub fn upsert_project(&self, project: &Project) -> PixelResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO projects (id, name, pipedrive_enabled, retention_days, active) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(id) DO UPDATE SET name = ?2, pipedrive_enabled = ?3, \
                 retention_days = ?4, active = ?5",
                params![
                    project.id,
                    project.name,
                    project.pipedrive_enabled,
                    project.retention_days,
                    project.active
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> PixelResult<Option<Project>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, name, pipedrive_enabled, retention_days, active \
                 FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        pipedrive_enabled: row.get(2)?,
                        retention_days: row.get(3)?,
                        active: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn upsert_pixel(&self, pixel: &Pixel) -> PixelResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO pixels (id, project_id, active) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(id) DO UPDATE SET project_id = ?2, active = ?3",
                params![pixel.id, pixel.project_id, pixel.active],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn get_pixel(&self, id: &str) -> PixelResult<Option<Pixel>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, project_id, active FROM pixels WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Pixel {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        active: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)
    }

    // ─── Visitors ───────────────────────────────────────────────────────

    pub fn find_visitor_by_cookie(&self, cookie: &str) -> PixelResult<Option<Visitor>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, visitor_cookie, first_seen, last_seen, visit_count, user_agent, ip \
                 FROM visitors WHERE visitor_cookie = ?1",
                params![cookie],
                row_to_visitor,
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn get_visitor(&self, id: &str) -> PixelResult<Option<Visitor>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, visitor_cookie, first_seen, last_seen, visit_count, user_agent, ip \
                 FROM visitors WHERE id = ?1",
                params![id],
                row_to_visitor,
            )
            .optional()
            .map_err(sql_err)
    }

    /// Insert a new visitor row. A concurrent first-request may have won the
    /// race; the unique constraint on the cookie surfaces as
    /// `DuplicateInsert` so the caller can re-select.
    pub fn insert_visitor(&self, visitor: &Visitor) -> PixelResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO visitors \
                 (id, visitor_cookie, first_seen, last_seen, visit_count, user_agent, ip) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    visitor.id,
                    visitor.visitor_cookie,
                    dt_ms(visitor.first_seen),
                    dt_ms(visitor.last_seen),
                    visitor.visit_count as i64,
                    visitor.user_agent,
                    visitor.ip
                ],
            )
            .map_err(|e| constraint_err(e, &visitor.visitor_cookie))?;
        Ok(())
    }

    /// `last_seen := now; visit_count += 1`, atomically.
    pub fn touch_visitor(&self, id: &str, now: DateTime<Utc>) -> PixelResult<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE visitors SET last_seen = ?1, visit_count = visit_count + 1 WHERE id = ?2",
                params![dt_ms(now), id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────

    /// Most recent session for (visitor, pixel) still inside the activity
    /// window (`last_activity >= cutoff`).
    pub fn find_active_session(
        &self,
        visitor_id: &str,
        pixel_id: &str,
        cutoff: DateTime<Utc>,
    ) -> PixelResult<Option<Session>> {
        self.conn
            .lock()
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE visitor_id = ?1 AND pixel_id = ?2 AND last_activity >= ?3 \
                     ORDER BY last_activity DESC LIMIT 1"
                ),
                params![visitor_id, pixel_id, dt_ms(cutoff)],
                row_to_session,
            )
            .optional()
            .map_err(sql_err)
    }

    /// The visitor's earliest session on this pixel that carries a
    /// `utm_source` — the first-visit attribution source.
    pub fn find_earliest_utm_session(
        &self,
        visitor_id: &str,
        pixel_id: &str,
    ) -> PixelResult<Option<Session>> {
        self.conn
            .lock()
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE visitor_id = ?1 AND pixel_id = ?2 AND utm_source IS NOT NULL \
                     ORDER BY started_at ASC LIMIT 1"
                ),
                params![visitor_id, pixel_id],
                row_to_session,
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn get_session(&self, id: &str) -> PixelResult<Option<Session>> {
        self.conn
            .lock()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                row_to_session,
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn insert_session(&self, session: &Session) -> PixelResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO sessions \
                 (id, visitor_id, pixel_id, session_cookie, started_at, last_activity, \
                  page_views, utm_source, utm_medium, utm_campaign, utm_content, utm_term, \
                  campaign_region, ad_group, ad_id, search_query) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    session.id,
                    session.visitor_id,
                    session.pixel_id,
                    session.session_cookie,
                    dt_ms(session.started_at),
                    dt_ms(session.last_activity),
                    session.page_views as i64,
                    session.utm_source,
                    session.utm_medium,
                    session.utm_campaign,
                    session.utm_content,
                    session.utm_term,
                    session.campaign_region,
                    session.ad_group,
                    session.ad_id,
                    session.search_query
                ],
            )
            .map_err(|e| constraint_err(e, &session.session_cookie))?;
        Ok(())
    }

    /// Write back the mutable columns of a merged session object.
    pub fn update_session(&self, session: &Session) -> PixelResult<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE sessions SET last_activity = ?1, page_views = ?2, \
                 utm_source = ?3, utm_medium = ?4, utm_campaign = ?5, utm_content = ?6, \
                 utm_term = ?7, campaign_region = ?8, ad_group = ?9, ad_id = ?10, \
                 search_query = ?11 WHERE id = ?12",
                params![
                    dt_ms(session.last_activity),
                    session.page_views as i64,
                    session.utm_source,
                    session.utm_medium,
                    session.utm_campaign,
                    session.utm_content,
                    session.utm_term,
                    session.campaign_region,
                    session.ad_group,
                    session.ad_id,
                    session.search_query,
                    session.id
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Delete sessions idle since before `cutoff`.
    pub fn prune_sessions(&self, cutoff: DateTime<Utc>) -> PixelResult<usize> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM sessions WHERE last_activity < ?1",
                params![dt_ms(cutoff)],
            )
            .map_err(sql_err)
    }

    // ─── Events ─────────────────────────────────────────────────────────

    /// Insert one event row. Returns the driver-assigned id when the driver
    /// reports one.
    pub fn insert_event(&self, draft: &EventDraft) -> PixelResult<Option<i64>> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events \
             (project_id, pixel_id, visitor_id, session_id, event_type, page_url, \
              referrer_url, page_title, user_agent, ip, country, region, city, \
              utm_source, utm_medium, utm_campaign, utm_content, utm_term, \
              gclid, fbclid, msclkid, ttclid, twclid, li_fat_id, sc_click_id, \
              campaign_region, ad_group, ad_id, search_query, \
              screen_resolution, device_type, operating_system, form_data, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, \
                     ?29, ?30, ?31, ?32, ?33, ?34)",
            params![
                draft.project_id,
                draft.pixel_id,
                draft.visitor_id,
                draft.session_id,
                draft.event_type,
                draft.page_url,
                draft.referrer_url,
                draft.page_title,
                draft.user_agent,
                draft.ip,
                draft.country,
                draft.region,
                draft.city,
                draft.utm_source,
                draft.utm_medium,
                draft.utm_campaign,
                draft.utm_content,
                draft.utm_term,
                draft.gclid,
                draft.fbclid,
                draft.msclkid,
                draft.ttclid,
                draft.twclid,
                draft.li_fat_id,
                draft.sc_click_id,
                draft.campaign_region,
                draft.ad_group,
                draft.ad_id,
                draft.search_query,
                draft.screen_resolution,
                draft.device_type,
                draft.operating_system,
                draft.form_data,
                dt_ms(draft.created_at)
            ],
        )
        .map_err(sql_err)?;
        let id = conn.last_insert_rowid();
        Ok((id > 0).then_some(id))
    }

    /// Strict disambiguation select for post-insert id recovery.
    pub fn find_recent_event_id(
        &self,
        visitor_id: &str,
        session_id: &str,
        event_type: &str,
        page_url: &str,
        since: DateTime<Utc>,
    ) -> PixelResult<Option<i64>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id FROM events \
                 WHERE visitor_id = ?1 AND session_id = ?2 AND event_type = ?3 \
                 AND page_url = ?4 AND created_at >= ?5 \
                 ORDER BY id DESC LIMIT 1",
                params![visitor_id, session_id, event_type, page_url, dt_ms(since)],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)
    }

    /// Loose disambiguation select, last rung of the recovery ladder.
    pub fn find_recent_event_id_loose(
        &self,
        visitor_id: &str,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> PixelResult<Option<i64>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id FROM events \
                 WHERE visitor_id = ?1 AND session_id = ?2 AND created_at >= ?3 \
                 ORDER BY id DESC LIMIT 1",
                params![visitor_id, session_id, dt_ms(since)],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn get_event(&self, id: i64) -> PixelResult<Option<TrackingEvent>> {
        self.conn
            .lock()
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id],
                row_to_event,
            )
            .optional()
            .map_err(sql_err)
    }

    /// Reconciliation outcome write. The scheduler is the only caller.
    pub fn update_sync_status(
        &self,
        event_id: i64,
        status: SyncStatus,
        sync_at: DateTime<Utc>,
        person_id: Option<i64>,
    ) -> PixelResult<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE events SET pipedrive_sync_status = ?1, pipedrive_sync_at = ?2, \
                 pipedrive_person_id = ?3 WHERE id = ?4",
                params![status.as_str(), dt_ms(sync_at), person_id, event_id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Expired-job path: mark `error` only when no outcome landed yet.
    pub fn mark_sync_error_if_unset(
        &self,
        event_id: i64,
        now: DateTime<Utc>,
    ) -> PixelResult<bool> {
        let changed = self
            .conn
            .lock()
            .execute(
                "UPDATE events SET pipedrive_sync_status = 'error', pipedrive_sync_at = ?1 \
                 WHERE id = ?2 AND pipedrive_sync_status IS NULL",
                params![dt_ms(now), event_id],
            )
            .map_err(sql_err)?;
        Ok(changed > 0)
    }

    /// Form submits whose sync never landed (or landed as a transient
    /// error): bounded retries, older than the stall cutoff.
    pub fn find_stalled_form_events(
        &self,
        cutoff: DateTime<Utc>,
        max_retries: u32,
        limit: usize,
    ) -> PixelResult<Vec<TrackingEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events \
                 WHERE event_type = 'form_submit' \
                 AND (pipedrive_sync_status IS NULL OR pipedrive_sync_status = 'error') \
                 AND pipedrive_retry_count < ?1 AND created_at < ?2 AND archived = 0 \
                 ORDER BY created_at ASC LIMIT ?3"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![max_retries, dt_ms(cutoff), limit as i64],
                row_to_event,
            )
            .map_err(sql_err)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(sql_err)?);
        }
        Ok(events)
    }

    pub fn mark_retry(&self, event_id: i64, now: DateTime<Utc>) -> PixelResult<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE events SET pipedrive_retry_count = pipedrive_retry_count + 1, \
                 pipedrive_last_retry_at = ?1 WHERE id = ?2",
                params![dt_ms(now), event_id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Up to `limit` most recent distinct page URLs for a visitor,
    /// newest-first.
    pub fn recent_page_urls(&self, visitor_id: &str, limit: usize) -> PixelResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT page_url FROM events WHERE visitor_id = ?1 \
                 GROUP BY page_url ORDER BY MAX(created_at) DESC, MAX(id) DESC LIMIT ?2",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![visitor_id, limit as i64], |row| row.get(0))
            .map_err(sql_err)?;
        let mut urls = Vec::new();
        for row in rows {
            urls.push(row.map_err(sql_err)?);
        }
        Ok(urls)
    }

    // ─── Archival hooks ─────────────────────────────────────────────────

    pub fn mark_archived(&self, event_ids: &[i64]) -> PixelResult<usize> {
        let conn = self.conn.lock();
        let mut changed = 0;
        for id in event_ids {
            changed += conn
                .execute("UPDATE events SET archived = 1 WHERE id = ?1", params![id])
                .map_err(sql_err)?;
        }
        Ok(changed)
    }

    /// Delete only rows already marked archived; called after the archival
    /// collaborator confirms receipt.
    pub fn delete_archived(&self, event_ids: &[i64]) -> PixelResult<usize> {
        let conn = self.conn.lock();
        let mut deleted = 0;
        for id in event_ids {
            deleted += conn
                .execute(
                    "DELETE FROM events WHERE id = ?1 AND archived = 1",
                    params![id],
                )
                .map_err(sql_err)?;
        }
        Ok(deleted)
    }
}

fn sql_err(e: rusqlite::Error) -> PixelError {
    PixelError::Store(e.to_string())
}

fn constraint_err(e: rusqlite::Error, key: &str) -> PixelError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            PixelError::DuplicateInsert(key.to_string())
        }
        _ => sql_err(e),
    }
}

fn dt_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

fn row_to_visitor(row: &Row<'_>) -> rusqlite::Result<Visitor> {
    Ok(Visitor {
        id: row.get(0)?,
        visitor_cookie: row.get(1)?,
        first_seen: ms_dt(row.get(2)?),
        last_seen: ms_dt(row.get(3)?),
        visit_count: row.get(4)?,
        user_agent: row.get(5)?,
        ip: row.get(6)?,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        visitor_id: row.get(1)?,
        pixel_id: row.get(2)?,
        session_cookie: row.get(3)?,
        started_at: ms_dt(row.get(4)?),
        last_activity: ms_dt(row.get(5)?),
        page_views: row.get(6)?,
        utm_source: row.get(7)?,
        utm_medium: row.get(8)?,
        utm_campaign: row.get(9)?,
        utm_content: row.get(10)?,
        utm_term: row.get(11)?,
        campaign_region: row.get(12)?,
        ad_group: row.get(13)?,
        ad_id: row.get(14)?,
        search_query: row.get(15)?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<TrackingEvent> {
    let status: Option<String> = row.get(34)?;
    let sync_at: Option<i64> = row.get(35)?;
    let last_retry: Option<i64> = row.get(38)?;
    Ok(TrackingEvent {
        id: row.get(0)?,
        project_id: row.get(1)?,
        pixel_id: row.get(2)?,
        visitor_id: row.get(3)?,
        session_id: row.get(4)?,
        event_type: row.get(5)?,
        page_url: row.get(6)?,
        referrer_url: row.get(7)?,
        page_title: row.get(8)?,
        user_agent: row.get(9)?,
        ip: row.get(10)?,
        country: row.get(11)?,
        region: row.get(12)?,
        city: row.get(13)?,
        utm_source: row.get(14)?,
        utm_medium: row.get(15)?,
        utm_campaign: row.get(16)?,
        utm_content: row.get(17)?,
        utm_term: row.get(18)?,
        gclid: row.get(19)?,
        fbclid: row.get(20)?,
        msclkid: row.get(21)?,
        ttclid: row.get(22)?,
        twclid: row.get(23)?,
        li_fat_id: row.get(24)?,
        sc_click_id: row.get(25)?,
        campaign_region: row.get(26)?,
        ad_group: row.get(27)?,
        ad_id: row.get(28)?,
        search_query: row.get(29)?,
        screen_resolution: row.get(30)?,
        device_type: row.get(31)?,
        operating_system: row.get(32)?,
        form_data: row.get(33)?,
        pipedrive_sync_status: status.as_deref().and_then(SyncStatus::parse),
        pipedrive_sync_at: sync_at.map(ms_dt),
        pipedrive_person_id: row.get(36)?,
        pipedrive_retry_count: row.get(37)?,
        pipedrive_last_retry_at: last_retry.map(ms_dt),
        archived: row.get(39)?,
        created_at: ms_dt(row.get(40)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pixel_core::clock::new_id;

    fn seed_project_pixel(store: &Store) -> (String, String) {
        let project = Project {
            id: new_id(),
            name: "Acme".to_string(),
            pipedrive_enabled: true,
            retention_days: 90,
            active: true,
        };
        let pixel = Pixel {
            id: new_id(),
            project_id: project.id.clone(),
            active: true,
        };
        store.upsert_project(&project).unwrap();
        store.upsert_pixel(&pixel).unwrap();
        (project.id, pixel.id)
    }

    fn make_visitor(cookie: &str, now: DateTime<Utc>) -> Visitor {
        Visitor {
            id: new_id(),
            visitor_cookie: cookie.to_string(),
            first_seen: now,
            last_seen: now,
            visit_count: 1,
            user_agent: Some("UA".to_string()),
            ip: Some("203.0.113.9".to_string()),
        }
    }

    fn make_session(visitor_id: &str, pixel_id: &str, now: DateTime<Utc>) -> Session {
        Session {
            id: new_id(),
            visitor_id: visitor_id.to_string(),
            pixel_id: pixel_id.to_string(),
            session_cookie: format!("ps_{}", &new_id().replace('-', "")[..32]),
            started_at: now,
            last_activity: now,
            page_views: 1,
            utm_source: None,
            utm_medium: None,
            utm_campaign: None,
            utm_content: None,
            utm_term: None,
            campaign_region: None,
            ad_group: None,
            ad_id: None,
            search_query: None,
        }
    }

    fn make_draft(
        project_id: &str,
        pixel_id: &str,
        visitor_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> EventDraft {
        EventDraft {
            project_id: project_id.to_string(),
            pixel_id: pixel_id.to_string(),
            visitor_id: visitor_id.to_string(),
            session_id: session_id.to_string(),
            event_type: "pageview".to_string(),
            page_url: "https://site.example/".to_string(),
            created_at: now,
            ..Default::default()
        }
    }

    #[test]
    fn test_duplicate_visitor_cookie_surfaces_as_duplicate_insert() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.insert_visitor(&make_visitor("pv_aaa", now)).unwrap();

        let err = store
            .insert_visitor(&make_visitor("pv_aaa", now))
            .unwrap_err();
        assert!(matches!(err, PixelError::DuplicateInsert(_)));
    }

    #[test]
    fn test_session_window_query() {
        let store = Store::open_in_memory().unwrap();
        let (_, pixel_id) = seed_project_pixel(&store);
        let now = Utc::now();

        let visitor = make_visitor("pv_bbb", now);
        store.insert_visitor(&visitor).unwrap();

        let mut old = make_session(&visitor.id, &pixel_id, now - Duration::minutes(45));
        old.utm_source = Some("google".to_string());
        store.insert_session(&old).unwrap();

        // Past the 30-minute window: nothing active.
        let cutoff = now - Duration::minutes(30);
        assert!(store
            .find_active_session(&visitor.id, &pixel_id, cutoff)
            .unwrap()
            .is_none());

        let fresh = make_session(&visitor.id, &pixel_id, now - Duration::minutes(5));
        store.insert_session(&fresh).unwrap();
        let found = store
            .find_active_session(&visitor.id, &pixel_id, cutoff)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, fresh.id);

        // Earliest UTM-bearing session is the old one.
        let earliest = store
            .find_earliest_utm_session(&visitor.id, &pixel_id)
            .unwrap()
            .unwrap();
        assert_eq!(earliest.id, old.id);
    }

    #[test]
    fn test_event_insert_returns_id_and_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let (project_id, pixel_id) = seed_project_pixel(&store);
        let now = Utc::now();
        let visitor = make_visitor("pv_ccc", now);
        store.insert_visitor(&visitor).unwrap();
        let session = make_session(&visitor.id, &pixel_id, now);
        store.insert_session(&session).unwrap();

        let id = store
            .insert_event(&make_draft(&project_id, &pixel_id, &visitor.id, &session.id, now))
            .unwrap()
            .unwrap();

        let event = store.get_event(id).unwrap().unwrap();
        assert_eq!(event.visitor_id, visitor.id);
        assert_eq!(event.pipedrive_sync_status, None);
        assert_eq!(event.pipedrive_retry_count, 0);
        assert!(!event.archived);

        let found = store
            .find_recent_event_id(
                &visitor.id,
                &session.id,
                "pageview",
                "https://site.example/",
                now - Duration::seconds(2),
            )
            .unwrap();
        assert_eq!(found, Some(id));
    }

    #[test]
    fn test_sync_status_writes() {
        let store = Store::open_in_memory().unwrap();
        let (project_id, pixel_id) = seed_project_pixel(&store);
        let now = Utc::now();
        let visitor = make_visitor("pv_ddd", now);
        store.insert_visitor(&visitor).unwrap();
        let session = make_session(&visitor.id, &pixel_id, now);
        store.insert_session(&session).unwrap();
        let id = store
            .insert_event(&make_draft(&project_id, &pixel_id, &visitor.id, &session.id, now))
            .unwrap()
            .unwrap();

        store
            .update_sync_status(id, SyncStatus::Synced, now, Some(42))
            .unwrap();
        let event = store.get_event(id).unwrap().unwrap();
        assert_eq!(event.pipedrive_sync_status, Some(SyncStatus::Synced));
        assert_eq!(event.pipedrive_person_id, Some(42));

        // An outcome already landed: the expired-job path must not clobber it.
        assert!(!store.mark_sync_error_if_unset(id, now).unwrap());
    }

    #[test]
    fn test_stalled_scan_honours_retry_bound_and_age() {
        let store = Store::open_in_memory().unwrap();
        let (project_id, pixel_id) = seed_project_pixel(&store);
        let now = Utc::now();
        let visitor = make_visitor("pv_eee", now);
        store.insert_visitor(&visitor).unwrap();
        let session = make_session(&visitor.id, &pixel_id, now);
        store.insert_session(&session).unwrap();

        let mut draft = make_draft(
            &project_id,
            &pixel_id,
            &visitor.id,
            &session.id,
            now - Duration::minutes(20),
        );
        draft.event_type = "form_submit".to_string();
        draft.form_data = Some(r#"{"email":"a@example.com"}"#.to_string());
        let stalled_id = store.insert_event(&draft).unwrap().unwrap();

        // Too fresh to count as stalled.
        let mut fresh = make_draft(&project_id, &pixel_id, &visitor.id, &session.id, now);
        fresh.event_type = "form_submit".to_string();
        store.insert_event(&fresh).unwrap();

        let cutoff = now - Duration::minutes(15);
        let stalled = store.find_stalled_form_events(cutoff, 3, 10).unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, stalled_id);

        // Exhaust the retry budget: drops out of the scan.
        for _ in 0..3 {
            store.mark_retry(stalled_id, now).unwrap();
        }
        assert!(store.find_stalled_form_events(cutoff, 3, 10).unwrap().is_empty());
    }

    #[test]
    fn test_recent_page_urls_distinct_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let (project_id, pixel_id) = seed_project_pixel(&store);
        let now = Utc::now();
        let visitor = make_visitor("pv_fff", now);
        store.insert_visitor(&visitor).unwrap();
        let session = make_session(&visitor.id, &pixel_id, now);
        store.insert_session(&session).unwrap();

        for (url, minutes_ago) in [("/a", 30), ("/b", 20), ("/a", 10), ("/c", 5)] {
            let mut draft = make_draft(
                &project_id,
                &pixel_id,
                &visitor.id,
                &session.id,
                now - Duration::minutes(minutes_ago),
            );
            draft.page_url = url.to_string();
            store.insert_event(&draft).unwrap();
        }

        let urls = store.recent_page_urls(&visitor.id, 50).unwrap();
        assert_eq!(urls, vec!["/c", "/a", "/b"]);
    }

    #[test]
    fn test_prune_sessions_by_age() {
        let store = Store::open_in_memory().unwrap();
        let (_, pixel_id) = seed_project_pixel(&store);
        let now = Utc::now();
        let visitor = make_visitor("pv_ggg", now);
        store.insert_visitor(&visitor).unwrap();

        store
            .insert_session(&make_session(&visitor.id, &pixel_id, now - Duration::days(31)))
            .unwrap();
        let kept = make_session(&visitor.id, &pixel_id, now - Duration::days(2));
        store.insert_session(&kept).unwrap();

        let pruned = store.prune_sessions(now - Duration::days(30)).unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_session(&kept.id).unwrap().is_some());
    }

    #[test]
    fn test_delete_archived_requires_mark() {
        let store = Store::open_in_memory().unwrap();
        let (project_id, pixel_id) = seed_project_pixel(&store);
        let now = Utc::now();
        let visitor = make_visitor("pv_hhh", now);
        store.insert_visitor(&visitor).unwrap();
        let session = make_session(&visitor.id, &pixel_id, now);
        store.insert_session(&session).unwrap();
        let id = store
            .insert_event(&make_draft(&project_id, &pixel_id, &visitor.id, &session.id, now))
            .unwrap()
            .unwrap();

        assert_eq!(store.delete_archived(&[id]).unwrap(), 0);
        store.mark_archived(&[id]).unwrap();
        assert_eq!(store.delete_archived(&[id]).unwrap(), 1);
        assert!(store.get_event(id).unwrap().is_none());
    }
}
