//! Schema and pragmas. Timestamps are epoch milliseconds (UTC).

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    pipedrive_enabled INTEGER NOT NULL DEFAULT 1,
    retention_days INTEGER NOT NULL DEFAULT 90,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS pixels (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS visitors (
    id TEXT PRIMARY KEY,
    visitor_cookie TEXT NOT NULL UNIQUE,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    visit_count INTEGER NOT NULL DEFAULT 1,
    user_agent TEXT,
    ip TEXT
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    visitor_id TEXT NOT NULL REFERENCES visitors(id),
    pixel_id TEXT NOT NULL,
    session_cookie TEXT NOT NULL UNIQUE,
    started_at INTEGER NOT NULL,
    last_activity INTEGER NOT NULL,
    page_views INTEGER NOT NULL DEFAULT 1,
    utm_source TEXT,
    utm_medium TEXT,
    utm_campaign TEXT,
    utm_content TEXT,
    utm_term TEXT,
    campaign_region TEXT,
    ad_group TEXT,
    ad_id TEXT,
    search_query TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_visitor_pixel
    ON sessions (visitor_id, pixel_id, last_activity);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    pixel_id TEXT NOT NULL,
    visitor_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    page_url TEXT NOT NULL,
    referrer_url TEXT,
    page_title TEXT,
    user_agent TEXT,
    ip TEXT,
    country TEXT,
    region TEXT,
    city TEXT,
    utm_source TEXT,
    utm_medium TEXT,
    utm_campaign TEXT,
    utm_content TEXT,
    utm_term TEXT,
    gclid TEXT,
    fbclid TEXT,
    msclkid TEXT,
    ttclid TEXT,
    twclid TEXT,
    li_fat_id TEXT,
    sc_click_id TEXT,
    campaign_region TEXT,
    ad_group TEXT,
    ad_id TEXT,
    search_query TEXT,
    screen_resolution TEXT,
    device_type TEXT,
    operating_system TEXT,
    form_data TEXT,
    pipedrive_sync_status TEXT,
    pipedrive_sync_at INTEGER,
    pipedrive_person_id INTEGER,
    pipedrive_retry_count INTEGER NOT NULL DEFAULT 0,
    pipedrive_last_retry_at INTEGER,
    archived INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_visitor_session
    ON events (visitor_id, session_id, created_at);
CREATE INDEX IF NOT EXISTS idx_events_sync_scan
    ON events (event_type, pipedrive_sync_status, created_at);
"#;
