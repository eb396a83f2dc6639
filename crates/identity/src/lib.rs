//! Identity resolution: map each request to a stable visitor and a live
//! session without losing attribution across the visitor's history.

use std::sync::Arc;

use chrono::Duration;
use pixel_attribution::UtmData;
use pixel_core::clock::{generate_session_cookie, new_id, SharedClock};
use pixel_core::types::{Session, Visitor};
use pixel_core::{PixelError, PixelResult};
use pixel_store::Store;
use tracing::{debug, info};

/// Inactivity gap that ends a session.
pub const SESSION_WINDOW_MINUTES: i64 = 30;

pub struct IdentityService {
    store: Arc<Store>,
    clock: SharedClock,
}

impl IdentityService {
    pub fn new(store: Arc<Store>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Find the visitor for a cookie, updating `last_seen`/`visit_count`, or
    /// create one. Two simultaneous first-requests may both insert; the
    /// unique cookie constraint rejects one, and that caller re-selects the
    /// winning row and updates it instead.
    pub fn find_or_create_visitor(
        &self,
        visitor_cookie: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> PixelResult<Visitor> {
        let now = self.clock.now();

        if let Some(visitor) = self.store.find_visitor_by_cookie(visitor_cookie)? {
            self.store.touch_visitor(&visitor.id, now)?;
            return Ok(Visitor {
                last_seen: now,
                visit_count: visitor.visit_count + 1,
                ..visitor
            });
        }

        let fresh = Visitor {
            id: new_id(),
            visitor_cookie: visitor_cookie.to_string(),
            first_seen: now,
            last_seen: now,
            visit_count: 1,
            user_agent: user_agent.map(str::to_string),
            ip: ip.map(str::to_string),
        };

        match self.store.insert_visitor(&fresh) {
            Ok(()) => {
                info!(visitor_id = %fresh.id, "visitor created");
                metrics::counter!("identity.visitors_created").increment(1);
                Ok(fresh)
            }
            Err(PixelError::DuplicateInsert(_)) => {
                // Lost the race: the winning row is there now.
                metrics::counter!("identity.visitor_insert_races").increment(1);
                let existing = self
                    .store
                    .find_visitor_by_cookie(visitor_cookie)?
                    .ok_or_else(|| {
                        PixelError::Store(format!(
                            "visitor vanished after duplicate insert: {visitor_cookie}"
                        ))
                    })?;
                self.store.touch_visitor(&existing.id, now)?;
                Ok(Visitor {
                    last_seen: now,
                    visit_count: existing.visit_count + 1,
                    ..existing
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Find the visitor's live session on this pixel, or start one. A live
    /// session absorbs the request's UTM columns; a new one without
    /// `utm_source` inherits the visitor's first-visit attribution.
    pub fn find_or_create_session(
        &self,
        visitor_id: &str,
        pixel_id: &str,
        utm: &UtmData,
    ) -> PixelResult<Session> {
        let now = self.clock.now();
        let cutoff = now - Duration::minutes(SESSION_WINDOW_MINUTES);

        if let Some(session) = self.store.find_active_session(visitor_id, pixel_id, cutoff)? {
            let mut merged = session;
            merged.last_activity = now;
            merged.page_views += 1;
            overwrite_with_request(&mut merged, utm);
            self.store.update_session(&merged)?;
            debug!(session_id = %merged.id, page_views = merged.page_views, "session touched");
            return Ok(merged);
        }

        let mut fresh = Session {
            id: new_id(),
            visitor_id: visitor_id.to_string(),
            pixel_id: pixel_id.to_string(),
            session_cookie: generate_session_cookie(),
            started_at: now,
            last_activity: now,
            page_views: 1,
            utm_source: utm.utm_source.clone(),
            utm_medium: utm.utm_medium.clone(),
            utm_campaign: utm.utm_campaign.clone(),
            utm_content: utm.utm_content.clone(),
            utm_term: utm.utm_term.clone(),
            campaign_region: utm.campaign_region.clone(),
            ad_group: utm.ad_group.clone(),
            ad_id: utm.ad_id.clone(),
            search_query: utm.search_query.clone(),
        };

        if fresh.utm_source.is_none() {
            if let Some(first) = self.store.find_earliest_utm_session(visitor_id, pixel_id)? {
                apply_first_visit_attribution(&mut fresh, &first);
                debug!(
                    session_id = %fresh.id,
                    source_session = %first.id,
                    "first-visit attribution inherited"
                );
                metrics::counter!("identity.first_visit_attribution").increment(1);
            }
        }

        match self.store.insert_session(&fresh) {
            Ok(()) => Ok(fresh),
            Err(PixelError::DuplicateInsert(_)) => {
                // Cookie collision: regenerate once and retry.
                fresh.session_cookie = generate_session_cookie();
                self.store.insert_session(&fresh)?;
                Ok(fresh)
            }
            Err(e) => Err(e),
        }
    }
}

/// Overwrite any attribution column the current request carries.
fn overwrite_with_request(session: &mut Session, utm: &UtmData) {
    macro_rules! overwrite {
        ($($field:ident),*) => {
            $(if utm.$field.is_some() {
                session.$field = utm.$field.clone();
            })*
        };
    }
    overwrite!(
        utm_source,
        utm_medium,
        utm_campaign,
        utm_content,
        utm_term,
        campaign_region,
        ad_group,
        ad_id,
        search_query
    );
}

/// Copy the first UTM-bearing session's attribution into a new session that
/// begins without one. `utm_content`/`utm_term` (and the ad columns) stay
/// with the current request when it carries them.
fn apply_first_visit_attribution(session: &mut Session, first: &Session) {
    session.utm_source = first.utm_source.clone();
    session.utm_medium = first.utm_medium.clone();
    session.utm_campaign = first.utm_campaign.clone();
    if session.utm_content.is_none() {
        session.utm_content = first.utm_content.clone();
    }
    if session.utm_term.is_none() {
        session.utm_term = first.utm_term.clone();
    }
    if session.campaign_region.is_none() {
        session.campaign_region = first.campaign_region.clone();
    }
    if session.ad_group.is_none() {
        session.ad_group = first.ad_group.clone();
    }
    if session.ad_id.is_none() {
        session.ad_id = first.ad_id.clone();
    }
    if session.search_query.is_none() {
        session.search_query = first.search_query.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pixel_core::clock::ManualClock;
    use pixel_core::types::{Pixel, Project};

    fn service() -> (IdentityService, Arc<Store>, Arc<ManualClock>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        store
            .upsert_project(&Project {
                id: "proj-1".to_string(),
                name: "Acme".to_string(),
                pipedrive_enabled: true,
                retention_days: 90,
                active: true,
            })
            .unwrap();
        store
            .upsert_pixel(&Pixel {
                id: "pix-1".to_string(),
                project_id: "proj-1".to_string(),
                active: true,
            })
            .unwrap();
        let svc = IdentityService::new(store.clone(), clock.clone());
        (svc, store, clock)
    }

    fn utm(source: Option<&str>) -> UtmData {
        UtmData {
            utm_source: source.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_same_cookie_resolves_to_same_visitor() {
        let (svc, _, _) = service();

        let first = svc
            .find_or_create_visitor("pv_c0ffee", Some("203.0.113.1"), Some("UA"))
            .unwrap();
        assert_eq!(first.visit_count, 1);

        let second = svc.find_or_create_visitor("pv_c0ffee", None, None).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.visit_count, 2);
    }

    #[test]
    fn test_session_reused_inside_window_and_replaced_after() {
        let (svc, _, clock) = service();
        let visitor = svc.find_or_create_visitor("pv_1", None, None).unwrap();

        let s1 = svc
            .find_or_create_session(&visitor.id, "pix-1", &utm(Some("google")))
            .unwrap();

        clock.advance(Duration::minutes(10));
        let s2 = svc
            .find_or_create_session(&visitor.id, "pix-1", &utm(None))
            .unwrap();
        assert_eq!(s2.id, s1.id);
        assert_eq!(s2.page_views, 2);
        // Attribution non-loss: the session keeps its UTMs.
        assert_eq!(s2.utm_source.as_deref(), Some("google"));

        clock.advance(Duration::minutes(31));
        let s3 = svc
            .find_or_create_session(&visitor.id, "pix-1", &utm(None))
            .unwrap();
        assert_ne!(s3.id, s1.id);
    }

    #[test]
    fn test_first_visit_attribution_propagates() {
        let (svc, _, clock) = service();
        let visitor = svc.find_or_create_visitor("pv_2", None, None).unwrap();

        let first = UtmData {
            utm_source: Some("google".to_string()),
            utm_medium: Some("cpc".to_string()),
            utm_campaign: Some("fall".to_string()),
            utm_term: Some("shoes".to_string()),
            ..Default::default()
        };
        svc.find_or_create_session(&visitor.id, "pix-1", &first)
            .unwrap();

        clock.advance(Duration::minutes(45));
        let request = UtmData {
            utm_term: Some("boots".to_string()),
            ..Default::default()
        };
        let inherited = svc
            .find_or_create_session(&visitor.id, "pix-1", &request)
            .unwrap();
        assert_eq!(inherited.utm_source.as_deref(), Some("google"));
        assert_eq!(inherited.utm_medium.as_deref(), Some("cpc"));
        assert_eq!(inherited.utm_campaign.as_deref(), Some("fall"));
        // Current request's term wins over the inherited one.
        assert_eq!(inherited.utm_term.as_deref(), Some("boots"));
    }

    #[test]
    fn test_live_session_absorbs_fresh_utms() {
        let (svc, _, clock) = service();
        let visitor = svc.find_or_create_visitor("pv_3", None, None).unwrap();

        svc.find_or_create_session(&visitor.id, "pix-1", &utm(Some("google")))
            .unwrap();

        clock.advance(Duration::minutes(5));
        let updated = svc
            .find_or_create_session(&visitor.id, "pix-1", &utm(Some("facebook")))
            .unwrap();
        assert_eq!(updated.utm_source.as_deref(), Some("facebook"));
    }

    #[test]
    fn test_new_session_with_utm_keeps_its_own_attribution() {
        let (svc, _, clock) = service();
        let visitor = svc.find_or_create_visitor("pv_4", None, None).unwrap();

        svc.find_or_create_session(&visitor.id, "pix-1", &utm(Some("google")))
            .unwrap();

        clock.advance(Duration::minutes(45));
        let fresh = svc
            .find_or_create_session(&visitor.id, "pix-1", &utm(Some("newsletter")))
            .unwrap();
        assert_eq!(fresh.utm_source.as_deref(), Some("newsletter"));
    }
}
