//! Amazon session cookie persistence.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Cookie names that identify a signed-in Amazon session.
pub const SESSION_COOKIES: &[&str] = &["session-id", "ubid-main"];

/// One persisted cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CookieRecord {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// Domain attribute (empty for host-only).
    #[serde(default)]
    pub domain: String,
    /// Path attribute.
    #[serde(default = "default_path")]
    pub path: String,
    /// Expiry, `None` for session cookies.
    #[serde(default, with = "expiry")]
    pub expires: Option<DateTime<Utc>>,
}

fn default_path() -> String {
    "/".to_string()
}

impl CookieRecord {
    /// Create a session cookie.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: path.into(),
            expires: None,
        }
    }

    /// Set the expiry.
    pub fn expiring(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(at);
        self
    }

    /// Whether the cookie has an expiry before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at < now)
    }

    fn same_cookie(&self, other: &CookieRecord) -> bool {
        self.name == other.name
            && self.domain.eq_ignore_ascii_case(&other.domain)
            && self.path == other.path
    }

    /// `Set-Cookie` form used to seed a cookie jar.
    pub fn to_set_cookie(&self) -> String {
        let mut header = format!("{}={}", self.name, self.value);
        if !self.domain.is_empty() {
            header.push_str("; Domain=");
            header.push_str(&self.domain);
        }
        header.push_str("; Path=");
        header.push_str(if self.path.is_empty() { "/" } else { &self.path });
        header
    }
}

/// `Expires` as written by the login helper: RFC 3339, or a naive timestamp
/// taken as UTC. Year 1 (the helper's "no expiry" marker) reads as `None`.
mod expiry {
    use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const NEVER: &str = "0001-01-01T00:00:00";

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(at) => s.serialize_str(&at.to_rfc3339()),
            None => s.serialize_str(NEVER),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        let parsed = DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.and_utc())
            })
            .map_err(serde::de::Error::custom)?;

        Ok((parsed.year() > 1).then_some(parsed))
    }
}

/// Cookies of one Amazon session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSession {
    cookies: Vec<CookieRecord>,
}

impl AuthSession {
    /// Create a session from cookies.
    pub fn new(cookies: Vec<CookieRecord>) -> Self {
        let mut session = Self::default();
        session.import_cookies(cookies);
        session
    }

    /// Stored cookies.
    pub fn cookies(&self) -> &[CookieRecord] {
        &self.cookies
    }

    /// Whether a session-identifying cookie is present.
    pub fn is_configured(&self) -> bool {
        self.cookies
            .iter()
            .any(|c| SESSION_COOKIES.contains(&c.name.as_str()))
    }

    /// Merge cookies, replacing those with the same name, domain and path.
    /// Nameless cookies are ignored.
    pub fn import_cookies(&mut self, cookies: impl IntoIterator<Item = CookieRecord>) {
        for cookie in cookies {
            if cookie.name.trim().is_empty() {
                continue;
            }
            match self.cookies.iter_mut().find(|c| c.same_cookie(&cookie)) {
                Some(existing) => *existing = cookie,
                None => self.cookies.push(cookie),
            }
        }
    }

    /// Drop cookies that expired before `now`.
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.cookies.len();
        self.cookies.retain(|c| !c.is_expired_at(now));
        before - self.cookies.len()
    }
}

/// Persists an [`AuthSession`] as a JSON array of cookie records.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the session. A missing file is an empty session; expired and
    /// malformed records are skipped.
    pub fn load(&self) -> Result<AuthSession> {
        if !self.path.exists() {
            return Ok(AuthSession::default());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let records: Vec<serde_json::Value> = serde_json::from_str(&content)?;

        let mut cookies = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        for record in records {
            match serde_json::from_value::<CookieRecord>(record) {
                Ok(cookie) => cookies.push(cookie),
                Err(e) => {
                    skipped += 1;
                    tracing::debug!(error = %e, "Skipping malformed cookie record");
                }
            }
        }

        let mut session = AuthSession::new(cookies);
        let expired = session.remove_expired(Utc::now());

        tracing::debug!(
            path = %self.path.display(),
            cookies = session.cookies().len(),
            expired,
            skipped,
            "Loaded session cookies"
        );

        Ok(session)
    }

    /// Write the session, replacing the file atomically.
    pub fn save(&self, session: &AuthSession) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let json = serde_json::to_string_pretty(session.cookies())?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut tmp, json.as_bytes())?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        tracing::info!(
            path = %self.path.display(),
            cookies = session.cookies().len(),
            "Saved session cookies"
        );
        Ok(())
    }

    /// Merge imported cookies into the stored session and save it.
    pub fn import(&self, cookies: Vec<CookieRecord>) -> Result<AuthSession> {
        let mut session = self.load()?;
        session.import_cookies(cookies);
        session.remove_expired(Utc::now());
        self.save(&session)?;
        Ok(session)
    }

    /// Delete the stored session.
    ///
    /// Clients already built from the session keep their cookies.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "Cleared session cookies");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Parse a cookie export, skipping malformed records.
pub fn parse_cookie_export(content: &str) -> Result<Vec<CookieRecord>> {
    let records: Vec<serde_json::Value> = serde_json::from_str(content)?;
    Ok(records
        .into_iter()
        .filter_map(|r| serde_json::from_value(r).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("booky").join("cookies.json"));
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_empty_session() {
        let (_dir, store) = store();
        let session = store.load().unwrap();
        assert!(session.cookies().is_empty());
        assert!(!session.is_configured());
    }

    #[test]
    fn test_save_load_roundtrip_keeps_expiry() {
        let (_dir, store) = store();
        let expires = Utc::now() + Duration::days(30);
        let expires = Utc.timestamp_opt(expires.timestamp(), 0).unwrap();
        let session = AuthSession::new(vec![
            CookieRecord::new("session-id", "123", ".amazon.com", "/").expiring(expires),
            CookieRecord::new("at-main", "secret", ".amazon.com", "/"),
        ]);

        store.save(&session).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded, session);
        assert!(loaded.is_configured());
    }

    #[test]
    fn test_expired_and_malformed_records_skipped() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"[
  {"Name":"session-id","Value":"old","Domain":".amazon.com","Path":"/","Expires":"2001-01-01T00:00:00"},
  {"Name":"ubid-main","Value":"keep","Domain":".amazon.com","Path":"/","Expires":"0001-01-01T00:00:00"},
  {"Value":"no name"},
  {"Name":"x-main","Value":"v","Domain":".amazon.com","Path":"/","Expires":"not a date"},
  {"Name":"lc-main","Value":"en","Domain":".amazon.com","Path":"/","Expires":"2999-01-01T00:00:00+01:00"}
]"#,
        )
        .unwrap();

        let session = store.load().unwrap();
        let names: Vec<_> = session.cookies().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ubid-main", "lc-main"]);
        assert!(session.cookies()[0].expires.is_none());
        assert!(session.is_configured());
    }

    #[test]
    fn test_clear_removes_session() {
        let (_dir, store) = store();
        store
            .save(&AuthSession::new(vec![CookieRecord::new(
                "session-id",
                "1",
                ".amazon.com",
                "/",
            )]))
            .unwrap();
        assert!(store.load().unwrap().is_configured());

        store.clear().unwrap();
        assert!(!store.path().exists());
        assert!(!store.load().unwrap().is_configured());
        store.clear().unwrap();
    }

    #[test]
    fn test_import_merges_by_name_domain_path() {
        let (_dir, store) = store();
        store
            .save(&AuthSession::new(vec![
                CookieRecord::new("session-id", "old", ".amazon.com", "/"),
                CookieRecord::new("lc-main", "en", ".amazon.com", "/"),
            ]))
            .unwrap();

        let session = store
            .import(vec![
                CookieRecord::new("session-id", "new", ".amazon.com", "/"),
                CookieRecord::new("", "ignored", ".amazon.com", "/"),
            ])
            .unwrap();

        assert_eq!(session.cookies().len(), 2);
        assert_eq!(session.cookies()[0].value, "new");
        assert_eq!(store.load().unwrap(), session);
    }

    #[test]
    fn test_not_configured_without_session_cookie() {
        let session = AuthSession::new(vec![CookieRecord::new("lc-main", "en", ".amazon.com", "/")]);
        assert!(!session.is_configured());
    }

    #[test]
    fn test_set_cookie_form() {
        let cookie = CookieRecord::new("session-id", "1", ".amazon.com", "/");
        assert_eq!(cookie.to_set_cookie(), "session-id=1; Domain=.amazon.com; Path=/");
        assert_eq!(CookieRecord::new("a", "b", "", "").to_set_cookie(), "a=b; Path=/");
    }

    #[test]
    fn test_parse_cookie_export() {
        let cookies =
            parse_cookie_export(r#"[{"Name":"session-id","Value":"1"},{"Name":3}]"#).unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].path, "/");
        assert!(parse_cookie_export("{}").is_err());
    }
}
