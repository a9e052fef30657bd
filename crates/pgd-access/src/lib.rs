//! Access control gate: who may sign in, and which dashboard sections they see.
//!
//! Identities come from an injectable [`IdentityStore`]. Passwords are stored as
//! salted PBKDF2-HMAC-SHA256 digests, never in the clear.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pgd-access";

pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 200_000;
const KEY_LEN: usize = 32;

/// Dashboard area an identity may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Hr,
    Production,
    Sales,
    Warehouse,
    AfterSales,
    Management,
}

impl Section {
    pub const ALL: [Section; 6] = [
        Section::Hr,
        Section::Production,
        Section::Sales,
        Section::Warehouse,
        Section::AfterSales,
        Section::Management,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Section::Hr => "hr",
            Section::Production => "production",
            Section::Sales => "sales",
            Section::Warehouse => "warehouse",
            Section::AfterSales => "after_sales",
            Section::Management => "management",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Section::ALL
            .into_iter()
            .find(|section| section.as_str() == wanted)
            .ok_or_else(|| AccessError::UnknownSection(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("reading identity file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing identity file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("user `{0}` is defined more than once")]
    DuplicateUser(String),
    #[error("invalid password record for `{username}`: {reason}")]
    InvalidRecord { username: String, reason: String },
    #[error("unknown section `{0}`")]
    UnknownSection(String),
}

/// Who a signed-in user is. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    pub role: String,
    pub display_name: String,
    pub access: BTreeSet<Section>,
}

/// Salted PBKDF2 digest, hex encoded as it appears in the identity file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRecord {
    pub salt: String,
    pub hash: String,
    pub iterations: u32,
}

impl PasswordRecord {
    fn decoded(&self) -> Result<(Vec<u8>, Vec<u8>), String> {
        let salt = hex::decode(&self.salt).map_err(|e| format!("salt: {e}"))?;
        let hash = hex::decode(&self.hash).map_err(|e| format!("hash: {e}"))?;
        if salt.is_empty() {
            return Err("salt is empty".to_string());
        }
        if hash.len() != KEY_LEN {
            return Err(format!("hash must be {KEY_LEN} bytes, got {}", hash.len()));
        }
        if self.iterations == 0 {
            return Err("iterations must be positive".to_string());
        }
        Ok((salt, hash))
    }
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Fresh salted record for `password`, suitable for pasting into the identity file.
pub fn hash_password(password: &str, iterations: u32) -> PasswordRecord {
    let iterations = iterations.max(1);
    let salt = *Uuid::new_v4().as_bytes();
    PasswordRecord {
        salt: hex::encode(salt),
        hash: hex::encode(derive_key(password, &salt, iterations)),
        iterations,
    }
}

/// Flat membership test; no hierarchy between sections.
pub fn has_access(identity: &UserIdentity, section: Section) -> bool {
    identity.access.contains(&section)
}

pub trait IdentityStore: Send + Sync {
    /// The identity for `username` when `password` matches, otherwise `None`.
    fn authenticate(&self, username: &str, password: &str) -> Option<UserIdentity>;
}

#[derive(Debug, Clone, Deserialize)]
struct UserEntry {
    username: String,
    role: String,
    display_name: String,
    #[serde(default)]
    access: BTreeSet<Section>,
    password: PasswordRecord,
}

#[derive(Debug, Deserialize)]
struct UsersFile {
    users: Vec<UserEntry>,
}

struct StoredUser {
    identity: UserIdentity,
    salt: Vec<u8>,
    hash: Vec<u8>,
    iterations: u32,
}

/// Identity table held in memory, usually loaded from `users.yaml`.
pub struct InMemoryIdentityStore {
    users: HashMap<String, StoredUser>,
    dummy_salt: [u8; 16],
    dummy_iterations: u32,
}

impl fmt::Debug for InMemoryIdentityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.users.keys().collect();
        names.sort();
        f.debug_struct("InMemoryIdentityStore").field("users", &names).finish()
    }
}

impl InMemoryIdentityStore {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AccessError> {
        let file: UsersFile = serde_yaml::from_str(yaml)?;
        let mut users = HashMap::with_capacity(file.users.len());
        let mut max_iterations = 1;
        for entry in file.users {
            let username = entry.username.trim().to_string();
            let (salt, hash) = entry
                .password
                .decoded()
                .map_err(|reason| AccessError::InvalidRecord {
                    username: username.clone(),
                    reason,
                })?;
            max_iterations = max_iterations.max(entry.password.iterations);
            let stored = StoredUser {
                identity: UserIdentity {
                    username: username.clone(),
                    role: entry.role,
                    display_name: entry.display_name,
                    access: entry.access,
                },
                salt,
                hash,
                iterations: entry.password.iterations,
            };
            if users.insert(username.clone(), stored).is_some() {
                return Err(AccessError::DuplicateUser(username));
            }
        }
        Ok(Self {
            users,
            dummy_salt: *Uuid::new_v4().as_bytes(),
            dummy_iterations: max_iterations,
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, AccessError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| AccessError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let store = Self::from_yaml_str(&text)?;
        info!(path = %path.display(), users = store.len(), "identity store loaded");
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn authenticate(&self, username: &str, password: &str) -> Option<UserIdentity> {
        let Some(user) = self.users.get(username.trim()) else {
            // Same cost as a real check so response time does not reveal valid usernames.
            let _ = derive_key(password, &self.dummy_salt, self.dummy_iterations);
            debug!("sign-in rejected");
            return None;
        };
        let derived = derive_key(password, &user.salt, user.iterations);
        if constant_time_eq(&derived, &user.hash) {
            debug!(username = %user.identity.username, "sign-in accepted");
            Some(user.identity.clone())
        } else {
            debug!(username = %user.identity.username, "sign-in rejected");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ITER: u32 = 64;

    fn users_yaml() -> String {
        let hr = hash_password("hr123", ITER);
        let viewer = hash_password("viewer", ITER);
        format!(
            r#"
users:
  - username: hr_manager
    role: hr_manager
    display_name: مدیر منابع انسانی
    access: [hr, management]
    password: {{ salt: "{}", hash: "{}", iterations: {} }}
  - username: viewer
    role: viewer
    display_name: کاربر مشاهده‌گر
    access: [sales, warehouse]
    password: {{ salt: "{}", hash: "{}", iterations: {} }}
"#,
            hr.salt, hr.hash, hr.iterations, viewer.salt, viewer.hash, viewer.iterations
        )
    }

    #[test]
    fn correct_password_returns_identity() {
        let store = InMemoryIdentityStore::from_yaml_str(&users_yaml()).unwrap();
        let identity = store.authenticate("hr_manager", "hr123").unwrap();
        assert_eq!(identity.role, "hr_manager");
        assert_eq!(identity.display_name, "مدیر منابع انسانی");
        assert!(has_access(&identity, Section::Hr));
        assert!(has_access(&identity, Section::Management));
        assert!(!has_access(&identity, Section::Sales));
    }

    #[test]
    fn wrong_password_or_unknown_user_is_rejected() {
        let store = InMemoryIdentityStore::from_yaml_str(&users_yaml()).unwrap();
        assert!(store.authenticate("hr_manager", "HR123").is_none());
        assert!(store.authenticate("hr_manager", "").is_none());
        assert!(store.authenticate("ghost", "hr123").is_none());
    }

    #[test]
    fn access_is_flat_membership() {
        let store = InMemoryIdentityStore::from_yaml_str(&users_yaml()).unwrap();
        let viewer = store.authenticate("viewer", "viewer").unwrap();
        for section in Section::ALL {
            let expected = matches!(section, Section::Sales | Section::Warehouse);
            assert_eq!(has_access(&viewer, section), expected, "{section}");
        }
    }

    #[test]
    fn hashing_uses_a_fresh_salt_each_time() {
        let a = hash_password("same", ITER);
        let b = hash_password("same", ITER);
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
        assert_eq!(a.hash.len(), KEY_LEN * 2);
        assert!(a.decoded().is_ok());
    }

    #[test]
    fn malformed_records_are_reported_per_user() {
        let yaml = r#"
users:
  - username: broken
    role: viewer
    display_name: x
    password: { salt: "zz", hash: "00", iterations: 10 }
"#;
        let err = InMemoryIdentityStore::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, AccessError::InvalidRecord { ref username, .. } if username == "broken"));
    }

    #[test]
    fn duplicate_usernames_are_rejected() {
        let record = hash_password("pw", ITER);
        let entry = format!(
            "  - {{ username: a, role: r, display_name: d, password: {{ salt: \"{}\", hash: \"{}\", iterations: {} }} }}\n",
            record.salt, record.hash, record.iterations
        );
        let yaml = format!("users:\n{entry}{entry}");
        let err = InMemoryIdentityStore::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, AccessError::DuplicateUser(ref name) if name == "a"));
    }

    #[test]
    fn unknown_section_tags_fail_to_load() {
        let record = hash_password("pw", ITER);
        let yaml = format!(
            "users:\n  - {{ username: a, role: r, display_name: d, access: [payroll], password: {{ salt: \"{}\", hash: \"{}\", iterations: {} }} }}\n",
            record.salt, record.hash, record.iterations
        );
        assert!(matches!(
            InMemoryIdentityStore::from_yaml_str(&yaml),
            Err(AccessError::Yaml(_))
        ));
        assert_eq!("After_Sales".parse::<Section>().unwrap(), Section::AfterSales);
        assert!("payroll".parse::<Section>().is_err());
    }

    #[test]
    fn bundled_example_users_file_is_valid() {
        let store =
            InMemoryIdentityStore::from_yaml_str(include_str!("../../../users.example.yaml")).unwrap();
        assert_eq!(store.len(), 5);
        let hr = store.authenticate("hr_manager", "change-me-hr").unwrap();
        assert!(has_access(&hr, Section::Hr));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(users_yaml().as_bytes()).unwrap();
        let store = InMemoryIdentityStore::from_yaml_file(file.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.authenticate(" viewer ", "viewer").is_some());

        let missing = InMemoryIdentityStore::from_yaml_file(file.path().with_extension("absent"));
        assert!(matches!(missing, Err(AccessError::Io { .. })));
    }
}
