use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The user on whose behalf an operation runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub login: String,
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub fn new(login: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            login: login.into(),
            uid,
            gid,
        }
    }
}

/// Maps numeric user ids to logins and back.
pub trait UserDirectory: Send + Sync {
    fn login_for(&self, uid: u32) -> Option<String>;
    fn uid_for(&self, login: &str) -> Option<u32>;
}

/// In-memory directory, filled by the caller.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    by_uid: HashMap<u32, String>,
    by_login: HashMap<String, u32>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, login: impl Into<String>, uid: u32) {
        let login = login.into();
        self.by_uid.insert(uid, login.clone());
        self.by_login.insert(login, uid);
    }

    pub fn with(mut self, login: impl Into<String>, uid: u32) -> Self {
        self.insert(login, uid);
        self
    }
}

impl UserDirectory for StaticDirectory {
    fn login_for(&self, uid: u32) -> Option<String> {
        self.by_uid.get(&uid).cloned()
    }

    fn uid_for(&self, login: &str) -> Option<u32> {
        self.by_login.get(login).copied()
    }
}
