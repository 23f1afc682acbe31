//! Relationships between users and the grants they gate.
//!
//! Every relationship with another user is a single [`FriendDocument`] in the owner's
//! store. A named-user grant on a file is only applied once the grantee is an accepted
//! friend or follower; until then it is parked in the relationship's `pending_shares`.

use crate::acl::share_flags;
use crate::error::{Error, FriendshipError, Result};
use crate::events::{Event, EventBus};
use crate::identity::Identity;
use crate::storage::{DocHelper, Doctype, DocumentStore};
use crate::views::{FriendViews, ViewRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FriendshipStatus {
    Friend,
    PendingFriend,
    Follower,
    Following,
    PendingFollower,
    PendingFollowing,
    BlockedUser,
}

impl FriendshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendshipStatus::Friend => "FRIEND",
            FriendshipStatus::PendingFriend => "PENDING_FRIEND",
            FriendshipStatus::Follower => "FOLLOWER",
            FriendshipStatus::Following => "FOLLOWING",
            FriendshipStatus::PendingFollower => "PENDING_FOLLOWER",
            FriendshipStatus::PendingFollowing => "PENDING_FOLLOWING",
            FriendshipStatus::BlockedUser => "BLOCKED_USER",
        }
    }

    /// Relationships that let grants through immediately.
    pub fn is_established(&self) -> bool {
        matches!(self, FriendshipStatus::Friend | FriendshipStatus::Follower)
    }
}

impl fmt::Display for FriendshipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FriendDocument {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_rev", default)]
    pub rev: u64,
    pub login: String,
    pub status: FriendshipStatus,
    /// Document id of a shared file to the permission letters waiting for acceptance.
    #[serde(default)]
    pub pending_shares: BTreeMap<String, String>,
}

impl Doctype for FriendDocument {
    const DOCTYPE: &'static str = "FriendDocument";

    fn id(&self) -> &str {
        &self.id
    }

    fn rev(&self) -> u64 {
        self.rev
    }

    fn set_rev(&mut self, rev: u64) {
        self.rev = rev;
    }
}

impl FriendDocument {
    pub fn new(login: impl Into<String>, status: FriendshipStatus) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            rev: 0,
            login: login.into(),
            status,
            pending_shares: BTreeMap::new(),
        }
    }
}

/// What to do with a named-user grant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrantDecision {
    /// Write the entry into the file's ACL now.
    Apply,
    /// The grant was recorded as a pending share on this relationship.
    Deferred(String),
}

/// Relationship state machine for one user's store.
#[derive(Clone)]
pub struct Friends {
    helper: DocHelper<FriendDocument>,
    views: FriendViews,
    events: EventBus,
    public_login: String,
}

impl Friends {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: &ViewRegistry,
        events: EventBus,
        public_login: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            helper: DocHelper::new(store.clone()),
            views: FriendViews::new(store, registry)?,
            events,
            public_login: public_login.into(),
        })
    }

    pub fn public_login(&self) -> &str {
        &self.public_login
    }

    pub fn relation(&self, login: &str) -> Result<Option<FriendDocument>> {
        self.views.by_login.first(vec![login.into()])
    }

    pub fn status(&self, login: &str) -> Result<Option<FriendshipStatus>> {
        Ok(self.relation(login)?.map(|doc| doc.status))
    }

    pub fn list(&self, status: FriendshipStatus) -> Result<Vec<FriendDocument>> {
        self.views.by_status.get(vec![status.as_str().into()])
    }

    /// Logins of every relationship that is not a block.
    pub fn logins(&self) -> Result<Vec<String>> {
        let mut logins: Vec<String> = self
            .views
            .by_login
            .all()?
            .into_iter()
            .filter(|doc| doc.status != FriendshipStatus::BlockedUser)
            .map(|doc| doc.login)
            .collect();
        logins.dedup();
        Ok(logins)
    }

    fn start(&self, login: &str, status: FriendshipStatus) -> Result<FriendDocument> {
        if let Some(existing) = self.relation(login)? {
            return Err(match existing.status {
                FriendshipStatus::BlockedUser => FriendshipError::BlockedUser(login.to_string()),
                FriendshipStatus::PendingFriend
                | FriendshipStatus::PendingFollower
                | FriendshipStatus::PendingFollowing => FriendshipError::AlreadyPending(login.to_string()),
                other => FriendshipError::AlreadyRelated {
                    login: login.to_string(),
                    status: other.to_string(),
                },
            }
            .into());
        }
        self.helper.create(&FriendDocument::new(login, status))
    }

    fn advance(&self, login: &str, from: FriendshipStatus, to: FriendshipStatus) -> Result<FriendDocument> {
        match self.relation(login)? {
            Some(mut doc) if doc.status == from => {
                doc.status = to;
                self.helper.update(&doc)
            }
            _ => Err(FriendshipError::NotPending(login.to_string()).into()),
        }
    }

    fn drop_relation(&self, login: &str, expected: &[FriendshipStatus]) -> Result<()> {
        match self.relation(login)? {
            Some(doc) if expected.contains(&doc.status) => self.helper.delete(&doc),
            Some(_) | None => Err(FriendshipError::NotRelated(login.to_string()).into()),
        }
    }

    pub fn request_friend(&self, ctx: &Identity, login: &str) -> Result<FriendDocument> {
        let doc = self.start(login, FriendshipStatus::PendingFriend)?;
        info!(owner = %ctx.login, friend = login, "friend request sent");
        self.events.send(Event::FriendRequested {
            login: login.to_string(),
        });
        Ok(doc)
    }

    /// Accept a pending friend request. Returns the relationship and the shares that were
    /// waiting on it, which the caller applies.
    pub fn accept_friend(&self, ctx: &Identity, login: &str) -> Result<(FriendDocument, BTreeMap<String, String>)> {
        let mut doc = match self.relation(login)? {
            Some(doc) if doc.status == FriendshipStatus::PendingFriend => doc,
            _ => return Err(FriendshipError::NotPending(login.to_string()).into()),
        };
        let pending = std::mem::take(&mut doc.pending_shares);
        doc.status = FriendshipStatus::Friend;
        let doc = self.helper.update(&doc)?;
        info!(owner = %ctx.login, friend = login, shares = pending.len(), "friend request accepted");
        self.events.send(Event::FriendAccepted {
            login: login.to_string(),
        });
        Ok((doc, pending))
    }

    /// Refuse or cancel a pending friend request, dropping its pending shares.
    pub fn refuse_friend(&self, ctx: &Identity, login: &str) -> Result<()> {
        match self.relation(login)? {
            Some(doc) if doc.status == FriendshipStatus::PendingFriend => {
                info!(owner = %ctx.login, friend = login, "friend request refused");
                self.helper.delete(&doc)
            }
            _ => Err(FriendshipError::NotPending(login.to_string()).into()),
        }
    }

    pub fn remove_friend(&self, ctx: &Identity, login: &str) -> Result<()> {
        info!(owner = %ctx.login, friend = login, "removing friend");
        self.drop_relation(login, &[FriendshipStatus::Friend])
    }

    /// Record an incoming follow request.
    pub fn add_pending_follower(&self, ctx: &Identity, login: &str) -> Result<FriendDocument> {
        info!(owner = %ctx.login, follower = login, "follow request received");
        self.start(login, FriendshipStatus::PendingFollower)
    }

    pub fn accept_follower(&self, ctx: &Identity, login: &str) -> Result<FriendDocument> {
        info!(owner = %ctx.login, follower = login, "follower accepted");
        self.advance(login, FriendshipStatus::PendingFollower, FriendshipStatus::Follower)
    }

    pub fn request_follow(&self, ctx: &Identity, login: &str) -> Result<FriendDocument> {
        info!(owner = %ctx.login, following = login, "follow request sent");
        self.start(login, FriendshipStatus::PendingFollowing)
    }

    pub fn accept_following(&self, ctx: &Identity, login: &str) -> Result<FriendDocument> {
        info!(owner = %ctx.login, following = login, "now following");
        self.advance(login, FriendshipStatus::PendingFollowing, FriendshipStatus::Following)
    }

    pub fn remove_follow(&self, ctx: &Identity, login: &str) -> Result<()> {
        info!(owner = %ctx.login, other = login, "removing follow relationship");
        self.drop_relation(
            login,
            &[
                FriendshipStatus::Follower,
                FriendshipStatus::Following,
                FriendshipStatus::PendingFollower,
                FriendshipStatus::PendingFollowing,
            ],
        )
    }

    /// Block `login`. Blocking overrides any relationship except an active follower.
    pub fn block(&self, ctx: &Identity, login: &str) -> Result<FriendDocument> {
        let doc = match self.relation(login)? {
            Some(doc) if doc.status == FriendshipStatus::BlockedUser => return Ok(doc),
            Some(doc) if doc.status == FriendshipStatus::Follower => {
                return Err(FriendshipError::CannotBlockFollower(login.to_string()).into())
            }
            Some(mut doc) => {
                doc.status = FriendshipStatus::BlockedUser;
                doc.pending_shares.clear();
                self.helper.update(&doc)?
            }
            None => self
                .helper
                .create(&FriendDocument::new(login, FriendshipStatus::BlockedUser))?,
        };
        info!(owner = %ctx.login, blocked = login, "user blocked");
        self.events.send(Event::Blocked {
            login: login.to_string(),
        });
        Ok(doc)
    }

    pub fn unblock(&self, ctx: &Identity, login: &str) -> Result<()> {
        match self.relation(login)? {
            Some(doc) if doc.status == FriendshipStatus::BlockedUser => {
                info!(owner = %ctx.login, unblocked = login, "user unblocked");
                self.helper.delete(&doc)
            }
            _ => Err(FriendshipError::NotBlocked(login.to_string()).into()),
        }
    }

    /// Fail if a grant to `login` would be rejected. Nothing is written.
    pub fn check_grant(&self, login: &str) -> Result<()> {
        match self.status(login)? {
            Some(FriendshipStatus::BlockedUser) => Err(FriendshipError::BlockedUser(login.to_string()).into()),
            _ => Ok(()),
        }
    }

    /// Decide whether a grant of `perms` on document `doc_id` applies now or waits.
    ///
    /// Waiting grants are stored on the relationship, creating a friend request when
    /// there is none yet.
    pub fn resolve_grant(&self, ctx: &Identity, login: &str, doc_id: &str, perms: u16) -> Result<GrantDecision> {
        if login == self.public_login || login == ctx.login {
            return Ok(GrantDecision::Apply);
        }
        let flags = share_flags(perms);
        let mut doc = match self.relation(login)? {
            Some(doc) if doc.status.is_established() => return Ok(GrantDecision::Apply),
            Some(doc) if doc.status == FriendshipStatus::BlockedUser => {
                return Err(Error::Friendship(FriendshipError::BlockedUser(login.to_string())))
            }
            Some(doc) => doc,
            None => self.request_friend(ctx, login)?,
        };
        doc.pending_shares.insert(doc_id.to_string(), flags.clone());
        let doc = self.helper.update(&doc)?;
        info!(owner = %ctx.login, grantee = login, doc = doc_id, perms = %flags, "share deferred");
        self.events.send(Event::ShareDeferred {
            id: doc_id.to_string(),
            principal: login.to_string(),
            perms: flags,
        });
        Ok(GrantDecision::Deferred(doc.id))
    }
}
