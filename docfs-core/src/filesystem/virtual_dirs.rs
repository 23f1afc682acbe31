use crate::document::SyncDocument;
use crate::error::Result;
use crate::identity::{Identity, UserDirectory};
use crate::sharing::{FriendshipStatus, Friends};
use crate::views::SyncViews;
use std::sync::Arc;

/// Read-only directory listings computed from the views.
///
/// Listing methods return synthesized directories (`0555`) placed under `base`; the
/// matching methods return the stored documents found one level down.
pub struct VirtualDirs {
    views: SyncViews,
    friends: Friends,
    directory: Arc<dyn UserDirectory>,
}

impl VirtualDirs {
    pub fn new(views: SyncViews, friends: Friends, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            views,
            friends,
            directory,
        }
    }

    fn dirs(base: &str, ctx: &Identity, names: impl IntoIterator<Item = String>) -> Vec<SyncDocument> {
        names
            .into_iter()
            .map(|name| SyncDocument::virtual_dir(base, &name, ctx.uid, ctx.gid))
            .collect()
    }

    /// One directory per mime category in use, such as `image` or `text`.
    pub fn categories(&self, base: &str, ctx: &Identity) -> Result<Vec<SyncDocument>> {
        let groups = self.views.type_groups(None)?;
        Ok(Self::dirs(base, ctx, groups.into_iter().map(|(name, _)| name)))
    }

    pub fn subtypes(&self, base: &str, ctx: &Identity, category: &str) -> Result<Vec<SyncDocument>> {
        let groups = self.views.type_groups(Some(category))?;
        Ok(Self::dirs(base, ctx, groups.into_iter().map(|(name, _)| name)))
    }

    pub fn of_type(&self, category: &str, subtype: &str) -> Result<Vec<SyncDocument>> {
        self.views.of_type(category, subtype)
    }

    /// One directory per tag on the caller's entries.
    pub fn tags(&self, base: &str, ctx: &Identity) -> Result<Vec<SyncDocument>> {
        let tags = self.views.tags(Some(ctx.uid))?;
        Ok(Self::dirs(base, ctx, tags.into_iter().map(|(name, _)| name)))
    }

    pub fn tagged(&self, tag: &str) -> Result<Vec<SyncDocument>> {
        self.views.tagged(tag)
    }

    /// One directory per accepted friend.
    pub fn friends(&self, base: &str, ctx: &Identity) -> Result<Vec<SyncDocument>> {
        let friends = self.friends.list(FriendshipStatus::Friend)?;
        Ok(Self::dirs(base, ctx, friends.into_iter().map(|doc| doc.login)))
    }

    /// One directory per user the caller shares entries with.
    pub fn participants(&self, base: &str, ctx: &Identity) -> Result<Vec<SyncDocument>> {
        let participants = self.views.participants(ctx.uid)?;
        Ok(Self::dirs(
            base,
            ctx,
            participants.into_iter().map(|(uid, _)| {
                self.directory
                    .login_for(uid)
                    .unwrap_or_else(|| uid.to_string())
            }),
        ))
    }

    /// The caller's entries carrying a grant for `login`. Unknown logins have none.
    pub fn shared_with(&self, ctx: &Identity, login: &str) -> Result<Vec<SyncDocument>> {
        let uid = match self.directory.uid_for(login).or_else(|| login.parse().ok()) {
            Some(uid) => uid,
            None => return Ok(Vec::new()),
        };
        self.views.shared_with(ctx.uid, uid)
    }
}
