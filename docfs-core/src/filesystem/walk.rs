use super::Overlay;
use crate::document::SyncDocument;
use crate::error::Result;
use crate::path;
use std::collections::HashSet;

/// One directory visited by [`Walk`].
#[derive(Clone, Debug, PartialEq)]
pub struct WalkEntry {
    pub dirpath: String,
    pub dirs: Vec<SyncDocument>,
    pub files: Vec<SyncDocument>,
}

enum Frame {
    Enter(String),
    Leave(WalkEntry),
}

/// Lazy depth-first walk over documents, directories before or after their contents.
///
/// Symlinks are reported as files unless links are followed, in which case a link to a
/// directory is listed with the directories and its target is descended into once.
pub struct Walk<'a> {
    overlay: &'a Overlay,
    stack: Vec<Frame>,
    topdown: bool,
    followlinks: bool,
    visited: HashSet<String>,
}

impl<'a> Walk<'a> {
    pub(super) fn new(overlay: &'a Overlay, top: &str, topdown: bool, followlinks: bool) -> Self {
        Self {
            overlay,
            stack: vec![Frame::Enter(top.to_string())],
            topdown,
            followlinks,
            visited: HashSet::new(),
        }
    }

    /// Overlay path of the directory a symlink points at, if it points at one.
    fn link_target(&self, link: &SyncDocument) -> Result<Option<String>> {
        let target = self.overlay.readlink(&link.path())?;
        let resolved = path::normalize(&path::join(&link.dirpath, &target));
        Ok(self
            .overlay
            .get(&resolved)?
            .filter(SyncDocument::is_dir)
            .map(|_| resolved))
    }

    fn list(&mut self, dirpath: &str) -> Result<(WalkEntry, Vec<String>)> {
        let mut entry = WalkEntry {
            dirpath: dirpath.to_string(),
            dirs: Vec::new(),
            files: Vec::new(),
        };
        let mut descend = Vec::new();
        for child in self.overlay.listdir(dirpath)? {
            if child.is_dir() {
                descend.push(child.path());
                entry.dirs.push(child);
            } else if child.is_symlink() && self.followlinks {
                match self.link_target(&child)? {
                    Some(target) => {
                        if self.visited.insert(target.clone()) {
                            descend.push(target);
                        }
                        entry.dirs.push(child);
                    }
                    None => entry.files.push(child),
                }
            } else {
                entry.files.push(child);
            }
        }
        Ok((entry, descend))
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<WalkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let dirpath = match self.stack.pop()? {
                Frame::Leave(entry) => return Some(Ok(entry)),
                Frame::Enter(dirpath) => dirpath,
            };
            self.visited.insert(dirpath.clone());
            let (entry, descend) = match self.list(&dirpath) {
                Ok(listed) => listed,
                Err(e) => return Some(Err(e)),
            };
            if self.topdown {
                self.stack.extend(descend.into_iter().rev().map(Frame::Enter));
                return Some(Ok(entry));
            }
            self.stack.push(Frame::Leave(entry));
            self.stack.extend(descend.into_iter().rev().map(Frame::Enter));
        }
    }
}
