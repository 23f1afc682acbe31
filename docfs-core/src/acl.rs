//! POSIX access control lists.
//!
//! An [`Acl`] converts between four representations:
//! - the in-memory ordered entry list,
//! - the `system.posix_acl_access` extended attribute layout (a little endian
//!   `u32` version header followed by 8-byte `(tag: u16, perm: u16, id: u32)` records),
//! - the JSON list of named-user grants kept in a document's `acl` field,
//! - the NFSv4 text dialect understood by `nfs4_setfacl`.

use crate::error::{AclError, Error, Result};
use crate::identity::UserDirectory;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const ACL_XATTR: &str = "system.posix_acl_access";
pub const ACL_DEFAULT_XATTR: &str = "system.posix_acl_default";
pub const ACL_EA_VERSION: u32 = 0x0002;
/// Qualifier carried by owner, owning-group, mask and other entries.
pub const UNQUALIFIED: u32 = u32::MAX;

pub const READ: u16 = 0x04;
pub const WRITE: u16 = 0x02;
pub const EXECUTE: u16 = 0x01;

const HEADER_LEN: usize = 4;
const ENTRY_LEN: usize = 8;

/// Entry tag. Variant order is the canonical sort order of an ACL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AceKind {
    UserObj,
    User,
    GroupObj,
    Group,
    Mask,
    Other,
}

impl AceKind {
    pub fn tag(self) -> u16 {
        match self {
            AceKind::UserObj => 0x01,
            AceKind::User => 0x02,
            AceKind::GroupObj => 0x04,
            AceKind::Group => 0x08,
            AceKind::Mask => 0x10,
            AceKind::Other => 0x20,
        }
    }

    pub fn from_tag(tag: u16) -> std::result::Result<Self, AclError> {
        Ok(match tag {
            0x01 => AceKind::UserObj,
            0x02 => AceKind::User,
            0x04 => AceKind::GroupObj,
            0x08 => AceKind::Group,
            0x10 => AceKind::Mask,
            0x20 => AceKind::Other,
            other => return Err(AclError::UnknownKind(other)),
        })
    }

    /// Named entries carry a real user or group qualifier.
    pub fn is_named(self) -> bool {
        matches!(self, AceKind::User | AceKind::Group)
    }

    fn label(self) -> &'static str {
        match self {
            AceKind::UserObj | AceKind::User => "user",
            AceKind::GroupObj | AceKind::Group => "group",
            AceKind::Mask => "mask",
            AceKind::Other => "other",
        }
    }
}

/// One access control entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ace {
    pub kind: AceKind,
    pub perms: u16,
    pub qualifier: u32,
}

impl Ace {
    pub fn new(kind: AceKind, perms: u16, qualifier: u32) -> Self {
        let qualifier = if kind.is_named() { qualifier } else { UNQUALIFIED };
        Self {
            kind,
            perms: perms & (READ | WRITE | EXECUTE),
            qualifier,
        }
    }

    pub fn user(uid: u32, perms: u16) -> Self {
        Self::new(AceKind::User, perms, uid)
    }

    /// `rwx` triplet with dashes for missing bits.
    pub fn perms_string(&self) -> String {
        perms_string(self.perms)
    }

    /// Textual form `kind:qualifier:perms`, for example `user:bob:rw-` or `other::r--`.
    pub fn to_text(&self, directory: &dyn UserDirectory) -> Result<String> {
        let qualifier = match self.kind {
            AceKind::User => directory
                .login_for(self.qualifier)
                .ok_or_else(|| Error::UnknownUser(self.qualifier.to_string()))?,
            AceKind::Group => self.qualifier.to_string(),
            _ => String::new(),
        };
        Ok(format!("{}:{}:{}", self.kind.label(), qualifier, self.perms_string()))
    }

    /// Parse the textual form produced by [`Ace::to_text`].
    pub fn parse(text: &str, directory: &dyn UserDirectory) -> Result<Self> {
        let fields: Vec<&str> = text.trim().split(':').collect();
        let [kind, qualifier, perms] = fields.as_slice() else {
            return Err(AclError::MalformedAce(text.to_string()).into());
        };
        let perms = parse_perms(perms).ok_or_else(|| AclError::MalformedAce(text.to_string()))?;
        let kind = match (*kind, qualifier.is_empty()) {
            ("user" | "u", true) => AceKind::UserObj,
            ("user" | "u", false) => AceKind::User,
            ("group" | "g", true) => AceKind::GroupObj,
            ("group" | "g", false) => AceKind::Group,
            ("mask" | "m", _) => AceKind::Mask,
            ("other" | "o", _) => AceKind::Other,
            _ => return Err(AclError::MalformedAce(text.to_string()).into()),
        };
        let qualifier = match kind {
            AceKind::User => match qualifier.parse::<u32>() {
                Ok(uid) => uid,
                Err(_) => directory
                    .uid_for(qualifier)
                    .ok_or_else(|| Error::UnknownUser(qualifier.to_string()))?,
            },
            AceKind::Group => qualifier
                .parse::<u32>()
                .map_err(|_| AclError::MalformedAce(text.to_string()))?,
            _ => UNQUALIFIED,
        };
        Ok(Ace::new(kind, perms, qualifier))
    }
}

fn perms_string(perms: u16) -> String {
    let mut out = String::with_capacity(3);
    out.push(if perms & READ != 0 { 'r' } else { '-' });
    out.push(if perms & WRITE != 0 { 'w' } else { '-' });
    out.push(if perms & EXECUTE != 0 { 'x' } else { '-' });
    out
}

fn parse_perms(text: &str) -> Option<u16> {
    let mut perms = 0;
    for c in text.chars() {
        match c {
            'r' => perms |= READ,
            'w' => perms |= WRITE,
            'x' => perms |= EXECUTE,
            '-' => {}
            _ => return None,
        }
    }
    Some(perms)
}

/// Named privileges used in the JSON form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    Read,
    Write,
    Execute,
}

impl Privilege {
    pub fn bit(self) -> u16 {
        match self {
            Privilege::Read => READ,
            Privilege::Write => WRITE,
            Privilege::Execute => EXECUTE,
        }
    }
}

/// A named-user grant as persisted in a document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonAce {
    pub qualifier: u32,
    pub privileges: Vec<Privilege>,
}

impl JsonAce {
    fn perms(&self) -> u16 {
        self.privileges.iter().fold(0, |acc, p| acc | p.bit())
    }
}

/// A grant addressed by login, as written by clients through `setxattr`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGrant {
    pub user: String,
    pub privileges: Vec<Privilege>,
}

impl UserGrant {
    pub fn perms(&self) -> u16 {
        self.privileges.iter().fold(0, |acc, p| acc | p.bit())
    }
}

/// An ordered list of entries together with the file mode used to backfill it.
#[derive(Clone, Debug, Default)]
pub struct Acl {
    entries: Vec<Ace>,
    mode: Option<u32>,
}

impl PartialEq for Acl {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for Acl {}

impl Acl {
    pub fn new(mode: Option<u32>) -> Self {
        Self {
            entries: Vec::new(),
            mode,
        }
    }

    /// The three mandatory entries derived from the permission digits of `mode`.
    pub fn from_mode(mode: u32) -> Self {
        let mut acl = Self::new(Some(mode));
        acl.entries = vec![
            Ace::new(AceKind::UserObj, ((mode >> 6) & 0o7) as u16, UNQUALIFIED),
            Ace::new(AceKind::GroupObj, ((mode >> 3) & 0o7) as u16, UNQUALIFIED),
            Ace::new(AceKind::Other, (mode & 0o7) as u16, UNQUALIFIED),
        ];
        acl
    }

    pub fn from_binary(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN || (data.len() - HEADER_LEN) % ENTRY_LEN != 0 {
            return Err(AclError::TruncatedBinary(data.len()).into());
        }
        let version = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if version != ACL_EA_VERSION {
            return Err(AclError::UnsupportedVersion(version).into());
        }
        let mut acl = Self::new(None);
        for record in data[HEADER_LEN..].chunks_exact(ENTRY_LEN) {
            let tag = u16::from_le_bytes([record[0], record[1]]);
            let perms = u16::from_le_bytes([record[2], record[3]]);
            let qualifier = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);
            acl.push(Ace::new(AceKind::from_tag(tag)?, perms, qualifier));
        }
        acl.sort();
        Ok(acl)
    }

    /// Serialize to the extended attribute layout, completing and sorting a copy first.
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        let mut acl = self.clone();
        acl.check(true)?;
        let mut out = Vec::with_capacity(HEADER_LEN + ENTRY_LEN * acl.entries.len());
        out.extend_from_slice(&ACL_EA_VERSION.to_le_bytes());
        for ace in &acl.entries {
            out.extend_from_slice(&ace.kind.tag().to_le_bytes());
            out.extend_from_slice(&ace.perms.to_le_bytes());
            out.extend_from_slice(&ace.qualifier.to_le_bytes());
        }
        Ok(out)
    }

    /// Build from persisted named-user grants. Other entries come from `mode` on check.
    pub fn from_json(grants: &[JsonAce], mode: Option<u32>) -> Self {
        let mut acl = Self::new(mode);
        for grant in grants {
            acl.push(Ace::user(grant.qualifier, grant.perms()));
        }
        acl.sort();
        acl
    }

    /// Named-user entries only.
    pub fn to_json(&self) -> Vec<JsonAce> {
        self.entries
            .iter()
            .filter(|ace| ace.kind == AceKind::User)
            .map(|ace| {
                let privileges = [Privilege::Read, Privilege::Write, Privilege::Execute]
                    .into_iter()
                    .filter(|p| ace.perms & p.bit() != 0)
                    .collect();
                JsonAce {
                    qualifier: ace.qualifier,
                    privileges,
                }
            })
            .collect()
    }

    /// Parse newline or comma separated textual entries.
    pub fn parse_text(text: &str, mode: Option<u32>, directory: &dyn UserDirectory) -> Result<Self> {
        let mut acl = Self::new(mode);
        for line in text.split(|c: char| c == '\n' || c == ',') {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            acl.push(Ace::parse(line, directory)?);
        }
        acl.sort();
        Ok(acl)
    }

    pub fn to_text(&self, directory: &dyn UserDirectory) -> Result<String> {
        let lines = self
            .entries
            .iter()
            .map(|ace| ace.to_text(directory))
            .collect::<Result<Vec<_>>>()?;
        Ok(lines.join("\n"))
    }

    pub fn entries(&self) -> &[Ace] {
        &self.entries
    }

    pub fn mode(&self) -> Option<u32> {
        self.mode
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.mode = Some(mode);
    }

    pub fn get(&self, kind: AceKind, qualifier: u32) -> Option<&Ace> {
        self.entries
            .iter()
            .find(|ace| ace.kind == kind && (!kind.is_named() || ace.qualifier == qualifier))
    }

    /// Insert an entry, replacing any entry with the same kind and qualifier.
    pub fn push(&mut self, ace: Ace) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.kind == ace.kind && e.qualifier == ace.qualifier)
        {
            Some(existing) => existing.perms = ace.perms,
            None => self.entries.push(ace),
        }
    }

    pub fn remove(&mut self, kind: AceKind, qualifier: u32) -> Option<Ace> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.kind == kind && e.qualifier == qualifier)?;
        Some(self.entries.remove(pos))
    }

    pub fn named(&self) -> impl Iterator<Item = &Ace> {
        self.entries.iter().filter(|ace| ace.kind.is_named())
    }

    /// Extended ACLs carry named entries and therefore a mask.
    pub fn is_extended(&self) -> bool {
        self.entries.iter().any(|ace| ace.kind.is_named())
    }

    /// Permission bits granted to everybody else.
    pub fn other_perms(&self) -> Option<u16> {
        self.get(AceKind::Other, UNQUALIFIED).map(|ace| ace.perms)
    }

    pub fn sort(&mut self) {
        self.entries.sort_by_key(|ace| (ace.kind, ace.qualifier));
    }

    /// Recompute the mask as the union of the owning group and every named entry.
    ///
    /// A mask without named entries is dropped.
    pub fn calc_mask(&mut self) {
        if !self.is_extended() {
            self.entries.retain(|ace| ace.kind != AceKind::Mask);
            return;
        }
        let perms = self
            .entries
            .iter()
            .filter(|ace| matches!(ace.kind, AceKind::GroupObj | AceKind::User | AceKind::Group))
            .fold(0, |acc, ace| acc | ace.perms);
        match self.entries.iter_mut().find(|ace| ace.kind == AceKind::Mask) {
            Some(mask) => mask.perms = perms,
            None => self.entries.push(Ace::new(AceKind::Mask, perms, UNQUALIFIED)),
        }
    }

    fn missing(&self) -> Vec<AceKind> {
        let mut required = vec![AceKind::UserObj, AceKind::GroupObj, AceKind::Other];
        if self.is_extended() {
            required.push(AceKind::Mask);
        }
        required
            .into_iter()
            .filter(|kind| !self.entries.iter().any(|ace| ace.kind == *kind))
            .collect()
    }

    /// Validate the required entries.
    ///
    /// With `complete`, missing owner, group and other entries are synthesized from the
    /// mode, the mask is recomputed and the list sorted before validating again.
    pub fn check(&mut self, complete: bool) -> Result<()> {
        let missing = self.missing();
        if !complete {
            if missing.is_empty() {
                return Ok(());
            }
            let names: Vec<&str> = missing.iter().map(|k| k.label()).collect();
            return Err(AclError::MissingEntries(names.join(", ")).into());
        }
        let backfill: Vec<AceKind> = missing.into_iter().filter(|k| *k != AceKind::Mask).collect();
        if !backfill.is_empty() {
            let mode = self.mode.ok_or(AclError::NoModeToBackfill)?;
            let from_mode = Acl::from_mode(mode);
            for kind in backfill {
                if let Some(ace) = from_mode.get(kind, UNQUALIFIED) {
                    self.entries.push(*ace);
                }
            }
        }
        self.calc_mask();
        self.sort();
        self.check(false)
    }

    /// Render the NFSv4 text form, one `A:flags:who:perms` line per entry.
    ///
    /// The mask has no NFSv4 counterpart and is left out, as are entries without permissions.
    pub fn to_nfs4(&self, directory: &dyn UserDirectory, domain: &str) -> Result<String> {
        let mut out = String::new();
        for ace in &self.entries {
            if ace.kind == AceKind::Mask || ace.perms == 0 {
                continue;
            }
            let (flags, who) = match ace.kind {
                AceKind::UserObj => ("", "OWNER@".to_string()),
                AceKind::GroupObj => ("g", "GROUP@".to_string()),
                AceKind::Other => ("", "EVERYONE@".to_string()),
                AceKind::User => {
                    let login = directory
                        .login_for(ace.qualifier)
                        .ok_or_else(|| Error::UnknownUser(ace.qualifier.to_string()))?;
                    ("", format!("{}@{}", login, domain))
                }
                AceKind::Group => ("g", format!("{}@{}", ace.qualifier, domain)),
                AceKind::Mask => continue,
            };
            let mut perms = String::new();
            if ace.perms & READ != 0 {
                perms.push('r');
            }
            if ace.perms & WRITE != 0 {
                perms.push_str("wa");
            }
            if ace.perms & EXECUTE != 0 {
                perms.push('x');
            }
            out.push_str(&format!("A:{}:{}:{}\n", flags, who, perms));
        }
        Ok(out)
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|ace| {
                let qualifier = if ace.kind.is_named() {
                    ace.qualifier.to_string()
                } else {
                    String::new()
                };
                format!("{}:{}:{}", ace.kind.label(), qualifier, ace.perms_string())
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// Permission letters recorded against a deferred share, `R`, `RW` or `RWX`.
pub fn share_flags(perms: u16) -> String {
    perms_string(perms).replace('-', "").to_uppercase()
}

pub fn parse_share_flags(flags: &str) -> u16 {
    parse_perms(&flags.to_lowercase()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticDirectory;

    fn directory() -> StaticDirectory {
        let mut dir = StaticDirectory::new();
        dir.insert("bob", 1001);
        dir.insert("carol", 1002);
        dir
    }

    #[test]
    fn from_mode_is_complete_without_mask() {
        for mode in [0o644, 0o755, 0o700, 0o000, 0o777] {
            let mut acl = Acl::from_mode(mode);
            acl.check(false).unwrap();
            acl.check(true).unwrap();
            assert_eq!(acl.entries().len(), 3);
            assert!(acl.get(AceKind::Mask, UNQUALIFIED).is_none());
        }
        let acl = Acl::from_mode(0o754);
        assert_eq!(acl.get(AceKind::UserObj, UNQUALIFIED).unwrap().perms, 7);
        assert_eq!(acl.get(AceKind::GroupObj, UNQUALIFIED).unwrap().perms, 5);
        assert_eq!(acl.other_perms(), Some(4));
    }

    #[test]
    fn binary_round_trip() {
        let mut acl = Acl::from_mode(0o640);
        acl.push(Ace::user(1001, READ | WRITE));
        acl.push(Ace::new(AceKind::Group, READ, 50));
        acl.check(true).unwrap();

        let bytes = acl.to_binary().unwrap();
        assert_eq!(&bytes[..4], &ACL_EA_VERSION.to_le_bytes());
        assert_eq!((bytes.len() - 4) % 8, 0);
        assert_eq!(Acl::from_binary(&bytes).unwrap(), acl);
    }

    #[test]
    fn binary_rejects_bad_input() {
        assert!(matches!(
            Acl::from_binary(&[2, 0, 0]),
            Err(Error::Acl(AclError::TruncatedBinary(3)))
        ));
        let mut bytes = Acl::from_mode(0o644).to_binary().unwrap();
        bytes[0] = 1;
        assert!(matches!(
            Acl::from_binary(&bytes),
            Err(Error::Acl(AclError::UnsupportedVersion(1)))
        ));
    }

    #[test]
    fn mask_is_union_of_group_and_named() {
        let mut acl = Acl::from_mode(0o640);
        acl.push(Ace::user(1001, READ | WRITE));
        acl.calc_mask();
        assert_eq!(acl.get(AceKind::Mask, UNQUALIFIED).unwrap().perms, READ | WRITE);

        acl.remove(AceKind::User, 1001);
        acl.calc_mask();
        assert!(acl.get(AceKind::Mask, UNQUALIFIED).is_none());
    }

    #[test]
    fn check_backfills_from_mode() {
        let grants = vec![JsonAce {
            qualifier: 1001,
            privileges: vec![Privilege::Read],
        }];
        let mut acl = Acl::from_json(&grants, Some(0o750));
        assert!(matches!(acl.check(false), Err(Error::Acl(AclError::MissingEntries(_)))));
        acl.check(true).unwrap();
        let kinds: Vec<AceKind> = acl.entries().iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![AceKind::UserObj, AceKind::User, AceKind::GroupObj, AceKind::Mask, AceKind::Other]
        );
        assert_eq!(acl.to_json(), grants);
    }

    #[test]
    fn incomplete_without_mode_is_fatal() {
        let mut acl = Acl::new(None);
        acl.push(Ace::user(1001, READ));
        assert!(matches!(acl.check(true), Err(Error::Acl(AclError::NoModeToBackfill))));
        assert!(acl.to_binary().is_err());
    }

    #[test]
    fn text_entries() {
        let dir = directory();
        let ace = Ace::parse("user:bob:rw-", &dir).unwrap();
        assert_eq!(ace, Ace::user(1001, READ | WRITE));
        assert_eq!(ace.to_text(&dir).unwrap(), "user:bob:rw-");
        assert_eq!(Ace::parse("other::r--", &dir).unwrap().kind, AceKind::Other);
        assert!(matches!(
            Ace::parse("user:bob", &dir),
            Err(Error::Acl(AclError::MalformedAce(_)))
        ));
        assert!(matches!(Ace::parse("user:dave:r--", &dir), Err(Error::UnknownUser(_))));

        let acl = Acl::parse_text("user::rwx\ngroup::r-x,other::---", None, &dir).unwrap();
        assert_eq!(acl, Acl::from_mode(0o750));
    }

    #[test]
    fn nfs4_dialect() {
        let dir = directory();
        let mut acl = Acl::from_mode(0o640);
        acl.push(Ace::user(1002, READ | EXECUTE));
        acl.check(true).unwrap();
        let text = acl.to_nfs4(&dir, "example.org").unwrap();
        assert_eq!(
            text,
            "A::OWNER@:rwa\nA::carol@example.org:rx\nA:g:GROUP@:r\n"
        );
    }

    #[test]
    fn share_flag_letters() {
        assert_eq!(share_flags(READ), "R");
        assert_eq!(share_flags(READ | WRITE), "RW");
        assert_eq!(parse_share_flags("RW"), READ | WRITE);
    }
}
