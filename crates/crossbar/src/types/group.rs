use parking_lot::RwLock;
use rand::Rng;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};

/// A named set of replica endpoints with a leader hint.
///
/// Reply handling mutates the hint concurrently with outbound target
/// selection, so members and the hint live under one lock; no caller can
/// observe a leader index pointing outside the current member list.
pub struct GroupAddress {
    name: String,
    update_leader_automatically: AtomicBool,
    inner: RwLock<GroupInner>,
}

struct GroupInner {
    members: Vec<SocketAddrV4>,
    leader: Option<usize>,
}

impl GroupAddress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            update_leader_automatically: AtomicBool::new(true),
            inner: RwLock::new(GroupInner {
                members: Vec::new(),
                leader: None,
            }),
        }
    }

    pub fn with_members(
        name: impl Into<String>,
        members: impl IntoIterator<Item = SocketAddrV4>,
    ) -> Self {
        let group = Self::new(name);
        {
            let mut inner = group.inner.write();
            inner.members = members.into_iter().collect();
        }
        group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_update_leader_automatically(&self) -> bool {
        self.update_leader_automatically.load(Ordering::Relaxed)
    }

    pub fn set_update_leader_automatically(&self, value: bool) {
        self.update_leader_automatically
            .store(value, Ordering::Relaxed);
    }

    pub fn members(&self) -> Vec<SocketAddrV4> {
        self.inner.read().members.clone()
    }

    /// Add a member. Returns false if it was already present.
    pub fn add_member(&self, addr: SocketAddrV4) -> bool {
        let mut inner = self.inner.write();
        if inner.members.contains(&addr) {
            return false;
        }
        inner.members.push(addr);
        true
    }

    /// Remove a member, fixing up the leader hint if it pointed at or past
    /// the removed slot. Returns false if the address was not a member.
    pub fn remove_member(&self, addr: SocketAddrV4) -> bool {
        let mut inner = self.inner.write();
        let Some(pos) = inner.members.iter().position(|m| *m == addr) else {
            return false;
        };
        inner.members.remove(pos);
        inner.leader = match inner.leader {
            Some(l) if l == pos => None,
            Some(l) if l > pos => Some(l - 1),
            other => other,
        };
        true
    }

    pub fn leader(&self) -> Option<SocketAddrV4> {
        let inner = self.inner.read();
        inner.leader.map(|i| inner.members[i])
    }

    /// Set the leader hint, inserting the address as a member if needed.
    pub fn set_leader(&self, addr: SocketAddrV4) {
        let mut inner = self.inner.write();
        match inner.members.iter().position(|m| *m == addr) {
            Some(pos) => inner.leader = Some(pos),
            None => {
                inner.members.push(addr);
                inner.leader = Some(inner.members.len() - 1);
            }
        }
    }

    /// Rotate the leader hint to the next member, used when the presumed
    /// leader stopped answering.
    pub fn leader_forward(&self) {
        let mut inner = self.inner.write();
        if inner.members.is_empty() {
            return;
        }
        inner.leader = Some(match inner.leader {
            Some(i) => (i + 1) % inner.members.len(),
            None => 0,
        });
    }

    /// The presumed leader, falling back to a random member when no hint is
    /// known.
    ///
    /// # Panics
    ///
    /// Panics if the group has no members; an empty group is never a valid
    /// call target.
    pub fn possible_leader(&self) -> SocketAddrV4 {
        let inner = self.inner.read();
        assert!(
            !inner.members.is_empty(),
            "group '{}' has no members",
            self.name
        );
        match inner.leader {
            Some(i) => inner.members[i],
            None => inner.members[rand::thread_rng().gen_range(0..inner.members.len())],
        }
    }

    /// A uniformly random member.
    ///
    /// # Panics
    ///
    /// Panics if the group has no members.
    pub fn random_member(&self) -> SocketAddrV4 {
        let inner = self.inner.read();
        assert!(
            !inner.members.is_empty(),
            "group '{}' has no members",
            self.name
        );
        inner.members[rand::thread_rng().gen_range(0..inner.members.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn leader_hint_lifecycle() {
        let group = GroupAddress::with_members("meta", [ep(1, 7000), ep(2, 7000)]);
        assert_eq!(group.leader(), None);

        group.set_leader(ep(2, 7000));
        assert_eq!(group.leader(), Some(ep(2, 7000)));
        assert_eq!(group.possible_leader(), ep(2, 7000));

        group.leader_forward();
        assert_eq!(group.leader(), Some(ep(1, 7000)));
    }

    #[test]
    fn set_leader_inserts_unknown_member() {
        let group = GroupAddress::with_members("meta", [ep(1, 7000)]);
        group.set_leader(ep(3, 7000));
        assert_eq!(group.leader(), Some(ep(3, 7000)));
        assert_eq!(group.members().len(), 2);
    }

    #[test]
    fn remove_member_fixes_leader_index() {
        let group = GroupAddress::with_members("meta", [ep(1, 7000), ep(2, 7000), ep(3, 7000)]);
        group.set_leader(ep(3, 7000));

        assert!(group.remove_member(ep(1, 7000)));
        assert_eq!(group.leader(), Some(ep(3, 7000)));

        assert!(group.remove_member(ep(3, 7000)));
        assert_eq!(group.leader(), None);
        assert!(!group.remove_member(ep(3, 7000)));
    }

    #[test]
    fn random_member_stays_in_set() {
        let group = GroupAddress::with_members("meta", [ep(1, 7000), ep(2, 7000)]);
        for _ in 0..16 {
            assert!(group.members().contains(&group.random_member()));
        }
    }
}
