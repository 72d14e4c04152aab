use std::collections::HashSet;
use std::fmt;

use crate::models::SceneId;
use crate::session::SessionId;

/// Broadcast group. Every admitted session starts in `Unassigned` and moves
/// to its scene's room once the display says hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomId {
    Unassigned,
    Scene(SceneId),
}

impl RoomId {
    pub fn scene(id: SceneId) -> Self {
        RoomId::Scene(id)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::Unassigned => f.write_str("unassigned"),
            RoomId::Scene(id) => write!(f, "scene:{id}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Room {
    members: HashSet<SessionId>,
}

impl Room {
    pub fn add_member(&mut self, id: SessionId) {
        self.members.insert(id);
    }

    pub fn remove_member(&mut self, id: SessionId) -> bool {
        self.members.remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.members.contains(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.members.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
