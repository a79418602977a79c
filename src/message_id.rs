//! Request identifiers: either a `u64` or a `Uuid`, compared by canonical
//! string form.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum MessageId {
    U64(u64),
    Uuid(Uuid),
}

impl MessageId {
    pub fn canonical_string(&self) -> String {
        match self {
            MessageId::U64(v) => v.to_string(),
            MessageId::Uuid(u) => u.to_string(),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl PartialEq for MessageId {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_string() == other.canonical_string()
    }
}
impl Eq for MessageId {}

impl std::hash::Hash for MessageId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical_string().hash(state);
    }
}

impl From<u64> for MessageId {
    fn from(v: u64) -> Self {
        MessageId::U64(v)
    }
}

impl From<Uuid> for MessageId {
    fn from(v: Uuid) -> Self {
        MessageId::Uuid(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_by_canonical_string() {
        assert_eq!(MessageId::U64(1), MessageId::U64(1));
        assert_ne!(MessageId::U64(1), MessageId::U64(2));
        let u = Uuid::new_v4();
        assert_eq!(MessageId::Uuid(u), MessageId::Uuid(u));
    }

    #[test]
    fn u64_and_uuid_are_never_equal() {
        let u = Uuid::nil();
        assert_ne!(MessageId::U64(0), MessageId::Uuid(u));
    }
}
