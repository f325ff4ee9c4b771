// Lock type lattice for multigranularity locking.
//
// The six lock types and the three relations between them (compatibility,
// parent intent, substitutability) are pure functions with no state. The
// hierarchy layer and recovery both rely on these tables holding exactly.
//
// # Compatibility Matrix
//
// |     | NL | IS | IX | S | SIX | X |
// |-----|----|----|----|---|-----|---|
// | NL  | ✓  | ✓  | ✓  | ✓ | ✓   | ✓ |
// | IS  | ✓  | ✓  | ✓  | ✓ | ✓   | ✗ |
// | IX  | ✓  | ✓  | ✓  | ✗ | ✗   | ✗ |
// | S   | ✓  | ✓  | ✗  | ✓ | ✗   | ✗ |
// | SIX | ✓  | ✓  | ✗  | ✗ | ✗   | ✗ |
// | X   | ✓  | ✗  | ✗  | ✗ | ✗   | ✗ |

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lock type held on a single resource in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// No lock.
    NL,
    /// Intent Shared - intent to acquire S locks at finer granularity.
    IS,
    /// Intent Exclusive - intent to acquire X locks at finer granularity.
    IX,
    /// Shared - read lock.
    S,
    /// Shared with Intent Exclusive - S lock plus intent for X locks.
    SIX,
    /// Exclusive - write lock.
    X,
}

impl LockType {
    /// Checks whether two lock types may be held on the same resource by two
    /// different transactions at the same time. Symmetric.
    pub fn is_compatible(&self, other: &LockType) -> bool {
        use LockType::*;
        matches!(
            (self, other),
            (NL, _) | (_, NL)
                | (IS, IS) | (IS, IX) | (IS, S) | (IS, SIX)
                | (IX, IS) | (IX, IX)
                | (S, IS) | (S, S)
                | (SIX, IS)
        )
    }

    /// The intent type a parent resource must carry for a child to hold this
    /// type.
    pub fn parent_intent(&self) -> LockType {
        use LockType::*;
        match self {
            S => IS,
            X => IX,
            IS => IS,
            IX => IX,
            SIX => IX,
            NL => NL,
        }
    }

    /// Checks whether holding `self` grants every privilege that holding
    /// `required` would grant.
    pub fn substitutes(&self, required: &LockType) -> bool {
        use LockType::*;
        if self == required {
            return true;
        }
        matches!(
            (self, required),
            (X, _) | (S, IS) | (IX, IS) | (SIX, NL) | (SIX, IS) | (SIX, IX) | (SIX, S)
        )
    }

    /// Checks whether a resource holding `self` may have a child resource
    /// holding `child`. Every parent admits an NL child.
    pub fn can_be_parent(&self, child: &LockType) -> bool {
        use LockType::*;
        if *child == NL {
            return true;
        }
        match self {
            NL => false,
            IS => matches!(child, IS | S),
            IX => true,
            SIX => matches!(child, IX | X),
            S => matches!(child, S),
            X => matches!(child, X),
        }
    }

    /// Returns true for the intent types IS, IX, and SIX.
    #[inline]
    pub fn is_intent(&self) -> bool {
        matches!(self, LockType::IS | LockType::IX | LockType::SIX)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::NL => write!(f, "NL"),
            LockType::IS => write!(f, "IS"),
            LockType::IX => write!(f, "IX"),
            LockType::S => write!(f, "S"),
            LockType::SIX => write!(f, "SIX"),
            LockType::X => write!(f, "X"),
        }
    }
}
