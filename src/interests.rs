use std::{fmt, ops};

/// The events a [`RegistryEntry`] may be asked to watch for.
///
/// [`RegistryEntry`]: crate::registry::RegistryEntry
const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const ERROR: u8 = 0b0100;
const NOTIFICATIONS: u8 = 0b1000;

/// A set of event kinds to watch for, e.g. `Interest::READABLE |
/// Interest::WRITABLE`.
///
/// An `Interest` is a bitset over `{ readable, writable, error,
/// notifications }`. It carries no trigger-policy information of its own;
/// that's [`Trigger`], paired with an `Interest` wherever a driver needs to
/// decide how to arm the kernel subscription.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(READABLE);
    pub const WRITABLE: Interest = Interest(WRITABLE);
    pub const ERROR: Interest = Interest(ERROR);
    pub const NOTIFICATIONS: Interest = Interest(NOTIFICATIONS);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }

    pub const fn is_notifications(self) -> bool {
        self.0 & NOTIFICATIONS != 0
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        *self = self.add(rhs);
    }
}

impl ops::Sub for Interest {
    type Output = Interest;
    fn sub(self, rhs: Interest) -> Interest {
        self.remove(rhs)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        macro_rules! flag {
            ($check:expr, $name:expr) => {
                if $check {
                    if !first {
                        write!(f, "|")?;
                    }
                    write!(f, $name)?;
                    first = false;
                }
            };
        }
        flag!(self.is_readable(), "READABLE");
        flag!(self.is_writable(), "WRITABLE");
        flag!(self.is_error(), "ERROR");
        flag!(self.is_notifications(), "NOTIFICATIONS");
        if first {
            write!(f, "(none)")?;
        }
        Ok(())
    }
}

/// The orthogonal policy bits every registered interest carries in
/// addition to the event kind: level-vs-edge triggering and one-shot
/// auto-disarm.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Trigger {
    pub edge: bool,
    pub one_shot: bool,
}

impl Trigger {
    /// Level-triggered, persists across announcements: the default, and
    /// the only portable choice (spec. level/edge is a per-registration
    /// policy bit, not a capability every OS selector is guaranteed to
    /// expose identically).
    pub const LEVEL: Trigger = Trigger {
        edge: false,
        one_shot: false,
    };

    pub const EDGE: Trigger = Trigger {
        edge: true,
        one_shot: false,
    };

    pub fn one_shot(mut self) -> Trigger {
        self.one_shot = true;
        self
    }
}

impl Default for Trigger {
    fn default() -> Trigger {
        Trigger::LEVEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_union_contains_both() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.contains(Interest::READABLE));
        assert!(both.contains(Interest::WRITABLE));
        assert!(!both.contains(Interest::ERROR));
    }

    #[test]
    fn interest_remove() {
        let both = Interest::READABLE | Interest::WRITABLE;
        let readable_only = both.remove(Interest::WRITABLE);
        assert!(readable_only.is_readable());
        assert!(!readable_only.is_writable());
    }

    #[test]
    fn default_trigger_is_level() {
        assert_eq!(Trigger::default(), Trigger::LEVEL);
    }
}
