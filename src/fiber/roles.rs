//! Priority bands a fiber is scheduled under.
//!
//! Eight bins, `BOOT` highest down to `BACKGROUND` lowest, ordered
//! `BOOT > IDLE > DEALER > MASTER > WORKER > USER` with two
//! reserved bands (`SYSTEM` just under `BOOT`, `BACKGROUND` just under
//! `USER`) kept free for callers that need a priority tier this crate
//! doesn't name itself -- e.g. a protocol layer's own low-priority stats
//! rollup fiber. The scheduler drains a band to exhaustion before ever
//! looking at the next one down, so a fiber that never yields can starve
//! every lower band forever; long-running housekeeping work (LRU sweeps,
//! stride growth) is expected to yield between batches rather than run to
//! completion in one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Background = 0,
    User = 1,
    Worker = 2,
    Master = 3,
    Dealer = 4,
    Idle = 5,
    System = 6,
    Boot = 7,
}

pub const PRIORITY_BANDS: usize = 8;

impl Priority {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// The role a fiber plays on its thread, and the priority band that role
/// always runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Runs once at thread start-up before anything else is scheduled.
    Boot,
    /// A thread's single idle fiber: the target of `idle(tail)`, parked
    /// whenever there is nothing else runnable.
    Idle,
    /// Drains this thread's event listener and request ring; one per
    /// thread.
    Dealer,
    /// Spawns worker fibers as work arrives, up to a configured maximum.
    Master,
    /// Drains queued work items until none remain, then goes idle.
    Worker,
    /// User-level / protocol-layer fibers (a connection's request/response
    /// cycle, in the canonical memcache tenant).
    User,
    /// Reserved tier between `Boot` and `Idle` for domain-scoped
    /// bootstrapping work that must run before any `Dealer`/`Master`/
    /// `Worker` fiber but after `Boot`.
    System,
    /// Reserved lowest tier, below `User`, for deferred/background work
    /// (stats rollups, deferred frees) a caller wants guaranteed to yield
    /// to everything else.
    Background,
}

impl Role {
    pub fn priority(self) -> Priority {
        match self {
            Role::Boot => Priority::Boot,
            Role::System => Priority::System,
            Role::Idle => Priority::Idle,
            Role::Dealer => Priority::Dealer,
            Role::Master => Priority::Master,
            Role::Worker => Priority::Worker,
            Role::User => Priority::User,
            Role::Background => Priority::Background,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_map_to_the_expected_priority() {
        assert_eq!(Role::Boot.priority(), Priority::Boot);
        assert_eq!(Role::Dealer.priority(), Priority::Dealer);
        assert_eq!(Role::Master.priority(), Priority::Master);
        assert_eq!(Role::Worker.priority(), Priority::Worker);
        assert_eq!(Role::User.priority(), Priority::User);
    }

    #[test]
    fn priority_bands_are_strictly_ordered() {
        assert!(Priority::Boot > Priority::Idle);
        assert!(Priority::Idle > Priority::Dealer);
        assert!(Priority::Dealer > Priority::Master);
        assert!(Priority::Master > Priority::Worker);
        assert!(Priority::Worker > Priority::User);
        assert!(Priority::User > Priority::Background);
    }
}
