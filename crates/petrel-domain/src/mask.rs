use bitflags::bitflags;

bitflags! {
    /// ACL permission mask.
    ///
    /// `CREATE` is only meaningful on an object-level ACL instance (one with
    /// no target instance) and must then be the sole bit; the Access Control
    /// subsystem enforces that rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessMask: u16 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const DELETE  = 1 << 3;
        const CREATE  = 1 << 4;
    }
}

impl AccessMask {
    pub const FULL: AccessMask = AccessMask::all();

    pub const EMPTY: AccessMask = AccessMask::empty();
}

impl std::fmt::Display for AccessMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (flag, ch) in [
            (AccessMask::READ, 'R'),
            (AccessMask::WRITE, 'W'),
            (AccessMask::EXECUTE, 'E'),
            (AccessMask::DELETE, 'D'),
            (AccessMask::CREATE, 'C'),
        ] {
            if self.contains(flag) {
                write!(f, "{}", ch)?;
            }
        }
        Ok(())
    }
}
