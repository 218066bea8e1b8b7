//! Polling-iteration counters for the two periodic actions.

/// Which periodic actions are due on this iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Due {
    pub diagnostics: bool,
    pub stash_cleanup: bool,
}

/// Advance `counter` by one. Returns the new value and whether it fired.
///
/// A firing counter resets to zero. A counter that reaches its threshold while
/// `enabled` is false keeps counting and fires on the first enabled tick.
pub fn advance(counter: u32, threshold: u32, enabled: bool) -> (u32, bool) {
    let next = counter.saturating_add(1);
    if enabled && next >= threshold {
        (0, true)
    } else {
        (next, false)
    }
}

#[derive(Debug, Clone)]
pub struct LoopCounters {
    diagnostics: u32,
    maintenance: u32,
    diagnostics_every: u32,
    maintenance_every: u32,
}

impl LoopCounters {
    pub fn new(diagnostics_every: u32, maintenance_every: u32) -> Self {
        Self {
            diagnostics: 0,
            maintenance: 0,
            diagnostics_every,
            maintenance_every,
        }
    }

    /// Count one polling iteration. Stash cleanup is only due in container mode.
    pub fn tick(&mut self, container: bool) -> Due {
        let (diagnostics, fire_diag) = advance(self.diagnostics, self.diagnostics_every, true);
        let (maintenance, fire_maint) = advance(self.maintenance, self.maintenance_every, container);
        self.diagnostics = diagnostics;
        self.maintenance = maintenance;
        Due {
            diagnostics: fire_diag,
            stash_cleanup: fire_maint,
        }
    }

    #[allow(dead_code)]
    pub fn diagnostics(&self) -> u32 {
        self.diagnostics
    }

    #[allow(dead_code)]
    pub fn maintenance(&self) -> u32 {
        self.maintenance
    }
}
