//! Source-side session state machine (spec §3 `PostcopyOutgoingState`, §4.2).

/// The source engine's session state. Transitions monotonically toward
/// `Completed` or `ErrorReceive` (spec §3 lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostcopyOutgoingState {
    Active,
    AllPagesSent,
    EocReceived,
    Completed,
    ErrorReceive,
}

impl PostcopyOutgoingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::ErrorReceive)
    }

    /// §4.2 request handler: EOC received.
    pub fn on_eoc(self) -> Self {
        match self {
            Self::AllPagesSent => Self::Completed,
            _ => Self::EocReceived,
        }
    }

    /// §4.2 background slice: no more dirty blocks to scan.
    pub fn on_background_exhausted(self) -> Self {
        match self {
            Self::Active => Self::AllPagesSent,
            other => other,
        }
    }

    /// §7: any decode or lookup error collapses the session.
    pub fn on_error(self) -> Self {
        match self {
            Self::AllPagesSent => Self::Completed,
            _ => Self::ErrorReceive,
        }
    }

    pub fn wants_read(self) -> bool {
        matches!(self, Self::Active | Self::AllPagesSent)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, Self::Active | Self::EocReceived)
    }

    pub fn runs_background_slice(self) -> bool {
        matches!(self, Self::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eoc_from_all_pages_sent_completes() {
        assert_eq!(PostcopyOutgoingState::AllPagesSent.on_eoc(), PostcopyOutgoingState::Completed);
    }

    #[test]
    fn eoc_from_active_awaits_pages_sent() {
        assert_eq!(PostcopyOutgoingState::Active.on_eoc(), PostcopyOutgoingState::EocReceived);
    }

    #[test]
    fn error_from_all_pages_sent_completes_not_errors() {
        assert_eq!(PostcopyOutgoingState::AllPagesSent.on_error(), PostcopyOutgoingState::Completed);
    }

    #[test]
    fn error_from_active_errors() {
        assert_eq!(PostcopyOutgoingState::Active.on_error(), PostcopyOutgoingState::ErrorReceive);
    }
}
