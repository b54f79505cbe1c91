use crate::peer::types::PeerConnectionState;
use serde::Serialize;

/// Состояние сессии звонка
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AcquiringMedia,
    Joining,
    WaitingForPeer,
    Offering,
    Answering,
    Connected,
    Ended,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }

    /// Допустимые переходы. Ended/Failed достижимы из любого
    /// нетерминального состояния; возврат в AcquiringMedia это
    /// переподключение, в WaitingForPeer перезапуск соединения.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Ended | Failed => true,
            AcquiringMedia => matches!(
                self,
                Idle | WaitingForPeer | Offering | Answering | Connected
            ),
            Joining => self == AcquiringMedia,
            WaitingForPeer => matches!(self, Joining | Offering | Answering | Connected),
            Offering | Answering => self == WaitingForPeer,
            Connected => matches!(self, Offering | Answering),
            Idle => false,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// Как выбирается инициатор
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleAssignment {
    /// Роль известна тому, кто открыл экран звонка
    Fixed(Role),
    /// Инициатор тот, чей id меньше; роль фиксируется, как только
    /// становится известен собеседник
    ByUserId,
}

impl RoleAssignment {
    pub fn resolve(self, local_id: &str, remote_id: &str) -> Role {
        match self {
            RoleAssignment::Fixed(role) => role,
            RoleAssignment::ByUserId if local_id < remote_id => Role::Initiator,
            RoleAssignment::ByUserId => Role::Responder,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub role: Option<Role>,
    pub connection_state: PeerConnectionState,
}

impl Participant {
    pub fn new(id: impl Into<String>, role: Option<Role>) -> Self {
        Self {
            id: id.into(),
            role,
            connection_state: PeerConnectionState::New,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    #[test]
    fn happy_path_is_allowed() {
        let path = [
            Idle,
            AcquiringMedia,
            Joining,
            WaitingForPeer,
            Offering,
            Connected,
            Ended,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
        assert!(WaitingForPeer.can_transition_to(Answering));
        assert!(Answering.can_transition_to(Connected));
    }

    #[test]
    fn terminal_states_are_final() {
        for next in [Idle, AcquiringMedia, Connected, Ended, Failed] {
            assert!(!Ended.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn media_failure_never_reaches_joining_directly() {
        assert!(AcquiringMedia.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Joining));
        assert!(!WaitingForPeer.can_transition_to(Connected));
        assert!(!Offering.can_transition_to(Answering));
    }

    #[test]
    fn user_id_order_picks_single_initiator() {
        let a = RoleAssignment::ByUserId.resolve("alice", "bob");
        let b = RoleAssignment::ByUserId.resolve("bob", "alice");
        assert_eq!(a, Role::Initiator);
        assert_eq!(b, Role::Responder);
        assert_eq!(
            RoleAssignment::Fixed(Role::Responder).resolve("alice", "bob"),
            Role::Responder
        );
    }
}
