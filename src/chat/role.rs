//! Participant roles and the moderation rule.

/// Effective role of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Owner of the relay. Fixed for the lifetime of the server.
    Host,
    /// Promoted participant; may moderate regular participants.
    Admin,
    /// Default role.
    Regular,
}

impl Role {
    /// Whether a participant with this role may moderate one with `target`.
    pub fn can_moderate(self, target: Role) -> bool {
        matches!(
            (self, target),
            (Role::Host, Role::Admin | Role::Regular) | (Role::Admin, Role::Regular)
        )
    }

    /// Status tag shown next to the participant's name.
    pub fn status_tag(self) -> &'static str {
        match self {
            Role::Host => "Host",
            Role::Admin => "Admin",
            Role::Regular => "",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Host => "host",
            Role::Admin => "admin",
            Role::Regular => "regular",
        };
        write!(f, "{name}")
    }
}

/// Local participant status as seen by a peer connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStatus {
    pub is_host: bool,
    pub is_admin: bool,
    pub is_muted: bool,
    pub is_connected: bool,
}

impl PeerStatus {
    /// Role implied by the status flags.
    pub fn role(&self) -> Role {
        if self.is_host {
            Role::Host
        } else if self.is_admin {
            Role::Admin
        } else {
            Role::Regular
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLES: [Role; 3] = [Role::Host, Role::Admin, Role::Regular];

    #[test]
    fn test_authorization_matrix() {
        for requester in ROLES {
            for target in ROLES {
                let expected = (requester == Role::Host && target != Role::Host)
                    || (requester == Role::Admin && target == Role::Regular);
                assert_eq!(
                    requester.can_moderate(target),
                    expected,
                    "{requester} -> {target}"
                );
            }
        }
    }

    #[test]
    fn test_nobody_moderates_host() {
        for requester in ROLES {
            assert!(!requester.can_moderate(Role::Host));
        }
    }

    #[test]
    fn test_status_tag() {
        assert_eq!(Role::Host.status_tag(), "Host");
        assert_eq!(Role::Admin.status_tag(), "Admin");
        assert_eq!(Role::Regular.status_tag(), "");
    }

    #[test]
    fn test_peer_status_role() {
        let mut status = PeerStatus::default();
        assert_eq!(status.role(), Role::Regular);
        status.is_admin = true;
        assert_eq!(status.role(), Role::Admin);
        status.is_host = true;
        assert_eq!(status.role(), Role::Host);
    }
}
