/// Presence roster for a room: who is connected, how they are drawn and
/// what they are pointing at. Presence is advisory and last-write-wins
/// per session.
use mindmap::{EdgeId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Role, SessionId, UserId};

/// Seconds without activity before a participant is reported idle.
pub const IDLE_AFTER_SECS: i64 = 60;

/// Color assigned to a participant for cursor/selection highlighting.
/// Travels on the wire as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Deterministic color for an identity string: the same user gets the
    /// same color in every session and on every client.
    pub fn from_seed(seed: &str) -> Self {
        let hash = seed
            .bytes()
            .fold(0x811c_9dc5_u32, |acc, b| (acc ^ b as u32).wrapping_mul(0x0100_0193));
        let hue = (hash % 360) as f32;
        Self::from_hsl(hue, 0.65, 0.5)
    }

    fn from_hsl(hue: f32, saturation: f32, lightness: f32) -> Self {
        let c = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
        let h = hue / 60.0;
        let x = c * (1.0 - (h % 2.0 - 1.0).abs());
        let (r, g, b) = match h as u32 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        let m = lightness - c / 2.0;
        let channel = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
        Self::new(channel(r), channel(g), channel(b))
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#')?;
        if digits.len() != 6 || !digits.is_ascii() {
            return None;
        }
        let parse = |range: std::ops::Range<usize>| u8::from_str_radix(&digits[range], 16).ok();
        Some(Self::new(parse(0..2)?, parse(2..4)?, parse(4..6)?))
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl From<UserColor> for String {
    fn from(color: UserColor) -> Self {
        color.to_hex()
    }
}

impl TryFrom<String> for UserColor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value).ok_or_else(|| format!("invalid color: {value}"))
    }
}

/// Element a participant is currently focused on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FocusTarget {
    Node { id: NodeId },
    Edge { id: EdgeId },
    Label { id: NodeId },
    Pane,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub session_id: SessionId,
    pub user_id: Option<UserId>,
    pub name: String,
    pub color: UserColor,
    #[serde(flatten)]
    pub role: Role,
    pub cursor: Option<Cursor>,
    pub active: Option<FocusTarget>,
    pub joined_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    /// Computed when the roster is snapshotted.
    #[serde(default)]
    pub idle: bool,
}

impl Participant {
    pub fn new(session_id: SessionId, user_id: Option<UserId>, role: Role) -> Self {
        let seed = match &user_id {
            Some(user) => user.0.clone(),
            None => session_id.to_string(),
        };
        let name = match &user_id {
            Some(user) => user.0.clone(),
            None => "Anonymous".to_string(),
        };
        let now = chrono::Utc::now();
        Self {
            session_id,
            user_id,
            name,
            color: UserColor::from_seed(&seed),
            role,
            cursor: None,
            active: None,
            joined_at: now,
            last_activity: now,
            idle: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = chrono::Utc::now();
    }

    pub fn is_idle(&self) -> bool {
        (chrono::Utc::now() - self.last_activity).num_seconds() > IDLE_AFTER_SECS
    }
}

/// A presence event submitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// `user_id` is informational only; identity comes from authentication.
    Announce {
        name: String,
        color: Option<String>,
        user_id: Option<String>,
    },
    Active {
        target: Option<FocusTarget>,
    },
    Clear,
    CursorMove {
        x: f64,
        y: f64,
    },
}

#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
    participants: HashMap<SessionId, Participant>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, session_id: SessionId, user_id: Option<UserId>, role: Role) -> Participant {
        let participant = Participant::new(session_id, user_id, role);
        self.participants.insert(session_id, participant.clone());
        participant
    }

    pub fn leave(&mut self, session_id: &SessionId) -> Option<Participant> {
        self.participants.remove(session_id)
    }

    /// Applies an event and returns the updated participant, or `None`
    /// for a session that is not in the roster.
    pub fn apply(&mut self, session_id: &SessionId, event: PresenceEvent) -> Option<Participant> {
        let participant = self.participants.get_mut(session_id)?;
        match event {
            PresenceEvent::Announce { name, color, .. } => {
                if !name.trim().is_empty() {
                    participant.name = name;
                }
                if let Some(color) = color.as_deref().and_then(UserColor::from_hex) {
                    participant.color = color;
                }
            }
            PresenceEvent::Active { target } => participant.active = target,
            PresenceEvent::Clear => {
                participant.active = None;
                participant.cursor = None;
            }
            PresenceEvent::CursorMove { x, y } => {
                if x.is_finite() && y.is_finite() {
                    participant.cursor = Some(Cursor { x, y });
                }
            }
        }
        participant.touch();
        participant.idle = false;
        Some(participant.clone())
    }

    pub fn set_role(&mut self, session_id: &SessionId, role: Role) -> Option<Participant> {
        let participant = self.participants.get_mut(session_id)?;
        participant.role = role;
        Some(participant.clone())
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&Participant> {
        self.participants.get(session_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.participants.keys()
    }

    /// Participants in join order with their idle flag refreshed.
    pub fn snapshot(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self
            .participants
            .values()
            .cloned()
            .map(|mut p| {
                p.idle = p.is_idle();
                p
            })
            .collect();
        list.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        list
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Access;

    #[test]
    fn test_user_color_is_deterministic() {
        let a = UserColor::from_seed("alice");
        assert_eq!(a, UserColor::from_seed("alice"));

        let hex = a.to_hex();
        assert!(hex.starts_with('#'));
        assert_eq!(hex.len(), 7);
        assert_eq!(UserColor::from_hex(&hex), Some(a));
        assert_eq!(UserColor::from_hex("red"), None);
    }

    #[test]
    fn test_presence_events_update_participant() {
        let mut roster = PresenceRoster::new();
        let session = SessionId::new();
        roster.join(session, Some(UserId::new("alice")), Role::Owner);

        roster.apply(
            &session,
            PresenceEvent::Announce {
                name: "Alice".into(),
                color: Some("#FF0000".into()),
                user_id: Some("someone-else".into()),
            },
        );
        roster.apply(&session, PresenceEvent::CursorMove { x: 10.0, y: 4.5 });
        let updated = roster
            .apply(
                &session,
                PresenceEvent::Active {
                    target: Some(FocusTarget::Node { id: "n1".into() }),
                },
            )
            .unwrap();

        assert_eq!(updated.name, "Alice");
        assert_eq!(updated.color, UserColor::new(255, 0, 0));
        assert_eq!(updated.user_id, Some(UserId::new("alice")));
        assert_eq!(updated.cursor, Some(Cursor { x: 10.0, y: 4.5 }));

        let cleared = roster.apply(&session, PresenceEvent::Clear).unwrap();
        assert_eq!(cleared.active, None);
        assert_eq!(cleared.cursor, None);
    }

    #[test]
    fn test_unknown_session_is_ignored() {
        let mut roster = PresenceRoster::new();
        assert!(roster.apply(&SessionId::new(), PresenceEvent::Clear).is_none());
    }

    #[test]
    fn test_idle_detection() {
        let mut roster = PresenceRoster::new();
        let session = SessionId::new();
        let mut participant = roster.join(
            session,
            None,
            Role::Public {
                access: Access::View,
            },
        );
        assert!(!participant.is_idle());
        assert_eq!(participant.name, "Anonymous");

        participant.last_activity = chrono::Utc::now() - chrono::Duration::seconds(120);
        assert!(participant.is_idle());
    }

    #[test]
    fn test_participant_json_flattens_role() {
        let participant = Participant::new(
            SessionId::new(),
            Some(UserId::new("bob")),
            Role::Collaborator {
                access: Access::Edit,
            },
        );
        let json = serde_json::to_value(&participant).unwrap();
        assert_eq!(json["role"], "collaborator");
        assert_eq!(json["access"], "edit");
        assert!(json["color"].as_str().unwrap().starts_with('#'));

        let focus = serde_json::to_value(FocusTarget::Edge { id: "e1".into() }).unwrap();
        assert_eq!(focus, serde_json::json!({ "type": "edge", "id": "e1" }));
    }
}
