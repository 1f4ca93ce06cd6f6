/// Access resolution against the external identity provider.
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::{CollaborationError, DocumentId, Result, UserId};

/// Public link sharing setting of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingPolicy {
    #[default]
    Private,
    View,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    View,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub user_id: UserId,
    pub access: Access,
    pub status: InvitationStatus,
}

/// Everything the core needs to know about who may open a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAccess {
    pub document_id: DocumentId,
    pub owner_id: UserId,
    #[serde(default)]
    pub collaborators: Vec<Collaborator>,
    #[serde(default)]
    pub sharing: SharingPolicy,
    #[serde(default)]
    pub share_token: Option<String>,
}

impl DocumentAccess {
    pub fn new(document_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            document_id: DocumentId::new(document_id),
            owner_id: UserId::new(owner_id),
            collaborators: Vec::new(),
            sharing: SharingPolicy::Private,
            share_token: None,
        }
    }

    pub fn with_collaborator(mut self, user_id: impl Into<String>, access: Access) -> Self {
        self.collaborators.push(Collaborator {
            user_id: UserId::new(user_id),
            access,
            status: InvitationStatus::Accepted,
        });
        self
    }

    pub fn with_sharing(mut self, sharing: SharingPolicy, share_token: Option<&str>) -> Self {
        self.sharing = sharing;
        self.share_token = share_token.map(str::to_string);
        self
    }
}

/// A session's resolved standing in a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Role {
    Owner,
    Collaborator { access: Access },
    Public { access: Access },
    Guest,
}

impl Role {
    /// Owner first, then accepted collaborator, then the public link
    /// policy. Anything else is a guest with no access.
    pub fn resolve(access: &DocumentAccess, user: Option<&UserId>) -> Self {
        if let Some(user) = user {
            if &access.owner_id == user {
                return Role::Owner;
            }
            if let Some(collaborator) = access
                .collaborators
                .iter()
                .find(|c| &c.user_id == user && c.status == InvitationStatus::Accepted)
            {
                return Role::Collaborator {
                    access: collaborator.access,
                };
            }
        }
        match access.sharing {
            SharingPolicy::Private => Role::Guest,
            SharingPolicy::View => Role::Public {
                access: Access::View,
            },
            SharingPolicy::Edit => Role::Public {
                access: Access::Edit,
            },
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Role::Owner => 3,
            Role::Collaborator { access: Access::Edit } | Role::Public { access: Access::Edit } => 2,
            Role::Collaborator { access: Access::View } | Role::Public { access: Access::View } => 1,
            Role::Guest => 0,
        }
    }

    pub fn can_view(&self) -> bool {
        self.rank() >= 1
    }

    pub fn can_edit(&self) -> bool {
        self.rank() >= 2
    }

    /// Access level label: owner, editor, viewer or public.
    pub fn level(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Collaborator { access: Access::Edit } => "editor",
            Role::Collaborator { access: Access::View } => "viewer",
            Role::Public { .. } => "public",
            Role::Guest => "none",
        }
    }
}

/// How a client names the room it wants to join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomKey {
    Document(DocumentId),
    ShareToken(String),
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Document(id) => write!(f, "document:{id}"),
            RoomKey::ShareToken(_) => f.write_str("share-token"),
        }
    }
}

#[async_trait]
pub trait AccessProvider: Send + Sync {
    /// Maps an opaque auth token to a user. No token means anonymous.
    async fn authenticate(&self, token: Option<&str>) -> Result<Option<UserId>>;

    async fn resolve(&self, key: &RoomKey) -> Result<DocumentAccess>;
}

#[derive(Debug, Default, Deserialize)]
struct AccessFile {
    #[serde(default)]
    users: HashMap<String, UserId>,
    #[serde(default)]
    documents: Vec<DocumentAccess>,
}

#[derive(Debug, Default)]
struct AccessRegistry {
    users: HashMap<String, UserId>,
    documents: HashMap<DocumentId, DocumentAccess>,
}

/// In-memory provider, optionally seeded from a JSON file of the form
/// `{ "users": { token: userId }, "documents": [DocumentAccess] }`.
#[derive(Debug, Default)]
pub struct StaticAccessProvider {
    inner: RwLock<AccessRegistry>,
}

impl StaticAccessProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| CollaborationError::Store(format!("failed to read access file: {e}")))?;
        let file: AccessFile = serde_json::from_str(&json)?;

        let provider = Self::new();
        {
            let mut inner = provider.inner.write();
            inner.users = file.users;
            for doc in file.documents {
                inner.documents.insert(doc.document_id.clone(), doc);
            }
        }
        Ok(provider)
    }

    pub fn add_user(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.inner
            .write()
            .users
            .insert(token.into(), UserId::new(user_id));
    }

    pub fn upsert_document(&self, access: DocumentAccess) {
        self.inner
            .write()
            .documents
            .insert(access.document_id.clone(), access);
    }

    pub fn document(&self, id: &DocumentId) -> Option<DocumentAccess> {
        self.inner.read().documents.get(id).cloned()
    }
}

#[async_trait]
impl AccessProvider for StaticAccessProvider {
    async fn authenticate(&self, token: Option<&str>) -> Result<Option<UserId>> {
        let Some(token) = token else {
            return Ok(None);
        };
        self.inner
            .read()
            .users
            .get(token)
            .cloned()
            .map(Some)
            .ok_or_else(|| CollaborationError::AccessDenied("invalid credentials".into()))
    }

    async fn resolve(&self, key: &RoomKey) -> Result<DocumentAccess> {
        let inner = self.inner.read();
        let found = match key {
            RoomKey::Document(id) => inner.documents.get(id),
            RoomKey::ShareToken(token) => inner
                .documents
                .values()
                .find(|d| d.share_token.as_deref() == Some(token.as_str())),
        };
        found
            .cloned()
            .ok_or_else(|| CollaborationError::RoomNotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentAccess {
        DocumentAccess::new("doc-1", "alice")
            .with_collaborator("bob", Access::Edit)
            .with_collaborator("carol", Access::View)
    }

    #[test]
    fn test_role_resolution_order() {
        let access = doc();
        assert_eq!(Role::resolve(&access, Some(&UserId::new("alice"))), Role::Owner);
        assert_eq!(
            Role::resolve(&access, Some(&UserId::new("bob"))),
            Role::Collaborator {
                access: Access::Edit
            }
        );
        assert_eq!(Role::resolve(&access, Some(&UserId::new("dave"))), Role::Guest);
        assert_eq!(Role::resolve(&access, None), Role::Guest);
    }

    #[test]
    fn test_pending_invitation_grants_nothing() {
        let mut access = doc();
        access.collaborators.push(Collaborator {
            user_id: UserId::new("erin"),
            access: Access::Edit,
            status: InvitationStatus::Pending,
        });
        assert_eq!(Role::resolve(&access, Some(&UserId::new("erin"))), Role::Guest);
    }

    #[test]
    fn test_public_policy_applies_to_anonymous() {
        let access = doc().with_sharing(SharingPolicy::View, Some("tok"));
        let role = Role::resolve(&access, None);
        assert_eq!(
            role,
            Role::Public {
                access: Access::View
            }
        );
        assert!(role.can_view());
        assert!(!role.can_edit());
        assert_eq!(role.level(), "public");
    }

    #[test]
    fn test_role_json_shape() {
        let json = serde_json::to_value(Role::Collaborator {
            access: Access::Edit,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "role": "collaborator", "access": "edit" }));
    }

    #[tokio::test]
    async fn test_static_provider_resolves_share_tokens() {
        let provider = StaticAccessProvider::new();
        provider.add_user("t-alice", "alice");
        provider.upsert_document(doc().with_sharing(SharingPolicy::Edit, Some("share-xyz")));

        let user = provider.authenticate(Some("t-alice")).await.unwrap();
        assert_eq!(user, Some(UserId::new("alice")));
        assert_eq!(provider.authenticate(None).await.unwrap(), None);
        assert!(matches!(
            provider.authenticate(Some("forged")).await,
            Err(CollaborationError::AccessDenied(_))
        ));

        let by_token = provider
            .resolve(&RoomKey::ShareToken("share-xyz".into()))
            .await
            .unwrap();
        assert_eq!(by_token.document_id, DocumentId::new("doc-1"));

        let missing = provider
            .resolve(&RoomKey::Document(DocumentId::new("nope")))
            .await;
        assert!(matches!(missing, Err(CollaborationError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_load_access_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.json");
        std::fs::write(
            &path,
            r#"{
                "users": { "t1": "alice" },
                "documents": [
                    { "documentId": "d1", "ownerId": "alice", "sharing": "view", "shareToken": "s1" }
                ]
            }"#,
        )
        .unwrap();

        let provider = StaticAccessProvider::load(&path).await.unwrap();
        let access = provider.document(&DocumentId::new("d1")).unwrap();
        assert_eq!(access.sharing, SharingPolicy::View);
        assert!(access.collaborators.is_empty());
    }
}
