/// Document persistence seam. The engine only decides *when* to save.
use async_trait::async_trait;
use mindmap::{RawDocument, Snapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

use crate::{CollaborationError, DocumentId, Result};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stored content as loose JSON, or `None` for a document with no
    /// content yet. The caller runs it through the reconciler.
    async fn load(&self, id: &DocumentId) -> Result<Option<RawDocument>>;

    async fn save(&self, id: &DocumentId, snapshot: &Snapshot) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentId, RawDocument>>,
    saves: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: DocumentId, raw: RawDocument) {
        self.documents.lock().insert(id, raw);
    }

    pub fn get(&self, id: &DocumentId) -> Option<RawDocument> {
        self.documents.lock().get(id).cloned()
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, id: &DocumentId) -> Result<Option<RawDocument>> {
        Ok(self.get(id))
    }

    async fn save(&self, id: &DocumentId, snapshot: &Snapshot) -> Result<()> {
        self.documents
            .lock()
            .insert(id.clone(), RawDocument::from(snapshot));
        *self.saves.lock() += 1;
        Ok(())
    }
}

/// One pretty-printed JSON file per document.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: &DocumentId) -> PathBuf {
        let mut name = String::with_capacity(id.0.len() + 5);
        for c in id.0.chars() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                name.push(c);
            } else {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    name.push_str(&format!("%{byte:02X}"));
                }
            }
        }
        name.push_str(".json");
        self.dir.join(name)
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn load(&self, id: &DocumentId) -> Result<Option<RawDocument>> {
        let path = self.path_for(id);
        if !fs::try_exists(&path)
            .await
            .map_err(|e| CollaborationError::Store(format!("failed to stat {}: {e}", path.display())))?
        {
            return Ok(None);
        }

        let json = fs::read_to_string(&path)
            .await
            .map_err(|e| CollaborationError::Store(format!("failed to read {}: {e}", path.display())))?;
        let raw: RawDocument = serde_json::from_str(&json)?;
        Ok(Some(raw))
    }

    async fn save(&self, id: &DocumentId, snapshot: &Snapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CollaborationError::Store(format!("failed to create store directory: {e}")))?;

        let path = self.path_for(id);
        let json = serde_json::to_string_pretty(snapshot)?;

        // Write then rename so readers never see a torn file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| CollaborationError::Store(format!("failed to write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| CollaborationError::Store(format!("failed to replace {}: {e}", path.display())))?;

        tracing::debug!(document = %id, path = %path.display(), "document saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindmap::{normalize, Document, Edge, Node};

    fn sample() -> Document {
        let mut doc = Document::new();
        doc.nodes.push(Node::new("a", "Root"));
        doc.nodes.push(Node::new("b", "Leaf"));
        doc.edges.push(Edge::new("e1", "a", "b"));
        normalize(RawDocument::from(&doc)).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_counts_saves() {
        let store = MemoryStore::new();
        let id = DocumentId::new("d1");
        assert!(store.load(&id).await.unwrap().is_none());

        store.save(&id, &sample()).await.unwrap();
        let loaded = normalize(store.load(&id).await.unwrap().unwrap()).unwrap();
        assert_eq!(loaded, sample());
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_seeded_memory_store_loads() {
        let store = MemoryStore::new();
        let id = DocumentId::new("seeded");
        store.insert(id.clone(), RawDocument::from(&sample()));

        let loaded = tokio_test::assert_ok!(tokio_test::block_on(store.load(&id)));
        assert_eq!(loaded.map(|raw| raw.nodes.len()), Some(2));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("docs"));
        let id = DocumentId::new("team/doc 1");

        assert!(store.load(&id).await.unwrap().is_none());
        store.save(&id, &sample()).await.unwrap();

        let path = store.path_for(&id);
        assert!(path.starts_with(dir.path().join("docs")));
        assert_eq!(path.file_name().unwrap(), "team%2Fdoc%201.json");

        let loaded = normalize(store.load(&id).await.unwrap().unwrap()).unwrap();
        assert_eq!(loaded, sample());
    }

    #[tokio::test]
    async fn test_file_store_accepts_legacy_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let id = DocumentId::new("legacy");
        std::fs::write(
            store.path_for(&id),
            r#"{ "nodes": [ { "id": "a", "type": "circle" } ], "edges": [ { "source": "a", "target": "ghost" } ] }"#,
        )
        .unwrap();

        let doc = normalize(store.load(&id).await.unwrap().unwrap()).unwrap();
        assert_eq!(doc.nodes.len(), 1);
        assert!(doc.edges.is_empty());
    }
}
