use crate::error::{KnowledgeError, Result};
use crate::models::{
    CopyDataTask, Document, DocumentStatus, Knowledge, Review, Slice, SliceStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

/// Persistence of knowledge metadata rows.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn create_knowledge(&self, knowledge: &Knowledge) -> Result<()>;
    async fn get_knowledge(&self, id: i64) -> Result<Option<Knowledge>>;
    async fn mget_knowledge(&self, ids: &[i64]) -> Result<Vec<Knowledge>>;
    async fn update_knowledge(&self, knowledge: &Knowledge) -> Result<()>;
    async fn delete_knowledge(&self, id: i64) -> Result<()>;

    /// Creates every document and touches the parent knowledge in one step.
    async fn create_documents(&self, documents: &[Document]) -> Result<()>;
    async fn get_document(&self, id: i64) -> Result<Option<Document>>;
    async fn mget_documents(&self, ids: &[i64]) -> Result<Vec<Document>>;
    async fn list_documents(&self, knowledge_id: i64) -> Result<Vec<Document>>;
    async fn update_document(&self, document: &Document) -> Result<()>;
    async fn update_document_status(&self, id: i64, status: DocumentStatus, message: &str) -> Result<()>;
    /// Recomputes slice count and character count from the stored slices.
    async fn update_document_slice_info(&self, id: i64) -> Result<()>;
    async fn delete_document(&self, id: i64) -> Result<()>;

    async fn batch_create_slices(&self, slices: &[Slice]) -> Result<()>;
    async fn get_slice(&self, id: i64) -> Result<Option<Slice>>;
    async fn mget_slices(&self, ids: &[i64]) -> Result<Vec<Slice>>;
    async fn get_document_slice_ids(&self, document_ids: &[i64]) -> Result<Vec<i64>>;
    /// Slices of one document ordered by sequence.
    async fn list_slices(&self, document_id: i64) -> Result<Vec<Slice>>;
    async fn update_slice(&self, slice: &Slice) -> Result<()>;
    async fn delete_slices(&self, ids: &[i64]) -> Result<()>;
    async fn delete_slices_by_document(&self, document_id: i64) -> Result<Vec<i64>>;
    async fn batch_set_slice_status(&self, ids: &[i64], status: SliceStatus, message: &str) -> Result<()>;
    async fn last_sequence(&self, document_id: i64) -> Result<Option<f64>>;
    async fn increment_hit_count(&self, ids: &[i64]) -> Result<()>;

    async fn create_review(&self, review: &Review) -> Result<()>;
    async fn get_review(&self, id: i64) -> Result<Option<Review>>;
    async fn update_review(&self, review: &Review) -> Result<()>;

    /// Returns the task stored under `(task_key, origin_id)` and whether this call created it.
    async fn create_copy_task_if_absent(&self, task: &CopyDataTask) -> Result<(CopyDataTask, bool)>;
    async fn update_copy_task(&self, task: &CopyDataTask) -> Result<()>;
}

#[derive(Default)]
struct MetaTables {
    knowledge: BTreeMap<i64, Knowledge>,
    documents: BTreeMap<i64, Document>,
    slices: BTreeMap<i64, Slice>,
    reviews: BTreeMap<i64, Review>,
    copy_tasks: HashMap<(String, i64), CopyDataTask>,
}

#[derive(Default)]
pub struct MemoryMetaStore {
    tables: Mutex<MetaTables>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_sequence(mut slices: Vec<Slice>) -> Vec<Slice> {
    slices.sort_by(|left, right| {
        left.sequence
            .total_cmp(&right.sequence)
            .then_with(|| left.id.cmp(&right.id))
    });
    slices
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn create_knowledge(&self, knowledge: &Knowledge) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.knowledge.contains_key(&knowledge.id) {
            return Err(KnowledgeError::InvalidParameter(format!(
                "knowledge {} already exists",
                knowledge.id
            )));
        }
        tables.knowledge.insert(knowledge.id, knowledge.clone());
        Ok(())
    }

    async fn get_knowledge(&self, id: i64) -> Result<Option<Knowledge>> {
        Ok(self.tables.lock().await.knowledge.get(&id).cloned())
    }

    async fn mget_knowledge(&self, ids: &[i64]) -> Result<Vec<Knowledge>> {
        let tables = self.tables.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.knowledge.get(id).cloned())
            .collect())
    }

    async fn update_knowledge(&self, knowledge: &Knowledge) -> Result<()> {
        let mut tables = self.tables.lock().await;
        match tables.knowledge.get_mut(&knowledge.id) {
            Some(existing) => {
                *existing = knowledge.clone();
                Ok(())
            }
            None => Err(KnowledgeError::not_found("knowledge", knowledge.id)),
        }
    }

    async fn delete_knowledge(&self, id: i64) -> Result<()> {
        self.tables.lock().await.knowledge.remove(&id);
        Ok(())
    }

    async fn create_documents(&self, documents: &[Document]) -> Result<()> {
        let mut tables = self.tables.lock().await;
        for document in documents {
            if !tables.knowledge.contains_key(&document.knowledge_id) {
                return Err(KnowledgeError::not_found("knowledge", document.knowledge_id));
            }
            if tables.documents.contains_key(&document.id) {
                return Err(KnowledgeError::InvalidParameter(format!(
                    "document {} already exists",
                    document.id
                )));
            }
        }

        let now = Utc::now();
        for document in documents {
            tables.documents.insert(document.id, document.clone());
            if let Some(knowledge) = tables.knowledge.get_mut(&document.knowledge_id) {
                knowledge.updated_at = now;
            }
        }
        Ok(())
    }

    async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        Ok(self.tables.lock().await.documents.get(&id).cloned())
    }

    async fn mget_documents(&self, ids: &[i64]) -> Result<Vec<Document>> {
        let tables = self.tables.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.documents.get(id).cloned())
            .collect())
    }

    async fn list_documents(&self, knowledge_id: i64) -> Result<Vec<Document>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .documents
            .values()
            .filter(|document| document.knowledge_id == knowledge_id)
            .cloned()
            .collect())
    }

    async fn update_document(&self, document: &Document) -> Result<()> {
        let mut tables = self.tables.lock().await;
        match tables.documents.get_mut(&document.id) {
            Some(existing) => {
                *existing = document.clone();
                existing.updated_at = Utc::now();
                Ok(())
            }
            None => Err(KnowledgeError::not_found("document", document.id)),
        }
    }

    async fn update_document_status(&self, id: i64, status: DocumentStatus, message: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let document = tables
            .documents
            .get_mut(&id)
            .ok_or_else(|| KnowledgeError::not_found("document", id))?;
        document.status = status;
        document.status_msg = message.to_string();
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn update_document_slice_info(&self, id: i64) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let (count, chars) = tables
            .slices
            .values()
            .filter(|slice| slice.document_id == id)
            .fold((0i64, 0i64), |(count, chars), slice| {
                (count + 1, chars + slice.content.chars().count() as i64)
            });
        let document = tables
            .documents
            .get_mut(&id)
            .ok_or_else(|| KnowledgeError::not_found("document", id))?;
        document.slice_count = count;
        document.char_count = chars;
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_document(&self, id: i64) -> Result<()> {
        self.tables.lock().await.documents.remove(&id);
        Ok(())
    }

    async fn batch_create_slices(&self, slices: &[Slice]) -> Result<()> {
        let mut tables = self.tables.lock().await;
        for slice in slices {
            let mut stored = slice.clone();
            stored.table_row = None;
            tables.slices.insert(stored.id, stored);
        }
        Ok(())
    }

    async fn get_slice(&self, id: i64) -> Result<Option<Slice>> {
        Ok(self.tables.lock().await.slices.get(&id).cloned())
    }

    async fn mget_slices(&self, ids: &[i64]) -> Result<Vec<Slice>> {
        let tables = self.tables.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.slices.get(id).cloned())
            .collect())
    }

    async fn get_document_slice_ids(&self, document_ids: &[i64]) -> Result<Vec<i64>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .slices
            .values()
            .filter(|slice| document_ids.contains(&slice.document_id))
            .map(|slice| slice.id)
            .collect())
    }

    async fn list_slices(&self, document_id: i64) -> Result<Vec<Slice>> {
        let tables = self.tables.lock().await;
        Ok(sorted_by_sequence(
            tables
                .slices
                .values()
                .filter(|slice| slice.document_id == document_id)
                .cloned()
                .collect(),
        ))
    }

    async fn update_slice(&self, slice: &Slice) -> Result<()> {
        let mut tables = self.tables.lock().await;
        match tables.slices.get_mut(&slice.id) {
            Some(existing) => {
                *existing = slice.clone();
                existing.table_row = None;
                existing.updated_at = Utc::now();
                Ok(())
            }
            None => Err(KnowledgeError::not_found("slice", slice.id)),
        }
    }

    async fn delete_slices(&self, ids: &[i64]) -> Result<()> {
        let mut tables = self.tables.lock().await;
        for id in ids {
            tables.slices.remove(id);
        }
        Ok(())
    }

    async fn delete_slices_by_document(&self, document_id: i64) -> Result<Vec<i64>> {
        let mut tables = self.tables.lock().await;
        let ids: Vec<i64> = tables
            .slices
            .values()
            .filter(|slice| slice.document_id == document_id)
            .map(|slice| slice.id)
            .collect();
        for id in &ids {
            tables.slices.remove(id);
        }
        Ok(ids)
    }

    async fn batch_set_slice_status(&self, ids: &[i64], status: SliceStatus, message: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        for id in ids {
            if let Some(slice) = tables.slices.get_mut(id) {
                slice.status = status;
                slice.status_msg = message.to_string();
                slice.updated_at = now;
            }
        }
        Ok(())
    }

    async fn last_sequence(&self, document_id: i64) -> Result<Option<f64>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .slices
            .values()
            .filter(|slice| slice.document_id == document_id)
            .map(|slice| slice.sequence)
            .max_by(f64::total_cmp))
    }

    async fn increment_hit_count(&self, ids: &[i64]) -> Result<()> {
        let mut tables = self.tables.lock().await;
        for id in ids {
            if let Some(slice) = tables.slices.get_mut(id) {
                slice.hit += 1;
            }
        }
        Ok(())
    }

    async fn create_review(&self, review: &Review) -> Result<()> {
        self.tables.lock().await.reviews.insert(review.id, review.clone());
        Ok(())
    }

    async fn get_review(&self, id: i64) -> Result<Option<Review>> {
        Ok(self.tables.lock().await.reviews.get(&id).cloned())
    }

    async fn update_review(&self, review: &Review) -> Result<()> {
        let mut tables = self.tables.lock().await;
        match tables.reviews.get_mut(&review.id) {
            Some(existing) => {
                *existing = review.clone();
                Ok(())
            }
            None => Err(KnowledgeError::not_found("review", review.id)),
        }
    }

    async fn create_copy_task_if_absent(&self, task: &CopyDataTask) -> Result<(CopyDataTask, bool)> {
        let mut tables = self.tables.lock().await;
        let key = (task.task_key.clone(), task.origin_id);
        if let Some(existing) = tables.copy_tasks.get(&key) {
            return Ok((existing.clone(), false));
        }
        tables.copy_tasks.insert(key, task.clone());
        Ok((task.clone(), true))
    }

    async fn update_copy_task(&self, task: &CopyDataTask) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let key = (task.task_key.clone(), task.origin_id);
        match tables.copy_tasks.get_mut(&key) {
            Some(existing) => {
                *existing = task.clone();
                existing.updated_at = Utc::now();
                Ok(())
            }
            None => Err(KnowledgeError::InvalidParameter(format!(
                "copy task {} for origin {} does not exist",
                task.task_key, task.origin_id
            ))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{document, knowledge, slice};
    use super::*;
    use crate::models::{CopyTaskStatus, FileType, FormatType};

    #[tokio::test]
    async fn documents_require_their_knowledge() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryMetaStore::new();
        let orphan = document(1, 99, FileType::Txt);
        assert!(matches!(
            store.create_documents(&[orphan]).await,
            Err(KnowledgeError::NotFound { entity: "knowledge", id: 99 })
        ));

        store.create_knowledge(&knowledge(99, FormatType::Text)).await?;
        store
            .create_documents(&[document(1, 99, FileType::Txt), document(2, 99, FileType::Txt)])
            .await?;
        assert_eq!(store.list_documents(99).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn slice_bookkeeping_follows_sequence() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryMetaStore::new();
        store.create_knowledge(&knowledge(1, FormatType::Text)).await?;
        let doc = document(10, 1, FileType::Txt);
        store.create_documents(&[doc.clone()]).await?;
        store
            .batch_create_slices(&[
                slice(3, &doc, 2.0, "second"),
                slice(2, &doc, 0.5, "before"),
                slice(1, &doc, 1.0, "first"),
            ])
            .await?;

        let ordered: Vec<_> = store.list_slices(10).await?.iter().map(|s| s.id).collect();
        assert_eq!(ordered, vec![2, 1, 3]);
        assert_eq!(store.last_sequence(10).await?, Some(2.0));

        store.update_document_slice_info(10).await?;
        let stored = store.get_document(10).await?.ok_or("document vanished")?;
        assert_eq!(stored.slice_count, 3);
        assert_eq!(stored.char_count, ("second".len() + "before".len() + "first".len()) as i64);

        store.increment_hit_count(&[1, 1]).await?;
        assert_eq!(store.get_slice(1).await?.map(|s| s.hit), Some(2));
        assert_eq!(store.delete_slices_by_document(10).await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn copy_task_is_created_once() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryMetaStore::new();
        let now = Utc::now();
        let task = CopyDataTask {
            task_key: "job-1".to_string(),
            origin_id: 5,
            target_id: 6,
            status: CopyTaskStatus::Create,
            error_msg: String::new(),
            created_at: now,
            updated_at: now,
        };
        let (_, created) = store.create_copy_task_if_absent(&task).await?;
        assert!(created);

        let replay = CopyDataTask { target_id: 7, ..task.clone() };
        let (existing, created) = store.create_copy_task_if_absent(&replay).await?;
        assert!(!created);
        assert_eq!(existing.target_id, 6);
        Ok(())
    }
}
