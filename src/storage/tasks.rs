use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Document};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, info, warn};

use crate::cli::config::StorageSettings;
use crate::crawler::task::{CatalogPageTask, ChapterTask, NovelTask, Resource, Task, TaskKind};

/// Equality lookups supported by the task store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFilter {
    Url(String),
}

impl TaskFilter {
    fn to_document(&self) -> Document {
        match self {
            TaskFilter::Url(url) => doc! { "url": url },
        }
    }
}

/// Persistent storage for the three task collections
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Find one task matching `filter`, `None` when nothing matches
    async fn find_one_by_filter(&self, kind: TaskKind, filter: &TaskFilter) -> Result<Option<Task>>;

    /// Insert a task without identity, update by id otherwise
    async fn save(&self, task: &Task) -> Result<ObjectId>;
}

/// MongoDB implementation of TaskStore
pub struct MongoTaskStore {
    /// MongoDB database
    database: Database,
}

impl MongoTaskStore {
    /// Connect and verify the database is reachable
    pub async fn new(settings: &StorageSettings) -> Result<Self> {
        let client_options = ClientOptions::parse(&settings.mongo_url)
            .await
            .context(format!("Failed to parse MongoDB connection string: {}", settings.mongo_url))?;

        let client = Client::with_options(client_options)
            .context("Failed to create MongoDB client")?;

        let database = client.database(&settings.database_name);

        database.list_collection_names(None)
            .await
            .context("Failed to connect to MongoDB")?;

        debug!("Connected to MongoDB database: {}", settings.database_name);

        Ok(Self { database })
    }

    fn collection(&self, kind: TaskKind) -> Collection<Document> {
        self.database.collection(kind.collection())
    }

    /// Create the url index of every task collection plus the parent linkage indexes
    pub async fn ensure_indexes(&self) {
        info!("Ensuring task collection indexes");

        let mut indexes: Vec<_> = TaskKind::ALL
            .into_iter()
            .map(|kind| (kind, doc! { "url": -1 }))
            .collect();
        indexes.push((TaskKind::Novel, doc! { "catalogId": 1 }));
        indexes.push((TaskKind::Chapter, doc! { "novelId": 1 }));

        join_all(indexes.into_iter().map(|(kind, keys)| self.ensure_index(kind, keys))).await;
    }

    async fn ensure_index(&self, kind: TaskKind, keys: Document) {
        let model = IndexModel::builder()
            .keys(keys.clone())
            .options(IndexOptions::builder().build())
            .build();

        if let Err(e) = self.collection(kind).create_index(model, None).await {
            warn!("Failed to ensure index {:?} on {}: {}", keys, kind.collection(), e);
        }
    }
}

fn decode(kind: TaskKind, doc: Document) -> Result<Task> {
    let task = match kind {
        TaskKind::CatalogPage => Task::CatalogPage(
            mongodb::bson::from_document::<CatalogPageTask>(doc)
                .context("Failed to convert BSON document to CatalogPageTask")?,
        ),
        TaskKind::Novel => Task::Novel(
            mongodb::bson::from_document::<NovelTask>(doc)
                .context("Failed to convert BSON document to NovelTask")?,
        ),
        TaskKind::Chapter => Task::Chapter(
            mongodb::bson::from_document::<ChapterTask>(doc)
                .context("Failed to convert BSON document to ChapterTask")?,
        ),
    };
    Ok(task)
}

fn encode(task: &Task) -> Result<Document> {
    let doc = match task {
        Task::CatalogPage(t) => mongodb::bson::to_document(t),
        Task::Novel(t) => mongodb::bson::to_document(t),
        Task::Chapter(t) => mongodb::bson::to_document(t),
    };
    doc.context("Failed to convert task to BSON document")
}

#[async_trait]
impl TaskStore for MongoTaskStore {
    async fn find_one_by_filter(&self, kind: TaskKind, filter: &TaskFilter) -> Result<Option<Task>> {
        let result = self.collection(kind)
            .find_one(filter.to_document(), None)
            .await
            .context(format!("Failed to query MongoDB collection {}", kind.collection()))?;

        result.map(|doc| decode(kind, doc)).transpose()
    }

    async fn save(&self, task: &Task) -> Result<ObjectId> {
        let kind = task.resource_type();
        let collection = self.collection(kind);
        let mut doc = encode(task)?;

        match task.id() {
            None => {
                let result = collection.insert_one(doc, None)
                    .await
                    .context("Failed to insert task into MongoDB")?;

                let id = result.inserted_id
                    .as_object_id()
                    .context("MongoDB returned a non ObjectId identity")?;
                debug!("Inserted {} task {}", kind, id);
                Ok(id)
            }
            Some(id) => {
                doc.remove("_id");
                collection.update_one(doc! { "_id": id }, doc! { "$set": doc }, None)
                    .await
                    .context("Failed to update task in MongoDB")?;

                debug!("Updated {} task {}", kind, id);
                Ok(id)
            }
        }
    }
}
