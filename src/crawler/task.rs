use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attribute keys copied from a parent task onto the tasks it produces
pub const PROPAGATED_ATTRIBUTES: &[&str] = &[ATTR_ONLY_COVER_IMAGE];

/// Only the cover image of a novel is wanted, its chapters are not crawled
pub const ATTR_ONLY_COVER_IMAGE: &str = "onlyCoverImage";

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    Processing,
    Finished,
    Failed,
    RetryFailed,
}

/// The three stages a task can belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    CatalogPage,
    Novel,
    Chapter,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::CatalogPage, TaskKind::Novel, TaskKind::Chapter];

    /// Key of this stage inside a site's crawler settings
    pub fn stage_name(&self) -> &'static str {
        match self {
            TaskKind::CatalogPage => "catalogPage",
            TaskKind::Novel => "novel",
            TaskKind::Chapter => "chapter",
        }
    }

    /// Store collection holding tasks of this kind
    pub fn collection(&self) -> &'static str {
        match self {
            TaskKind::CatalogPage => "catalogPageTask",
            TaskKind::Novel => "novelTask",
            TaskKind::Chapter => "chapterTask",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stage_name())
    }
}

/// Status, retry counter and operation dates shared by every task variant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    #[serde(default)]
    pub status: TaskStatus,

    #[serde(default)]
    pub retries: u32,

    /// Set once, on the first successful completion
    #[serde(default)]
    pub created_date: Option<DateTime<Utc>>,

    /// Set on every re-processing of a task that was already stored
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// A page of a catalog listing novels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPageTask {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<ObjectId>,

    pub url: String,

    #[serde(default)]
    pub site_name: String,

    #[serde(default)]
    pub attributes: HashMap<String, Value>,

    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}

/// A novel (or comic, gallery...) page discovered on a catalog page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NovelTask {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<ObjectId>,

    pub url: String,

    #[serde(default)]
    pub has_chapters: bool,

    #[serde(default)]
    pub site_name: String,

    #[serde(default)]
    pub attributes: HashMap<String, Value>,

    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}

/// A single chapter of a novel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterTask {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub order: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub novel_id: Option<ObjectId>,

    pub url: String,

    #[serde(default)]
    pub site_name: String,

    #[serde(default)]
    pub attributes: HashMap<String, Value>,

    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}

/// Capability every task variant exposes to the dedup check
pub trait Resource {
    fn resource_type(&self) -> TaskKind;
    fn url(&self) -> &str;
    fn status(&self) -> TaskStatus;
}

/// A task variant that flows through one pipeline stage
pub trait StageTask:
    Resource + Serialize + DeserializeOwned + Clone + Send + Sync + fmt::Debug + 'static
{
    const KIND: TaskKind;

    fn id(&self) -> Option<ObjectId>;
    fn set_id(&mut self, id: ObjectId);
    fn site_name(&self) -> &str;
    fn attributes(&self) -> &HashMap<String, Value>;
    fn attributes_mut(&mut self) -> &mut HashMap<String, Value>;
    fn lifecycle(&self) -> &Lifecycle;
    fn lifecycle_mut(&mut self) -> &mut Lifecycle;

    /// Copy the persisted state of `existing` onto this freshly decoded task
    fn merge_persisted(&mut self, existing: &Self);

    fn into_task(self) -> Task;
    fn from_task(task: Task) -> Option<Self>;
}

/// Any task, tagged with its stage
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    CatalogPage(CatalogPageTask),
    Novel(NovelTask),
    Chapter(ChapterTask),
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::CatalogPage(_) => TaskKind::CatalogPage,
            Task::Novel(_) => TaskKind::Novel,
            Task::Chapter(_) => TaskKind::Chapter,
        }
    }

    pub fn id(&self) -> Option<ObjectId> {
        match self {
            Task::CatalogPage(t) => t.id,
            Task::Novel(t) => t.id,
            Task::Chapter(t) => t.id,
        }
    }

    /// Serialize the inner task for storage or transport
    pub fn to_json_value(&self) -> serde_json::Result<Value> {
        match self {
            Task::CatalogPage(t) => serde_json::to_value(t),
            Task::Novel(t) => serde_json::to_value(t),
            Task::Chapter(t) => serde_json::to_value(t),
        }
    }
}

impl Resource for Task {
    fn resource_type(&self) -> TaskKind {
        self.kind()
    }

    fn url(&self) -> &str {
        match self {
            Task::CatalogPage(t) => &t.url,
            Task::Novel(t) => &t.url,
            Task::Chapter(t) => &t.url,
        }
    }

    fn status(&self) -> TaskStatus {
        match self {
            Task::CatalogPage(t) => t.lifecycle.status,
            Task::Novel(t) => t.lifecycle.status,
            Task::Chapter(t) => t.lifecycle.status,
        }
    }
}

macro_rules! impl_stage_task {
    ($ty:ident, $variant:ident) => {
        impl Resource for $ty {
            fn resource_type(&self) -> TaskKind {
                TaskKind::$variant
            }

            fn url(&self) -> &str {
                &self.url
            }

            fn status(&self) -> TaskStatus {
                self.lifecycle.status
            }
        }

        impl StageTask for $ty {
            const KIND: TaskKind = TaskKind::$variant;

            fn id(&self) -> Option<ObjectId> {
                self.id
            }

            fn set_id(&mut self, id: ObjectId) {
                self.id = Some(id);
            }

            fn site_name(&self) -> &str {
                &self.site_name
            }

            fn attributes(&self) -> &HashMap<String, Value> {
                &self.attributes
            }

            fn attributes_mut(&mut self) -> &mut HashMap<String, Value> {
                &mut self.attributes
            }

            fn lifecycle(&self) -> &Lifecycle {
                &self.lifecycle
            }

            fn lifecycle_mut(&mut self) -> &mut Lifecycle {
                &mut self.lifecycle
            }

            fn merge_persisted(&mut self, existing: &Self) {
                $ty::merge_from_stored(self, existing)
            }

            fn into_task(self) -> Task {
                Task::$variant(self)
            }

            fn from_task(task: Task) -> Option<Self> {
                match task {
                    Task::$variant(t) => Some(t),
                    _ => None,
                }
            }
        }
    };
}

impl_stage_task!(CatalogPageTask, CatalogPage);
impl_stage_task!(NovelTask, Novel);
impl_stage_task!(ChapterTask, Chapter);

/// Attributes already on the incoming task win over the stored ones
fn merge_attributes(into: &mut HashMap<String, Value>, existing: &HashMap<String, Value>) {
    for (key, value) in existing {
        into.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

impl CatalogPageTask {
    fn merge_from_stored(&mut self, existing: &Self) {
        self.id = existing.id;
        if self.catalog_id.is_none() {
            self.catalog_id = existing.catalog_id;
        }
        if self.site_name.is_empty() {
            self.site_name = existing.site_name.clone();
        }
        merge_attributes(&mut self.attributes, &existing.attributes);
        self.lifecycle = existing.lifecycle.clone();
    }
}

impl NovelTask {
    fn merge_from_stored(&mut self, existing: &Self) {
        self.id = existing.id;
        if self.name.is_empty() {
            self.name = existing.name.clone();
        }
        if self.catalog_id.is_none() {
            self.catalog_id = existing.catalog_id;
        }
        self.has_chapters = self.has_chapters || existing.has_chapters;
        if self.site_name.is_empty() {
            self.site_name = existing.site_name.clone();
        }
        merge_attributes(&mut self.attributes, &existing.attributes);
        self.lifecycle = existing.lifecycle.clone();
    }
}

impl ChapterTask {
    fn merge_from_stored(&mut self, existing: &Self) {
        self.id = existing.id;
        if self.name.is_empty() {
            self.name = existing.name.clone();
        }
        if self.order == 0 {
            self.order = existing.order;
        }
        if self.novel_id.is_none() {
            self.novel_id = existing.novel_id;
        }
        if self.site_name.is_empty() {
            self.site_name = existing.site_name.clone();
        }
        merge_attributes(&mut self.attributes, &existing.attributes);
        self.lifecycle = existing.lifecycle.clone();
    }
}

/// Move a task to its post-crawl state.
///
/// `existing` is the record stored before this pass, if any. `CreatedDate` is
/// only ever written for a first successful completion and `LastUpdated` only
/// for tasks that were already stored.
pub fn apply_outcome<T: StageTask>(task: &mut T, existing: Option<&T>, succeeded: bool, now: DateTime<Utc>) {
    match (existing, succeeded) {
        (None, true) => {
            let lifecycle = task.lifecycle_mut();
            lifecycle.status = TaskStatus::Finished;
            lifecycle.created_date = Some(now);
            lifecycle.last_updated = None;
        }
        (None, false) => {
            let lifecycle = task.lifecycle_mut();
            lifecycle.status = TaskStatus::Failed;
            lifecycle.created_date = None;
            lifecycle.last_updated = None;
        }
        (Some(existing), true) => {
            if let Some(id) = existing.id() {
                task.set_id(id);
            }
            let created = existing.lifecycle().created_date;
            let retries = existing.lifecycle().retries;
            let lifecycle = task.lifecycle_mut();
            lifecycle.status = TaskStatus::Finished;
            lifecycle.retries = retries;
            lifecycle.created_date = created.or(Some(now));
            lifecycle.last_updated = Some(now);
        }
        (Some(existing), false) => {
            task.merge_persisted(existing);
            let lifecycle = task.lifecycle_mut();
            match lifecycle.status {
                TaskStatus::Failed | TaskStatus::RetryFailed => {
                    lifecycle.retries += 1;
                    lifecycle.status = TaskStatus::RetryFailed;
                }
                TaskStatus::Finished => {}
                TaskStatus::NotStarted | TaskStatus::Processing => {
                    lifecycle.status = TaskStatus::Failed;
                }
            }
            lifecycle.last_updated = Some(now);
        }
    }
}

/// Copy propagated attributes from `parent` onto each child lacking them
pub fn propagate_attributes<T: StageTask>(parent: &HashMap<String, Value>, children: &mut [T]) {
    for key in PROPAGATED_ATTRIBUTES {
        if let Some(value) = parent.get(*key) {
            for child in children.iter_mut() {
                child
                    .attributes_mut()
                    .entry((*key).to_string())
                    .or_insert_with(|| value.clone());
            }
        }
    }
}

/// Whether the task asks for its cover image only
pub fn only_cover_image(attributes: &HashMap<String, Value>) -> bool {
    attributes
        .get(ATTR_ONLY_COVER_IMAGE)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored_novel(status: TaskStatus, retries: u32) -> NovelTask {
        NovelTask {
            id: Some(ObjectId::new()),
            name: "stored".to_string(),
            url: "https://example.com/novel/1".to_string(),
            site_name: "nsf".to_string(),
            lifecycle: Lifecycle {
                status,
                retries,
                created_date: Some(Utc::now()),
                last_updated: None,
            },
            ..Default::default()
        }
    }

    fn incoming_novel() -> NovelTask {
        NovelTask {
            url: "https://example.com/novel/1".to_string(),
            site_name: "nsf".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_success_sets_created_date_only() {
        let mut task = incoming_novel();
        apply_outcome(&mut task, None, true, Utc::now());

        assert_eq!(task.lifecycle.status, TaskStatus::Finished);
        assert!(task.lifecycle.created_date.is_some());
        assert!(task.lifecycle.last_updated.is_none());
    }

    #[test]
    fn test_first_failure_sets_no_dates() {
        let mut task = incoming_novel();
        apply_outcome(&mut task, None, false, Utc::now());

        assert_eq!(task.lifecycle.status, TaskStatus::Failed);
        assert!(task.lifecycle.created_date.is_none());
        assert!(task.lifecycle.last_updated.is_none());
        assert_eq!(task.lifecycle.retries, 0);
    }

    #[test]
    fn test_repeated_failure_increments_retries() {
        for previous in [TaskStatus::Failed, TaskStatus::RetryFailed] {
            let existing = stored_novel(previous, 2);
            let mut task = incoming_novel();
            apply_outcome(&mut task, Some(&existing), false, Utc::now());

            assert_eq!(task.lifecycle.status, TaskStatus::RetryFailed);
            assert_eq!(task.lifecycle.retries, 3);
            assert_eq!(task.id, existing.id);
            assert_eq!(task.name, "stored");
            assert!(task.lifecycle.last_updated.is_some());
        }
    }

    #[test]
    fn test_failure_never_demotes_finished_record() {
        let existing = stored_novel(TaskStatus::Finished, 0);
        let mut task = incoming_novel();
        apply_outcome(&mut task, Some(&existing), false, Utc::now());

        assert_eq!(task.lifecycle.status, TaskStatus::Finished);
        assert_eq!(task.lifecycle.retries, 0);
        assert_eq!(task.lifecycle.created_date, existing.lifecycle.created_date);
    }

    #[test]
    fn test_success_on_existing_keeps_identity_and_created_date() {
        let existing = stored_novel(TaskStatus::Failed, 1);
        let mut task = incoming_novel();
        apply_outcome(&mut task, Some(&existing), true, Utc::now());

        assert_eq!(task.lifecycle.status, TaskStatus::Finished);
        assert_eq!(task.id, existing.id);
        assert_eq!(task.lifecycle.created_date, existing.lifecycle.created_date);
        assert!(task.lifecycle.last_updated.is_some());
    }

    #[test]
    fn test_merge_keeps_incoming_attributes() {
        let mut existing = stored_novel(TaskStatus::Failed, 0);
        existing.attributes.insert("author".to_string(), json!("old"));
        existing.attributes.insert(ATTR_ONLY_COVER_IMAGE.to_string(), json!(false));

        let mut task = incoming_novel();
        task.attributes.insert(ATTR_ONLY_COVER_IMAGE.to_string(), json!(true));
        task.merge_persisted(&existing);

        assert_eq!(task.attributes["author"], json!("old"));
        assert_eq!(task.attributes[ATTR_ONLY_COVER_IMAGE], json!(true));
    }

    #[test]
    fn test_propagate_attributes_fills_missing_keys_only() {
        let mut parent = HashMap::new();
        parent.insert(ATTR_ONLY_COVER_IMAGE.to_string(), json!(true));
        parent.insert("unrelated".to_string(), json!(1));

        let mut children = vec![incoming_novel(), incoming_novel()];
        children[1]
            .attributes
            .insert(ATTR_ONLY_COVER_IMAGE.to_string(), json!(false));
        propagate_attributes(&parent, &mut children);

        assert_eq!(children[0].attributes[ATTR_ONLY_COVER_IMAGE], json!(true));
        assert_eq!(children[1].attributes[ATTR_ONLY_COVER_IMAGE], json!(false));
        assert!(!children[0].attributes.contains_key("unrelated"));
    }

    #[test]
    fn test_wire_format() {
        let task = CatalogPageTask {
            url: "https://example.com/list?page=2".to_string(),
            site_name: "nsf".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&task).unwrap();

        assert_eq!(json["siteName"], "nsf");
        assert_eq!(json["status"], "notStarted");
        assert!(json.get("_id").is_none());

        let decoded: CatalogPageTask =
            serde_json::from_str(r#"{"url":"https://example.com","siteName":"nsf","status":"retryFailed","retries":2}"#)
                .unwrap();
        assert_eq!(decoded.lifecycle.status, TaskStatus::RetryFailed);
        assert_eq!(decoded.lifecycle.retries, 2);
    }
}
