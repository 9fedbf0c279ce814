//! MongoDB Repositories
//!
//! One document per process version and one per instance, with history embedded
//! in the instance. A transition is a single `find_one_and_update` filtered on
//! `version`. Instance timestamps are stored as BSON dates so range scans and
//! sorts order by time.

use async_trait::async_trait;
use bson::DateTime as BsonDateTime;
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use super::{DefinitionRepository, InstanceRepository};
use crate::domain::{HistoryEntry, Process, ProcessInstance};
use crate::error::{Result, WorkflowError};

const DUPLICATE_KEY: i32 = 11000;

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(*err.kind, ErrorKind::Write(WriteFailure::WriteError(ref e)) if e.code == DUPLICATE_KEY)
}

fn unique_index(keys: mongodb::bson::Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

pub struct MongoDefinitionRepository {
    collection: Collection<Process>,
}

impl MongoDefinitionRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("wf_processes"),
        }
    }

    pub async fn init_indexes(&self) -> Result<()> {
        self.collection.create_index(unique_index(doc! { "id": 1 })).await?;
        self.collection
            .create_index(unique_index(doc! { "tenantId": 1, "code": 1, "version": 1 }))
            .await?;
        info!("Workflow process indexes ensured (mongo)");
        Ok(())
    }
}

#[async_trait]
impl DefinitionRepository for MongoDefinitionRepository {
    async fn insert(&self, process: &Process) -> Result<()> {
        match self.collection.insert_one(process).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(WorkflowError::duplicate(
                "Process",
                "version",
                format!("{}@{}", process.code, process.version),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Process>> {
        Ok(self
            .collection
            .find_one(doc! { "tenantId": tenant_id, "id": id })
            .await?)
    }

    async fn find_latest_by_code(&self, tenant_id: &str, code: &str) -> Result<Option<Process>> {
        Ok(self
            .collection
            .find_one(doc! { "tenantId": tenant_id, "code": code })
            .sort(doc! { "version": -1 })
            .await?)
    }

    async fn list_latest(&self, tenant_id: &str) -> Result<Vec<Process>> {
        let cursor = self
            .collection
            .find(doc! { "tenantId": tenant_id })
            .sort(doc! { "code": 1, "version": -1 })
            .await?;
        let all: Vec<Process> = cursor.try_collect().await?;

        let mut seen = HashSet::new();
        Ok(all
            .into_iter()
            .filter(|p| seen.insert(p.code.clone()))
            .collect())
    }
}

/// Stored form of [`HistoryEntry`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryDocument {
    sequence: i64,
    actor_id: String,
    from_state: String,
    to_state: String,
    action_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    assignee: Option<String>,
    #[serde(default)]
    escalated: bool,
    timestamp: BsonDateTime,
}

impl From<&HistoryEntry> for HistoryDocument {
    fn from(entry: &HistoryEntry) -> Self {
        Self {
            sequence: entry.sequence as i64,
            actor_id: entry.actor_id.clone(),
            from_state: entry.from_state.clone(),
            to_state: entry.to_state.clone(),
            action_name: entry.action_name.clone(),
            comment: entry.comment.clone(),
            assignee: entry.assignee.clone(),
            escalated: entry.escalated,
            timestamp: BsonDateTime::from_chrono(entry.timestamp),
        }
    }
}

impl From<HistoryDocument> for HistoryEntry {
    fn from(doc: HistoryDocument) -> Self {
        Self {
            sequence: doc.sequence as u64,
            actor_id: doc.actor_id,
            from_state: doc.from_state,
            to_state: doc.to_state,
            action_name: doc.action_name,
            comment: doc.comment,
            assignee: doc.assignee,
            escalated: doc.escalated,
            timestamp: doc.timestamp.to_chrono(),
        }
    }
}

/// Stored form of [`ProcessInstance`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceDocument {
    id: String,
    tenant_id: String,
    process_id: String,
    process_code: String,
    entity_id: String,
    current_state_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    assignee: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    escalated: bool,
    version: i64,
    #[serde(default)]
    history: Vec<HistoryDocument>,
    state_entered_at: BsonDateTime,
    created_at: BsonDateTime,
    updated_at: BsonDateTime,
}

impl From<&ProcessInstance> for InstanceDocument {
    fn from(instance: &ProcessInstance) -> Self {
        Self {
            id: instance.id.clone(),
            tenant_id: instance.tenant_id.clone(),
            process_id: instance.process_id.clone(),
            process_code: instance.process_code.clone(),
            entity_id: instance.entity_id.clone(),
            current_state_id: instance.current_state_id.clone(),
            assignee: instance.assignee.clone(),
            attributes: instance.attributes.clone(),
            escalated: instance.escalated,
            version: instance.version as i64,
            history: instance.history.iter().map(HistoryDocument::from).collect(),
            state_entered_at: BsonDateTime::from_chrono(instance.state_entered_at),
            created_at: BsonDateTime::from_chrono(instance.created_at),
            updated_at: BsonDateTime::from_chrono(instance.updated_at),
        }
    }
}

impl From<InstanceDocument> for ProcessInstance {
    fn from(doc: InstanceDocument) -> Self {
        Self {
            id: doc.id,
            tenant_id: doc.tenant_id,
            process_id: doc.process_id,
            process_code: doc.process_code,
            entity_id: doc.entity_id,
            current_state_id: doc.current_state_id,
            assignee: doc.assignee,
            attributes: doc.attributes,
            escalated: doc.escalated,
            version: doc.version as u64,
            history: doc.history.into_iter().map(HistoryEntry::from).collect(),
            state_entered_at: doc.state_entered_at.to_chrono(),
            created_at: doc.created_at.to_chrono(),
            updated_at: doc.updated_at.to_chrono(),
        }
    }
}

pub struct MongoInstanceRepository {
    collection: Collection<InstanceDocument>,
}

impl MongoInstanceRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("wf_instances"),
        }
    }

    pub async fn init_indexes(&self) -> Result<()> {
        self.collection.create_index(unique_index(doc! { "id": 1 })).await?;
        self.collection
            .create_index(unique_index(doc! { "tenantId": 1, "processCode": 1, "entityId": 1 }))
            .await?;
        self.collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "tenantId": 1, "processId": 1, "currentStateId": 1 })
                    .build(),
            )
            .await?;
        info!("Workflow instance indexes ensured (mongo)");
        Ok(())
    }

    async fn find_one(&self, filter: mongodb::bson::Document) -> Result<Option<ProcessInstance>> {
        Ok(self.collection.find_one(filter).await?.map(ProcessInstance::from))
    }

    async fn find_many(
        &self,
        filter: mongodb::bson::Document,
        sort: mongodb::bson::Document,
        limit: Option<(u32, u32)>,
    ) -> Result<Vec<ProcessInstance>> {
        let mut find = self.collection.find(filter).sort(sort);
        if let Some((limit, offset)) = limit {
            find = find.skip(u64::from(offset)).limit(i64::from(limit));
        }
        let docs: Vec<InstanceDocument> = find.await?.try_collect().await?;
        Ok(docs.into_iter().map(ProcessInstance::from).collect())
    }
}

#[async_trait]
impl InstanceRepository for MongoInstanceRepository {
    async fn insert(&self, instance: &ProcessInstance) -> Result<()> {
        match self.collection.insert_one(InstanceDocument::from(instance)).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(WorkflowError::duplicate_instance(
                &instance.tenant_id,
                &instance.process_id,
                &instance.entity_id,
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<ProcessInstance>> {
        self.find_one(doc! { "tenantId": tenant_id, "id": id }).await
    }

    async fn find_by_entity(
        &self,
        tenant_id: &str,
        process_id: &str,
        entity_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        self.find_one(doc! { "tenantId": tenant_id, "processId": process_id, "entityId": entity_id })
            .await
    }

    async fn find_by_process_code(
        &self,
        tenant_id: &str,
        process_code: &str,
        entity_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        self.find_one(doc! { "tenantId": tenant_id, "processCode": process_code, "entityId": entity_id })
            .await
    }

    async fn append_transition(
        &self,
        instance_id: &str,
        expected_version: u64,
        new_state: &str,
        mut entry: HistoryEntry,
    ) -> Result<ProcessInstance> {
        entry.sequence = expected_version + 1;
        entry.to_state = new_state.to_string();

        let at = BsonDateTime::from_chrono(entry.timestamp);
        let mut set = doc! {
            "currentStateId": new_state,
            "stateEnteredAt": at,
            "updatedAt": at,
        };
        if let Some(assignee) = &entry.assignee {
            set.insert("assignee", assignee.clone());
        }
        if entry.escalated {
            set.insert("escalated", true);
        }

        let updated = self
            .collection
            .find_one_and_update(
                doc! { "id": instance_id, "version": expected_version as i64 },
                doc! {
                    "$set": set,
                    "$inc": { "version": 1_i64 },
                    "$push": { "history": to_bson(&HistoryDocument::from(&entry))? },
                },
            )
            .return_document(ReturnDocument::After)
            .await?;

        match updated {
            Some(doc) => Ok(doc.into()),
            None => Err(match self.collection.find_one(doc! { "id": instance_id }).await? {
                Some(_) => WorkflowError::conflict(instance_id, expected_version),
                None => WorkflowError::not_found("ProcessInstance", instance_id),
            }),
        }
    }

    async fn find_in_state(
        &self,
        tenant_id: &str,
        process_id: &str,
        state_id: &str,
    ) -> Result<Vec<ProcessInstance>> {
        self.find_many(
            doc! { "tenantId": tenant_id, "processId": process_id, "currentStateId": state_id },
            doc! { "stateEnteredAt": 1 },
            None,
        )
        .await
    }

    async fn find_escalated(
        &self,
        tenant_id: &str,
        process_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ProcessInstance>> {
        self.find_many(
            doc! { "tenantId": tenant_id, "processId": process_id, "escalated": true },
            doc! { "updatedAt": -1 },
            Some((limit, offset)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use mongodb::bson::Bson;

    #[test]
    fn test_instance_timestamps_stored_as_dates() {
        let mut instance = ProcessInstance::new("pb", "p-1", "permit", "APP-1", "draft");
        let whole_second = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        instance.state_entered_at = whole_second;
        instance.updated_at = whole_second + Duration::milliseconds(500);
        instance.apply(HistoryEntry::new("alice", "draft", "submitted", "SUBMIT"));

        let stored = to_bson(&InstanceDocument::from(&instance)).unwrap();
        let stored = stored.as_document().unwrap();
        assert!(matches!(stored.get("createdAt"), Some(Bson::DateTime(_))));
        let history = stored.get_array("history").unwrap();
        let first = history[0].as_document().unwrap();
        assert!(matches!(first.get("timestamp"), Some(Bson::DateTime(_))));

        // Whole-second and fractional timestamps compare by instant, not by text
        let early = InstanceDocument::from(&ProcessInstance { updated_at: whole_second, ..instance.clone() });
        let late = InstanceDocument::from(&ProcessInstance {
            updated_at: whole_second + Duration::milliseconds(500),
            ..instance.clone()
        });
        assert!(early.updated_at < late.updated_at);

        let back = ProcessInstance::from(InstanceDocument::from(&instance));
        assert_eq!(back.version, 1);
        assert_eq!(back.history[0].sequence, 1);
        assert_eq!(back.state_entered_at.timestamp_millis(), instance.state_entered_at.timestamp_millis());
    }
}
