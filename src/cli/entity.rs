//! Entity commands (list, show, add, edit, delete)
//!
//! Reads come straight from the local store. Writes are queued as pending
//! mutations and reach the service on the next `tandem sync`.

use std::sync::Arc;

use anyhow::{Context, Result};

use super::output::Output;
use crate::bus::EventBus;
use crate::domain::{Entity, EntityId, EntityKind, Mutation, MutationRequest, Payload};
use crate::storage::Workspace;
use crate::sync::{OfflineRemote, RetryPolicy, SyncEngine};

/// Parses `key=value` pairs
///
/// Values that parse as JSON keep their type (`priority=4`, `checked=true`);
/// anything else is a string.
pub fn parse_fields(pairs: &[String]) -> Result<Payload> {
    let mut fields = Payload::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Expected key=value, got '{}'", pair))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Empty field name in '{}'", pair);
        }
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

/// Engine over the workspace store, for queueing only
fn offline_engine(workspace: &Workspace) -> Result<SyncEngine> {
    let store = Arc::new(workspace.open_store()?);
    Ok(SyncEngine::new(
        store,
        Arc::new(OfflineRemote),
        Arc::new(EventBus::new()),
        RetryPolicy::from(&workspace.config().project.sync),
    ))
}

/// Kind of a known entity, or of one created locally and not yet pushed
fn resolve_kind(engine: &SyncEngine, id: &EntityId) -> Result<EntityKind> {
    if let Some(entity) = engine.store().get(id)? {
        if entity.deleted {
            anyhow::bail!("Entity {} has been deleted", id);
        }
        return Ok(entity.kind);
    }

    engine
        .store()
        .pending()?
        .into_iter()
        .find(|m| &m.entity_id == id)
        .map(|m| m.kind)
        .ok_or_else(|| anyhow::anyhow!("Entity not found: {}", id))
}

fn entity_json(entity: &Entity) -> serde_json::Value {
    serde_json::json!({
        "id": entity.id,
        "kind": entity.kind,
        "title": entity.title(),
        "revision": entity.revision,
        "deleted": entity.deleted,
        "updated_at": entity.updated_at,
        "payload": entity.payload,
    })
}

fn report_queued(output: &Output, mutation: &Mutation) {
    if output.is_json() {
        output.data(&serde_json::json!({
            "queued": true,
            "seq": mutation.seq,
            "token": mutation.token,
            "entity_id": mutation.entity_id,
            "kind": mutation.kind,
            "op": mutation.op,
        }));
    } else {
        output.success(&format!(
            "Queued {} of {} {} (run 'tandem sync' to push)",
            mutation.op, mutation.kind, mutation.entity_id
        ));
    }
}

pub fn list(output: &Output, kind: Option<EntityKind>, include_deleted: bool) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let store = workspace.open_store()?;
    let entities = store.list(kind, include_deleted)?;

    if output.is_json() {
        let items: Vec<_> = entities.iter().map(entity_json).collect();
        output.data(&items);
    } else if entities.is_empty() {
        match kind {
            Some(kind) => println!("No {} entities", kind),
            None => println!("No entities. Run 'tandem sync' to fetch them."),
        }
    } else {
        println!("{:<16} {:<8} {:>6}  TITLE", "ID", "KIND", "REV");
        println!("{}", "-".repeat(60));
        for entity in &entities {
            let marker = if entity.deleted {
                " (deleted)"
            } else if entity.is_completed() {
                " (done)"
            } else {
                ""
            };
            println!(
                "{:<16} {:<8} {:>6}  {}{}",
                entity.id,
                entity.kind,
                entity.revision,
                entity.title(),
                marker
            );
        }
    }

    Ok(())
}

pub fn show(output: &Output, id_str: &str) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let store = workspace.open_store()?;

    let id: EntityId = id_str.parse()?;
    let entity = store
        .get(&id)?
        .ok_or_else(|| anyhow::anyhow!("Entity not found: {}", id))?;
    let pending: Vec<Mutation> = store
        .pending()?
        .into_iter()
        .filter(|m| m.entity_id == id)
        .collect();

    if output.is_json() {
        let mut json = entity_json(&entity);
        json["pending"] = serde_json::json!(pending
            .iter()
            .map(|m| serde_json::json!({"op": m.op, "fields": m.fields, "queued_at": m.queued_at}))
            .collect::<Vec<_>>());
        output.data(&json);
    } else {
        println!("{}: {}", entity.kind, entity.id);
        if !entity.title().is_empty() {
            println!("Title: {}", entity.title());
        }
        println!("Revision: {}", entity.revision);
        println!("Updated: {}", entity.updated_at.format("%Y-%m-%d %H:%M"));
        if entity.deleted {
            println!("Deleted: yes");
        }
        if let Some(priority) = entity.priority() {
            println!("Priority: {}", priority);
        }
        if let Some(due) = entity.due() {
            match (due.date, due.string) {
                (Some(date), Some(string)) => println!("Due: {} ({})", date, string),
                (Some(date), None) => println!("Due: {}", date),
                (None, Some(string)) => println!("Due: {}", string),
                (None, None) => {}
            }
        }
        if let Some(project) = entity.project_id() {
            println!("Project: {}", project);
        }
        if let Some(parent) = entity.parent_id() {
            println!("Parent: {}", parent);
        }

        if !entity.payload.is_empty() {
            println!("\nFields:");
            for (key, value) in &entity.payload {
                println!("  {}: {}", key, value);
            }
        }

        if !pending.is_empty() {
            println!("\nPending:");
            for mutation in &pending {
                let fields: Vec<&str> = mutation.fields.keys().map(String::as_str).collect();
                println!("  {} {}", mutation.op, fields.join(", "));
            }
        }
    }

    Ok(())
}

pub fn add(output: &Output, kind: EntityKind, set: &[String]) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let engine = offline_engine(&workspace)?;

    let fields = parse_fields(set)?;
    let mutation = engine
        .enqueue(MutationRequest::create(kind, fields))
        .with_context(|| format!("Failed to queue new {}", kind))?;

    report_queued(output, &mutation);
    Ok(())
}

pub fn edit(output: &Output, id_str: &str, set: &[String]) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let engine = offline_engine(&workspace)?;

    let id: EntityId = id_str.parse()?;
    let kind = resolve_kind(&engine, &id)?;
    let fields = parse_fields(set)?;
    if fields.is_empty() {
        anyhow::bail!("Nothing to change. Use -s key=value");
    }

    let mutation = engine
        .enqueue(MutationRequest::update(id, kind, fields))
        .context("Failed to queue edit")?;

    report_queued(output, &mutation);
    Ok(())
}

pub fn delete(output: &Output, id_str: &str) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let engine = offline_engine(&workspace)?;

    let id: EntityId = id_str.parse()?;
    let kind = resolve_kind(&engine, &id)?;

    let mutation = engine
        .enqueue(MutationRequest::delete(id, kind))
        .context("Failed to queue delete")?;

    report_queued(output, &mutation);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_fields_keeps_json_types() {
        let fields = parse_fields(&[
            "content=Buy milk".to_string(),
            "priority=4".to_string(),
            "checked=false".to_string(),
            "labels=[\"home\"]".to_string(),
            "note=a=b".to_string(),
        ])
        .unwrap();

        assert_eq!(fields["content"], json!("Buy milk"));
        assert_eq!(fields["priority"], json!(4));
        assert_eq!(fields["checked"], json!(false));
        assert_eq!(fields["labels"], json!(["home"]));
        assert_eq!(fields["note"], json!("a=b"));
    }

    #[test]
    fn parse_fields_rejects_missing_equals() {
        assert!(parse_fields(&["content".to_string()]).is_err());
        assert!(parse_fields(&["=x".to_string()]).is_err());
    }
}
