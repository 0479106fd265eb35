use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_query, optional_i64, optional_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value, Connection};
use serde_json::json;

const AUDIT_LIST_MAX_ROWS: i64 = 500;

fn audit_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let entity = optional_str(params, "entity")?;
    let entity_id = optional_str(params, "entityId")?;
    let limit = optional_i64(params, "limit")?
        .unwrap_or(100)
        .clamp(1, AUDIT_LIST_MAX_ROWS);

    let mut sql = String::from(
        "SELECT entity, entity_id, action, actor, at, before_json, after_json FROM audit_log",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(entity) = &entity {
        clauses.push("entity = ?");
        binds.push(Value::Text(entity.clone()));
    }
    if let Some(entity_id) = &entity_id {
        clauses.push("entity_id = ?");
        binds.push(Value::Text(entity_id.clone()));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY at DESC LIMIT ?");
    binds.push(Value::Integer(limit));

    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let entries = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            let entity: String = row.get(0)?;
            let entity_id: String = row.get(1)?;
            let action: String = row.get(2)?;
            let actor: String = row.get(3)?;
            let at: String = row.get(4)?;
            let before_json: Option<String> = row.get(5)?;
            let after_json: Option<String> = row.get(6)?;
            Ok(json!({
                "entity": entity,
                "entityId": entity_id,
                "action": action,
                "actor": actor,
                "at": at,
                "before": before_json
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok()),
                "after": after_json
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method != "audit.list" {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match audit_list(conn, &req.params) {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
