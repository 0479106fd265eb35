use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn param_path(req: &Request, key: &str) -> Option<PathBuf> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
}

fn handle_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match param_path(req, "workspacePath").or_else(|| state.workspace.clone()) {
        Some(p) => p,
        None => return err(&req.id, "bad_params", "missing workspacePath", None),
    };
    let Some(out_path) = param_path(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "dbSha256": summary.db_sha256,
                "outPath": out_path.to_string_lossy()
            }),
        ),
        Err(e) => err(&req.id, "backup_export_failed", format!("{e:#}"), None),
    }
}

fn handle_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(in_path) = param_path(req, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let workspace = match param_path(req, "workspacePath").or_else(|| state.workspace.clone()) {
        Some(p) => p,
        None => return err(&req.id, "bad_params", "missing workspacePath", None),
    };

    // Drop the open handle before swapping the database file underneath it.
    state.db = None;

    let result = backup::import_workspace_bundle(&in_path, &workspace);

    // Reopen regardless: on a failed import this restores the previous
    // database instead of leaving the session without a workspace.
    let reopened = db::open_db(&workspace);
    if let Ok(conn) = reopened {
        state.workspace = Some(workspace.clone());
        state.db = Some(conn);
    }

    match result {
        Ok(summary) => {
            if state.db.is_none() {
                return err(
                    &req.id,
                    "db_open_failed",
                    "bundle imported but the database failed to reopen",
                    None,
                );
            }
            ok(
                &req.id,
                json!({
                    "bundleFormatDetected": summary.bundle_format_detected,
                    "workspacePath": workspace.to_string_lossy()
                }),
            )
        }
        Err(e) => err(&req.id, "backup_import_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_workspace_bundle(state, req)),
        _ => None,
    }
}
