// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! State handlers: read, write, toggle, plain output, listing, and the
//! subscription endpoints.
//!
//! Every handler checks permissions first, then talks to the store and the
//! gateway registry. Value coercion for query-string writes follows the
//! object's declared type; if the object cannot be read the raw string is
//! written as-is and a warning is logged.

use std::time::Duration;

use serde_json::{Value, json};

use crate::auth::{AuthService, PermissionCheck};
use crate::error::Error;
use crate::gateway::Gateway;
use crate::registry::WatchKind;
use crate::store::{ObjectMeta, StateStore};

use super::{ApiRequest, ApiResponse};

/// Upper bound for the `timeout` query parameter (one minute).
const MAX_WAIT: Duration = Duration::from_millis(60_000);

fn parse_wait(req: &ApiRequest) -> Option<Duration> {
    let millis = req.query("timeout")?.parse::<u64>().ok()?;
    if millis == 0 {
        return None;
    }
    Some(Duration::from_millis(millis).min(MAX_WAIT))
}

fn split_ids(raw: &str) -> Vec<&str> {
    raw.split(',').map(str::trim).filter(|id| !id.is_empty()).collect()
}

fn missing_url() -> ApiResponse {
    ApiResponse::json(
        422,
        json!({
            "error": "url not provided",
            "expectedBody": { "url": "http://ipaddress:9000/hook/" },
        }),
    )
}

/// Coerces a query-string value using the object's declared type.
async fn coerce_query_value<S: StateStore>(
    gw: &Gateway<S>,
    id: &str,
    raw: &str,
    user: &str,
) -> Value {
    let opts = gw.access(user);
    if raw == "true" || raw == "false" {
        match gw.store().get_object(id, &opts).await {
            Ok(Some(obj)) if obj.common.data_type.as_deref() == Some("boolean") => {
                return Value::Bool(raw == "true");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(id = %id, error = %err, "cannot read object, writing raw value");
            }
        }
    } else if let Ok(number) = raw.parse::<f64>() {
        match gw.store().get_object(id, &opts).await {
            Ok(Some(obj)) if obj.common.data_type.as_deref() == Some("number") => {
                return json!(number);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(id = %id, error = %err, "cannot read object, writing raw value");
            }
        }
    }
    Value::String(raw.to_string())
}

/// Shared write path: plain write answers immediately, a `timeout` makes
/// the call wait for the acknowledged value.
async fn write_value<S: StateStore>(
    gw: &Gateway<S>,
    id: &str,
    val: Value,
    ack: Option<bool>,
    wait: Option<Duration>,
    user: &str,
) -> ApiResponse {
    match wait {
        Some(wait) => match gw.set_state_and_wait(id, val, ack, wait, user).await {
            Ok(state) => ApiResponse::ok_json(json!({
                "id": id,
                "val": state.val,
                "ack": state.ack,
                "ts": state.ts,
            })),
            Err(err) => ApiResponse::from_error(&err),
        },
        None => {
            let opts = gw.access(user);
            match gw.store().set_state(id, val.clone(), ack, &opts).await {
                Ok(()) => ApiResponse::ok_json(json!({ "id": id, "val": val })),
                Err(err) => ApiResponse::from_error(&Error::from(err)),
            }
        }
    }
}

// =============================================================================
// Read / write / toggle
// =============================================================================

/// `GET /v1/state/<ids>` — reads one or more comma-separated states.
///
/// `?value=` turns the call into a write of the first id, `?toggle` into a
/// toggle, `?withInfo=true` merges object metadata into the result.
pub async fn read_state<S: StateStore, A: AuthService>(
    gw: &Gateway<S>,
    auth: &A,
    req: &ApiRequest,
    ids: &str,
) -> ApiResponse {
    let user = req.user_or(gw.config().default_user());
    if let Err(err) = auth.check_permissions(user, &[PermissionCheck::STATE_READ]).await {
        return ApiResponse::from_error(&err);
    }

    let ids = split_ids(ids);
    let Some(first) = ids.first() else {
        return ApiResponse::from_error(&Error::NotFound("ID not found".to_string()));
    };

    if let Some(raw) = req.query("value") {
        let val = coerce_query_value(gw, first, raw, user).await;
        let ack = req.query("ack").map(|a| a == "true");
        return write_value(gw, first, val, ack, parse_wait(req), user).await;
    }
    if req.has_query("toggle") {
        return toggle_value(gw, req, first, user).await;
    }

    let opts = gw.access(user);
    let with_info = req.query("withInfo") == Some("true");
    let mut result = Vec::with_capacity(ids.len());

    for id in &ids {
        let state = match gw.store().get_state(id, &opts).await {
            Ok(state) => state,
            Err(err) => return ApiResponse::from_error(&Error::from(err)),
        };

        let object = if with_info || state.is_none() {
            match gw.store().get_object(id, &opts).await {
                Ok(object) => object,
                Err(err) => {
                    tracing::warn!(id = %id, error = %err, "error by reading of object");
                    None
                }
            }
        } else {
            None
        };

        if state.is_none() && object.is_none() {
            return ApiResponse::json(404, json!({ "error": "ID not found", "id": id }));
        }

        let mut entry = match &state {
            Some(state) => serde_json::to_value(state).unwrap_or(Value::Null),
            None => json!({}),
        };
        entry["id"] = json!(id);
        if with_info {
            if let Some(object) = object {
                entry["type"] = json!(object.kind);
                entry["common"] = serde_json::to_value(&object.common).unwrap_or(Value::Null);
            }
        }
        result.push(entry);
    }

    if result.len() == 1 {
        ApiResponse::ok_json(result.into_iter().next().unwrap_or(Value::Null))
    } else {
        ApiResponse::ok_json(Value::Array(result))
    }
}

/// `PATCH /v1/state/<id>` — writes a state from the request body.
///
/// The body is either `{"val": ..., "ack": ...}` or a bare JSON value.
pub async fn update_state<S: StateStore, A: AuthService>(
    gw: &Gateway<S>,
    auth: &A,
    req: &ApiRequest,
    id: &str,
) -> ApiResponse {
    let user = req.user_or(gw.config().default_user());
    if let Err(err) = auth.check_permissions(user, &[PermissionCheck::STATE_WRITE]).await {
        return ApiResponse::from_error(&err);
    }

    let body = req.body();
    let (val, ack) = if body.is_object() && body.get("val").is_some() {
        (
            body["val"].clone(),
            body.get("ack").and_then(Value::as_bool),
        )
    } else {
        (body.clone(), None)
    };

    // A string body still goes through type coercion, like a query write.
    let val = match &val {
        Value::String(raw) => coerce_query_value(gw, id, raw, user).await,
        other => other.clone(),
    };

    write_value(gw, id, val, ack, parse_wait(req), user).await
}

/// `GET /v1/state/<id>/toggle` — inverts a state value.
pub async fn toggle_state<S: StateStore, A: AuthService>(
    gw: &Gateway<S>,
    auth: &A,
    req: &ApiRequest,
    id: &str,
) -> ApiResponse {
    let user = req.user_or(gw.config().default_user());
    if let Err(err) = auth.check_permissions(user, &[PermissionCheck::STATE_WRITE]).await {
        return ApiResponse::from_error(&err);
    }
    toggle_value(gw, req, id, user).await
}

async fn toggle_value<S: StateStore>(
    gw: &Gateway<S>,
    req: &ApiRequest,
    id: &str,
    user: &str,
) -> ApiResponse {
    let opts = gw.access(user);
    let state = match gw.store().get_state(id, &opts).await {
        Ok(Some(state)) => state,
        Ok(None) => {
            return ApiResponse::json(500, json!({ "error": "State not initiated", "id": id }));
        }
        Err(err) => return ApiResponse::from_error(&Error::from(err)),
    };
    let object = match gw.store().get_object(id, &opts).await {
        Ok(object) => object,
        Err(err) => {
            tracing::warn!(id = %id, error = %err, "cannot read object for toggle");
            None
        }
    };

    let val = toggled(&state.val, object.as_ref());
    write_value(gw, id, val, None, parse_wait(req), user).await
}

/// Computes the inverse of a state value.
///
/// Numeric states with declared `min`/`max` bounds mirror around the
/// middle of the range; other numbers flip between 0 and 1; the common
/// on/off string pairs flip to their partner; everything else inverts
/// its truthiness.
fn toggled(current: &Value, object: Option<&ObjectMeta>) -> Value {
    if let Some(common) = object.map(|obj| &obj.common) {
        if common.data_type.as_deref() == Some("number") {
            if let (Some(min), Some(max)) = (common.min, common.max) {
                let v = current
                    .as_f64()
                    .or_else(|| current.as_str().and_then(|s| s.parse().ok()))
                    .unwrap_or(0.0)
                    .clamp(min, max);
                return json!(max + min - v);
            }
        }
        if common.data_type.as_deref() == Some("boolean") {
            return Value::Bool(!truthy(current));
        }
    }

    match current {
        Value::String(s) => {
            let flipped = match s.as_str() {
                "true" => "false",
                "false" => "true",
                "on" => "off",
                "off" => "on",
                "ON" => "OFF",
                "OFF" => "ON",
                "0" => "1",
                "1" => "0",
                _ => return Value::Bool(!truthy(current)),
            };
            Value::String(flipped.to_string())
        }
        Value::Number(n) => {
            if n.as_f64().unwrap_or(0.0) == 0.0 {
                json!(1)
            } else {
                json!(0)
            }
        }
        other => Value::Bool(!truthy(other)),
    }
}

fn truthy(val: &Value) -> bool {
    match val {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Null => false,
        _ => true,
    }
}

// =============================================================================
// Plain output and listing
// =============================================================================

/// `GET /v1/state/<id>/plain` — the bare value as text.
///
/// `?extraPlain=true` strips the JSON quoting from string values.
pub async fn plain_state<S: StateStore, A: AuthService>(
    gw: &Gateway<S>,
    auth: &A,
    req: &ApiRequest,
    id: &str,
) -> ApiResponse {
    let user = req.user_or(gw.config().default_user());
    if let Err(err) = auth.check_permissions(user, &[PermissionCheck::STATE_READ]).await {
        return ApiResponse::from_error(&err);
    }

    let opts = gw.access(user);
    match gw.store().get_state(id, &opts).await {
        Ok(Some(state)) => {
            if req.query("extraPlain") == Some("true") {
                let text = match &state.val {
                    Value::Null => "null".to_string(),
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                ApiResponse::text(200, text)
            } else {
                ApiResponse::text(200, state.val.to_string())
            }
        }
        Ok(None) => ApiResponse::json(404, json!({ "error": "State not found", "id": id })),
        Err(err) => ApiResponse::from_error(&Error::from(err)),
    }
}

/// `GET /v1/states?filter=<pattern>` — lists states matching a pattern.
pub async fn list_states<S: StateStore, A: AuthService>(
    gw: &Gateway<S>,
    auth: &A,
    req: &ApiRequest,
) -> ApiResponse {
    let user = req.user_or(gw.config().default_user());
    if let Err(err) = auth.check_permissions(user, &[PermissionCheck::STATE_LIST]).await {
        return ApiResponse::from_error(&err);
    }

    let filter = req.query("filter").unwrap_or("*");
    let opts = gw.access(user);
    match gw.store().get_states(filter, &opts).await {
        Ok(list) => ApiResponse::ok_json(serde_json::to_value(list).unwrap_or(Value::Null)),
        Err(err) => ApiResponse::from_error(&Error::from(err)),
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// `POST /v1/state/<id>/subscribe` — registers a webhook or polling session
/// for a single state id. Responds with the current state.
pub async fn subscribe_state<S: StateStore, A: AuthService>(
    gw: &Gateway<S>,
    auth: &A,
    req: &ApiRequest,
    id: &str,
) -> ApiResponse {
    let user = req.user_or(gw.config().default_user());
    if let Err(err) = auth.check_permissions(user, &[PermissionCheck::STATE_READ]).await {
        return ApiResponse::from_error(&err);
    }
    let Some((endpoint, transport)) = req.delivery_endpoint() else {
        return missing_url();
    };

    let opts = gw.access(user);
    match gw.store().get_object(id, &opts).await {
        Ok(None) => {
            return ApiResponse::json(404, json!({ "error": "object not found", "id": id }));
        }
        Ok(Some(obj)) if obj.kind != "state" => {
            return ApiResponse::json(
                500,
                json!({
                    "error": "Cannot subscribe on non-state",
                    "stateId": id,
                    "type": obj.kind,
                }),
            );
        }
        Ok(Some(_)) => {}
        Err(err) => return ApiResponse::from_error(&Error::from(err)),
    }

    if let Err(err) = gw
        .register_subscribe(&endpoint, transport, WatchKind::State, id, user)
        .await
    {
        return ApiResponse::from_error(&err);
    }

    match gw.store().get_state(id, &opts).await {
        Ok(state) => ApiResponse::ok_json(serde_json::to_value(state).unwrap_or(Value::Null)),
        Err(err) => ApiResponse::from_error(&Error::from(err)),
    }
}

/// `DELETE /v1/state/<id>/subscribe` — removes one watch entry.
pub async fn unsubscribe_state<S: StateStore, A: AuthService>(
    gw: &Gateway<S>,
    auth: &A,
    req: &ApiRequest,
    id: &str,
) -> ApiResponse {
    let user = req.user_or(gw.config().default_user());
    if let Err(err) = auth.check_permissions(user, &[PermissionCheck::STATE_READ]).await {
        return ApiResponse::from_error(&err);
    }
    let Some((endpoint, _)) = req.delivery_endpoint() else {
        return missing_url();
    };

    match gw
        .unregister_subscribe(&endpoint, WatchKind::State, Some(id), user)
        .await
    {
        Ok(()) => ApiResponse::ok_json(json!({ "result": "OK" })),
        Err(err) => ApiResponse::from_error(&err),
    }
}

/// `POST /v1/states/subscribe` — registers every state currently matching
/// a pattern. Patterns are expanded at subscription time; ids created
/// later are not picked up retroactively.
pub async fn subscribe_pattern<S: StateStore, A: AuthService>(
    gw: &Gateway<S>,
    auth: &A,
    req: &ApiRequest,
) -> ApiResponse {
    let user = req.user_or(gw.config().default_user());
    if let Err(err) = auth.check_permissions(user, &[PermissionCheck::STATE_READ]).await {
        return ApiResponse::from_error(&err);
    }
    let Some((endpoint, transport)) = req.delivery_endpoint() else {
        return missing_url();
    };
    let Some(pattern) = req.body_str("pattern") else {
        return ApiResponse::json(
            422,
            json!({
                "error": "pattern not provided",
                "expectedBody": {
                    "url": "http://ipaddress:9000/hook/",
                    "pattern": "system.adapter.admin.0.*",
                },
            }),
        );
    };

    let ids = match expand_pattern(gw, pattern, user).await {
        Ok(ids) => ids,
        Err(err) => return ApiResponse::from_error(&err),
    };
    for id in &ids {
        if let Err(err) = gw
            .register_subscribe(&endpoint, transport, WatchKind::State, id, user)
            .await
        {
            return ApiResponse::from_error(&err);
        }
    }

    ApiResponse::ok_json(json!({ "result": "OK", "count": ids.len() }))
}

/// `DELETE /v1/states/subscribe` — removes the watch entries a pattern
/// currently expands to, or every state watch when no pattern is given.
pub async fn unsubscribe_pattern<S: StateStore, A: AuthService>(
    gw: &Gateway<S>,
    auth: &A,
    req: &ApiRequest,
) -> ApiResponse {
    let user = req.user_or(gw.config().default_user());
    if let Err(err) = auth.check_permissions(user, &[PermissionCheck::STATE_READ]).await {
        return ApiResponse::from_error(&err);
    }
    let Some((endpoint, _)) = req.delivery_endpoint() else {
        return missing_url();
    };

    match req.body_str("pattern") {
        Some(pattern) => {
            let ids = match expand_pattern(gw, pattern, user).await {
                Ok(ids) => ids,
                Err(err) => return ApiResponse::from_error(&err),
            };
            for id in &ids {
                if let Err(err) = gw
                    .unregister_subscribe(&endpoint, WatchKind::State, Some(id), user)
                    .await
                {
                    return ApiResponse::from_error(&err);
                }
            }
        }
        None => {
            if let Err(err) = gw
                .unregister_subscribe(&endpoint, WatchKind::State, None, user)
                .await
            {
                return ApiResponse::from_error(&err);
            }
        }
    }

    ApiResponse::ok_json(json!({ "result": "OK" }))
}

/// `GET /v1/states/subscribe` — the watch list of one endpoint.
pub async fn get_states_subscribes<S: StateStore, A: AuthService>(
    gw: &Gateway<S>,
    auth: &A,
    req: &ApiRequest,
) -> ApiResponse {
    let user = req.user_or(gw.config().default_user());
    if let Err(err) = auth.check_permissions(user, &[PermissionCheck::STATE_READ]).await {
        return ApiResponse::from_error(&err);
    }
    let Some((endpoint, _)) = req.delivery_endpoint() else {
        return missing_url();
    };

    let filter = req.body_str("pattern");
    match gw.get_subscribes(&endpoint, WatchKind::State, filter).await {
        Some(states) => ApiResponse::ok_json(json!({ "states": states })),
        None => ApiResponse::from_error(&Error::NotFound("URL or session not found".to_string())),
    }
}

async fn expand_pattern<S: StateStore>(
    gw: &Gateway<S>,
    pattern: &str,
    user: &str,
) -> Result<Vec<String>, Error> {
    if !pattern.contains('*') {
        return Ok(vec![pattern.to_string()]);
    }
    let opts = gw.access(user);
    let states = gw.store().get_states(pattern, &opts).await?;
    Ok(states.into_keys().collect())
}

// =============================================================================
// Long polling
// =============================================================================

/// `GET /v1/polling?sid=<id>&timeout=<ms>&check=<bool>` — the long-poll
/// entry point.
///
/// `check=true` creates or refreshes the session and answers `_`
/// immediately. Otherwise the call serves one backlog entry or parks until
/// an event arrives; an empty body means the lease elapsed quietly.
pub async fn polling_get<S: StateStore>(gw: &Gateway<S>, req: &ApiRequest) -> ApiResponse {
    let endpoint = req.session_endpoint();
    let lease = req
        .query("timeout")
        .and_then(|t| t.parse::<u64>().ok())
        .map(Duration::from_millis);

    if req.query("check") == Some("true") {
        gw.connect(&endpoint, lease).await;
        return ApiResponse::text(200, "_");
    }

    match gw.poll(&endpoint, lease).await {
        Ok(Some(payload)) => ApiResponse::text(200, payload),
        Ok(None) => ApiResponse::empty(200),
        Err(err) => ApiResponse::from_error(&err),
    }
}
