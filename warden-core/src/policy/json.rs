//! JSON form of the policy model, the ingestion and tooling surface.
//!
//! The shape mirrors the model: bundles own promise types, promise types own
//! contexts (runs of promises sharing a class guard), contexts own promises.
//! A `symbol` rval marks a body reference and survives a round-trip.

use serde_json::{Map, Value as Json, json};
use thiserror::Error;

use super::{
    Body, BodyId, Bundle, BundleSection, Constraint, FnCall, Policy, Promise, Rval, SourceOffset,
};

#[derive(Error, Debug)]
#[error("policy JSON: {0}")]
pub struct PolicyJsonError(pub String);

type JsonResult<T> = std::result::Result<T, PolicyJsonError>;

fn bad<T>(message: impl Into<String>) -> JsonResult<T> {
    Err(PolicyJsonError(message.into()))
}

// ---- serialisation ------------------------------------------------------

pub fn policy_to_json(policy: &Policy) -> Json {
    json!({
        "bundles": policy.bundles.iter().map(bundle_to_json).collect::<Vec<_>>(),
        "bodies": policy.bodies.iter().map(body_to_json).collect::<Vec<_>>(),
    })
}

fn bundle_to_json(bundle: &Bundle) -> Json {
    let mut object = Map::new();
    if let Some(path) = &bundle.source_path {
        object.insert("sourcePath".into(), json!(path));
    }
    object.insert("line".into(), json!(bundle.offset.line));
    object.insert("namespace".into(), json!(bundle.ns));
    object.insert("name".into(), json!(bundle.name));
    object.insert("bundleType".into(), json!(bundle.bundle_type));
    object.insert("arguments".into(), json!(bundle.args));
    object.insert(
        "promiseTypes".into(),
        Json::Array(
            bundle
                .sections
                .iter()
                .chain(bundle.custom_sections.iter())
                .map(section_to_json)
                .collect(),
        ),
    );
    Json::Object(object)
}

fn section_to_json(section: &BundleSection) -> Json {
    json!({
        "line": section.offset.line,
        "name": section.promise_type,
        "contexts": promise_contexts_to_json(&section.promises),
    })
}

/// Group consecutive promises sharing a class guard into context objects.
fn promise_contexts_to_json(promises: &[Promise]) -> Json {
    let mut contexts: Vec<Json> = Vec::new();
    let mut current: Option<(&str, Vec<Json>)> = None;

    for promise in promises {
        match &mut current {
            Some((guard, group)) if *guard == promise.classes => {
                group.push(promise_to_json(promise));
            }
            _ => {
                if let Some((guard, group)) = current.take() {
                    contexts.push(json!({ "name": guard, "promises": group }));
                }
                current = Some((promise.classes.as_str(), vec![promise_to_json(promise)]));
            }
        }
    }
    if let Some((guard, group)) = current {
        contexts.push(json!({ "name": guard, "promises": group }));
    }
    Json::Array(contexts)
}

fn promise_to_json(promise: &Promise) -> Json {
    let mut object = Map::new();
    object.insert("line".into(), json!(promise.offset.line));
    object.insert("promiser".into(), json!(promise.promiser));
    match &promise.promisee {
        Some(Rval::Scalar(s)) => {
            object.insert("promisee".into(), json!(s));
        }
        Some(Rval::List(items)) => {
            let list: Vec<Json> = items
                .iter()
                .filter_map(|r| r.as_scalar())
                .map(|s| json!(s))
                .collect();
            object.insert("promisee".into(), Json::Array(list));
        }
        _ => {}
    }
    object.insert(
        "attributes".into(),
        Json::Array(promise.constraints.iter().map(attribute_to_json).collect()),
    );
    Json::Object(object)
}

fn attribute_to_json(constraint: &Constraint) -> Json {
    json!({
        "line": constraint.offset.line,
        "lval": constraint.lval,
        "rval": rval_to_json(&constraint.rval, constraint.references_body),
    })
}

fn rval_to_json(rval: &Rval, symbolic_reference: bool) -> Json {
    match rval {
        Rval::Scalar(s) => {
            let kind = if symbolic_reference { "symbol" } else { "string" };
            json!({ "type": kind, "value": s })
        }
        Rval::List(items) => json!({
            "type": "list",
            "value": items.iter().map(|r| rval_to_json(r, false)).collect::<Vec<_>>(),
        }),
        Rval::FnCall(call) => json!({
            "type": "functionCall",
            "name": call.name,
            "arguments": call.args.iter().map(|r| rval_to_json(r, false)).collect::<Vec<_>>(),
        }),
        Rval::Container(value) => json!({ "type": "container", "value": value }),
    }
}

fn body_to_json(body: &Body) -> Json {
    let mut object = Map::new();
    if let Some(path) = &body.source_path {
        object.insert("sourcePath".into(), json!(path));
    }
    object.insert("line".into(), json!(body.offset.line));
    object.insert("namespace".into(), json!(body.ns));
    object.insert("name".into(), json!(body.name));
    object.insert("bodyType".into(), json!(body.body_type));
    object.insert("arguments".into(), json!(body.args));
    object.insert(
        "contexts".into(),
        body_contexts_to_json(&body.constraints),
    );
    Json::Object(object)
}

fn body_contexts_to_json(constraints: &[Constraint]) -> Json {
    let mut contexts: Vec<Json> = Vec::new();
    let mut current: Option<(&str, Vec<Json>)> = None;

    for constraint in constraints {
        match &mut current {
            Some((guard, group)) if *guard == constraint.classes => {
                group.push(attribute_to_json(constraint));
            }
            _ => {
                if let Some((guard, group)) = current.take() {
                    contexts.push(json!({ "name": guard, "attributes": group }));
                }
                current = Some((constraint.classes.as_str(), vec![attribute_to_json(constraint)]));
            }
        }
    }
    match current {
        Some((guard, group)) => contexts.push(json!({ "name": guard, "attributes": group })),
        None => contexts.push(json!({ "name": "any", "attributes": [] })),
    }
    Json::Array(contexts)
}

// ---- deserialisation ----------------------------------------------------

pub fn policy_from_json(value: &Json) -> JsonResult<Policy> {
    let object = value
        .as_object()
        .ok_or_else(|| PolicyJsonError("top-level value is not an object".into()))?;

    let bundles = object.get("bundles").and_then(Json::as_array);
    let bodies = object.get("bodies").and_then(Json::as_array);
    if bundles.is_none() && bodies.is_none() {
        return bad("policy has neither bundles nor bodies");
    }

    let mut policy = Policy::new();
    for json_bundle in bundles.into_iter().flatten() {
        bundle_from_json(&mut policy, json_bundle)?;
    }
    for json_body in bodies.into_iter().flatten() {
        body_from_json(&mut policy, json_body)?;
    }
    Ok(policy)
}

pub fn policy_from_str(text: &str) -> JsonResult<Policy> {
    let value: Json =
        serde_json::from_str(text).map_err(|e| PolicyJsonError(format!("parse error: {e}")))?;
    policy_from_json(&value)
}

fn get_str<'a>(object: &'a Json, key: &str, what: &str) -> JsonResult<&'a str> {
    object
        .get(key)
        .and_then(Json::as_str)
        .ok_or_else(|| PolicyJsonError(format!("{what} is missing string field '{key}'")))
}

fn get_line(object: &Json) -> SourceOffset {
    SourceOffset {
        line: object
            .get("line")
            .and_then(Json::as_u64)
            .unwrap_or(0) as usize,
        column: 0,
    }
}

fn string_array(object: &Json, key: &str) -> Vec<String> {
    object
        .get(key)
        .and_then(Json::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn bundle_from_json(policy: &mut Policy, json_bundle: &Json) -> JsonResult<()> {
    let ns = get_str(json_bundle, "namespace", "bundle")?;
    let name = get_str(json_bundle, "name", "bundle")?;
    let bundle_type = get_str(json_bundle, "bundleType", "bundle")?;
    let source_path = json_bundle
        .get("sourcePath")
        .and_then(Json::as_str)
        .map(str::to_string);
    let args = string_array(json_bundle, "arguments");

    let bundle_id = policy.append_bundle(ns, name, bundle_type, args, source_path);
    policy.bundle_mut(bundle_id).offset = get_line(json_bundle);

    for json_section in json_bundle
        .get("promiseTypes")
        .and_then(Json::as_array)
        .into_iter()
        .flatten()
    {
        let promise_type = get_str(json_section, "name", "promise type")?;
        let section = policy.append_section(bundle_id, promise_type);
        policy.section_mut(section).offset = get_line(json_section);

        for json_context in json_section
            .get("contexts")
            .and_then(Json::as_array)
            .into_iter()
            .flatten()
        {
            let guard = get_str(json_context, "name", "context")?;
            for json_promise in json_context
                .get("promises")
                .and_then(Json::as_array)
                .into_iter()
                .flatten()
            {
                promise_from_json(policy, section, guard, json_promise)?;
            }
        }
    }
    Ok(())
}

fn promise_from_json(
    policy: &mut Policy,
    section: super::SectionRef,
    guard: &str,
    json_promise: &Json,
) -> JsonResult<()> {
    let promiser = get_str(json_promise, "promiser", "promise")?;
    let promisee = match json_promise.get("promisee") {
        Some(Json::String(s)) => Some(Rval::scalar(s.clone())),
        Some(Json::Array(items)) => Some(Rval::List(
            items
                .iter()
                .filter_map(Json::as_str)
                .map(Rval::scalar)
                .collect(),
        )),
        _ => None,
    };

    let promise_ref = policy.append_promise(section, promiser, promisee, guard);
    policy.promise_mut(promise_ref).offset = get_line(json_promise);

    for json_attribute in json_promise
        .get("attributes")
        .and_then(Json::as_array)
        .into_iter()
        .flatten()
    {
        let lval = get_str(json_attribute, "lval", "attribute")?;
        let json_rval = json_attribute
            .get("rval")
            .ok_or_else(|| PolicyJsonError(format!("attribute '{lval}' has no rval")))?;
        let references_body = json_rval.get("type").and_then(Json::as_str) == Some("symbol");
        let rval = rval_from_json(json_rval)?;
        let offset = get_line(json_attribute);
        policy.append_promise_constraint(promise_ref, lval, rval, references_body);
        if let Some(constraint) = policy
            .promise_mut(promise_ref)
            .constraints
            .iter_mut()
            .find(|c| c.lval == lval)
        {
            constraint.offset = offset;
        }
    }

    let comment = policy
        .promise(promise_ref)
        .constraint_as_scalar("comment")
        .map(str::to_string);
    policy.promise_mut(promise_ref).comment = comment;
    Ok(())
}

fn body_from_json(policy: &mut Policy, json_body: &Json) -> JsonResult<()> {
    let ns = get_str(json_body, "namespace", "body")?;
    let name = get_str(json_body, "name", "body")?;
    let body_type = get_str(json_body, "bodyType", "body")?;
    let source_path = json_body
        .get("sourcePath")
        .and_then(Json::as_str)
        .map(str::to_string);
    let args = string_array(json_body, "arguments");

    let body_id = policy.append_body(ns, name, body_type, args, source_path, false);
    policy.bodies[body_id.0].offset = get_line(json_body);

    for json_context in json_body
        .get("contexts")
        .and_then(Json::as_array)
        .into_iter()
        .flatten()
    {
        let guard = get_str(json_context, "name", "context")?;
        for json_attribute in json_context
            .get("attributes")
            .and_then(Json::as_array)
            .into_iter()
            .flatten()
        {
            let lval = get_str(json_attribute, "lval", "attribute")?;
            let json_rval = json_attribute
                .get("rval")
                .ok_or_else(|| PolicyJsonError(format!("attribute '{lval}' has no rval")))?;
            let references_body = json_rval.get("type").and_then(Json::as_str) == Some("symbol");
            let rval = rval_from_json(json_rval)?;
            let offset = get_line(json_attribute);
            policy.append_body_constraint(body_id, lval, rval, guard, references_body);
            set_body_constraint_offset(policy, body_id, lval, guard, offset);
        }
    }
    Ok(())
}

fn set_body_constraint_offset(
    policy: &mut Policy,
    body_id: BodyId,
    lval: &str,
    guard: &str,
    offset: SourceOffset,
) {
    if let Some(constraint) = policy.bodies[body_id.0]
        .constraints
        .iter_mut()
        .find(|c| c.lval == lval && c.classes == guard)
    {
        constraint.offset = offset;
    }
}

fn rval_from_json(json_rval: &Json) -> JsonResult<Rval> {
    let kind = json_rval
        .get("type")
        .and_then(Json::as_str)
        .ok_or_else(|| PolicyJsonError("rval has no type".into()))?;

    match kind {
        "string" | "symbol" => {
            let value = get_str(json_rval, "value", "rval")?;
            Ok(Rval::scalar(value))
        }
        "list" => {
            let items = json_rval
                .get("value")
                .and_then(Json::as_array)
                .ok_or_else(|| PolicyJsonError("list rval has no value array".into()))?;
            Ok(Rval::List(
                items.iter().map(rval_from_json).collect::<JsonResult<_>>()?,
            ))
        }
        "functionCall" => {
            let name = get_str(json_rval, "name", "function call")?;
            let args = json_rval
                .get("arguments")
                .and_then(Json::as_array)
                .ok_or_else(|| PolicyJsonError("function call has no arguments array".into()))?;
            Ok(Rval::FnCall(FnCall {
                name: name.to_string(),
                args: args.iter().map(rval_from_json).collect::<JsonResult<_>>()?,
            }))
        }
        "container" => {
            let value = json_rval
                .get("value")
                .ok_or_else(|| PolicyJsonError("container rval has no value".into()))?;
            Ok(Rval::Container(value.clone()))
        }
        other => bad(format!("unexpected rval type '{other}'")),
    }
}
