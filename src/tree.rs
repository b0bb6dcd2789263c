//! Tree Query Adapter over the session's last tree snapshot.

use serde_json::{json, Value};

use crate::api::error::CommandError;
use crate::engine::{Element, Lookup};
use crate::protocol::now_millis;
use crate::registry::{Resource, TreeSnapshot};
use crate::session::Session;

/// A validated `query tree` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeQuery {
    /// One lookup by a named criterion.
    By(Lookup, String),
    /// Several selector expressions, matched independently.
    SelectorSet(Vec<String>),
}

impl TreeQuery {
    /// Parse `{type, value}`. `None` for any shape the adapter cannot serve.
    pub fn parse(data: &Value) -> Option<Self> {
        let lookup = Lookup::parse(data.get("type")?.as_str()?)?;
        match data.get("value")? {
            Value::String(s) => Some(Self::By(lookup, s.clone())),
            Value::Array(items) if lookup == Lookup::Selector => items
                .iter()
                .map(|v| v.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
                .map(Self::SelectorSet),
            _ => None,
        }
    }
}

fn ids(elements: Vec<Element>) -> Vec<String> {
    elements.into_iter().map(|e| e.id).collect()
}

/// `get latest tree`: fetch, store as the session snapshot, describe.
pub async fn refresh(session: &Session) -> Result<Value, CommandError> {
    let tree = session.engine().framework().tree().await?;
    let snapshot = TreeSnapshot {
        hash: tree.hash(),
        tree,
        number: session.next_tree_number(),
        generated: now_millis(),
    };
    let reply = snapshot.to_json();
    if session.is_alive() {
        session.registry().register(Resource::Tree(snapshot));
    }
    Ok(reply)
}

/// `query tree`. Missing snapshots and malformed queries yield `[]`.
pub async fn query(session: &Session, data: &Value) -> Result<Value, CommandError> {
    let Some(query) = TreeQuery::parse(data) else {
        return Ok(json!([]));
    };
    let Some(snapshot) = session.registry().tree() else {
        return Ok(json!([]));
    };

    match query {
        TreeQuery::SelectorSet(selectors) => {
            let matched = snapshot.tree.find_by_selector_set(&selectors).await?;
            let by_set: Vec<Vec<String>> = matched.by_set.into_iter().map(ids).collect();
            Ok(json!({ "flat": ids(matched.flat), "bySet": by_set }))
        }
        TreeQuery::By(_, value) if value.is_empty() => Ok(json!([])),
        TreeQuery::By(lookup, value) => {
            let found = snapshot.tree.find(lookup, &value).await?;
            Ok(json!(ids(found)))
        }
    }
}
