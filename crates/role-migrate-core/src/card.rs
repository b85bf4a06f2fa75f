//! Card-format helpers used around the migration: building `chara_card_v2`
//! cards from raw result exports and keeping their Telegram deeplinks current.

use serde_json::{json, Map, Value};

use crate::{is_truthy, stringify, MigrateError, CONFLICT_KEY};

pub const CARD_SPEC: &str = "chara_card_v2";
pub const CARD_SPEC_VERSION: &str = "2.0";

/// Canonical start link for a role.
#[must_use]
pub fn deeplink_for(bot_username: &str, role_id: &str) -> String {
    format!("https://t.me/{bot_username}?start=role_{role_id}")
}

fn truthy_or(value: Option<&Value>, fallback: Value) -> Value {
    value.filter(|value| is_truthy(value)).cloned().unwrap_or(fallback)
}

/// Build a v2 card from one entry of a raw result export.
#[must_use]
pub fn build_v2_card(raw: &Value) -> Value {
    let field = |key: &str| raw.get(key);
    let empty = || Value::String(String::new());

    json!({
        "spec": CARD_SPEC,
        "spec_version": CARD_SPEC_VERSION,
        "data": {
            "name": "",
            "description": "",
            "personality": "",
            "scenario": "",
            "first_mes": truthy_or(field("first_sentence"), empty()),
            "mes_example": "",
            "system_prompt": truthy_or(field("module_1_result"), empty()),
            "post_history_instructions": "",
            "alternate_greetings": [],
            "character_book": null,
            "tags": truthy_or(field("tag"), json!([])),
            "extensions": {
                "title": truthy_or(field("name"), empty()),
                "role_id": field(CONFLICT_KEY).cloned().unwrap_or(Value::Null),
                "summary": truthy_or(field("summary"), empty()),
                "deeplink": truthy_or(field("deeplink"), empty()),
            }
        }
    })
}

/// Convert a raw result export into a list of v2 cards.
///
/// # Errors
/// Returns [`MigrateError::Configuration`] when `payload` is not a JSON array.
pub fn convert_results(payload: &Value) -> Result<Vec<Value>, MigrateError> {
    let Value::Array(items) = payload else {
        return Err(MigrateError::Configuration(
            "expected the source JSON to be a list of roles".to_string(),
        ));
    };
    Ok(items.iter().map(build_v2_card).collect())
}

fn extensions(role: &Value) -> Option<&Map<String, Value>> {
    role.get("data")?.get("extensions")?.as_object()
}

fn extensions_mut(role: &mut Value) -> Option<&mut Map<String, Value>> {
    role.get_mut("data")?.get_mut("extensions")?.as_object_mut()
}

/// Role id stored in a card's extensions; any non-null value counts.
fn extension_role_id(extensions: &Map<String, Value>) -> Option<String> {
    match extensions.get(CONFLICT_KEY) {
        None | Some(Value::Null) => None,
        Some(value) => Some(stringify(value)),
    }
}

/// Count roles that do not carry a deeplink yet.
#[must_use]
pub fn count_missing_deeplinks(roles: &[Value]) -> usize {
    roles
        .iter()
        .filter(|role| match extensions(role) {
            Some(extensions) if extension_role_id(extensions).is_some() => {
                !extensions.get("deeplink").is_some_and(is_truthy)
            }
            _ => role.get("deeplink").is_none(),
        })
        .count()
}

/// Set the canonical deeplink on every role that has an id, returning how many changed.
pub fn ensure_deeplinks(roles: &mut [Value], bot_username: &str) -> usize {
    let mut updated = 0;

    for role in roles.iter_mut() {
        if let Some(extensions) = extensions_mut(role) {
            if let Some(role_id) = extension_role_id(extensions) {
                let deeplink = Value::String(deeplink_for(bot_username, &role_id));
                if extensions.get("deeplink") != Some(&deeplink) {
                    extensions.insert("deeplink".to_string(), deeplink);
                    updated += 1;
                }
                continue;
            }
        }

        let Some(object) = role.as_object_mut() else {
            continue;
        };
        let Some(role_id) = object.get(CONFLICT_KEY).filter(|value| is_truthy(value)).map(stringify)
        else {
            continue;
        };
        let deeplink = Value::String(deeplink_for(bot_username, &role_id));
        if object.get("deeplink") != Some(&deeplink) {
            object.insert("deeplink".to_string(), deeplink);
            updated += 1;
        }
    }

    updated
}
