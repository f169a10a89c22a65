//! Build profile parser: planner payloads → profiles and item usages.
//!
//! Accepted payload shape:
//!
//! ```json
//! { "profiles": [
//!     { "name": "Speed", "class": "barbarian",
//!       "items":         { "head": { "id": "Unique_Helm_001" }, "neck": "Unique_Amulet_002" },
//!       "followerItems": { "special": { "id": "Unique_Enchantress_Special_001" } },
//!       "kanai":         { "weapon": "Unique_Sword_2H_104", "armor": null } } ] }
//! ```
//!
//! The document may also be wrapped in `data`, either as an object or as a
//! string holding the JSON document. `heroClass` is accepted for `class`.

use std::collections::BTreeSet;

use build_harvest_core::models::{
    Guide, ItemUsage, ParsedBuilds, PlannerPayload, Profile, UsageContext,
};
use build_harvest_core::HarvestError;
use serde_json::{Map, Value};
use tracing::warn;

const SLOT_MAPS: [(&str, UsageContext); 3] = [
    ("items", UsageContext::Main),
    ("followerItems", UsageContext::Follower),
    ("kanai", UsageContext::KanaiCube),
];

/// Parse every payload resolved for `guide`.
///
/// Fails as a whole with `MalformedContent` if any payload is not JSON or has
/// no `profiles` array. Individual malformed profiles are skipped and
/// reported in `warnings`. Output is deduplicated and deterministic.
pub fn parse_payloads(
    guide: &Guide,
    payloads: &[PlannerPayload],
) -> Result<ParsedBuilds, HarvestError> {
    let mut parsed = ParsedBuilds::default();
    let mut seen_profiles = BTreeSet::new();
    let mut usages = BTreeSet::new();

    for payload in payloads {
        let malformed = |detail: String| HarvestError::MalformedContent {
            guide_id: Some(guide.id.clone()),
            planner_id: Some(payload.planner_id.to_string()),
            detail,
        };

        let root: Value = serde_json::from_str(&payload.body)
            .map_err(|e| malformed(format!("payload is not valid JSON: {}", e)))?;
        let document = unwrap_document(root).map_err(malformed)?;
        let profiles = document
            .get("profiles")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("payload has no profiles array".to_string()))?;

        for (index, raw) in profiles.iter().enumerate() {
            let (profile, profile_usages) = match parse_profile(guide, payload, raw) {
                Ok(p) => p,
                Err(reason) => {
                    let message = format!(
                        "planner {} profile #{} skipped: {}",
                        payload.planner_id, index, reason
                    );
                    warn!(
                        guide = %guide.id,
                        planner_id = %payload.planner_id,
                        index,
                        reason = %reason,
                        "skipping malformed profile"
                    );
                    parsed.warnings.push(message);
                    continue;
                }
            };

            if !seen_profiles.insert(profile.key()) {
                parsed.warnings.push(format!(
                    "planner {} profile #{} skipped: duplicate profile name '{}'",
                    payload.planner_id, index, profile.name
                ));
                continue;
            }
            parsed.profiles.push(profile);
            usages.extend(profile_usages);
        }
    }

    parsed.usages = usages.into_iter().collect();
    Ok(parsed)
}

/// Find the object that carries `profiles`, looking through a `data` wrapper.
fn unwrap_document(root: Value) -> Result<Map<String, Value>, String> {
    let Value::Object(mut map) = root else {
        return Err("payload is not a JSON object".to_string());
    };
    if map.contains_key("profiles") {
        return Ok(map);
    }
    match map.remove("data") {
        Some(Value::Object(inner)) => Ok(inner),
        Some(Value::String(text)) => match serde_json::from_str(&text) {
            Ok(Value::Object(inner)) => Ok(inner),
            Ok(_) => Err("data field does not hold a JSON object".to_string()),
            Err(e) => Err(format!("data field is not valid JSON: {}", e)),
        },
        _ => Ok(map),
    }
}

fn non_blank<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_profile(
    guide: &Guide,
    payload: &PlannerPayload,
    raw: &Value,
) -> Result<(Profile, Vec<ItemUsage>), String> {
    let obj = raw.as_object().ok_or("profile is not an object")?;
    let name = non_blank(obj, "name").ok_or("missing name")?;
    let class = non_blank(obj, "class")
        .or_else(|| non_blank(obj, "heroClass"))
        .ok_or("missing class")?;

    let profile = Profile {
        guide_id: guide.id.clone(),
        guide_url: guide.url.clone(),
        planner_id: payload.planner_id.clone(),
        name: name.to_string(),
        class: class.to_string(),
    };
    let key = profile.key();

    let mut usages = Vec::new();
    for (field, context) in SLOT_MAPS {
        let slots = match obj.get(field) {
            None | Some(Value::Null) => continue,
            Some(Value::Object(slots)) => slots,
            Some(_) => return Err(format!("{} is not an object", field)),
        };
        for (slot, value) in slots {
            if let Some(item_id) = slot_item_id(value)? {
                usages.push(ItemUsage {
                    profile: key.clone(),
                    item_id,
                    slot: slot.clone(),
                    context,
                });
            }
        }
    }

    Ok((profile, usages))
}

/// Item id in a slot: `{ "id": … }`, a bare string, or nothing.
fn slot_item_id(value: &Value) -> Result<Option<String>, String> {
    let id = match value {
        Value::Null => None,
        Value::String(s) => Some(s.as_str()),
        Value::Object(o) => match o.get("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.as_str()),
            Some(other) => return Err(format!("unexpected item id {}", other)),
        },
        other => return Err(format!("unexpected slot value {}", other)),
    };
    Ok(id.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use build_harvest_core::models::PlannerId;
    use build_harvest_core::ErrorKind;
    use serde_json::json;

    fn guide() -> Guide {
        Guide {
            id: "ww-barb".to_string(),
            title: "Ww Barb".to_string(),
            url: "https://example.com/d3/guides/ww-barb".to_string(),
        }
    }

    fn payload(id: &str, body: Value) -> PlannerPayload {
        PlannerPayload {
            planner_id: PlannerId::parse(id).unwrap(),
            body: body.to_string(),
            from_cache: false,
        }
    }

    #[test]
    fn maps_each_slot_to_its_context() {
        let body = json!({
            "profiles": [{
                "name": "Speed",
                "class": "barbarian",
                "items": { "mainhand": { "id": "Unique_Sword_001" } },
                "followerItems": { "special": { "id": "Unique_Templar_Special_001" } },
                "kanai": { "weapon": "Unique_Sword_2H_104" }
            }]
        });
        let parsed = parse_payloads(&guide(), &[payload("p1", body)]).unwrap();

        assert_eq!(parsed.profiles.len(), 1);
        assert_eq!(parsed.usages.len(), 3);
        let rows: Vec<(&str, &str, UsageContext)> = parsed
            .usages
            .iter()
            .map(|u| (u.item_id.as_str(), u.slot.as_str(), u.context))
            .collect();
        assert!(rows.contains(&("Unique_Sword_001", "mainhand", UsageContext::Main)));
        assert!(rows.contains(&(
            "Unique_Templar_Special_001",
            "special",
            UsageContext::Follower
        )));
        assert!(rows.contains(&("Unique_Sword_2H_104", "weapon", UsageContext::KanaiCube)));
        assert!(parsed
            .usages
            .iter()
            .all(|u| u.profile == parsed.profiles[0].key()));
    }

    #[test]
    fn empty_slots_are_skipped() {
        let body = json!({
            "profiles": [{
                "name": "Speed",
                "heroClass": "wizard",
                "items": {
                    "head": null,
                    "neck": "",
                    "ring": { "id": null },
                    "hand": "Unique_Gloves_001"
                },
                "kanai": { "armor": null }
            }]
        });
        let parsed = parse_payloads(&guide(), &[payload("p1", body)]).unwrap();
        assert_eq!(parsed.profiles[0].class, "wizard");
        assert_eq!(parsed.usages.len(), 1);
        assert_eq!(parsed.usages[0].slot, "hand");
    }

    #[test]
    fn data_wrapper_as_object_or_string() {
        let inner = json!({
            "profiles": [{ "name": "A", "class": "monk", "items": { "head": "H" } }]
        });
        let as_object = json!({ "data": inner.clone() });
        let as_string = json!({ "data": inner.to_string() });
        for body in [as_object, as_string] {
            let parsed = parse_payloads(&guide(), &[payload("p1", body)]).unwrap();
            assert_eq!(parsed.usages.len(), 1);
        }
    }

    #[test]
    fn malformed_profiles_are_skipped_with_warning() {
        let body = json!({
            "profiles": [
                { "class": "barbarian", "items": { "head": "H" } },
                "not a profile",
                { "name": "Bad items", "class": "barbarian", "items": [1, 2] },
                { "name": "Good", "class": "barbarian", "items": { "head": "H" } }
            ]
        });
        let parsed = parse_payloads(&guide(), &[payload("p1", body)]).unwrap();
        assert_eq!(parsed.profiles.len(), 1);
        assert_eq!(parsed.profiles[0].name, "Good");
        assert_eq!(parsed.warnings.len(), 3);
    }

    #[test]
    fn invalid_payload_fails_with_attribution() {
        let bad = PlannerPayload {
            planner_id: PlannerId::parse("broken").unwrap(),
            body: "<html>oops</html>".to_string(),
            from_cache: false,
        };
        let err = parse_payloads(&guide(), &[bad]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedContent);
        assert_eq!(err.guide_id(), Some("ww-barb"));
        assert_eq!(err.planner_id(), Some("broken"));

        let err = parse_payloads(&guide(), &[payload("p2", json!({ "builds": [] }))]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedContent);
    }

    #[test]
    fn duplicates_are_removed() {
        let profile = json!({
            "name": "Speed",
            "class": "barbarian",
            "items": { "head": "H", "neck": "N" }
        });
        let body = json!({ "profiles": [profile.clone(), profile] });
        let payloads = [payload("p1", body.clone()), payload("p1", body)];
        let parsed = parse_payloads(&guide(), &payloads).unwrap();
        assert_eq!(parsed.profiles.len(), 1);
        assert_eq!(parsed.usages.len(), 2);
        assert!(parsed.usages.iter().all(|u| u.profile == parsed.profiles[0].key()));
    }

    #[test]
    fn same_profile_name_in_two_planners_is_distinct() {
        let body = json!({
            "profiles": [{ "name": "Speed", "class": "barbarian", "items": { "head": "H" } }]
        });
        let parsed =
            parse_payloads(&guide(), &[payload("p1", body.clone()), payload("p2", body)]).unwrap();
        assert_eq!(parsed.profiles.len(), 2);
        assert_eq!(parsed.usages.len(), 2);
    }

    #[test]
    fn no_payloads_is_empty() {
        let parsed = parse_payloads(&guide(), &[]).unwrap();
        assert!(parsed.profiles.is_empty());
        assert!(parsed.usages.is_empty());
    }
}
