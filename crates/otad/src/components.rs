//! Component-enumerator seam for multi-component (proxy) devices.
//!
//! The enumerator is a singleton extension. It speaks JSON: a
//! components document is `{"components": [ ... ]}` and a selector is
//! an object of property equals-matches, e.g. `{"group": "motors"}`.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("component enumeration failed: {0}")]
    Enumeration(String),
    #[error("components document is not valid JSON: {0}")]
    InvalidJson(String),
}

pub type Result<T> = std::result::Result<T, ComponentError>;

pub trait ComponentEnumerator: Send + Sync {
    /// All components on the device, as a components document.
    fn get_all_components(&self) -> Result<String>;

    /// Components matching the selector, enumerator order preserved.
    fn select_components(&self, selector_json: &str) -> Result<String>;
}

/// Parse a components document into its component objects.
pub fn parse_components(doc: &str) -> Result<Vec<Value>> {
    let value: Value =
        serde_json::from_str(doc).map_err(|e| ComponentError::InvalidJson(e.to_string()))?;
    match value.get("components") {
        Some(Value::Array(items)) => Ok(items.clone()),
        _ => Err(ComponentError::InvalidJson(
            "missing components array".to_string(),
        )),
    }
}

/// Fixed component table with property-match selection. Stands in for
/// the enumerator extension on single-box test benches.
#[derive(Debug, Default)]
pub struct ScriptedEnumerator {
    components: Vec<Value>,
}

impl ScriptedEnumerator {
    pub fn new(components: Vec<Value>) -> Self {
        Self { components }
    }

    fn matches(selector: &Value, component: &Value) -> bool {
        let Some(wanted) = selector.as_object() else {
            return false;
        };
        wanted
            .iter()
            .all(|(key, value)| component.get(key) == Some(value))
    }
}

impl ComponentEnumerator for ScriptedEnumerator {
    fn get_all_components(&self) -> Result<String> {
        Ok(serde_json::json!({ "components": self.components }).to_string())
    }

    fn select_components(&self, selector_json: &str) -> Result<String> {
        let selector: Value = serde_json::from_str(selector_json)
            .map_err(|e| ComponentError::InvalidJson(e.to_string()))?;
        let selected: Vec<&Value> = self
            .components
            .iter()
            .filter(|component| Self::matches(&selector, component))
            .collect();
        Ok(serde_json::json!({ "components": selected }).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enumerator() -> ScriptedEnumerator {
        ScriptedEnumerator::new(vec![
            json!({"id": "motor-0", "group": "usb-motor-controller"}),
            json!({"id": "camera-0", "group": "cameras"}),
            json!({"id": "motor-1", "group": "usb-motor-controller"}),
        ])
    }

    #[test]
    fn selects_by_group_in_order() {
        let doc = enumerator()
            .select_components(r#"{"group": "usb-motor-controller"}"#)
            .unwrap();
        let components = parse_components(&doc).unwrap();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0]["id"], "motor-0");
        assert_eq!(components[1]["id"], "motor-1");
    }

    #[test]
    fn empty_selection_is_not_an_error() {
        let doc = enumerator().select_components(r#"{"group": "none"}"#).unwrap();
        assert!(parse_components(&doc).unwrap().is_empty());
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(matches!(
            parse_components("{}"),
            Err(ComponentError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_components("nope"),
            Err(ComponentError::InvalidJson(_))
        ));
    }
}
