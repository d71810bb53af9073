use serde::{Deserialize, Deserializer};

/// Deserializes a field that distinguishes "omitted" from "explicitly null".
/// Use together with `#[serde(default)]`:
/// omitted → `None`, `null` → `Some(None)`, value → `Some(Some(value))`.
pub fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Trims free text; blank input becomes `None`.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Deserialize)]
    struct Patch {
        #[serde(default, deserialize_with = "nullable")]
        parent: Option<Option<Uuid>>,
    }

    #[test]
    fn distinguishes_omitted_null_and_value() {
        let omitted: Patch = serde_json::from_str("{}").unwrap();
        assert_eq!(omitted.parent, None);

        let cleared: Patch = serde_json::from_str(r#"{"parent": null}"#).unwrap();
        assert_eq!(cleared.parent, Some(None));

        let id = Uuid::new_v4();
        let set: Patch = serde_json::from_str(&format!(r#"{{"parent": "{id}"}}"#)).unwrap();
        assert_eq!(set.parent, Some(Some(id)));
    }

    #[test]
    fn blank_text_becomes_none() {
        assert_eq!(non_blank(Some("  ".into())), None);
        assert_eq!(non_blank(Some(" Ministry ".into())).as_deref(), Some("Ministry"));
        assert_eq!(non_blank(None), None);
    }
}
