use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

lazy_static! {
    static ref FRONTMATTER_RE: Regex =
        Regex::new(r"(?s)\A---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n|\z)").unwrap();
}

/// Typed YAML front matter of a markdown document.
///
/// Every field is optional in the source; absent values fall back to the
/// defaults below.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct Frontmatter {
    #[serde(default, deserialize_with = "scalar_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub keywords: Vec<String>,
    #[serde(
        default,
        rename = "Published",
        alias = "published",
        deserialize_with = "loose_bool"
    )]
    pub published: bool,
}

impl Frontmatter {
    /// Parse the front-matter block at the start of `content`.
    ///
    /// `Ok(None)` when there is no block, `Err` when the block is not
    /// valid YAML for this structure.
    pub fn parse(content: &str) -> Result<Option<Self>, serde_yaml::Error> {
        let Some(raw) = split(content).0 else {
            return Ok(None);
        };
        if raw.trim().is_empty() {
            return Ok(Some(Self::default()));
        }
        serde_yaml::from_str(raw).map(Some)
    }

    pub fn has_any_tag(&self, wanted: &[String]) -> bool {
        self.tags.iter().any(|t| wanted.iter().any(|w| w == t))
    }
}

/// Split `content` into (raw front matter, body)
pub fn split(content: &str) -> (Option<&str>, &str) {
    match FRONTMATTER_RE.captures(content) {
        Some(caps) => {
            let raw = caps.get(1).map(|m| m.as_str());
            let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
            (raw, &content[end..])
        }
        None => (None, content),
    }
}

/// Body of a markdown document without its front matter
pub fn strip(content: &str) -> &str {
    split(content).1
}

fn scalar_to_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_to_string))
}

// `tags: [a, b]`, `tags: a, b` and `tags: a` are all accepted
fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(items)) => items.iter().filter_map(scalar_to_string).collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|t| t.trim().trim_matches('"').trim_matches('\'').to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        Some(other) => scalar_to_string(&other).into_iter().collect(),
    })
}

fn loose_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "on" | "1"
        ),
        Some(Value::Number(n)) => n.as_i64().map(|n| n != 0).unwrap_or(false),
        _ => false,
    })
}
