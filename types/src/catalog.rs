//! The API allow-list.
//!
//! The relay forwards only paths present in the catalog. That check is the sole
//! protection against the relay being used to issue arbitrary same-origin
//! requests, so lookups are exact: no case folding, no prefix matching.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

const CATEGORY_TIMELINE: &str = "时间线";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParamDescriptor {
    #[serde(default)]
    pub default: Value,
    #[serde(default)]
    pub description: String,
}

/// Human-oriented description of one API path.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiDescriptor {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// `"GET"`, `"POST"` or `"GET | POST"`.
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamDescriptor>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Default)]
pub struct ApiCatalog {
    apis: BTreeMap<String, ApiDescriptor>,
}

impl ApiCatalog {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The timeline endpoints shipped with the SDK.
    #[must_use]
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.insert(
            "/statuses/home_timeline",
            timeline("主页时间线", &[("pageflag", 0), ("reqnum", 20), ("pagetime", 0)]),
        );
        catalog.insert(
            "/statuses/public_timeline",
            timeline("广播大厅时间线", &[("pos", 0), ("reqnum", 20), ("pagetime", 0)]),
        );
        catalog
    }

    pub fn insert(&mut self, api: impl Into<String>, descriptor: ApiDescriptor) {
        self.apis.insert(api.into(), descriptor);
    }

    #[must_use]
    pub fn descriptor(&self, api: &str) -> Option<&ApiDescriptor> {
        self.apis.get(api)
    }

    #[must_use]
    pub fn is_provided(&self, api: &str) -> bool {
        self.apis.contains_key(api)
    }

    /// `category>description`, or an empty string for unknown paths.
    #[must_use]
    pub fn describe(&self, api: &str) -> String {
        self.descriptor(api)
            .map(|d| format!("{}>{}", d.category, d.description))
            .unwrap_or_default()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.apis.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.apis.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }
}

fn timeline(description: &str, params: &[(&str, i64)]) -> ApiDescriptor {
    ApiDescriptor {
        category: CATEGORY_TIMELINE.to_string(),
        description: description.to_string(),
        method: "GET".to_string(),
        params: params
            .iter()
            .map(|(name, default)| {
                (
                    (*name).to_string(),
                    ParamDescriptor {
                        default: Value::from(*default),
                        description: String::new(),
                    },
                )
            })
            .collect(),
    }
}
