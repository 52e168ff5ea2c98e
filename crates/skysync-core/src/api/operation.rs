use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Read-only; safe to repeat and to cache.
    Query,
    /// Mutating; routed through the mutation queue by the facade.
    Procedure,
}

/// Descriptor of a call against the remote service, e.g.
/// `app.bsky.feed.getTimeline?limit=50`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub nsid: String,
    pub kind: OperationKind,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl Operation {
    pub fn query(nsid: impl Into<String>) -> Self {
        Self {
            nsid: nsid.into(),
            kind: OperationKind::Query,
            params: BTreeMap::new(),
            body: None,
        }
    }

    pub fn procedure(nsid: impl Into<String>, body: Value) -> Self {
        Self {
            nsid: nsid.into(),
            kind: OperationKind::Procedure,
            params: BTreeMap::new(),
            body: Some(body),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn is_query(&self) -> bool {
        self.kind == OperationKind::Query
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.nsid)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            f.write_str(if i == 0 { "?" } else { "&" })?;
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}
