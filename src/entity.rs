use serde::{Deserialize, Serialize};

/// The `u` object attached to every chat message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Author identity as it is written to the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Author {
    pub id: String,
    pub username: String,
    pub name: String,
}

impl Author {
    /// Resolve the author of a message. Missing or blank fields fall back:
    /// username to `"unknown"`, display name to the username and then `"Unknown"`.
    pub fn resolve(user: Option<&ChatUser>) -> Self {
        let id = user.and_then(|u| non_blank(u.id.as_deref()));
        let username = user.and_then(|u| non_blank(u.username.as_deref()));
        let name = user.and_then(|u| non_blank(u.name.as_deref()));

        Self {
            id: id.unwrap_or_default().to_string(),
            username: username.unwrap_or("unknown").to_string(),
            name: name.or(username).unwrap_or("Unknown").to_string(),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
